//! The IPC kernel: request and reply queues, descriptor management and dispatch.
//!
//! A request moves through four states:
//!
//! 1. enqueued by the host when the guest rings the doorbell,
//! 2. acknowledged once the kernel picks it off the request queue,
//! 3. dispatched to the device behind its descriptor,
//! 4. replied, when the reply event fires and the result is written back to guest memory.
//!
//! All replies go through [`Kernel::enqueue_ipc_reply`], which keeps reply ticks monotonic.

use std::collections::VecDeque;
use std::sync::mpsc;

use ios_mem::GuestMemory;
use ios_time::Scheduler;
use tracing::{debug, error, info, warn};

use crate::boot::{titles, BootRequest};
use crate::config::{IosConfig, IpcTimings};
use crate::device::catalog::{register_devices, DeviceHandles};
use crate::device::stm::{SharedStmState, StmState};
use crate::device::usb_oh0::{self, Oh0Child, SharedUsbHost};
use crate::device::{fs as fs_device, Completion, Device, DeviceContext, DeviceEffect};
use crate::fdtable::{DescriptorTable, Fd, FixedFd, Slot};
use crate::fs::SharedFileSystem;
use crate::iosc::{Iosc, SharedKeyStore};
use crate::ipc::{
    IoctlRequest, IoctlvRequest, IpcCommand, IpcReply, OpenRequest, ReadWriteRequest, Request,
    SeekRequest, IPC_EINVAL, IPC_EMAX, IPC_ENOENT, IPC_SUCCESS,
};
use crate::mailbox::IpcInterface;
use crate::registry::{DeviceId, DeviceRegistry};
use crate::system::IosEvent;

/// The guest's identity as seen by permission checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u16,
}

enum Target<'d> {
    Fd(Fd),
    Static(DeviceId),
    Owned(&'d mut dyn Device),
}

pub struct Kernel {
    pub(crate) title_id: u64,
    pub(crate) timings: IpcTimings,
    pub(crate) fs: SharedFileSystem,
    pub(crate) iosc: SharedKeyStore,
    pub(crate) usb: SharedUsbHost,
    pub(crate) stm: SharedStmState,
    pub(crate) registry: DeviceRegistry,
    pub(crate) fds: DescriptorTable,
    pub(crate) request_queue: VecDeque<u32>,
    pub(crate) reply_queue: VecDeque<u32>,
    pub(crate) ack_queue: VecDeque<u32>,
    pub(crate) last_reply_tick: u64,
    pub(crate) ipc_paused: bool,
    pub(crate) credentials: Credentials,
    effects: Vec<DeviceEffect>,
    completions_tx: mpsc::Sender<Completion>,
    completions_rx: mpsc::Receiver<Completion>,
    pending_boot: Option<BootRequest>,
}

impl Kernel {
    /// Build a kernel instance for `title_id` and register its devices.
    pub fn new(
        title_id: u64,
        config: &IosConfig,
        fs: SharedFileSystem,
        usb: SharedUsbHost,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::channel();
        let mut kernel = Self {
            title_id,
            timings: config.timings,
            fs,
            iosc: Iosc::new(config.console_id).into_shared(),
            usb,
            stm: StmState::new_shared(),
            registry: DeviceRegistry::new(),
            fds: DescriptorTable::new(),
            request_queue: VecDeque::new(),
            reply_queue: VecDeque::new(),
            ack_queue: VecDeque::new(),
            last_reply_tick: 0,
            ipc_paused: false,
            credentials: Credentials::default(),
            effects: Vec::new(),
            completions_tx,
            completions_rx,
            pending_boot: None,
        };

        let handles = DeviceHandles {
            fs: kernel.fs.clone(),
            iosc: kernel.iosc.clone(),
            usb: kernel.usb.clone(),
            stm: kernel.stm.clone(),
        };
        register_devices(&mut kernel.registry, title_id, &handles, config);
        for fixed in FixedFd::ALL {
            if let Some(id) = kernel.registry.by_name(fixed.device_name()) {
                kernel.fds.bind_fixed(fixed, id);
            }
        }
        info!(title_id, devices = kernel.registry.len(), "kernel instance created");
        kernel
    }

    pub fn title_id(&self) -> u64 {
        self.title_id
    }

    pub fn is_mios(&self) -> bool {
        self.title_id == titles::MIOS
    }

    pub fn timings(&self) -> &IpcTimings {
        &self.timings
    }

    pub fn is_paused(&self) -> bool {
        self.ipc_paused
    }

    /// Stop acknowledging requests. Never cleared automatically; a new kernel starts unpaused.
    pub fn set_paused(&mut self, paused: bool) {
        self.ipc_paused = paused;
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
    }

    pub fn last_reply_tick(&self) -> u64 {
        self.last_reply_tick
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    pub fn fds(&self) -> &DescriptorTable {
        &self.fds
    }

    pub fn fs(&self) -> &SharedFileSystem {
        &self.fs
    }

    pub fn iosc(&self) -> &SharedKeyStore {
        &self.iosc
    }

    pub fn queued_requests(&self) -> usize {
        self.request_queue.len()
    }

    pub fn queued_replies(&self) -> usize {
        self.reply_queue.len()
    }

    /// The device behind a guest descriptor.
    pub fn device_by_fd(&self, fd: u32) -> Option<&dyn Device> {
        match self.fds.get(Fd::new(fd)?)? {
            Slot::Static(id) => self.registry.get(*id),
            Slot::Dynamic(device) => Some(device.as_ref()),
        }
    }

    pub fn device_by_name(&self, name: &str) -> Option<&dyn Device> {
        self.registry.get(self.registry.by_name(name)?)
    }

    /// A reload a device asked for during the last dispatch, if any.
    pub fn take_boot_request(&mut self) -> Option<BootRequest> {
        self.pending_boot.take()
    }

    pub fn enqueue_ipc_request(&mut self, address: u32) {
        self.request_queue.push_back(address);
    }

    pub fn enqueue_ipc_acknowledgement(&mut self, address: u32) {
        self.ack_queue.push_back(address);
    }

    /// Schedule the reply for `request`.
    ///
    /// The reply lands at `max(now + delay, last + delay)` so that replies never overtake each
    /// other, whatever order devices finish in.
    pub fn enqueue_ipc_reply(
        &mut self,
        scheduler: &mut dyn Scheduler<IosEvent>,
        request: &Request,
        return_value: i32,
        delay: Option<u64>,
    ) -> u64 {
        let delay = delay.unwrap_or(self.timings.default_reply_delay);
        let tick = scheduler
            .now()
            .max(self.last_reply_tick)
            .saturating_add(delay);
        self.last_reply_tick = tick;
        scheduler.schedule_at(
            tick,
            IosEvent::Reply {
                address: request.address,
                command: request.command,
                return_value,
            },
        );
        tick
    }

    /// Write a reply back into the command block and queue its interrupt.
    pub fn complete_reply(
        &mut self,
        memory: &mut dyn GuestMemory,
        address: u32,
        command: u32,
        return_value: i32,
    ) {
        memory.write_u32(address.wrapping_add(4), return_value as u32);
        memory.write_u32(address.wrapping_add(8), command);
        memory.write_u32(address, IpcCommand::Reply as u32);
        self.reply_queue.push_back(address);
    }

    /// Advance the IPC hardware by one item: a request, else a reply, else an acknowledgement.
    ///
    /// Returns whether anything was processed.
    pub fn update_ipc(
        &mut self,
        memory: &mut dyn GuestMemory,
        scheduler: &mut dyn Scheduler<IosEvent>,
        interface: &mut dyn IpcInterface,
    ) -> bool {
        if self.ipc_paused || !interface.is_ready() {
            return false;
        }
        if let Some(address) = self.request_queue.pop_front() {
            interface.generate_ack(address);
            self.execute_command(memory, scheduler, address);
            return true;
        }
        if let Some(address) = self.reply_queue.pop_front() {
            interface.generate_reply(address);
            return true;
        }
        if let Some(address) = self.ack_queue.pop_front() {
            interface.generate_ack(address);
            return true;
        }
        false
    }

    /// Decode and dispatch the command block at `address`, scheduling its reply if the device
    /// answered synchronously.
    pub fn execute_command(
        &mut self,
        memory: &mut dyn GuestMemory,
        scheduler: &mut dyn Scheduler<IosEvent>,
        address: u32,
    ) {
        let request = Request::decode(memory, address);
        let reply = self.handle(memory, scheduler.now(), &request);
        if let Some(reply) = reply {
            self.enqueue_ipc_reply(scheduler, &request, reply.return_value, reply.delay);
        }
        self.apply_effects(scheduler);
    }

    fn handle(&mut self, memory: &mut dyn GuestMemory, now: u64, request: &Request) -> Option<IpcReply> {
        let command = match request.command() {
            Some(IpcCommand::Open) => return Some(self.open_device(memory, now, request)),
            Some(IpcCommand::Reply) | None => {
                error!(address = request.address, command = request.command, "invalid IPC command");
                return Some(IpcReply::with_delay(IPC_EINVAL, self.timings.invalid_command_delay));
            }
            Some(command) => command,
        };

        let Some(fd) = Fd::new(request.fd).filter(|fd| self.fds.is_open(*fd)) else {
            error!(address = request.address, fd = request.fd, ?command, "invalid descriptor");
            return Some(self.invalid_fd_reply());
        };

        let reply = match command {
            IpcCommand::Close => return self.close_device(memory, now, fd),
            IpcCommand::Read => {
                let rw = ReadWriteRequest::decode(memory, request);
                self.call_device(memory, now, Target::Fd(fd), |d, ctx| d.read(ctx, &rw))
            }
            IpcCommand::Write => {
                let rw = ReadWriteRequest::decode(memory, request);
                self.call_device(memory, now, Target::Fd(fd), |d, ctx| d.write(ctx, &rw))
            }
            IpcCommand::Seek => {
                let seek = SeekRequest::decode(memory, request);
                self.call_device(memory, now, Target::Fd(fd), |d, ctx| d.seek(ctx, &seek))
            }
            IpcCommand::Ioctl => {
                let ioctl = IoctlRequest::decode(memory, request);
                self.call_device(memory, now, Target::Fd(fd), |d, ctx| d.ioctl(ctx, &ioctl))
            }
            IpcCommand::Ioctlv => {
                let ioctlv = IoctlvRequest::decode(memory, request);
                self.call_device(memory, now, Target::Fd(fd), |d, ctx| d.ioctlv(ctx, &ioctlv))
            }
            IpcCommand::Open | IpcCommand::Reply => unreachable!("handled above"),
        };
        reply.unwrap_or_else(|| Some(self.invalid_fd_reply()))
    }

    fn invalid_fd_reply(&self) -> IpcReply {
        IpcReply::with_delay(IPC_EINVAL, self.timings.invalid_fd_delay)
    }

    fn resolve(&self, path: &str) -> Option<Slot> {
        if path.starts_with(usb_oh0::CHILD_PREFIX) && self.registry.by_name(path).is_none() {
            self.registry.by_name(usb_oh0::DEVICE_NAME)?;
            return Some(Slot::Dynamic(Box::new(Oh0Child::new(self.usb.clone(), path))));
        }
        if path.starts_with("/dev/") {
            return self.registry.by_name(path).map(Slot::Static);
        }
        if path.starts_with('/') {
            return self.registry.by_name(fs_device::DEVICE_NAME).map(Slot::Static);
        }
        None
    }

    fn open_device(&mut self, memory: &mut dyn GuestMemory, now: u64, request: &Request) -> IpcReply {
        let Some(fd) = self.fds.free_slot() else {
            warn!(address = request.address, "descriptor table full");
            return IpcReply::with_delay(IPC_EMAX, self.timings.too_many_files_delay);
        };
        let open = OpenRequest::decode(
            memory,
            request,
            fd.get(),
            self.credentials.uid,
            self.credentials.gid,
        );
        let Some(mut slot) = self.resolve(&open.path) else {
            warn!(path = %open.path, "unknown device");
            return IpcReply::with_delay(IPC_ENOENT, self.timings.unknown_device_delay);
        };

        let reply = match &mut slot {
            Slot::Static(id) => {
                self.call_device(memory, now, Target::Static(*id), |d, ctx| d.open(ctx, &open))
            }
            Slot::Dynamic(device) => {
                self.call_device(memory, now, Target::Owned(device.as_mut()), |d, ctx| d.open(ctx, &open))
            }
        }
        .flatten();

        let reply = match reply {
            Some(reply) => reply,
            None => {
                error!(path = %open.path, "device did not answer open synchronously");
                IpcReply::new(IPC_EINVAL)
            }
        };
        if reply.return_value < IPC_SUCCESS {
            debug!(path = %open.path, rv = reply.return_value, "open rejected");
            return reply;
        }
        self.fds.insert(fd, slot);
        info!(fd = fd.get(), path = %open.path, mode = ?open.mode, "opened device");
        IpcReply {
            return_value: fd.get() as i32,
            delay: reply.delay,
        }
    }

    fn close_device(&mut self, memory: &mut dyn GuestMemory, now: u64, fd: Fd) -> Option<IpcReply> {
        let Some(slot) = self.fds.take(fd) else {
            return Some(self.invalid_fd_reply());
        };
        debug!(fd = fd.get(), "closing descriptor");
        let reply = match slot {
            Slot::Static(id) => {
                let still_open = self.fds.open_statics().contains(&id);
                self.call_device(memory, now, Target::Static(id), |d, ctx| {
                    let reply = d.close(ctx, fd.get());
                    // Another descriptor still holds the device.
                    if still_open {
                        d.base_mut().set_active(true);
                    }
                    reply
                })
            }
            Slot::Dynamic(mut device) => {
                self.call_device(memory, now, Target::Owned(device.as_mut()), |d, ctx| {
                    d.close(ctx, fd.get())
                })
            }
        };
        reply.unwrap_or_else(|| Some(self.invalid_fd_reply()))
    }

    fn call_device<R>(
        &mut self,
        memory: &mut dyn GuestMemory,
        now: u64,
        target: Target<'_>,
        f: impl FnOnce(&mut dyn Device, &mut DeviceContext<'_>) -> R,
    ) -> Option<R> {
        let Self {
            title_id,
            registry,
            fds,
            credentials,
            effects,
            completions_tx,
            ..
        } = self;
        let device: &mut dyn Device = match target {
            Target::Fd(fd) => match fds.get_mut(fd)? {
                Slot::Static(id) => registry.get_mut(*id)?,
                Slot::Dynamic(device) => device.as_mut(),
            },
            Target::Static(id) => registry.get_mut(id)?,
            Target::Owned(device) => device,
        };
        let mut ctx = DeviceContext::new(memory, now, *title_id, credentials, effects, completions_tx);
        Some(f(device, &mut ctx))
    }

    fn apply_effects(&mut self, scheduler: &mut dyn Scheduler<IosEvent>) {
        for effect in std::mem::take(&mut self.effects) {
            match effect {
                DeviceEffect::Reply(c) => {
                    self.enqueue_ipc_reply(scheduler, &c.request, c.return_value, c.delay);
                }
                DeviceEffect::Boot(request) => {
                    if let Some(previous) = self.pending_boot.replace(request) {
                        warn!(title_id = previous.title_id, "superseded pending reload request");
                    }
                }
            }
        }
    }

    /// Dispatch an IOCtlV to a crypto engine through its fixed descriptor.
    ///
    /// Guest requests can never name these descriptors; this is for in-kernel callers.
    pub fn fixed_ioctlv(
        &mut self,
        memory: &mut dyn GuestMemory,
        scheduler: &mut dyn Scheduler<IosEvent>,
        fixed: FixedFd,
        request: &IoctlvRequest,
    ) -> Option<IpcReply> {
        let Some(id) = self.fds.fixed(fixed) else {
            return Some(IpcReply::new(IPC_ENOENT));
        };
        let reply = self
            .call_device(memory, scheduler.now(), Target::Static(id), |d, ctx| d.ioctlv(ctx, request))
            .flatten();
        self.apply_effects(scheduler);
        reply
    }

    /// Run periodic device work for every device behind an open descriptor and collect
    /// background completions.
    pub fn update_devices(
        &mut self,
        memory: &mut dyn GuestMemory,
        scheduler: &mut dyn Scheduler<IosEvent>,
    ) {
        let now = scheduler.now();
        {
            let Self {
                title_id,
                registry,
                fds,
                credentials,
                effects,
                completions_tx,
                ..
            } = self;
            let open_statics = fds.open_statics();
            let statics = registry
                .iter_mut()
                .filter(|(id, _)| open_statics.contains(id))
                .map(|(_, d)| d);
            let dynamics = fds.iter_mut().filter_map(|(_, slot)| match slot {
                Slot::Dynamic(device) => Some(device),
                Slot::Static(_) => None,
            });
            for device in statics.chain(dynamics) {
                let mut ctx =
                    DeviceContext::new(memory, now, *title_id, credentials, effects, completions_tx);
                device.update(&mut ctx);
            }
        }
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.effects.push(DeviceEffect::Reply(completion));
        }
        self.apply_effects(scheduler);
    }

    /// Deliver a state transition event to the parked STM event hook, if there is one.
    pub fn trigger_stm_event(
        &mut self,
        memory: &mut dyn GuestMemory,
        scheduler: &mut dyn Scheduler<IosEvent>,
        event: u32,
    ) -> bool {
        let hook = self.stm.borrow_mut().fire(memory, event);
        match hook {
            Some(request) => {
                info!(event, "delivering STM event");
                self.enqueue_ipc_reply(scheduler, &request, IPC_SUCCESS, None);
                true
            }
            None => {
                debug!(event, "no STM event hook registered");
                false
            }
        }
    }
}
