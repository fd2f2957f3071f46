//! The host-facing IOS instance: guest memory, the event queue, the boot state machine and the one
//! live kernel.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use ios_mem::{GuestMemory, GuestRam};
use ios_snapshot::{ReadLeExt, SnapshotError, WriteLeExt};
use ios_time::{EventQueue, Scheduler};
use tracing::{debug, error, info, warn};

use crate::boot::{
    boot_ticks, setup_memory, BootError, BootRequest, BootState, GuestCpu, HeadlessCpu,
    MemorySetupType, NoProgramLoader, ProgramLoader,
};
use crate::config::IosConfig;
use crate::device::stm::{STM_EVENT_POWER, STM_EVENT_RESET};
use crate::device::usb_oh0::{SharedUsbHost, UsbHost};
use crate::fs::{MemoryNand, SharedFileSystem};
use crate::ipc::Request;
use crate::kernel::Kernel;
use crate::mailbox::Mailbox;

const SNAPSHOT_MAGIC: &[u8; 4] = b"IOSH";
const SNAPSHOT_VERSION: u16 = 1;
const MAX_SNAPSHOT_EVENTS: usize = 0x10000;

/// Work scheduled on the virtual clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IosEvent {
    /// The guest's request reaches the kernel after the acknowledge latency.
    Request(u32),
    /// Raise an acknowledge interrupt for a request a previous kernel accepted.
    Acknowledge(u32),
    /// Write a reply back to the guest.
    Reply {
        address: u32,
        command: u32,
        return_value: i32,
    },
    /// Complete a pending reload.
    FinishBoot {
        title_id: u64,
        entry: Option<u32>,
        acknowledge: Option<u32>,
    },
}

impl IosEvent {
    fn save(&self, w: &mut dyn Write) -> ios_snapshot::Result<()> {
        match *self {
            Self::Request(address) => {
                w.write_u8(0)?;
                w.write_u32_le(address)
            }
            Self::Acknowledge(address) => {
                w.write_u8(1)?;
                w.write_u32_le(address)
            }
            Self::Reply {
                address,
                command,
                return_value,
            } => {
                w.write_u8(2)?;
                w.write_u32_le(address)?;
                w.write_u32_le(command)?;
                w.write_i32_le(return_value)
            }
            Self::FinishBoot {
                title_id,
                entry,
                acknowledge,
            } => {
                w.write_u8(3)?;
                w.write_u64_le(title_id)?;
                write_opt_u32(w, entry)?;
                write_opt_u32(w, acknowledge)
            }
        }
    }

    fn load(r: &mut dyn Read) -> ios_snapshot::Result<Self> {
        Ok(match r.read_u8()? {
            0 => Self::Request(r.read_u32_le()?),
            1 => Self::Acknowledge(r.read_u32_le()?),
            2 => Self::Reply {
                address: r.read_u32_le()?,
                command: r.read_u32_le()?,
                return_value: r.read_i32_le()?,
            },
            3 => Self::FinishBoot {
                title_id: r.read_u64_le()?,
                entry: read_opt_u32(r)?,
                acknowledge: read_opt_u32(r)?,
            },
            _ => return Err(SnapshotError::Corrupt("unknown event tag")),
        })
    }
}

fn write_opt_u32(w: &mut dyn Write, v: Option<u32>) -> ios_snapshot::Result<()> {
    w.write_bool(v.is_some())?;
    w.write_u32_le(v.unwrap_or(0))
}

fn read_opt_u32(r: &mut dyn Read) -> ios_snapshot::Result<Option<u32>> {
    let present = r.read_bool()?;
    let v = r.read_u32_le()?;
    Ok(present.then_some(v))
}

fn boot_state_to_u8(state: BootState) -> u8 {
    match state {
        BootState::Uninitialized => 0,
        BootState::MemoryLayoutEstablished => 1,
        BootState::Running => 2,
        BootState::SwapRequested => 3,
    }
}

fn boot_state_from_u8(v: u8) -> Option<BootState> {
    Some(match v {
        0 => BootState::Uninitialized,
        1 => BootState::MemoryLayoutEstablished,
        2 => BootState::Running,
        3 => BootState::SwapRequested,
        _ => return None,
    })
}

pub struct Ios {
    config: IosConfig,
    memory: Box<dyn GuestMemory>,
    events: EventQueue<IosEvent>,
    cpu: Box<dyn GuestCpu>,
    loader: Box<dyn ProgramLoader>,
    mailbox: Mailbox,
    fs: SharedFileSystem,
    usb: SharedUsbHost,
    kernel: Kernel,
    boot_state: BootState,
}

impl Ios {
    /// A self-contained instance: fresh guest RAM, a headless CPU and an empty NAND.
    pub fn new(config: IosConfig) -> Self {
        Self::with_parts(
            config,
            Box::new(GuestRam::new()),
            Box::new(HeadlessCpu::running()),
            Box::new(NoProgramLoader),
            MemoryNand::new().into_shared(),
        )
    }

    /// Boot the configured default title against the given collaborators.
    pub fn with_parts(
        config: IosConfig,
        memory: Box<dyn GuestMemory>,
        cpu: Box<dyn GuestCpu>,
        loader: Box<dyn ProgramLoader>,
        fs: SharedFileSystem,
    ) -> Self {
        let title_id = config.default_title_id;
        let usb = UsbHost::new(config.usb_devices.iter().copied()).into_shared();
        let kernel = Kernel::new(title_id, &config, fs.clone(), usb.clone());
        let mut ios = Self {
            config,
            memory,
            events: EventQueue::new(),
            cpu,
            loader,
            mailbox: Mailbox::auto_ack(),
            fs,
            usb,
            kernel,
            boot_state: BootState::Uninitialized,
        };
        setup_memory(ios.memory.as_mut(), title_id, MemorySetupType::Full);
        ios.advance_boot(BootState::MemoryLayoutEstablished);
        ios.advance_boot(BootState::Running);
        info!(title_id, "IOS started");
        ios
    }

    fn advance_boot(&mut self, next: BootState) {
        if !self.boot_state.can_advance_to(next) {
            warn!(from = ?self.boot_state, to = ?next, "unexpected boot state transition");
        }
        debug!(from = ?self.boot_state, to = ?next, "boot state");
        self.boot_state = next;
    }

    pub fn config(&self) -> &IosConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    pub fn memory(&mut self) -> &mut dyn GuestMemory {
        self.memory.as_mut()
    }

    pub fn events(&self) -> &EventQueue<IosEvent> {
        &self.events
    }

    pub fn now(&self) -> u64 {
        self.events.now()
    }

    pub fn boot_state(&self) -> BootState {
        self.boot_state
    }

    pub fn cpu(&self) -> &dyn GuestCpu {
        self.cpu.as_ref()
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn mailbox_mut(&mut self) -> &mut Mailbox {
        &mut self.mailbox
    }

    pub fn set_mailbox(&mut self, mailbox: Mailbox) {
        self.mailbox = mailbox;
    }

    pub fn fs(&self) -> &SharedFileSystem {
        &self.fs
    }

    pub fn usb(&self) -> &SharedUsbHost {
        &self.usb
    }

    /// The guest rang the doorbell for the command block at `address`.
    pub fn enqueue_request(&mut self, address: u32) {
        let delay = self.config.timings.ack_delay;
        self.events.schedule(delay, IosEvent::Request(address));
    }

    /// Answer `request` from outside the device dispatch path.
    pub fn enqueue_reply(&mut self, request: &Request, return_value: i32, delay: Option<u64>) {
        self.kernel
            .enqueue_ipc_reply(&mut self.events, request, return_value, delay);
    }

    /// Reload into `title_id`.
    pub fn boot(
        &mut self,
        title_id: u64,
        hang_cpu: bool,
        companion: Option<&Path>,
    ) -> Result<(), BootError> {
        self.boot_request(BootRequest {
            hang_cpu,
            companion: companion.map(Path::to_path_buf),
            ..BootRequest::new(title_id)
        })
    }

    pub fn boot_request(&mut self, request: BootRequest) -> Result<(), BootError> {
        info!(title_id = request.title_id, hang_cpu = request.hang_cpu, "IOS reload requested");
        self.kernel.set_paused(true);
        self.advance_boot(BootState::SwapRequested);

        let entry = match &request.companion {
            Some(path) => Some(self.loader.load(self.memory.as_mut(), path).map_err(|source| {
                BootError::Companion {
                    path: path.clone(),
                    source,
                }
            })?),
            None => None,
        };

        let cpu_running = self.cpu.is_running();
        if request.hang_cpu {
            self.cpu.reset_and_pause();
        }
        if cpu_running {
            let delay = boot_ticks(request.title_id, &self.config.timings);
            self.events.schedule(
                delay,
                IosEvent::FinishBoot {
                    title_id: request.title_id,
                    entry,
                    acknowledge: request.acknowledge,
                },
            );
        } else {
            self.finish_boot(request.title_id, entry, request.acknowledge);
        }
        Ok(())
    }

    fn finish_boot(&mut self, title_id: u64, entry: Option<u32>, acknowledge: Option<u32>) {
        // Replies and acknowledgements belong to the outgoing kernel.
        self.events
            .retain(|e| matches!(e, IosEvent::Request(_) | IosEvent::FinishBoot { .. }));
        // Requests the paused kernel never acknowledged are served by its successor.
        let unacknowledged = std::mem::take(&mut self.kernel.request_queue);
        setup_memory(self.memory.as_mut(), title_id, MemorySetupType::IosReload);
        self.advance_boot(BootState::MemoryLayoutEstablished);
        self.kernel = Kernel::new(title_id, &self.config, self.fs.clone(), self.usb.clone());
        self.kernel.request_queue = unacknowledged;
        self.advance_boot(BootState::Running);
        info!(title_id, "IOS reload complete");

        if let Some(entry) = entry {
            self.cpu.release(entry);
        }
        if let Some(address) = acknowledge {
            let delay = self.config.timings.ack_delay;
            self.events.schedule(delay, IosEvent::Acknowledge(address));
        }
    }

    fn process_boot_request(&mut self) {
        if let Some(request) = self.kernel.take_boot_request() {
            let title_id = request.title_id;
            if let Err(err) = self.boot_request(request) {
                error!(title_id, %err, "device-initiated reload failed");
            }
        }
    }

    fn pump_ipc(&mut self) {
        while self
            .kernel
            .update_ipc(self.memory.as_mut(), &mut self.events, &mut self.mailbox)
        {
            self.process_boot_request();
        }
    }

    fn handle_event(&mut self, event: IosEvent) {
        match event {
            IosEvent::Request(address) => self.kernel.enqueue_ipc_request(address),
            IosEvent::Acknowledge(address) => self.kernel.enqueue_ipc_acknowledgement(address),
            IosEvent::Reply {
                address,
                command,
                return_value,
            } => self
                .kernel
                .complete_reply(self.memory.as_mut(), address, command, return_value),
            IosEvent::FinishBoot {
                title_id,
                entry,
                acknowledge,
            } => self.finish_boot(title_id, entry, acknowledge),
        }
    }

    /// Fire every event due at or before `tick`, then move the clock to `tick`.
    pub fn run_until(&mut self, tick: u64) {
        self.pump_ipc();
        while let Some((_, event)) = self.events.pop_due(tick) {
            self.handle_event(event);
            self.pump_ipc();
        }
        self.events.advance_to(tick);
    }

    pub fn run_for(&mut self, ticks: u64) {
        self.run_until(self.now().saturating_add(ticks));
    }

    /// Periodic device work and background completions.
    pub fn update_devices(&mut self) {
        self.kernel
            .update_devices(self.memory.as_mut(), &mut self.events);
        self.process_boot_request();
    }

    /// Returns whether a guest event hook was waiting for the event.
    pub fn press_power_button(&mut self) -> bool {
        self.kernel
            .trigger_stm_event(self.memory.as_mut(), &mut self.events, STM_EVENT_POWER)
    }

    pub fn press_reset_button(&mut self) -> bool {
        self.kernel
            .trigger_stm_event(self.memory.as_mut(), &mut self.events, STM_EVENT_RESET)
    }

    /// Serialize the IPC state. Guest memory is not included.
    pub fn save_state(&self) -> ios_snapshot::Result<Vec<u8>> {
        let mut w = Vec::new();
        w.write_bytes(SNAPSHOT_MAGIC)?;
        w.write_u16_le(SNAPSHOT_VERSION)?;
        w.write_u64_le(self.kernel.title_id())?;
        w.write_u64_le(self.events.now())?;
        w.write_u8(boot_state_to_u8(self.boot_state))?;
        w.write_count_u32(self.events.len())?;
        for (tick, event) in self.events.iter() {
            w.write_u64_le(tick)?;
            event.save(&mut w)?;
        }
        self.kernel.save_state(&mut w)?;
        Ok(w)
    }

    /// Restore a snapshot taken by [`Ios::save_state`].
    ///
    /// On failure the instance is put back the way it was before the call.
    pub fn load_state(&mut self, data: &[u8]) -> ios_snapshot::Result<()> {
        let backup = self.save_state()?;
        if let Err(err) = self.restore(data) {
            warn!(%err, "savestate rejected, keeping current state");
            if let Err(restore_err) = self.restore(&backup) {
                error!(%restore_err, "failed to roll back after a rejected savestate");
            }
            return Err(err);
        }
        Ok(())
    }

    fn restore(&mut self, data: &[u8]) -> ios_snapshot::Result<()> {
        let mut r = Cursor::new(data);
        if r.read_exact_vec(SNAPSHOT_MAGIC.len())? != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = r.read_u16_le()?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        let title_id = r.read_u64_le()?;
        let now = r.read_u64_le()?;
        let boot_state =
            boot_state_from_u8(r.read_u8()?).ok_or(SnapshotError::Corrupt("invalid boot state"))?;
        let count = r.read_u32_le()? as usize;
        if count > MAX_SNAPSHOT_EVENTS {
            return Err(SnapshotError::Corrupt("too many pending events"));
        }
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            let tick = r.read_u64_le()?;
            events.push((tick, IosEvent::load(&mut r)?));
        }

        // The outgoing kernel must release shared handles before the restored one claims them.
        self.kernel = Kernel::new(title_id, &self.config, self.fs.clone(), self.usb.clone());
        self.kernel.load_state(&mut r)?;
        if r.position() != data.len() as u64 {
            return Err(SnapshotError::Corrupt("trailing bytes after snapshot"));
        }

        self.events.reset(now);
        for (tick, event) in events {
            self.events.schedule_at(tick, event);
        }
        self.boot_state = boot_state;
        info!(title_id, now, "savestate loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn event_encoding_round_trips() {
        let events = [
            IosEvent::Request(0x8000_1000),
            IosEvent::Acknowledge(0x8000_2000),
            IosEvent::Reply {
                address: 0x8000_3000,
                command: 6,
                return_value: -4,
            },
            IosEvent::FinishBoot {
                title_id: 0x1_0000_0024,
                entry: Some(0x8000_3400),
                acknowledge: None,
            },
        ];
        for event in events {
            let mut buf = Vec::new();
            event.save(&mut buf).unwrap();
            assert_eq!(IosEvent::load(&mut Cursor::new(&buf)).unwrap(), event);
        }
    }

    #[test]
    fn startup_reaches_running() {
        let ios = Ios::new(IosConfig::default());
        assert_eq!(ios.boot_state(), BootState::Running);
        assert!(!ios.kernel().is_paused());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut ios = Ios::new(IosConfig::default());
        let err = ios.load_state(b"NOPE").unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidMagic));
    }
}
