//! `/dev/stm/immediate` and `/dev/stm/eventhook`: the state transition manager.
//!
//! The guest parks one IOCtl on the event hook device. It stays unanswered until a power or reset
//! event arrives or the guest releases it through the immediate device.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use ios_snapshot::{ReadLeExt, WriteLeExt};
use tracing::{info, warn};

use super::{Device, DeviceBase, DeviceContext};
use crate::ipc::{IoctlRequest, IpcReply, Request, IPC_EEXIST, IPC_ENOENT, IPC_SUCCESS};

pub const IMMEDIATE_NAME: &str = "/dev/stm/immediate";
pub const EVENTHOOK_NAME: &str = "/dev/stm/eventhook";

pub const IOCTL_HOTRESET: u32 = 0x2001;
pub const IOCTL_SHUTDOWN: u32 = 0x2003;
pub const IOCTL_RELEASE_EH: u32 = 0x3002;
pub const IOCTL_VIDIMMING: u32 = 0x5001;
pub const IOCTL_LEDMODE: u32 = 0x6002;
pub const IOCTL_EVENTHOOK: u32 = 0x1000;

pub const STM_EVENT_RESET: u32 = 0x0002_0000;
pub const STM_EVENT_POWER: u32 = 0x0000_0800;

pub type SharedStmState = Rc<RefCell<StmState>>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StmState {
    hook: Option<IoctlRequest>,
}

impl StmState {
    pub fn new_shared() -> SharedStmState {
        Rc::new(RefCell::new(Self::default()))
    }

    pub fn has_hook(&self) -> bool {
        self.hook.is_some()
    }

    /// Remove the parked hook request so the caller can answer it with `event`.
    ///
    /// The event code is written to the hook's output buffer here.
    pub fn fire(&mut self, memory: &mut dyn ios_mem::GuestMemory, event: u32) -> Option<Request> {
        let hook = self.hook.take()?;
        memory.write_u32(hook.buffer_out, event);
        Some(hook.request)
    }
}

pub struct StmImmediate {
    base: DeviceBase,
    state: SharedStmState,
}

impl StmImmediate {
    pub fn new(state: SharedStmState) -> Self {
        Self {
            base: DeviceBase::new(IMMEDIATE_NAME),
            state,
        }
    }
}

impl Device for StmImmediate {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn ioctl(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlRequest) -> Option<IpcReply> {
        let rv = match request.command {
            IOCTL_RELEASE_EH => {
                let released = self.state.borrow_mut().fire(ctx.memory, 0);
                match released {
                    Some(hook) => {
                        ctx.enqueue_reply(&hook, IPC_SUCCESS, None);
                        IPC_SUCCESS
                    }
                    None => IPC_ENOENT,
                }
            }
            IOCTL_HOTRESET => {
                info!("STM hot reset requested");
                IPC_SUCCESS
            }
            IOCTL_SHUTDOWN => {
                info!("STM shutdown requested");
                IPC_SUCCESS
            }
            IOCTL_VIDIMMING | IOCTL_LEDMODE => IPC_SUCCESS,
            other => {
                warn!(command = other, "unsupported STM immediate ioctl");
                return Some(IpcReply::unsupported());
            }
        };
        Some(IpcReply::new(rv))
    }
}

pub struct StmEventHook {
    base: DeviceBase,
    state: SharedStmState,
}

impl StmEventHook {
    pub fn new(state: SharedStmState) -> Self {
        Self {
            base: DeviceBase::new(EVENTHOOK_NAME),
            state,
        }
    }
}

impl Device for StmEventHook {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn close(&mut self, _ctx: &mut DeviceContext<'_>, _fd: u32) -> Option<IpcReply> {
        self.state.borrow_mut().hook = None;
        self.base.set_active(false);
        Some(IpcReply::success())
    }

    fn ioctl(&mut self, _ctx: &mut DeviceContext<'_>, request: &IoctlRequest) -> Option<IpcReply> {
        if request.command != IOCTL_EVENTHOOK {
            warn!(command = request.command, "unsupported STM eventhook ioctl");
            return Some(IpcReply::unsupported());
        }
        let mut state = self.state.borrow_mut();
        if state.hook.is_some() {
            return Some(IpcReply::new(IPC_EEXIST));
        }
        state.hook = Some(*request);
        None
    }

    fn save_state(&self, w: &mut dyn Write) -> ios_snapshot::Result<()> {
        self.base.save_state(w)?;
        let state = self.state.borrow();
        match &state.hook {
            Some(hook) => {
                w.write_bool(true)?;
                w.write_u32_le(hook.request.address)?;
                w.write_u32_le(hook.request.command)?;
                w.write_u32_le(hook.request.fd)?;
                w.write_u32_le(hook.command)?;
                w.write_u32_le(hook.buffer_in)?;
                w.write_u32_le(hook.buffer_in_size)?;
                w.write_u32_le(hook.buffer_out)?;
                w.write_u32_le(hook.buffer_out_size)?;
            }
            None => w.write_bool(false)?,
        }
        Ok(())
    }

    fn load_state(&mut self, r: &mut dyn Read) -> ios_snapshot::Result<()> {
        self.base.load_state(r)?;
        let hook = if r.read_bool()? {
            Some(IoctlRequest {
                request: Request {
                    address: r.read_u32_le()?,
                    command: r.read_u32_le()?,
                    fd: r.read_u32_le()?,
                },
                command: r.read_u32_le()?,
                buffer_in: r.read_u32_le()?,
                buffer_in_size: r.read_u32_le()?,
                buffer_out: r.read_u32_le()?,
                buffer_out_size: r.read_u32_le()?,
            })
        } else {
            None
        };
        self.state.borrow_mut().hook = hook;
        Ok(())
    }
}
