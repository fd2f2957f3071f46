//! `/dev/dolphin`: the emulator control channel homebrew uses to query the host.

use std::io::{Read, Write};

use ios_snapshot::{ReadLeExt, WriteLeExt};
use ios_time::{ticks_to_ms, CPU_TICKS_PER_SECOND};
use tracing::{info, warn};

use super::{write_guest_buffer, Device, DeviceBase, DeviceContext};
use crate::ipc::{IoctlvRequest, IpcReply, IPC_EINVAL};

pub const DEVICE_NAME: &str = "/dev/dolphin";

pub const IOCTLV_GET_ELAPSED_TIME: u32 = 0x01;
pub const IOCTLV_GET_VERSION: u32 = 0x02;
pub const IOCTLV_GET_SPEED_LIMIT: u32 = 0x03;
pub const IOCTLV_SET_SPEED_LIMIT: u32 = 0x04;
pub const IOCTLV_GET_CPU_SPEED: u32 = 0x05;
pub const IOCTLV_GET_SYSTEM_TIME: u32 = 0x0B;

const VERSION: &str = concat!("ios-hle ", env!("CARGO_PKG_VERSION"));

pub struct DolphinDevice {
    base: DeviceBase,
    system_time_base_ms: u64,
    /// Emulation speed limit in percent; 0 means unlimited.
    speed_limit: u32,
}

impl DolphinDevice {
    pub fn new(system_time_base_ms: u64) -> Self {
        Self {
            base: DeviceBase::new(DEVICE_NAME),
            system_time_base_ms,
            speed_limit: 100,
        }
    }

    pub fn speed_limit(&self) -> u32 {
        self.speed_limit
    }
}

impl Device for DolphinDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn ioctlv(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlvRequest) -> Option<IpcReply> {
        let now = ctx.now();
        let out = request.io_vector(0).copied();
        let out_at_least = |len: u32| out.filter(|v| request.has_vectors(0, 1) && v.size >= len);

        let ok = match request.command {
            IOCTLV_GET_ELAPSED_TIME => out_at_least(4).map(|v| {
                ctx.memory.write_u32(v.address, ticks_to_ms(now) as u32);
            }),
            IOCTLV_GET_VERSION => out_at_least(1).map(|v| {
                let mut bytes = VERSION.as_bytes().to_vec();
                bytes.push(0);
                write_guest_buffer(ctx.memory, v.address, v.size, &bytes);
            }),
            IOCTLV_GET_SPEED_LIMIT => out_at_least(4).map(|v| {
                ctx.memory.write_u32(v.address, self.speed_limit);
            }),
            IOCTLV_SET_SPEED_LIMIT => request
                .in_vector(0)
                .filter(|v| request.has_vectors(1, 0) && v.size >= 4)
                .copied()
                .map(|v| {
                    self.speed_limit = ctx.memory.read_u32(v.address);
                    info!(speed_limit = self.speed_limit, "guest changed emulation speed limit");
                }),
            IOCTLV_GET_CPU_SPEED => out_at_least(4).map(|v| {
                ctx.memory.write_u32(v.address, CPU_TICKS_PER_SECOND as u32);
            }),
            IOCTLV_GET_SYSTEM_TIME => out_at_least(8).map(|v| {
                let now_ms = self.system_time_base_ms + ticks_to_ms(now);
                ctx.memory.write_u64(v.address, now_ms);
            }),
            other => {
                warn!(command = other, "unsupported dolphin ioctlv");
                return Some(IpcReply::unsupported());
            }
        };
        Some(match ok {
            Some(()) => IpcReply::success(),
            None => IpcReply::new(IPC_EINVAL),
        })
    }

    fn save_state(&self, w: &mut dyn Write) -> ios_snapshot::Result<()> {
        self.base.save_state(w)?;
        w.write_u32_le(self.speed_limit)
    }

    fn load_state(&mut self, r: &mut dyn Read) -> ios_snapshot::Result<()> {
        self.base.load_state(r)?;
        self.speed_limit = r.read_u32_le()?;
        Ok(())
    }
}
