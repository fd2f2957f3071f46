//! Placeholder for hardware that is not emulated beyond accepting commands.

use tracing::debug;

use super::{Device, DeviceBase, DeviceContext};
use crate::ipc::{IoctlRequest, IoctlvRequest, IpcReply, ReadWriteRequest, SeekRequest};

pub struct StubDevice {
    base: DeviceBase,
}

impl StubDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: DeviceBase::new(name),
        }
    }
}

impl Device for StubDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn seek(&mut self, _ctx: &mut DeviceContext<'_>, _request: &SeekRequest) -> Option<IpcReply> {
        Some(IpcReply::success())
    }

    fn read(&mut self, _ctx: &mut DeviceContext<'_>, _request: &ReadWriteRequest) -> Option<IpcReply> {
        Some(IpcReply::success())
    }

    fn write(&mut self, _ctx: &mut DeviceContext<'_>, _request: &ReadWriteRequest) -> Option<IpcReply> {
        Some(IpcReply::success())
    }

    fn ioctl(&mut self, _ctx: &mut DeviceContext<'_>, request: &IoctlRequest) -> Option<IpcReply> {
        debug!(device = self.base.name(), command = request.command, "stub ioctl");
        Some(IpcReply::success())
    }

    fn ioctlv(&mut self, _ctx: &mut DeviceContext<'_>, request: &IoctlvRequest) -> Option<IpcReply> {
        debug!(device = self.base.name(), command = request.command, "stub ioctlv");
        Some(IpcReply::success())
    }
}
