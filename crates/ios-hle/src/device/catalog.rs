//! The set of static devices each IOS version provides.

use tracing::debug;

use super::aes::AesDevice;
use super::dolphin::DolphinDevice;
use super::es::EsDevice;
use super::fs::FsDevice;
use super::sha::ShaDevice;
use super::stm::{SharedStmState, StmEventHook, StmImmediate};
use super::stub::StubDevice;
use super::usb_oh0::{Oh0Hub, SharedUsbHost};
use crate::boot::titles;
use crate::config::IosConfig;
use crate::fs::SharedFileSystem;
use crate::iosc::SharedKeyStore;
use crate::registry::DeviceRegistry;

/// Hardware that answers but is not emulated.
const STUB_DEVICES: &[&str] = &[
    "/dev/di",
    "/dev/sdio/slot0",
    "/dev/sdio/slot1",
    "/dev/net/kd/request",
    "/dev/net/kd/time",
    "/dev/net/ncd/manage",
    "/dev/net/wd/command",
    "/dev/net/ip/top",
    "/dev/net/ssl",
    "/dev/usb/kbd",
    "/dev/usb/hid",
    "/dev/usb/oh1/57e/305",
    "/dev/wl0",
];

/// Stubbed devices that only exist from a given IOS version on.
const VERSIONED_STUB_DEVICES: &[(u32, &str)] = &[(57, "/dev/usb/ven"), (58, "/dev/usb/ehc")];

/// Shared resources the devices of one kernel instance are wired to.
pub struct DeviceHandles {
    pub fs: SharedFileSystem,
    pub iosc: SharedKeyStore,
    pub usb: SharedUsbHost,
    pub stm: SharedStmState,
}

/// Register the static devices for `title_id`. GameCube mode registers none.
pub fn register_devices(
    registry: &mut DeviceRegistry,
    title_id: u64,
    handles: &DeviceHandles,
    config: &IosConfig,
) {
    if title_id == titles::MIOS {
        debug!("MIOS has no IPC devices");
        return;
    }
    let version = titles::version(title_id);

    registry.register_static(Box::new(FsDevice::new(handles.fs.clone())));
    registry.register_static(Box::new(EsDevice::new(handles.iosc.clone())));
    registry.register_static(Box::new(AesDevice::new()));
    registry.register_static(Box::new(ShaDevice::new()));
    registry.register_static(Box::new(StmImmediate::new(handles.stm.clone())));
    registry.register_static(Box::new(StmEventHook::new(handles.stm.clone())));
    registry.register_static(Box::new(Oh0Hub::new(handles.usb.clone())));
    registry.register_static(Box::new(DolphinDevice::new(config.system_time_base_ms)));

    for name in STUB_DEVICES {
        registry.register_static(Box::new(StubDevice::new(*name)));
    }
    for (since, name) in VERSIONED_STUB_DEVICES {
        if version >= *since {
            registry.register_static(Box::new(StubDevice::new(*name)));
        }
    }
    debug!(title_id, devices = registry.len(), "registered static devices");
}
