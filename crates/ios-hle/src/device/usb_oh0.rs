//! `/dev/usb/oh0`: the OHCI host controller and its per-peripheral child devices.
//!
//! Opening `/dev/usb/oh0/<vid>/<pid>` (hex, no prefix) creates a child device bound to one
//! attached peripheral. Each peripheral can be held by only one descriptor at a time.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::rc::Rc;

use ios_snapshot::{ReadLeExt, WriteLeExt};
use tracing::{info, warn};

use super::{Device, DeviceBase, DeviceContext, DeviceKind};
use crate::ipc::{
    IoctlvRequest, IpcReply, OpenRequest, IPC_EEXIST, IPC_EINVAL, IPC_ENOENT, MAX_GUEST_BUFFER,
};

pub const DEVICE_NAME: &str = "/dev/usb/oh0";
pub const CHILD_PREFIX: &str = "/dev/usb/oh0/";

pub const IOCTLV_GET_DEVICE_LIST: u32 = 0x0C;
pub const IOCTLV_CTRL_MSG: u32 = 0x00;

const DEVICE_ENTRY_SIZE: u32 = 8;

pub type SharedUsbHost = Rc<RefCell<UsbHost>>;

/// Peripherals attached to the host controller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UsbHost {
    attached: Vec<(u16, u16)>,
    opened: BTreeSet<(u16, u16)>,
}

impl UsbHost {
    pub fn new(attached: impl IntoIterator<Item = (u16, u16)>) -> Self {
        Self {
            attached: attached.into_iter().collect(),
            opened: BTreeSet::new(),
        }
    }

    pub fn into_shared(self) -> SharedUsbHost {
        Rc::new(RefCell::new(self))
    }

    pub fn attach(&mut self, vid: u16, pid: u16) {
        if !self.attached.contains(&(vid, pid)) {
            self.attached.push((vid, pid));
        }
    }

    pub fn detach(&mut self, vid: u16, pid: u16) {
        self.attached.retain(|d| *d != (vid, pid));
    }

    pub fn is_attached(&self, vid: u16, pid: u16) -> bool {
        self.attached.contains(&(vid, pid))
    }

    pub fn is_open(&self, vid: u16, pid: u16) -> bool {
        self.opened.contains(&(vid, pid))
    }
}

/// Parse the `<vid>/<pid>` suffix of a child path. Zero ids are rejected.
pub fn parse_child_path(path: &str) -> Option<(u16, u16)> {
    let rest = path.strip_prefix(CHILD_PREFIX)?;
    let (vid, pid) = rest.split_once('/')?;
    let vid = u16::from_str_radix(vid, 16).ok()?;
    let pid = u16::from_str_radix(pid, 16).ok()?;
    (vid != 0 && pid != 0).then_some((vid, pid))
}

pub struct Oh0Hub {
    base: DeviceBase,
    host: SharedUsbHost,
}

impl Oh0Hub {
    pub fn new(host: SharedUsbHost) -> Self {
        Self {
            base: DeviceBase::new(DEVICE_NAME),
            host,
        }
    }
}

impl Device for Oh0Hub {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn ioctlv(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlvRequest) -> Option<IpcReply> {
        if request.command != IOCTLV_GET_DEVICE_LIST {
            warn!(command = request.command, "unsupported oh0 ioctlv");
            return Some(IpcReply::unsupported());
        }
        if !request.has_vectors(2, 2) {
            return Some(IpcReply::new(IPC_EINVAL));
        }
        let max_entries = ctx.memory.read_u8(request.in_vectors[0].address);
        let (count_out, list_out) = (request.io_vectors[0], request.io_vectors[1]);
        let capacity = (list_out.size / DEVICE_ENTRY_SIZE).min(u32::from(max_entries));

        let host = self.host.borrow();
        let mut written = 0u32;
        for (vid, pid) in host.attached.iter().take(capacity as usize) {
            let entry = list_out.address.wrapping_add(written * DEVICE_ENTRY_SIZE);
            ctx.memory.write_u32(entry, 0);
            ctx.memory.write_u16(entry.wrapping_add(4), *vid);
            ctx.memory.write_u16(entry.wrapping_add(6), *pid);
            written += 1;
        }
        ctx.memory.write_u8(count_out.address, written as u8);
        Some(IpcReply::success())
    }
}

/// A dynamic device bound to one attached peripheral.
pub struct Oh0Child {
    base: DeviceBase,
    host: SharedUsbHost,
    vid: u16,
    pid: u16,
}

impl Oh0Child {
    /// A child for `path`, not yet claiming its peripheral. Claiming happens on open.
    pub fn new(host: SharedUsbHost, path: &str) -> Self {
        let (vid, pid) = parse_child_path(path).unwrap_or((0, 0));
        Self {
            base: DeviceBase::with_kind(path, DeviceKind::UsbOh0Child),
            host,
            vid,
            pid,
        }
    }

    /// Placeholder filled in by [`Device::load_state`].
    pub fn blank(host: SharedUsbHost) -> Self {
        Self::new(host, "")
    }

    pub fn ids(&self) -> (u16, u16) {
        (self.vid, self.pid)
    }
}

impl Device for Oh0Child {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn open(&mut self, _ctx: &mut DeviceContext<'_>, _request: &OpenRequest) -> Option<IpcReply> {
        let (vid, pid) = (self.vid, self.pid);
        let mut host = self.host.borrow_mut();
        if vid == 0 || pid == 0 || !host.is_attached(vid, pid) {
            return Some(IpcReply::new(IPC_ENOENT));
        }
        if !host.opened.insert((vid, pid)) {
            return Some(IpcReply::new(IPC_EEXIST));
        }
        info!(vid, pid, "usb peripheral opened");
        self.base.set_active(true);
        Some(IpcReply::success())
    }

    fn close(&mut self, _ctx: &mut DeviceContext<'_>, _fd: u32) -> Option<IpcReply> {
        self.host.borrow_mut().opened.remove(&(self.vid, self.pid));
        self.base.set_active(false);
        Some(IpcReply::success())
    }

    fn ioctlv(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlvRequest) -> Option<IpcReply> {
        if request.command != IOCTLV_CTRL_MSG {
            warn!(command = request.command, vid = self.vid, pid = self.pid, "unsupported usb transfer");
            return Some(IpcReply::unsupported());
        }
        // No peripheral is actually emulated behind the port: IN transfers read back zeros.
        let Some(data) = request.io_vector(0).filter(|v| v.size <= MAX_GUEST_BUFFER) else {
            return Some(IpcReply::new(IPC_EINVAL));
        };
        ctx.memory.fill(data.address, data.size as usize, 0);
        Some(IpcReply::new(data.size as i32))
    }

    fn save_state(&self, w: &mut dyn Write) -> ios_snapshot::Result<()> {
        self.base.save_state(w)?;
        w.write_u16_le(self.vid)?;
        w.write_u16_le(self.pid)
    }

    fn load_state(&mut self, r: &mut dyn Read) -> ios_snapshot::Result<()> {
        self.base.load_state(r)?;
        self.vid = r.read_u16_le()?;
        self.pid = r.read_u16_le()?;
        if self.base.is_active() {
            self.host.borrow_mut().opened.insert((self.vid, self.pid));
        }
        Ok(())
    }
}

impl Drop for Oh0Child {
    fn drop(&mut self) {
        if self.base.is_active() {
            if let Ok(mut host) = self.host.try_borrow_mut() {
                host.opened.remove(&(self.vid, self.pid));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_paths() {
        assert_eq!(parse_child_path("/dev/usb/oh0/57e/308"), Some((0x057E, 0x0308)));
        assert_eq!(parse_child_path("/dev/usb/oh0/0/0"), None);
        assert_eq!(parse_child_path("/dev/usb/oh0/57e"), None);
        assert_eq!(parse_child_path("/dev/usb/oh0/zz/1"), None);
        assert_eq!(parse_child_path("/dev/usb/oh1/57e/308"), None);
    }

    #[test]
    fn dropping_an_open_child_releases_the_peripheral() {
        let host = UsbHost::new([(0x057E, 0x0308)]).into_shared();
        let mut child = Oh0Child::new(host.clone(), "/dev/usb/oh0/57e/308");
        child.base_mut().set_active(true);
        host.borrow_mut().opened.insert((0x057E, 0x0308));
        drop(child);
        assert!(!host.borrow().is_open(0x057E, 0x0308));
    }
}
