//! The device capability interface and the emulated devices behind it.
//!
//! Every emulated hardware unit implements [`Device`]. All operations have defaults, so a device
//! only overrides what it actually models; anything else answers with
//! [`IpcReply::unsupported`] instead of failing the dispatch path.

use std::any::Any;
use std::io::{Read, Write};
use std::sync::mpsc;

use ios_mem::GuestMemory;
use ios_snapshot::{ReadLeExt, SnapshotError, WriteLeExt};
use tracing::warn;

use crate::boot::BootRequest;
use crate::ipc::{
    IoctlRequest, IoctlvRequest, IpcReply, OpenRequest, ReadWriteRequest, Request, SeekRequest,
};
use crate::kernel::Credentials;

pub mod aes;
pub mod catalog;
pub mod dolphin;
pub mod es;
pub mod fs;
pub mod sha;
pub mod stm;
pub mod stub;
pub mod usb_oh0;

/// How a device's lifetime is tied to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Registered by name for the lifetime of the kernel instance.
    Static,
    /// A `/dev/usb/oh0/<vid>/<pid>` child, created on open and owned by its descriptor slot.
    UsbOh0Child,
}

impl DeviceKind {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Static => 0,
            Self::UsbOh0Child => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Static),
            1 => Some(Self::UsbOh0Child),
            _ => None,
        }
    }

    pub fn is_dynamic(self) -> bool {
        !matches!(self, Self::Static)
    }
}

/// State every device carries regardless of what it emulates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBase {
    name: String,
    kind: DeviceKind,
    active: bool,
}

impl DeviceBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_kind(name, DeviceKind::Static)
    }

    pub fn with_kind(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            active: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn save_state(&self, w: &mut dyn Write) -> ios_snapshot::Result<()> {
        w.write_string_u32(&self.name)?;
        w.write_u8(self.kind.to_u8())?;
        w.write_bool(self.active)
    }

    /// Restore the base fields.
    ///
    /// The saved kind must match. Static devices must also match by name; dynamic devices are
    /// constructed blank and adopt the saved name.
    pub fn load_state(&mut self, r: &mut dyn Read) -> ios_snapshot::Result<()> {
        let name = r.read_string_u32()?;
        let raw_kind = r.read_u8()?;
        let kind = DeviceKind::from_u8(raw_kind).ok_or(SnapshotError::UnknownDeviceKind(raw_kind))?;
        if kind != self.kind {
            return Err(SnapshotError::DeviceMismatch {
                expected: format!("{} ({:?})", self.name, self.kind),
                found: format!("{name} ({kind:?})"),
            });
        }
        if !kind.is_dynamic() && name != self.name {
            return Err(SnapshotError::DeviceMismatch {
                expected: self.name.clone(),
                found: name,
            });
        }
        self.name = name;
        self.active = r.read_bool()?;
        Ok(())
    }
}

/// A reply produced outside the synchronous return path of a device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub request: Request,
    pub return_value: i32,
    /// `None` uses the configured default reply delay.
    pub delay: Option<u64>,
}

/// Handle for reporting completions from background threads.
///
/// Completions sent here are picked up on the dispatch path the next time the kernel updates
/// its devices, and go through the same reply ordering as every other reply.
#[derive(Debug, Clone)]
pub struct CompletionSender(mpsc::Sender<Completion>);

impl CompletionSender {
    pub(crate) fn new(tx: mpsc::Sender<Completion>) -> Self {
        Self(tx)
    }

    /// Returns `false` if the kernel that handed out this sender is gone.
    pub fn send(&self, completion: Completion) -> bool {
        self.0.send(completion).is_ok()
    }
}

/// Side effects a device asks the kernel to perform after the current operation returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeviceEffect {
    Reply(Completion),
    Boot(BootRequest),
}

/// Everything a device may touch while handling a command or an update.
pub struct DeviceContext<'a> {
    pub memory: &'a mut dyn GuestMemory,
    now: u64,
    title_id: u64,
    credentials: &'a mut Credentials,
    effects: &'a mut Vec<DeviceEffect>,
    completions: &'a mpsc::Sender<Completion>,
}

impl<'a> DeviceContext<'a> {
    pub(crate) fn new(
        memory: &'a mut dyn GuestMemory,
        now: u64,
        title_id: u64,
        credentials: &'a mut Credentials,
        effects: &'a mut Vec<DeviceEffect>,
        completions: &'a mpsc::Sender<Completion>,
    ) -> Self {
        Self {
            memory,
            now,
            title_id,
            credentials,
            effects,
            completions,
        }
    }

    /// Current virtual time in scheduler ticks.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Title id of the running IOS.
    pub fn title_id(&self) -> u64 {
        self.title_id
    }

    pub fn credentials(&self) -> Credentials {
        *self.credentials
    }

    pub fn set_uid(&mut self, uid: u32) {
        self.credentials.uid = uid;
    }

    pub fn set_gid(&mut self, gid: u16) {
        self.credentials.gid = gid;
    }

    /// Reply to a request that was previously left pending.
    pub fn enqueue_reply(&mut self, request: &Request, return_value: i32, delay: Option<u64>) {
        self.effects.push(DeviceEffect::Reply(Completion {
            request: *request,
            return_value,
            delay,
        }));
    }

    /// Ask the host to reload into another IOS once the current command has been handled.
    pub fn request_boot(&mut self, request: BootRequest) {
        self.effects.push(DeviceEffect::Boot(request));
    }

    pub fn completion_sender(&self) -> CompletionSender {
        CompletionSender::new(self.completions.clone())
    }
}

pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// An emulated IOS resource.
///
/// Returning `None` from a command means the reply will arrive later through
/// [`DeviceContext::enqueue_reply`] (or a [`CompletionSender`]). Exactly one reply must
/// eventually be produced for every request that returned `None`.
pub trait Device: AsAny {
    fn base(&self) -> &DeviceBase;
    fn base_mut(&mut self) -> &mut DeviceBase;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn kind(&self) -> DeviceKind {
        self.base().kind()
    }

    fn is_active(&self) -> bool {
        self.base().is_active()
    }

    fn open(&mut self, _ctx: &mut DeviceContext<'_>, _request: &OpenRequest) -> Option<IpcReply> {
        self.base_mut().set_active(true);
        Some(IpcReply::success())
    }

    fn close(&mut self, _ctx: &mut DeviceContext<'_>, _fd: u32) -> Option<IpcReply> {
        self.base_mut().set_active(false);
        Some(IpcReply::success())
    }

    fn seek(&mut self, _ctx: &mut DeviceContext<'_>, _request: &SeekRequest) -> Option<IpcReply> {
        unsupported(self.name(), "seek")
    }

    fn read(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _request: &ReadWriteRequest,
    ) -> Option<IpcReply> {
        unsupported(self.name(), "read")
    }

    fn write(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _request: &ReadWriteRequest,
    ) -> Option<IpcReply> {
        unsupported(self.name(), "write")
    }

    fn ioctl(&mut self, _ctx: &mut DeviceContext<'_>, request: &IoctlRequest) -> Option<IpcReply> {
        warn!(device = self.name(), command = request.command, "unsupported ioctl");
        Some(IpcReply::unsupported())
    }

    fn ioctlv(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        request: &IoctlvRequest,
    ) -> Option<IpcReply> {
        warn!(device = self.name(), command = request.command, "unsupported ioctlv");
        Some(IpcReply::unsupported())
    }

    /// Called once per host update for every open device.
    fn update(&mut self, _ctx: &mut DeviceContext<'_>) {}

    fn save_state(&self, w: &mut dyn Write) -> ios_snapshot::Result<()> {
        self.base().save_state(w)
    }

    fn load_state(&mut self, r: &mut dyn Read) -> ios_snapshot::Result<()> {
        self.base_mut().load_state(r)
    }
}

fn unsupported(device: &str, op: &'static str) -> Option<IpcReply> {
    warn!(device, op, "unsupported command");
    Some(IpcReply::unsupported())
}

/// Write `data` into a guest buffer of `capacity` bytes, truncating to fit.
pub(crate) fn write_guest_buffer(
    memory: &mut dyn GuestMemory,
    address: u32,
    capacity: u32,
    data: &[u8],
) -> usize {
    let len = data.len().min(capacity as usize);
    memory.copy_in(address, &data[..len]);
    len
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::mpsc;

    use ios_mem::GuestRam;

    use super::{Completion, DeviceContext, DeviceEffect};
    use crate::kernel::Credentials;

    /// Owns everything a [`DeviceContext`] borrows, for driving one device directly.
    pub(crate) struct Harness {
        pub ram: GuestRam,
        pub now: u64,
        pub credentials: Credentials,
        pub effects: Vec<DeviceEffect>,
        tx: mpsc::Sender<Completion>,
        _rx: mpsc::Receiver<Completion>,
    }

    impl Harness {
        pub fn new() -> Self {
            let (tx, rx) = mpsc::channel();
            Self {
                ram: GuestRam::new(),
                now: 0,
                credentials: Credentials::default(),
                effects: Vec::new(),
                tx,
                _rx: rx,
            }
        }

        pub fn with_ctx<R>(&mut self, f: impl FnOnce(&mut DeviceContext<'_>) -> R) -> R {
            let mut ctx = DeviceContext::new(
                &mut self.ram,
                self.now,
                crate::boot::titles::SYSTEM_MENU_IOS,
                &mut self.credentials,
                &mut self.effects,
                &self.tx,
            );
            f(&mut ctx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn static_base_rejects_other_name() {
        let mut buf = Vec::new();
        DeviceBase::new("/dev/es").save_state(&mut buf).unwrap();

        let mut fs = DeviceBase::new("/dev/fs");
        let err = fs.load_state(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, SnapshotError::DeviceMismatch { .. }));
    }

    #[test]
    fn dynamic_base_adopts_saved_name_but_not_other_kind() {
        let mut saved = DeviceBase::with_kind("/dev/usb/oh0/57e/308", DeviceKind::UsbOh0Child);
        saved.set_active(true);
        let mut buf = Vec::new();
        saved.save_state(&mut buf).unwrap();

        let mut blank = DeviceBase::with_kind("", DeviceKind::UsbOh0Child);
        blank.load_state(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(blank, saved);

        let mut wrong = DeviceBase::new("/dev/usb/oh0/57e/308");
        assert!(wrong.load_state(&mut Cursor::new(&buf)).is_err());
    }
}
