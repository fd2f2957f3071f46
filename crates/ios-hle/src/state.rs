//! Kernel savestate serialization.
//!
//! Layout, in order: IPC queues, reply ordering state, credentials, the key store, the NAND, each
//! static device by name, then the descriptor table. Fixed descriptors are not stored; they are
//! rebound when the kernel for the saved title is constructed.

use std::collections::VecDeque;
use std::io::{Read, Write};

use ios_snapshot::{expect_marker, write_marker, ReadLeExt, Result, SnapshotError, WriteLeExt};
use tracing::debug;

use crate::device::usb_oh0::Oh0Child;
use crate::device::{Device, DeviceKind};
use crate::fdtable::{Fd, Slot, IPC_MAX_FDS};
use crate::kernel::Kernel;

/// Upper bound on queued addresses accepted from a snapshot.
const MAX_QUEUED: usize = 0x1000;

fn write_queue(w: &mut dyn Write, queue: &VecDeque<u32>) -> Result<()> {
    w.write_count_u32(queue.len())?;
    for address in queue {
        w.write_u32_le(*address)?;
    }
    Ok(())
}

fn read_queue(r: &mut dyn Read) -> Result<VecDeque<u32>> {
    let count = r.read_u32_le()? as usize;
    if count > MAX_QUEUED {
        return Err(SnapshotError::Corrupt("IPC queue too long"));
    }
    (0..count).map(|_| r.read_u32_le()).collect()
}

impl Kernel {
    pub fn save_state(&self, w: &mut dyn Write) -> Result<()> {
        write_marker(w, "KERNEL")?;
        write_queue(w, &self.request_queue)?;
        write_queue(w, &self.reply_queue)?;
        write_queue(w, &self.ack_queue)?;
        w.write_u64_le(self.last_reply_tick)?;
        w.write_bool(self.ipc_paused)?;
        w.write_u64_le(self.title_id)?;
        w.write_u32_le(self.credentials.uid)?;
        w.write_u16_le(self.credentials.gid)?;

        self.iosc.borrow().save_state(w)?;
        self.fs.borrow().save_state(w)?;

        if !self.is_mios() {
            w.write_count_u32(self.registry.len())?;
            for (_, device) in self.registry.iter() {
                w.write_string_u32(device.name())?;
                device.save_state(w)?;
            }
        }

        for index in 0..IPC_MAX_FDS as u32 {
            let slot = Fd::new(index).and_then(|fd| self.fds.get(fd));
            w.write_bool(slot.is_some())?;
            match slot {
                None => {}
                Some(Slot::Static(id)) => {
                    w.write_u8(DeviceKind::Static.to_u8())?;
                    let name = self
                        .registry
                        .get(*id)
                        .map(|d| d.name())
                        .ok_or(SnapshotError::Corrupt("descriptor names an unregistered device"))?;
                    w.write_string_u32(name)?;
                }
                Some(Slot::Dynamic(device)) => {
                    w.write_u8(device.kind().to_u8())?;
                    device.save_state(w)?;
                }
            }
        }
        write_marker(w, "KERNEL-END")
    }

    /// Restore kernel state. The kernel must have been constructed for the saved title.
    ///
    /// On error the kernel is left partially loaded; callers restore a backup.
    pub fn load_state(&mut self, r: &mut dyn Read) -> Result<()> {
        expect_marker(r, "KERNEL")?;
        self.request_queue = read_queue(r)?;
        self.reply_queue = read_queue(r)?;
        self.ack_queue = read_queue(r)?;
        self.last_reply_tick = r.read_u64_le()?;
        self.ipc_paused = r.read_bool()?;
        let title_id = r.read_u64_le()?;
        if title_id != self.title_id {
            return Err(SnapshotError::Corrupt("snapshot was taken under a different IOS"));
        }
        self.credentials.uid = r.read_u32_le()?;
        self.credentials.gid = r.read_u16_le()?;

        self.iosc.borrow_mut().load_state(r)?;
        self.fs.borrow_mut().load_state(r)?;

        if !self.is_mios() {
            let count = r.read_u32_le()? as usize;
            for _ in 0..count {
                let name = r.read_string_u32()?;
                let id = self
                    .registry
                    .by_name(&name)
                    .ok_or_else(|| SnapshotError::UnknownDevice(name.clone()))?;
                let device = self
                    .registry
                    .get_mut(id)
                    .ok_or_else(|| SnapshotError::UnknownDevice(name.clone()))?;
                device.load_state(r)?;
            }
            if count != self.registry.len() {
                return Err(SnapshotError::Corrupt("device count mismatch"));
            }
        }

        // Release children held by the current table before restored ones claim their ports.
        self.fds.clear();
        for index in 0..IPC_MAX_FDS as u32 {
            if !r.read_bool()? {
                continue;
            }
            let Some(fd) = Fd::new(index) else {
                return Err(SnapshotError::Corrupt("descriptor out of range"));
            };
            let raw_kind = r.read_u8()?;
            let kind = DeviceKind::from_u8(raw_kind).ok_or(SnapshotError::UnknownDeviceKind(raw_kind))?;
            let slot = match kind {
                DeviceKind::Static => {
                    let name = r.read_string_u32()?;
                    let id = self
                        .registry
                        .by_name(&name)
                        .ok_or(SnapshotError::UnknownDevice(name))?;
                    Slot::Static(id)
                }
                DeviceKind::UsbOh0Child => {
                    let mut child = Oh0Child::blank(self.usb.clone());
                    child.load_state(r)?;
                    Slot::Dynamic(Box::new(child))
                }
            };
            self.fds.insert(fd, slot);
        }
        expect_marker(r, "KERNEL-END")?;
        debug!(open = self.fds.open_count(), "kernel state loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::titles;
    use crate::config::IosConfig;
    use crate::device::usb_oh0::UsbHost;
    use crate::fs::MemoryNand;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn kernel(title: u64) -> Kernel {
        Kernel::new(
            title,
            &IosConfig::default(),
            MemoryNand::new().into_shared(),
            UsbHost::default().into_shared(),
        )
    }

    #[test]
    fn snapshot_is_stable_across_a_round_trip() {
        let mut k = kernel(titles::ios(58));
        k.enqueue_ipc_request(0x8000_1000);
        k.enqueue_ipc_acknowledgement(0x8000_2000);
        let mut first = Vec::new();
        k.save_state(&mut first).unwrap();

        let mut restored = kernel(titles::ios(58));
        restored.load_state(&mut Cursor::new(&first)).unwrap();
        let mut second = Vec::new();
        restored.save_state(&mut second).unwrap();
        assert_eq!(first, second);
        assert_eq!(restored.queued_requests(), 1);
    }

    #[test]
    fn snapshot_for_another_ios_is_rejected() {
        let k = kernel(titles::ios(58));
        let mut buf = Vec::new();
        k.save_state(&mut buf).unwrap();
        let err = kernel(titles::ios(36)).load_state(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt(_)));
    }

    #[test]
    fn mios_snapshot_has_no_device_section() {
        let k = kernel(titles::MIOS);
        let mut buf = Vec::new();
        k.save_state(&mut buf).unwrap();
        kernel(titles::MIOS).load_state(&mut Cursor::new(&buf)).unwrap();
    }
}
