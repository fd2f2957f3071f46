//! The descriptor table: a fixed array of slots mapping guest descriptors to devices.

use std::collections::BTreeSet;
use std::fmt;

use crate::device::Device;
use crate::registry::DeviceId;

/// Number of regular descriptors a guest can hold open at once.
pub const IPC_MAX_FDS: usize = 0x18;

/// A validated regular descriptor, always below [`IPC_MAX_FDS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(u8);

impl Fd {
    pub fn new(raw: u32) -> Option<Self> {
        (raw < IPC_MAX_FDS as u32).then_some(Self(raw as u8))
    }

    pub fn get(self) -> u32 {
        u32::from(self.0)
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptors permanently bound to the crypto engines. They never occupy a regular slot and
/// cannot be named by guest requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixedFd {
    Aes,
    Sha,
}

impl FixedFd {
    pub const ALL: [FixedFd; 2] = [FixedFd::Aes, FixedFd::Sha];

    pub fn device_name(self) -> &'static str {
        match self {
            Self::Aes => "/dev/aes",
            Self::Sha => "/dev/sha",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Aes => 0,
            Self::Sha => 1,
        }
    }
}

pub enum Slot {
    /// A registry device. Several slots may name the same static device; its per-open state is
    /// keyed by descriptor.
    Static(DeviceId),
    /// A device owned by this slot alone and dropped with it.
    Dynamic(Box<dyn Device>),
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(id) => f.debug_tuple("Static").field(id).finish(),
            Self::Dynamic(device) => f.debug_tuple("Dynamic").field(&device.name()).finish(),
        }
    }
}

pub struct DescriptorTable {
    slots: [Option<Slot>; IPC_MAX_FDS],
    fixed: [Option<DeviceId>; 2],
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DescriptorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            fixed: [None; 2],
        }
    }

    /// The lowest-numbered empty slot.
    pub fn free_slot(&self) -> Option<Fd> {
        self.slots
            .iter()
            .position(Option::is_none)
            .map(|i| Fd(i as u8))
    }

    /// # Panics
    ///
    /// Panics if `fd` is already occupied.
    pub fn insert(&mut self, fd: Fd, slot: Slot) {
        let entry = &mut self.slots[fd.index()];
        assert!(entry.is_none(), "descriptor {fd} is already in use");
        *entry = Some(slot);
    }

    pub fn take(&mut self, fd: Fd) -> Option<Slot> {
        self.slots[fd.index()].take()
    }

    pub fn get(&self, fd: Fd) -> Option<&Slot> {
        self.slots[fd.index()].as_ref()
    }

    pub fn get_mut(&mut self, fd: Fd) -> Option<&mut Slot> {
        self.slots[fd.index()].as_mut()
    }

    pub fn is_open(&self, fd: Fd) -> bool {
        self.slots[fd.index()].is_some()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Fd, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (Fd(i as u8), s)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Fd, &mut Slot)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (Fd(i as u8), s)))
    }

    /// Static devices with at least one open descriptor, each listed once.
    pub fn open_statics(&self) -> BTreeSet<DeviceId> {
        self.iter()
            .filter_map(|(_, slot)| match slot {
                Slot::Static(id) => Some(*id),
                Slot::Dynamic(_) => None,
            })
            .collect()
    }

    pub fn bind_fixed(&mut self, fixed: FixedFd, device: DeviceId) {
        self.fixed[fixed.index()] = Some(device);
    }

    pub fn fixed(&self, fixed: FixedFd) -> Option<DeviceId> {
        self.fixed[fixed.index()]
    }

    /// Empty every regular slot, dropping dynamic devices. Fixed bindings stay.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn static_slot() -> Slot {
        Slot::Static(DeviceId::from_raw(0))
    }

    #[test]
    fn fd_bounds() {
        assert_eq!(Fd::new(0).map(Fd::get), Some(0));
        assert_eq!(Fd::new(0x17).map(Fd::get), Some(0x17));
        assert!(Fd::new(0x18).is_none());
        assert!(Fd::new(u32::MAX).is_none());
    }

    #[test]
    fn fills_up_and_reuses_lowest() {
        let mut table = DescriptorTable::new();
        for _ in 0..IPC_MAX_FDS {
            let fd = table.free_slot().unwrap();
            table.insert(fd, static_slot());
        }
        assert_eq!(table.free_slot(), None);
        assert_eq!(table.open_count(), IPC_MAX_FDS);

        table.take(Fd::new(7).unwrap());
        table.take(Fd::new(3).unwrap());
        assert_eq!(table.free_slot(), Fd::new(3));
    }

    #[test]
    fn open_statics_lists_each_device_once() {
        let mut table = DescriptorTable::new();
        table.insert(Fd::new(0).unwrap(), static_slot());
        table.insert(Fd::new(1).unwrap(), static_slot());
        table.insert(Fd::new(2).unwrap(), Slot::Static(DeviceId::from_raw(4)));
        assert_eq!(
            table.open_statics().into_iter().collect::<Vec<_>>(),
            vec![DeviceId::from_raw(0), DeviceId::from_raw(4)]
        );

        table.take(Fd::new(0).unwrap());
        assert!(table.open_statics().contains(&DeviceId::from_raw(0)));
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn double_insert_panics() {
        let mut table = DescriptorTable::new();
        let fd = Fd::new(1).unwrap();
        table.insert(fd, static_slot());
        table.insert(fd, static_slot());
    }

    proptest! {
        #[test]
        fn free_slot_is_always_lowest_empty(ops in proptest::collection::vec((any::<bool>(), 0u32..0x18), 1..200)) {
            let mut table = DescriptorTable::new();
            let mut model = [false; IPC_MAX_FDS];
            for (open, raw) in ops {
                if open {
                    let expected = model.iter().position(|used| !used);
                    let got = table.free_slot();
                    prop_assert_eq!(got.map(Fd::index), expected);
                    if let Some(fd) = got {
                        table.insert(fd, static_slot());
                        model[fd.index()] = true;
                    }
                } else {
                    let fd = Fd::new(raw).unwrap();
                    prop_assert_eq!(table.take(fd).is_some(), model[fd.index()]);
                    model[fd.index()] = false;
                }
            }
            prop_assert_eq!(table.open_count(), model.iter().filter(|u| **u).count());
        }
    }
}
