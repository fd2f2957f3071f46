//! Name-indexed table of the static devices a kernel instance registers at construction.

use std::collections::HashMap;

use crate::device::{Device, DeviceKind};

/// Index of a static device in its [`DeviceRegistry`]. Only meaningful for the registry that
/// handed it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(usize);

impl DeviceId {
    pub fn index(self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(index: usize) -> Self {
        Self(index)
    }
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Vec<Box<dyn Device>>,
    by_name: HashMap<String, DeviceId>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a static device under its own name.
    ///
    /// # Panics
    ///
    /// Panics if a device with the same name is already registered, or if `device` is not a
    /// static device. Both are wiring bugs in the embedding code.
    pub fn register_static(&mut self, device: Box<dyn Device>) -> DeviceId {
        let name = device.name().to_string();
        assert!(
            device.kind() == DeviceKind::Static,
            "device {name} registered as static but has kind {:?}",
            device.kind()
        );
        assert!(
            !self.by_name.contains_key(&name),
            "static device {name} registered twice"
        );
        let id = DeviceId(self.devices.len());
        self.devices.push(device);
        self.by_name.insert(name, id);
        id
    }

    pub fn by_name(&self, name: &str) -> Option<DeviceId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: DeviceId) -> Option<&dyn Device> {
        self.devices.get(id.0).map(|d| d.as_ref())
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut (dyn Device + 'static)> {
        self.devices.get_mut(id.0).map(|d| d.as_mut())
    }

    /// Typed access to a registered device.
    pub fn device_mut<T: Device>(&mut self, name: &str) -> Option<&mut T> {
        let id = self.by_name(name)?;
        self.devices[id.0].as_any_mut().downcast_mut::<T>()
    }

    pub fn device<T: Device>(&self, name: &str) -> Option<&T> {
        let id = self.by_name(name)?;
        self.devices[id.0].as_any().downcast_ref::<T>()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &dyn Device)> {
        self.devices
            .iter()
            .enumerate()
            .map(|(i, d)| (DeviceId(i), d.as_ref()))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (DeviceId, &mut Box<dyn Device>)> {
        self.devices
            .iter_mut()
            .enumerate()
            .map(|(i, d)| (DeviceId(i), d))
    }
}
