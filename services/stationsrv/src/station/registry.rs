//! Named device registry

use dashmap::DashMap;
use std::sync::Arc;

use super::device::Device;
use crate::error::{Result, StationError};

/// Devices by name; unknown names are an explicit `NotFound`
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, Arc<Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, rejecting duplicate names
    pub fn insert(&self, device: Device) -> Result<Arc<Device>> {
        let name = device.name().to_string();
        let device = Arc::new(device);
        match self.devices.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(e) => Err(StationError::validation(format!(
                "Device {} already registered",
                e.key()
            ))),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(Arc::clone(&device));
                Ok(device)
            },
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Device>> {
        self.devices
            .get(name)
            .map(|d| Arc::clone(d.value()))
            .ok_or_else(|| StationError::device_not_found(name))
    }

    pub fn remove(&self, name: &str) -> Result<Arc<Device>> {
        self.devices
            .remove(name)
            .map(|(_, d)| d)
            .ok_or_else(|| StationError::device_not_found(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<Arc<Device>> {
        self.devices.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::station::DeviceSettings;

    fn device(name: &str) -> Device {
        Device::new(name, "127.0.0.1:502", 1, DeviceSettings::default())
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = DeviceRegistry::new();
        registry.insert(device("pump-b")).unwrap();
        registry.insert(device("pump-a")).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["pump-a", "pump-b"]);

        assert_eq!(registry.get("pump-a").unwrap().name(), "pump-a");
        registry.remove("pump-a").unwrap();
        assert!(matches!(registry.get("pump-a"), Err(StationError::NotFound(_))));
        assert!(matches!(registry.remove("pump-a"), Err(StationError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = DeviceRegistry::new();
        registry.insert(device("fan")).unwrap();
        assert!(matches!(
            registry.insert(device("fan")),
            Err(StationError::ValidationError(_))
        ));
        assert_eq!(registry.len(), 1);
    }
}
