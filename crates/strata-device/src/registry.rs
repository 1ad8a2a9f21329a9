use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::device::Device;
use crate::error::{DeviceError, DeviceResult};
use crate::host::HostDevice;
use crate::memory::DeviceId;

/// Default device capacity.
pub const MAX_DEVICES: usize = 256;

/// Process-scoped table of devices.
///
/// Ids are handed out once, in increasing order, and never reused. The table
/// is never reset; dropping it drains devices in reverse registration order.
pub struct DeviceRegistry {
    capacity: usize,
    devices: Mutex<Vec<Arc<dyn Device>>>,
}

static GLOBAL: OnceLock<DeviceRegistry> = OnceLock::new();

impl DeviceRegistry {
    /// Empty registry with [`MAX_DEVICES`] capacity.
    pub fn new() -> Self {
        Self::with_capacity(MAX_DEVICES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            devices: Mutex::new(Vec::with_capacity(capacity.min(MAX_DEVICES))),
        }
    }

    /// Registry whose device 0 is a [`HostDevice`].
    pub fn with_host() -> DeviceResult<Self> {
        let registry = Self::new();
        registry.register_device(Arc::new(HostDevice::new()))?;
        Ok(registry)
    }

    /// Shared registry, created with a host device on first use.
    ///
    /// Prefer passing a registry explicitly; this exists for binaries that
    /// want one table for the whole process.
    pub fn global() -> &'static DeviceRegistry {
        GLOBAL.get_or_init(|| {
            let registry = Self::new();
            // Cannot fail: fresh registry, fresh host device.
            let _ = registry.register_device(Arc::new(HostDevice::new()));
            registry
        })
    }

    fn devices(&self) -> MutexGuard<'_, Vec<Arc<dyn Device>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assigns the next id to `device` and takes shared ownership of it.
    ///
    /// Fails without consuming an id when the registry is full or the device
    /// was already registered somewhere.
    pub fn register_device(&self, device: Arc<dyn Device>) -> DeviceResult<DeviceId> {
        let mut devices = self.devices();

        if devices.len() >= self.capacity {
            log::error!("device registry full ({} devices)", self.capacity);
            return Err(DeviceError::resource_limit(format!(
                "device capacity {} exhausted",
                self.capacity
            )));
        }

        let id = DeviceId(devices.len() as u32);
        if !device.id_slot().assign(id) {
            return Err(DeviceError::precondition(format!(
                "device already registered as {:?}",
                device.id()
            )));
        }

        log::debug!("registered device {:?} ({:?})", id, device.query_type());
        devices.push(device);
        Ok(id)
    }

    pub fn get_device_by_id(&self, id: DeviceId) -> Option<Arc<dyn Device>> {
        self.devices().get(id.index()).cloned()
    }

    /// Like [`get_device_by_id`](Self::get_device_by_id) but reports unknown ids.
    pub fn device(&self, id: DeviceId) -> DeviceResult<Arc<dyn Device>> {
        self.get_device_by_id(id)
            .ok_or_else(|| DeviceError::precondition(format!("unknown device {id:?}")))
    }

    pub fn len(&self) -> usize {
        self.devices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drains all devices, newest first.
    pub fn sync_all(&self) -> DeviceResult<()> {
        let devices = self.devices().clone();
        for device in devices.iter().rev() {
            device.sync_all()?;
        }
        Ok(())
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        let devices = std::mem::take(&mut *self.devices());
        for device in devices.into_iter().rev() {
            if let Err(e) = device.sync_all() {
                log::warn!("device {:?} failed to drain at shutdown: {e}", device.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── registration ──────────────────────────────────────────────────────

    #[test]
    fn ids_are_assigned_in_order() {
        let registry = DeviceRegistry::with_capacity(4);
        for expected in 0..4 {
            let id = registry.register_device(Arc::new(HostDevice::new())).unwrap();
            assert_eq!(id, DeviceId(expected));
        }
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn registration_past_capacity_fails_without_consuming_an_id() {
        let registry = DeviceRegistry::with_capacity(2);
        registry.register_device(Arc::new(HostDevice::new())).unwrap();
        registry.register_device(Arc::new(HostDevice::new())).unwrap();

        let extra = Arc::new(HostDevice::new());
        let err = registry.register_device(extra.clone()).unwrap_err();
        assert!(matches!(err, DeviceError::ResourceLimit(_)));
        assert_eq!(extra.id(), DeviceId::UNASSIGNED);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn full_default_capacity_is_honored() {
        let registry = DeviceRegistry::new();
        for i in 0..MAX_DEVICES {
            let id = registry.register_device(Arc::new(HostDevice::new())).unwrap();
            assert_eq!(id.index(), i);
        }
        assert!(registry.register_device(Arc::new(HostDevice::new())).is_err());
    }

    #[test]
    fn a_device_cannot_be_registered_twice() {
        let registry = DeviceRegistry::new();
        let dev = Arc::new(HostDevice::new());
        registry.register_device(dev.clone()).unwrap();
        let err = registry.register_device(dev).unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(registry.len(), 1);
    }

    // ── lookup ────────────────────────────────────────────────────────────

    #[test]
    fn lookup_returns_the_registered_device() {
        let registry = DeviceRegistry::with_host().unwrap();
        let host = registry.get_device_by_id(DeviceId::HOST).unwrap();
        assert_eq!(host.id(), DeviceId::HOST);
        assert!(registry.get_device_by_id(DeviceId(1)).is_none());
        assert!(matches!(registry.device(DeviceId(7)), Err(DeviceError::Precondition(_))));
    }

    #[test]
    fn global_registry_reserves_host_slot() {
        let host = DeviceRegistry::global().get_device_by_id(DeviceId::HOST).unwrap();
        assert_eq!(host.query_type(), crate::DeviceType::Host);
    }

    #[test]
    fn registration_is_thread_safe() {
        let registry = Arc::new(DeviceRegistry::with_capacity(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..8)
                        .map(|_| registry.register_device(Arc::new(HostDevice::new())).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        ids.sort();
        assert_eq!(ids, (0..64).map(DeviceId).collect::<Vec<_>>());
    }
}
