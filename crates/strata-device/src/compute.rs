//! Compute devices and the cross-device kernel launch protocol.

use std::collections::BTreeMap;

use crate::device::Device;
use crate::error::DeviceResult;
use crate::memory::{AllocParams, DeviceAllocation, DeviceRange};
use crate::registry::DeviceRegistry;

/// Logical node id → the memory range a kernel sees for it.
pub type SNodeMapping = BTreeMap<i32, DeviceRange>;

/// A device that can run compiled kernels.
pub trait ComputeDevice: Device {
    /// Runs `kernel_id` with every range already local to this device.
    fn launch_kernel_internal(
        &self,
        stream_id: u32,
        kernel_id: u32,
        mapping: &SNodeMapping,
    ) -> DeviceResult<()>;

    fn num_streams(&self) -> u32;

    fn wait_for_stream_complete(&self, stream_id: u32) -> DeviceResult<()>;
}

/// How a foreign entry was made local for one launch.
enum Localized {
    Alias,
    Copy(DeviceAllocation),
}

struct ForeignEntry {
    node: i32,
    source: DeviceRange,
    local: DeviceRange,
    how: Localized,
}

impl dyn ComputeDevice + '_ {
    /// Launches a kernel whose ranges may live on other registered devices.
    ///
    /// Foreign ranges are aliased when possible and copied otherwise. Source
    /// devices are synced once all copies are issued, the kernel runs, copies
    /// are written back and freed, and finally each source device syncs
    /// against this one. Any failure aborts the launch as-is.
    pub fn launch_kernel(
        &self,
        registry: &DeviceRegistry,
        stream_id: u32,
        kernel_id: u32,
        mapping: &SNodeMapping,
    ) -> DeviceResult<()> {
        let this: &dyn Device = self;
        let this_id = this.id();

        let mut local_mapping = SNodeMapping::new();
        let mut foreign = Vec::new();

        // preamble
        for (&node, &range) in mapping {
            if range.device() == this_id {
                local_mapping.insert(node, range);
                continue;
            }

            let source = registry.device(range.device())?;
            let (local, how) = match this.get_local_alias(range) {
                Some(ptr) => (DeviceRange::new(ptr, range.length), Localized::Alias),
                None => {
                    let scratch = this.allocate_memory(AllocParams::device_local(range.length))?;
                    let local = scratch.range(range.length);
                    this.transfer(local.ptr, range, source.as_ref())?;
                    (local, Localized::Copy(scratch))
                }
            };

            local_mapping.insert(node, local);
            foreign.push(ForeignEntry {
                node,
                source: range,
                local,
                how,
            });
        }

        // Batched after all copies so independent transfers overlap.
        for entry in &foreign {
            let source = registry.device(entry.source.device())?;
            this.sync_read(entry.local, source.as_ref())?;
        }

        self.launch_kernel_internal(stream_id, kernel_id, &local_mapping)?;

        // postamble
        for entry in &foreign {
            match entry.how {
                Localized::Copy(scratch) => {
                    let source = registry.device(entry.source.device())?;
                    source.transfer(entry.source.ptr, entry.local, this)?;
                    this.deallocate_memory(scratch)?;
                }
                Localized::Alias => {
                    log::trace!("node {} aliased, no copy-back", entry.node);
                    if this.is_alias(entry.local.ptr) {
                        this.deallocate_memory(entry.local.ptr.allocation())?;
                    }
                }
            }
        }

        for entry in &foreign {
            let source = registry.device(entry.source.device())?;
            source.sync_read(entry.source, this)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::device::{DeviceCaps, DeviceIdSlot, DeviceType};
    use crate::memory::{DeviceId, DevicePtr, MappedRegion, MemoryType};
    use crate::DeviceError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Allocate { on: u32, ty: MemoryType, size: u64 },
        Deallocate { on: u32 },
        Transfer { on: u32, from: u32 },
        SyncRead { on: u32, against: u32 },
        Launch { on: u32, kernel: u32, local: bool },
    }

    type Log = Arc<Mutex<Vec<Call>>>;

    /// Records every memory call into a log shared by all mock devices.
    struct MockDevice {
        id: DeviceIdSlot,
        log: Log,
        alias: bool,
        next_alloc: Mutex<u32>,
    }

    impl MockDevice {
        fn new(log: &Log, alias: bool) -> Arc<Self> {
            Arc::new(Self {
                id: DeviceIdSlot::new(),
                log: log.clone(),
                alias,
                next_alloc: Mutex::new(0),
            })
        }

        fn record(&self, call: Call) {
            self.log.lock().unwrap().push(call);
        }
    }

    impl Device for MockDevice {
        fn id_slot(&self) -> &DeviceIdSlot {
            &self.id
        }
        fn query_type(&self) -> DeviceType {
            DeviceType::Gpu
        }
        fn query_capabilities(&self) -> DeviceCaps {
            DeviceCaps::COMPUTE
        }
        fn query_available_memory(&self, _ty: MemoryType) -> u64 {
            u64::MAX
        }
        fn allocate_memory(&self, params: AllocParams) -> DeviceResult<DeviceAllocation> {
            self.record(Call::Allocate {
                on: self.id().0,
                ty: params.memory_type(),
                size: params.size,
            });
            let mut next = self.next_alloc.lock().unwrap();
            *next += 1;
            Ok(DeviceAllocation::new(self.id(), 100 + *next))
        }
        fn deallocate_memory(&self, _alloc: DeviceAllocation) -> DeviceResult<()> {
            self.record(Call::Deallocate { on: self.id().0 });
            Ok(())
        }
        fn get_local_alias(&self, other: DeviceRange) -> Option<DevicePtr> {
            self.alias.then(|| DeviceAllocation::new(self.id(), 900).ptr(other.ptr.offset))
        }
        fn barrier(&self, _range: DeviceRange) -> DeviceResult<()> {
            Ok(())
        }
        fn sync_read(&self, _range: DeviceRange, other: &dyn Device) -> DeviceResult<()> {
            self.record(Call::SyncRead {
                on: self.id().0,
                against: other.id().0,
            });
            Ok(())
        }
        fn sync_write(&self, _range: DeviceRange, _other: &dyn Device) -> DeviceResult<()> {
            Ok(())
        }
        fn map(&self, _alloc: DeviceAllocation) -> DeviceResult<MappedRegion> {
            Err(DeviceError::Unsupported("mock".into()))
        }
        fn map_range(&self, _ptr: DevicePtr, _size: u64) -> DeviceResult<MappedRegion> {
            Err(DeviceError::Unsupported("mock".into()))
        }
        fn unmap(&self, _alloc: DeviceAllocation) -> DeviceResult<()> {
            Ok(())
        }
        fn read_range(&self, range: DeviceRange) -> DeviceResult<Vec<u8>> {
            Ok(vec![0; range.length as usize])
        }
        fn write_range(&self, _dst: DevicePtr, _data: &[u8]) -> DeviceResult<()> {
            Ok(())
        }
        fn transfer(&self, _dst: DevicePtr, _src: DeviceRange, src_device: &dyn Device) -> DeviceResult<()> {
            self.record(Call::Transfer {
                on: self.id().0,
                from: src_device.id().0,
            });
            Ok(())
        }
        fn sync_all(&self) -> DeviceResult<()> {
            Ok(())
        }
        fn as_compute(&self) -> Option<&dyn ComputeDevice> {
            Some(self)
        }
    }

    impl ComputeDevice for MockDevice {
        fn launch_kernel_internal(
            &self,
            _stream_id: u32,
            kernel_id: u32,
            mapping: &SNodeMapping,
        ) -> DeviceResult<()> {
            let local = mapping.values().all(|r| r.device() == self.id());
            self.record(Call::Launch {
                on: self.id().0,
                kernel: kernel_id,
                local,
            });
            Ok(())
        }
        fn num_streams(&self) -> u32 {
            1
        }
        fn wait_for_stream_complete(&self, _stream_id: u32) -> DeviceResult<()> {
            Ok(())
        }
    }

    fn two_devices(alias: bool) -> (DeviceRegistry, Arc<MockDevice>, Arc<MockDevice>, Log) {
        let log: Log = Arc::default();
        let registry = DeviceRegistry::new();
        let a = MockDevice::new(&log, alias);
        let b = MockDevice::new(&log, alias);
        registry.register_device(a.clone()).unwrap();
        registry.register_device(b.clone()).unwrap();
        (registry, a, b, log)
    }

    fn range_on(device: u32, length: u64) -> DeviceRange {
        DeviceAllocation::new(DeviceId(device), 1).range(length)
    }

    fn launch(registry: &DeviceRegistry, device: &MockDevice, mapping: &SNodeMapping) {
        let compute = device.as_compute().unwrap();
        compute.launch_kernel(registry, 0, 42, mapping).unwrap();
    }

    // ── fast path ─────────────────────────────────────────────────────────

    #[test]
    fn local_ranges_launch_without_memory_traffic() {
        let (registry, a, _b, log) = two_devices(false);
        let mapping = SNodeMapping::from([(1, range_on(0, 64)), (2, range_on(0, 128))]);

        launch(&registry, &a, &mapping);

        assert_eq!(
            *log.lock().unwrap(),
            vec![Call::Launch { on: 0, kernel: 42, local: true }]
        );
    }

    // ── foreign copy path ─────────────────────────────────────────────────

    #[test]
    fn foreign_range_is_copied_synced_and_written_back() {
        let (registry, a, _b, log) = two_devices(false);
        let mapping = SNodeMapping::from([(7, range_on(1, 1024))]);

        launch(&registry, &a, &mapping);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Call::Allocate { on: 0, ty: MemoryType::Device, size: 1024 },
                Call::Transfer { on: 0, from: 1 },
                Call::SyncRead { on: 0, against: 1 },
                Call::Launch { on: 0, kernel: 42, local: true },
                Call::Transfer { on: 1, from: 0 },
                Call::Deallocate { on: 0 },
                Call::SyncRead { on: 1, against: 0 },
            ]
        );
    }

    #[test]
    fn source_syncs_are_batched_after_all_copies() {
        let (registry, a, _b, log) = two_devices(false);
        let mapping = SNodeMapping::from([(1, range_on(1, 16)), (2, range_on(1, 32))]);

        launch(&registry, &a, &mapping);

        let calls = log.lock().unwrap().clone();
        let last_transfer_in = calls
            .iter()
            .rposition(|c| matches!(c, Call::Transfer { on: 0, .. }))
            .unwrap();
        let first_sync = calls
            .iter()
            .position(|c| matches!(c, Call::SyncRead { .. }))
            .unwrap();
        assert!(last_transfer_in < first_sync);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::SyncRead { on: 0, .. })).count(), 2);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::SyncRead { on: 1, .. })).count(), 2);
    }

    // ── alias path ────────────────────────────────────────────────────────

    #[test]
    fn aliased_range_skips_copies() {
        let (registry, a, _b, log) = two_devices(true);
        let mapping = SNodeMapping::from([(3, range_on(1, 256))]);

        launch(&registry, &a, &mapping);

        let calls = log.lock().unwrap().clone();
        assert!(!calls.iter().any(|c| matches!(c, Call::Transfer { .. } | Call::Allocate { .. })));
        assert_eq!(
            calls,
            vec![
                Call::SyncRead { on: 0, against: 1 },
                Call::Launch { on: 0, kernel: 42, local: true },
                Call::SyncRead { on: 1, against: 0 },
            ]
        );
    }

    #[test]
    fn unknown_source_device_fails_before_launch() {
        let (registry, a, _b, log) = two_devices(false);
        let mapping = SNodeMapping::from([(1, range_on(5, 8))]);

        let compute = a.as_compute().unwrap();
        let err = compute.launch_kernel(&registry, 0, 1, &mapping).unwrap_err();

        assert!(err.is_precondition());
        assert!(!log.lock().unwrap().iter().any(|c| matches!(c, Call::Launch { .. })));
    }
}
