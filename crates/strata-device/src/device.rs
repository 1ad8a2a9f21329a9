use std::sync::OnceLock;

use bitflags::bitflags;

use crate::compute::ComputeDevice;
use crate::error::{DeviceError, DeviceResult};
use crate::memory::{
    AllocParams, DeviceAllocation, DeviceId, DevicePtr, DeviceRange, MappedRegion, MemoryType,
};

bitflags! {
    /// Capability classes a device advertises.
    ///
    /// Callers query these before reaching for a capability-gated interface
    /// (`Device::as_compute`, the backend's graphics/display entry points).
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DeviceCaps: u32 {
        const COMPUTE = 1;
        const GRAPHICS = 1 << 1;
        const DISPLAY = 1 << 2;
        const ACCEL_RAYTRACING = 1 << 3;
        const ACCEL_TENSOR = 1 << 4;
        const ACCEL_CODEC = 1 << 5;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Plain host memory.
    Host,
    /// GPU sharing physical memory with the host.
    GpuUma,
    /// Discrete GPU.
    Gpu,
    /// Device behind a transport (network, IPC).
    Remote,
}

/// Write-once slot holding the id the registry assigned to a device.
#[derive(Debug, Default)]
pub struct DeviceIdSlot(OnceLock<DeviceId>);

impl DeviceIdSlot {
    pub const fn new() -> Self {
        Self(OnceLock::new())
    }

    pub fn get(&self) -> Option<DeviceId> {
        self.0.get().copied()
    }

    /// Returns `false` when an id was already assigned.
    pub(crate) fn assign(&self, id: DeviceId) -> bool {
        self.0.set(id).is_ok()
    }
}

/// Memory-level contract every backend implements.
///
/// Methods take `&self`; implementations keep their tables behind a lock.
/// One device's recording and allocation APIs must still be driven by one
/// thread at a time.
pub trait Device: Send + Sync {
    fn id_slot(&self) -> &DeviceIdSlot;

    /// Id assigned at registration, or [`DeviceId::UNASSIGNED`].
    fn id(&self) -> DeviceId {
        self.id_slot().get().unwrap_or(DeviceId::UNASSIGNED)
    }

    fn query_type(&self) -> DeviceType;

    fn query_capabilities(&self) -> DeviceCaps;

    /// Upper bound on a single allocation of the given type, in bytes.
    fn query_available_memory(&self, ty: MemoryType) -> u64;

    fn allocate_memory(&self, params: AllocParams) -> DeviceResult<DeviceAllocation>;

    /// Frees the allocation. Deallocating an alias only drops the alias.
    fn deallocate_memory(&self, alloc: DeviceAllocation) -> DeviceResult<()>;

    /// Zero-copy view of another device's range, when both devices share memory.
    fn get_local_alias(&self, _other: DeviceRange) -> Option<DevicePtr> {
        None
    }

    fn is_alias(&self, _ptr: DevicePtr) -> bool {
        false
    }

    /// Orders all prior writes to `range` before later reads on this device.
    fn barrier(&self, range: DeviceRange) -> DeviceResult<()>;

    /// Stalls this device until `other` has finished modifying `range`.
    fn sync_read(&self, range: DeviceRange, other: &dyn Device) -> DeviceResult<()>;

    /// Stalls this device until its own writes to `range` are visible to `other`.
    fn sync_write(&self, range: DeviceRange, other: &dyn Device) -> DeviceResult<()>;

    /// Maps the whole allocation. At most one mapping may be active.
    fn map(&self, alloc: DeviceAllocation) -> DeviceResult<MappedRegion>;

    /// Maps `size` bytes at `ptr`. Counts as the allocation's one mapping.
    fn map_range(&self, ptr: DevicePtr, size: u64) -> DeviceResult<MappedRegion>;

    fn unmap(&self, alloc: DeviceAllocation) -> DeviceResult<()>;

    /// Copies `range` out to host memory, waiting for pending device writes.
    fn read_range(&self, range: DeviceRange) -> DeviceResult<Vec<u8>>;

    /// Writes host bytes at `dst`, ordered after previously submitted work.
    fn write_range(&self, dst: DevicePtr, data: &[u8]) -> DeviceResult<()>;

    /// Copies `src` (living on `src_device`) into `dst` on this device.
    ///
    /// The default stages the bytes through the host; backends override it
    /// with a native copy when both ends share a device.
    fn transfer(&self, dst: DevicePtr, src: DeviceRange, src_device: &dyn Device) -> DeviceResult<()> {
        if dst.device != self.id() {
            return Err(DeviceError::precondition(format!(
                "transfer destination lives on {:?}, not {:?}",
                dst.device,
                self.id()
            )));
        }
        let bytes = src_device.read_range(src)?;
        self.write_range(dst, &bytes)
    }

    /// Blocks until every piece of work submitted to this device completed.
    fn sync_all(&self) -> DeviceResult<()>;

    /// Compute view of this device, present when it advertises `COMPUTE`.
    fn as_compute(&self) -> Option<&dyn ComputeDevice> {
        None
    }
}
