use std::ptr::NonNull;

/// Size sentinel meaning "to the end of the allocation".
pub const WHOLE_SIZE: u64 = u64::MAX;

/// Stable id handed out by the device registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Host memory always lives behind id 0.
    pub const HOST: DeviceId = DeviceId(0);

    /// Id of a device that has not been registered.
    pub const UNASSIGNED: DeviceId = DeviceId(u32::MAX);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Opaque handle to a region allocated on one device.
///
/// `alloc_id` is per-device and monotonically increasing; a live id is never
/// handed out twice.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAllocation {
    pub device: DeviceId,
    pub alloc_id: u32,
}

impl DeviceAllocation {
    #[inline]
    pub fn new(device: DeviceId, alloc_id: u32) -> Self {
        Self { device, alloc_id }
    }

    /// Pointer `offset` bytes into this allocation.
    #[inline]
    pub fn ptr(self, offset: u64) -> DevicePtr {
        DevicePtr {
            device: self.device,
            address_space: self.alloc_id,
            offset,
        }
    }

    /// Range covering `length` bytes from the start of this allocation.
    #[inline]
    pub fn range(self, length: u64) -> DeviceRange {
        DeviceRange::new(self.ptr(0), length)
    }
}

/// Pointer into any registered device's memory.
///
/// The address space is the allocation the pointer lives in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr {
    pub device: DeviceId,
    pub address_space: u32,
    pub offset: u64,
}

impl DevicePtr {
    /// Unbound slot marker. Binders skip it when writing descriptors.
    pub const NULL: DevicePtr = DevicePtr {
        device: DeviceId::UNASSIGNED,
        address_space: u32::MAX,
        offset: 0,
    };

    #[inline]
    pub fn is_null(&self) -> bool {
        self.device == DeviceId::UNASSIGNED
    }

    /// Allocation this pointer points into.
    #[inline]
    pub fn allocation(&self) -> DeviceAllocation {
        DeviceAllocation::new(self.device, self.address_space)
    }

    #[inline]
    pub fn add(self, bytes: u64) -> DevicePtr {
        DevicePtr {
            offset: self.offset + bytes,
            ..self
        }
    }
}

/// Pointer plus length. Kernel launches map logical nodes to ranges.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceRange {
    pub ptr: DevicePtr,
    pub length: u64,
}

impl DeviceRange {
    #[inline]
    pub fn new(ptr: DevicePtr, length: u64) -> Self {
        Self { ptr, length }
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.ptr.device
    }
}

/// Placement class derived from host access flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Device-local only; no host access.
    Device,
    /// Host-visible and device-local where the platform allows (UMA friendly).
    HostShared,
    /// Written by the host, read by the device.
    HostToDevice,
    /// Written by the device, read back by the host.
    DeviceToHost,
}

/// Parameters for [`Device::allocate_memory`](crate::Device::allocate_memory).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocParams {
    pub size: u64,
    pub host_read: bool,
    pub host_write: bool,
}

impl AllocParams {
    pub fn device_local(size: u64) -> Self {
        Self {
            size,
            host_read: false,
            host_write: false,
        }
    }

    pub fn host_visible(size: u64) -> Self {
        Self {
            size,
            host_read: true,
            host_write: true,
        }
    }

    pub fn memory_type(&self) -> MemoryType {
        match (self.host_read, self.host_write) {
            (true, true) => MemoryType::HostShared,
            (true, false) => MemoryType::DeviceToHost,
            (false, true) => MemoryType::HostToDevice,
            (false, false) => MemoryType::Device,
        }
    }

    pub fn is_host_visible(&self) -> bool {
        self.host_read || self.host_write
    }
}

/// Host view of a mapped region, valid until the matching `unmap`.
#[derive(Debug, Copy, Clone)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes until unmapped.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// The region must still be mapped and no other slice over it may be live.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    /// The region must still be mapped.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

/// Resolves a `WHOLE_SIZE` request against an allocation of `total` bytes.
pub fn resolve_size(offset: u64, size: u64, total: u64) -> u64 {
    if size == WHOLE_SIZE {
        total.saturating_sub(offset)
    } else {
        size
    }
}
