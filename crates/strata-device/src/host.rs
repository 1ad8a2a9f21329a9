use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::device::{Device, DeviceCaps, DeviceIdSlot, DeviceType};
use crate::error::{DeviceError, DeviceResult};
use crate::memory::{
    AllocParams, DeviceAllocation, DevicePtr, DeviceRange, MappedRegion, MemoryType, resolve_size,
};

struct HostAllocation {
    data: Box<[u8]>,
    mapped: bool,
}

#[derive(Default)]
struct HostState {
    alloc_cnt: u32,
    allocations: HashMap<u32, HostAllocation>,
}

/// Plain host memory exposed through the device contract.
///
/// Registered as device 0 so host buffers can take part in kernel launches
/// like any other range.
pub struct HostDevice {
    id: DeviceIdSlot,
    state: Mutex<HostState>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            id: DeviceIdSlot::new(),
            state: Mutex::new(HostState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.state().allocations.len()
    }

    fn check_owner(&self, alloc: DeviceAllocation) -> DeviceResult<()> {
        if alloc.device != self.id() {
            return Err(DeviceError::precondition(format!(
                "allocation {alloc:?} does not belong to host device {:?}",
                self.id()
            )));
        }
        Ok(())
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostState {
    fn get_mut(&mut self, alloc: DeviceAllocation) -> DeviceResult<&mut HostAllocation> {
        self.allocations
            .get_mut(&alloc.alloc_id)
            .ok_or_else(|| DeviceError::precondition(format!("unknown allocation {alloc:?}")))
    }
}

/// Zero-filled host block; failure to reserve it is a capacity error.
fn zeroed(size: u64) -> DeviceResult<Box<[u8]>> {
    let len = usize::try_from(size).map_err(|_| {
        DeviceError::resource_limit(format!("{size} bytes exceed the host address space"))
    })?;
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|e| {
        DeviceError::resource_limit(format!("host allocation of {size} bytes failed: {e}"))
    })?;
    data.resize(len, 0u8);
    Ok(data.into_boxed_slice())
}

fn checked_span(offset: u64, len: u64, total: usize) -> DeviceResult<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= total as u64)
        .ok_or_else(|| {
            DeviceError::precondition(format!(
                "range {offset}+{len} exceeds allocation of {total} bytes"
            ))
        })?;
    Ok(offset as usize..end as usize)
}

impl Device for HostDevice {
    fn id_slot(&self) -> &DeviceIdSlot {
        &self.id
    }

    fn query_type(&self) -> DeviceType {
        DeviceType::Host
    }

    fn query_capabilities(&self) -> DeviceCaps {
        DeviceCaps::empty()
    }

    fn query_available_memory(&self, _ty: MemoryType) -> u64 {
        isize::MAX as u64
    }

    fn allocate_memory(&self, params: AllocParams) -> DeviceResult<DeviceAllocation> {
        let data = zeroed(params.size)?;
        let mut state = self.state();
        let alloc_id = state.alloc_cnt;
        state.alloc_cnt += 1;
        state.allocations.insert(alloc_id, HostAllocation { data, mapped: false });
        Ok(DeviceAllocation::new(self.id(), alloc_id))
    }

    fn deallocate_memory(&self, alloc: DeviceAllocation) -> DeviceResult<()> {
        self.check_owner(alloc)?;
        self.state()
            .allocations
            .remove(&alloc.alloc_id)
            .map(|_| ())
            .ok_or_else(|| DeviceError::precondition(format!("unknown allocation {alloc:?}")))
    }

    fn barrier(&self, _range: DeviceRange) -> DeviceResult<()> {
        Ok(())
    }

    fn sync_read(&self, _range: DeviceRange, _other: &dyn Device) -> DeviceResult<()> {
        Ok(())
    }

    fn sync_write(&self, _range: DeviceRange, _other: &dyn Device) -> DeviceResult<()> {
        Ok(())
    }

    fn map(&self, alloc: DeviceAllocation) -> DeviceResult<MappedRegion> {
        self.map_range(alloc.ptr(0), crate::WHOLE_SIZE)
    }

    fn map_range(&self, ptr: DevicePtr, size: u64) -> DeviceResult<MappedRegion> {
        let alloc = ptr.allocation();
        self.check_owner(alloc)?;

        let mut state = self.state();
        let entry = state.get_mut(alloc)?;
        if entry.mapped {
            return Err(DeviceError::precondition(format!("{alloc:?} is already mapped")));
        }

        let size = resolve_size(ptr.offset, size, entry.data.len() as u64);
        let span = checked_span(ptr.offset, size, entry.data.len())?;
        entry.mapped = true;

        let base = entry.data[span.clone()].as_mut_ptr();
        let base = NonNull::new(base).unwrap_or(NonNull::dangling());
        // SAFETY: the boxed slice is not moved or freed while mapped; unmap and
        // deallocate are the only ways to end the mapping.
        Ok(unsafe { MappedRegion::new(base, span.len()) })
    }

    fn unmap(&self, alloc: DeviceAllocation) -> DeviceResult<()> {
        self.check_owner(alloc)?;
        let mut state = self.state();
        let entry = state.get_mut(alloc)?;
        if !entry.mapped {
            return Err(DeviceError::precondition(format!("{alloc:?} is not mapped")));
        }
        entry.mapped = false;
        Ok(())
    }

    fn read_range(&self, range: DeviceRange) -> DeviceResult<Vec<u8>> {
        let alloc = range.ptr.allocation();
        self.check_owner(alloc)?;
        let mut state = self.state();
        let entry = state.get_mut(alloc)?;
        let span = checked_span(range.ptr.offset, range.length, entry.data.len())?;
        Ok(entry.data[span].to_vec())
    }

    fn write_range(&self, dst: DevicePtr, data: &[u8]) -> DeviceResult<()> {
        let alloc = dst.allocation();
        self.check_owner(alloc)?;
        let mut state = self.state();
        let entry = state.get_mut(alloc)?;
        let span = checked_span(dst.offset, data.len() as u64, entry.data.len())?;
        entry.data[span].copy_from_slice(data);
        Ok(())
    }

    fn sync_all(&self) -> DeviceResult<()> {
        Ok(())
    }
}
