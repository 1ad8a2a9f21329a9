//! Structural caches and descriptor pools.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::{DeviceError, DeviceResult};

/// Sets a descriptor pool hands out before reporting exhaustion.
pub const DESCRIPTOR_POOL_CAPACITY: usize = 1000;

/// Stable handle to a cached object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheHandle(u32);

impl CacheHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Deduplicates native objects by their descriptor.
///
/// Equal keys always resolve to the same handle; objects live until the cache
/// is dropped.
#[derive(Debug)]
pub struct ObjectCache<K, V> {
    index: HashMap<K, CacheHandle>,
    objects: Vec<V>,
}

impl<K, V> Default for ObjectCache<K, V> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            objects: Vec::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V> ObjectCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for `key`, creating the object on first sight.
    ///
    /// A failing `create` leaves the cache untouched.
    pub fn get_or_try_insert_with<F>(&mut self, key: &K, create: F) -> DeviceResult<CacheHandle>
    where
        F: FnOnce(&K) -> DeviceResult<V>,
    {
        if let Some(handle) = self.index.get(key) {
            return Ok(*handle);
        }

        let object = create(key)?;
        let handle = CacheHandle(self.objects.len() as u32);
        self.objects.push(object);
        self.index.insert(key.clone(), handle);
        Ok(handle)
    }

    pub fn lookup(&self, key: &K) -> Option<CacheHandle> {
        self.index.get(key).copied()
    }

    pub fn get(&self, handle: CacheHandle) -> Option<&V> {
        self.objects.get(handle.index())
    }

    pub fn get_mut(&mut self, handle: CacheHandle) -> Option<&mut V> {
        self.objects.get_mut(handle.index())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.objects.iter_mut()
    }
}

/// Bounded pool of recyclable descriptor sets.
#[derive(Debug)]
pub struct DescriptorPool<S> {
    capacity: usize,
    allocated: usize,
    free: Vec<S>,
}

impl<S> DescriptorPool<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            allocated: 0,
            free: Vec::new(),
        }
    }

    /// Pops a recycled set, or creates one while under capacity.
    pub fn allocate(&mut self, create: impl FnOnce(usize) -> S) -> DeviceResult<S> {
        if let Some(set) = self.free.pop() {
            return Ok(set);
        }

        if self.allocated >= self.capacity {
            log::warn!("descriptor pool exhausted ({} sets)", self.capacity);
            return Err(DeviceError::resource_limit(format!(
                "descriptor pool of {} sets exhausted",
                self.capacity
            )));
        }

        let set = create(self.allocated);
        self.allocated += 1;
        Ok(set)
    }

    /// Returns a set for reuse. The caller guarantees no pending GPU use.
    pub fn recycle(&mut self, set: S) {
        self.free.push(set);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sets created so far, free or not.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}

impl<S> Default for DescriptorPool<S> {
    fn default() -> Self {
        Self::new(DESCRIPTOR_POOL_CAPACITY)
    }
}
