//! Resource binding description.
//!
//! A [`ResourceBinder`] starts open: every `rw_buffer`/`buffer` call creates
//! the set and binding it names. Pipelines fill a binder from shader
//! reflection and then lock it. After [`ResourceBinder::lock_layout`]:
//! - rebinding a known slot with the same kind updates pointer and size
//! - rebinding a known slot with a different kind panics
//! - binding an unknown slot is dropped (binders are shared between
//!   pipelines whose reflected subsets differ)

use std::collections::BTreeMap;

use crate::memory::{DeviceAllocation, DevicePtr, WHOLE_SIZE};

/// What a binding slot holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Storage buffer the shader may write.
    ReadWriteBuffer,
    /// Storage buffer the shader only reads.
    ReadOnlyStorageBuffer,
    /// Uniform buffer.
    ReadOnlyBuffer,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Binding {
    pub kind: ResourceKind,
    pub ptr: DevicePtr,
    pub size: u64,
}

/// Bindings of one descriptor set, ordered by binding index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingSet {
    bindings: BTreeMap<u32, Binding>,
}

impl BindingSet {
    pub fn get(&self, binding: u32) -> Option<&Binding> {
        self.bindings.get(&binding)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Binding)> {
        self.bindings.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Structural description of this set; used as a layout cache key.
    pub fn layout(&self) -> SetLayout {
        SetLayout {
            entries: self.bindings.iter().map(|(b, e)| (*b, e.kind)).collect(),
        }
    }
}

/// Ordered binding → kind description of one set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetLayout {
    entries: Vec<(u32, ResourceKind)>,
}

impl SetLayout {
    pub fn new(mut entries: Vec<(u32, ResourceKind)>) -> Self {
        entries.sort_by_key(|(binding, _)| *binding);
        entries.dedup_by_key(|(binding, _)| *binding);
        Self { entries }
    }

    /// Layout with no bindings; fills gaps between used sets.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[(u32, ResourceKind)] {
        &self.entries
    }

    pub fn kind_of(&self, binding: u32) -> Option<ResourceKind> {
        self.entries
            .binary_search_by_key(&binding, |(b, _)| *b)
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One backend-neutral descriptor update.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub kind: ResourceKind,
    pub ptr: DevicePtr,
    pub size: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceBinder {
    sets: BTreeMap<u32, BindingSet>,
    locked: bool,
    vertex_buffers: BTreeMap<u32, DevicePtr>,
    index_buffer: Option<(DevicePtr, IndexFormat)>,
}

impl ResourceBinder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── buffers ───────────────────────────────────────────────────────────

    pub fn rw_buffer(&mut self, set: u32, binding: u32, ptr: DevicePtr, size: u64) {
        self.bind(set, binding, ResourceKind::ReadWriteBuffer, ptr, size);
    }

    pub fn ro_buffer(&mut self, set: u32, binding: u32, ptr: DevicePtr, size: u64) {
        self.bind(set, binding, ResourceKind::ReadOnlyStorageBuffer, ptr, size);
    }

    /// Uniform buffer.
    pub fn buffer(&mut self, set: u32, binding: u32, ptr: DevicePtr, size: u64) {
        self.bind(set, binding, ResourceKind::ReadOnlyBuffer, ptr, size);
    }

    pub fn rw_buffer_alloc(&mut self, set: u32, binding: u32, alloc: DeviceAllocation) {
        self.rw_buffer(set, binding, alloc.ptr(0), WHOLE_SIZE);
    }

    pub fn buffer_alloc(&mut self, set: u32, binding: u32, alloc: DeviceAllocation) {
        self.buffer(set, binding, alloc.ptr(0), WHOLE_SIZE);
    }

    /// Registers or updates a slot of the given kind.
    pub fn bind(&mut self, set: u32, binding: u32, kind: ResourceKind, ptr: DevicePtr, size: u64) {
        if !self.locked {
            self.sets
                .entry(set)
                .or_default()
                .bindings
                .insert(binding, Binding { kind, ptr, size });
            return;
        }

        let Some(slot) = self
            .sets
            .get_mut(&set)
            .and_then(|s| s.bindings.get_mut(&binding))
        else {
            log::trace!("dropping write to unknown binding ({set}, {binding})");
            return;
        };

        assert_eq!(
            slot.kind, kind,
            "binding ({set}, {binding}) is locked as {:?}, cannot rebind as {kind:?}",
            slot.kind
        );
        slot.ptr = ptr;
        slot.size = size;
    }

    // ── geometry ──────────────────────────────────────────────────────────

    pub fn vertex_buffer(&mut self, ptr: DevicePtr, binding: u32) {
        self.vertex_buffers.insert(binding, ptr);
    }

    pub fn index_buffer(&mut self, ptr: DevicePtr, format: IndexFormat) {
        self.index_buffer = Some((ptr, format));
    }

    pub fn vertex_buffers(&self) -> impl Iterator<Item = (u32, DevicePtr)> + '_ {
        self.vertex_buffers.iter().map(|(b, p)| (*b, *p))
    }

    pub fn index_buffer_binding(&self) -> Option<(DevicePtr, IndexFormat)> {
        self.index_buffer
    }

    // ── layout ────────────────────────────────────────────────────────────

    /// Freezes the set of known bindings.
    pub fn lock_layout(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn sets(&self) -> impl Iterator<Item = (u32, &BindingSet)> {
        self.sets.iter().map(|(k, v)| (*k, v))
    }

    pub fn set(&self, index: u32) -> Option<&BindingSet> {
        self.sets.get(&index)
    }

    pub fn set_layout(&self, index: u32) -> Option<SetLayout> {
        self.sets.get(&index).map(BindingSet::layout)
    }

    /// Descriptor writes for every bound slot of set `index`.
    ///
    /// Null slots produce no write.
    pub fn descriptor_writes(&self, index: u32) -> Vec<DescriptorWrite> {
        let Some(set) = self.sets.get(&index) else {
            return Vec::new();
        };

        let mut writes = Vec::with_capacity(set.len());
        for (binding, b) in set.iter() {
            if b.ptr.is_null() {
                continue;
            }
            writes.push(DescriptorWrite {
                binding,
                kind: b.kind,
                ptr: b.ptr,
                size: b.size,
            });
        }
        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DeviceId;

    fn ptr(alloc: u32, offset: u64) -> DevicePtr {
        DeviceAllocation::new(DeviceId(1), alloc).ptr(offset)
    }

    fn reflected() -> ResourceBinder {
        let mut binder = ResourceBinder::new();
        binder.rw_buffer(0, 0, DevicePtr::NULL, 0);
        binder.lock_layout();
        binder
    }

    // ── accumulation ──────────────────────────────────────────────────────

    #[test]
    fn open_binder_creates_sets_and_bindings() {
        let mut binder = ResourceBinder::new();
        binder.rw_buffer(2, 5, ptr(1, 0), 64);
        binder.buffer(0, 1, ptr(2, 0), 16);

        assert_eq!(binder.sets().map(|(i, _)| i).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(binder.set(2).unwrap().get(5).unwrap().kind, ResourceKind::ReadWriteBuffer);
    }

    #[test]
    fn open_binder_may_change_kind() {
        let mut binder = ResourceBinder::new();
        binder.rw_buffer(0, 0, DevicePtr::NULL, 0);
        binder.buffer(0, 0, DevicePtr::NULL, 0);
        assert_eq!(binder.set_layout(0).unwrap().kind_of(0), Some(ResourceKind::ReadOnlyBuffer));
    }

    // ── locked ────────────────────────────────────────────────────────────

    #[test]
    fn locked_rebind_with_same_kind_updates_the_next_write() {
        let mut binder = reflected();
        binder.rw_buffer(0, 0, ptr(3, 16), 256);

        assert_eq!(
            binder.descriptor_writes(0),
            vec![DescriptorWrite {
                binding: 0,
                kind: ResourceKind::ReadWriteBuffer,
                ptr: ptr(3, 16),
                size: 256,
            }]
        );
    }

    #[test]
    #[should_panic(expected = "cannot rebind")]
    fn locked_rebind_with_other_kind_panics() {
        let mut binder = reflected();
        binder.buffer(0, 0, ptr(3, 0), 16);
    }

    #[test]
    fn locked_binder_drops_unknown_bindings() {
        let mut binder = reflected();
        binder.rw_buffer(0, 1, ptr(3, 0), 16);
        binder.rw_buffer(4, 0, ptr(3, 0), 16);

        assert_eq!(binder.set(0).unwrap().len(), 1);
        assert!(binder.set(4).is_none());
    }

    // ── descriptor writes ─────────────────────────────────────────────────

    #[test]
    fn null_slots_produce_no_writes() {
        let mut binder = ResourceBinder::new();
        binder.rw_buffer(0, 0, DevicePtr::NULL, 0);
        binder.buffer(0, 1, ptr(1, 0), 16);
        binder.lock_layout();

        let writes = binder.descriptor_writes(0);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].binding, 1);
        assert!(binder.descriptor_writes(9).is_empty());
    }

    #[test]
    fn alloc_helpers_bind_the_whole_allocation() {
        let mut binder = ResourceBinder::new();
        let alloc = DeviceAllocation::new(DeviceId(1), 7);
        binder.rw_buffer_alloc(0, 0, alloc);

        let w = binder.descriptor_writes(0)[0];
        assert_eq!(w.ptr, alloc.ptr(0));
        assert_eq!(w.size, WHOLE_SIZE);
    }

    // ── layouts ───────────────────────────────────────────────────────────

    #[test]
    fn set_layout_ignores_bound_values() {
        let mut a = ResourceBinder::new();
        a.rw_buffer(0, 0, ptr(1, 0), 4);
        let mut b = ResourceBinder::new();
        b.rw_buffer(0, 0, ptr(9, 64), 128);

        assert_eq!(a.set_layout(0), b.set_layout(0));
    }

    #[test]
    fn set_layout_new_sorts_entries() {
        let layout = SetLayout::new(vec![
            (3, ResourceKind::ReadOnlyBuffer),
            (1, ResourceKind::ReadWriteBuffer),
        ]);
        assert_eq!(layout.entries()[0].0, 1);
        assert_eq!(layout.kind_of(3), Some(ResourceKind::ReadOnlyBuffer));
        assert_eq!(layout.kind_of(2), None);
    }

    #[test]
    fn geometry_bindings_are_recorded() {
        let mut binder = ResourceBinder::new();
        binder.vertex_buffer(ptr(1, 0), 1);
        binder.vertex_buffer(ptr(2, 0), 0);
        binder.index_buffer(ptr(3, 0), IndexFormat::U16);

        assert_eq!(binder.vertex_buffers().map(|(b, _)| b).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(binder.index_buffer_binding(), Some((ptr(3, 0), IndexFormat::U16)));
    }
}
