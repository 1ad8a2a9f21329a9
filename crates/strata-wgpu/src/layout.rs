//! Descriptor-set layout cache and per-layout set pools.
//!
//! A wgpu bind group is immutable, so a "descriptor set" here is a pool slot:
//! it bounds how many sets a layout hands out and tracks when a slot may be
//! rewritten. Writing a set creates a fresh bind group for the slot.

use strata_device::{
    CacheHandle, DescriptorPool, DeviceError, DeviceResult, ObjectCache, ResourceKind, SetLayout,
};

/// Pool slot of one layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle {
    pub layout: CacheHandle,
    pub set: u32,
}

pub(crate) struct LayoutEntry {
    pub layout: wgpu::BindGroupLayout,
    pub pool: DescriptorPool<u32>,
}

#[derive(Default)]
pub(crate) struct DescriptorCaches {
    layouts: ObjectCache<SetLayout, LayoutEntry>,
}

fn visibility(kind: ResourceKind) -> wgpu::ShaderStages {
    match kind {
        // Writable storage is not allowed in vertex shaders without an extra feature.
        ResourceKind::ReadWriteBuffer => wgpu::ShaderStages::COMPUTE | wgpu::ShaderStages::FRAGMENT,
        ResourceKind::ReadOnlyStorageBuffer | ResourceKind::ReadOnlyBuffer => {
            wgpu::ShaderStages::COMPUTE | wgpu::ShaderStages::VERTEX_FRAGMENT
        }
    }
}

fn binding_type(kind: ResourceKind) -> wgpu::BindingType {
    let ty = match kind {
        ResourceKind::ReadWriteBuffer => wgpu::BufferBindingType::Storage { read_only: false },
        ResourceKind::ReadOnlyStorageBuffer => wgpu::BufferBindingType::Storage { read_only: true },
        ResourceKind::ReadOnlyBuffer => wgpu::BufferBindingType::Uniform,
    };
    wgpu::BindingType::Buffer {
        ty,
        has_dynamic_offset: false,
        min_binding_size: None,
    }
}

pub(crate) fn create_bind_group_layout(device: &wgpu::Device, layout: &SetLayout) -> wgpu::BindGroupLayout {
    let entries: Vec<wgpu::BindGroupLayoutEntry> = layout
        .entries()
        .iter()
        .map(|&(binding, kind)| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: visibility(kind),
            ty: binding_type(kind),
            count: None,
        })
        .collect();

    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("strata set layout"),
        entries: &entries,
    })
}

impl DescriptorCaches {
    /// Resolves the layout, creating its bind group layout and pool on a miss.
    pub fn get_set_layout(&mut self, device: &wgpu::Device, layout: &SetLayout) -> DeviceResult<CacheHandle> {
        self.layouts.get_or_try_insert_with(layout, |key| {
            log::debug!("creating set layout with {} bindings", key.len());
            Ok(LayoutEntry {
                layout: create_bind_group_layout(device, key),
                pool: DescriptorPool::default(),
            })
        })
    }

    fn entry(&self, handle: CacheHandle) -> DeviceResult<&LayoutEntry> {
        self.layouts
            .get(handle)
            .ok_or_else(|| DeviceError::precondition(format!("unknown set layout {handle:?}")))
    }

    pub fn bind_group_layout(&self, handle: CacheHandle) -> DeviceResult<&wgpu::BindGroupLayout> {
        self.entry(handle).map(|e| &e.layout)
    }

    pub fn alloc_set(&mut self, layout: CacheHandle) -> DeviceResult<DescriptorSetHandle> {
        let entry = self
            .layouts
            .get_mut(layout)
            .ok_or_else(|| DeviceError::precondition(format!("unknown set layout {layout:?}")))?;
        let set = entry.pool.allocate(|i| i as u32)?;
        Ok(DescriptorSetHandle { layout, set })
    }

    pub fn recycle_set(&mut self, set: DescriptorSetHandle) {
        match self.layouts.get_mut(set.layout) {
            Some(entry) => entry.pool.recycle(set.set),
            None => log::warn!("recycling set {set:?} of an unknown layout"),
        }
    }

    /// `(allocated, free)` counts of one layout's pool.
    pub fn pool_usage(&self, layout: CacheHandle) -> Option<(usize, usize)> {
        self.layouts
            .get(layout)
            .map(|e| (e.pool.allocated(), e.pool.free_len()))
    }

    pub fn layout_count(&self) -> usize {
        self.layouts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_storage_is_hidden_from_vertex_stage() {
        assert!(!visibility(ResourceKind::ReadWriteBuffer).contains(wgpu::ShaderStages::VERTEX));
        assert!(visibility(ResourceKind::ReadOnlyBuffer).contains(wgpu::ShaderStages::VERTEX));
    }

    #[test]
    fn kinds_map_to_buffer_binding_types() {
        let wgpu::BindingType::Buffer { ty, .. } = binding_type(ResourceKind::ReadOnlyStorageBuffer) else {
            panic!("expected a buffer binding");
        };
        assert_eq!(ty, wgpu::BufferBindingType::Storage { read_only: true });
    }
}
