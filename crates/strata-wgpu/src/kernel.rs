//! Kernel table: compute pipelines addressable by kernel id.

use std::collections::HashMap;
use std::sync::Arc;

use strata_device::{DeviceError, DeviceResult, Pipeline, ResourceBinder, SNodeMapping};

use crate::pipeline::WgpuPipeline;

/// A compute pipeline plus how launch mappings feed its bindings.
#[derive(Clone)]
pub struct KernelLaunch {
    pub pipeline: Arc<WgpuPipeline>,
    /// `(node, set, binding)`: the range mapped to `node` is bound read-write at `(set, binding)`.
    pub args: Vec<(i32, u32, u32)>,
    pub workgroups: [u32; 3],
}

impl KernelLaunch {
    pub fn new(pipeline: Arc<WgpuPipeline>, workgroups: [u32; 3]) -> Self {
        Self {
            pipeline,
            args: Vec::new(),
            workgroups,
        }
    }

    pub fn arg(mut self, node: i32, set: u32, binding: u32) -> Self {
        self.args.push((node, set, binding));
        self
    }

    /// Binder for one launch, every argument resolved from `mapping`.
    pub(crate) fn binder(&self, mapping: &SNodeMapping) -> DeviceResult<ResourceBinder> {
        let mut binder = self.pipeline.resource_binder();
        for &(node, set, binding) in &self.args {
            let range = mapping.get(&node).ok_or_else(|| {
                DeviceError::precondition(format!(
                    "kernel `{}` expects node {node}, which is not mapped",
                    self.pipeline.name()
                ))
            })?;
            binder.rw_buffer(set, binding, range.ptr, range.length);
        }
        Ok(binder)
    }
}

#[derive(Default)]
pub(crate) struct KernelTable {
    kernels: HashMap<u32, KernelLaunch>,
}

impl KernelTable {
    pub fn insert(&mut self, kernel_id: u32, launch: KernelLaunch) -> DeviceResult<()> {
        if launch.pipeline.is_graphics() {
            return Err(DeviceError::precondition(format!(
                "kernel {kernel_id} needs a compute pipeline, `{}` is a raster pipeline",
                launch.pipeline.name()
            )));
        }
        if self.kernels.insert(kernel_id, launch).is_some() {
            log::debug!("kernel {kernel_id} replaced");
        }
        Ok(())
    }

    pub fn get(&self, kernel_id: u32) -> DeviceResult<KernelLaunch> {
        self.kernels
            .get(&kernel_id)
            .cloned()
            .ok_or_else(|| DeviceError::precondition(format!("kernel {kernel_id} is not registered")))
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }
}
