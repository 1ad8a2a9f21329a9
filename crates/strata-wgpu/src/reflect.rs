//! Descriptor reflection from shader modules.
//!
//! SPIR-V and WGSL are both parsed with naga; the resulting global variables
//! describe which `(set, binding)` slots a pipeline expects.

use strata_device::{
    DevicePtr, DeviceError, DeviceResult, PipelineSource, PipelineStage, ResourceBinder,
    ShaderSourceKind,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReflectedType {
    StorageBuffer { writable: bool },
    UniformBuffer,
    SampledImage,
    StorageImage,
    Sampler,
    Other,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub ty: ReflectedType,
    /// Smallest buffer range the shader accepts; a runtime-sized array counts one element.
    pub min_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ShaderReflection {
    pub bindings: Vec<ReflectedBinding>,
    pub entry_points: Vec<(String, PipelineStage)>,
}

impl ShaderReflection {
    pub fn has_entry_point(&self, name: &str, stage: PipelineStage) -> bool {
        self.entry_points.iter().any(|(n, s)| n == name && *s == stage)
    }
}

pub(crate) fn parse_module(source: &PipelineSource<'_>) -> DeviceResult<naga::Module> {
    match source.kind {
        ShaderSourceKind::Wgsl => {
            let text = std::str::from_utf8(source.data)
                .map_err(|e| DeviceError::precondition(format!("WGSL source is not UTF-8: {e}")))?;
            naga::front::wgsl::parse_str(text)
                .map_err(|e| DeviceError::precondition(format!("invalid WGSL: {e}")))
        }
        ShaderSourceKind::SpirvBinary => {
            let options = naga::front::spv::Options::default();
            naga::front::spv::parse_u8_slice(source.data, &options)
                .map_err(|e| DeviceError::precondition(format!("invalid SPIR-V: {e}")))
        }
    }
}

fn stage_of(stage: naga::ShaderStage) -> Option<PipelineStage> {
    match stage {
        naga::ShaderStage::Compute => Some(PipelineStage::Compute),
        naga::ShaderStage::Vertex => Some(PipelineStage::Vertex),
        naga::ShaderStage::Fragment => Some(PipelineStage::Fragment),
        _ => None,
    }
}

fn classify(module: &naga::Module, var: &naga::GlobalVariable) -> ReflectedType {
    match var.space {
        naga::AddressSpace::Storage { access } => ReflectedType::StorageBuffer {
            writable: access.contains(naga::StorageAccess::STORE),
        },
        naga::AddressSpace::Uniform => ReflectedType::UniformBuffer,
        naga::AddressSpace::Handle => match &module.types[var.ty].inner {
            naga::TypeInner::Image {
                class: naga::ImageClass::Storage { .. },
                ..
            } => ReflectedType::StorageImage,
            naga::TypeInner::Image { .. } => ReflectedType::SampledImage,
            naga::TypeInner::Sampler { .. } => ReflectedType::Sampler,
            _ => ReflectedType::Other,
        },
        _ => ReflectedType::Other,
    }
}

pub fn reflect_module(module: &naga::Module) -> ShaderReflection {
    let mut bindings: Vec<ReflectedBinding> = module
        .global_variables
        .iter()
        .filter_map(|(_, var)| {
            let rb = var.binding.as_ref()?;
            Some(ReflectedBinding {
                set: rb.group,
                binding: rb.binding,
                ty: classify(module, var),
                min_size: u64::from(module.types[var.ty].inner.size(module.to_ctx())),
            })
        })
        .collect();
    bindings.sort_by_key(|b| (b.set, b.binding));

    let entry_points = module
        .entry_points
        .iter()
        .filter_map(|ep| Some((ep.name.clone(), stage_of(ep.stage)?)))
        .collect();

    ShaderReflection {
        bindings,
        entry_points,
    }
}

pub fn reflect(source: &PipelineSource<'_>) -> DeviceResult<ShaderReflection> {
    parse_module(source).map(|m| reflect_module(&m))
}

/// Registers reflected buffers into an open binder with null pointers.
///
/// A null slot carries the reflected minimum size, which is what a
/// placeholder bound in its place must cover.
///
/// Writable storage buffers become read-write, read-only storage buffers
/// read-only storage, uniforms read-only. Image and sampler bindings have no
/// binder path and are skipped.
pub fn register_bindings(binder: &mut ResourceBinder, reflection: &ShaderReflection) {
    for b in &reflection.bindings {
        match b.ty {
            ReflectedType::StorageBuffer { writable: true } => {
                binder.rw_buffer(b.set, b.binding, DevicePtr::NULL, b.min_size)
            }
            ReflectedType::StorageBuffer { writable: false } => {
                binder.ro_buffer(b.set, b.binding, DevicePtr::NULL, b.min_size)
            }
            ReflectedType::UniformBuffer => {
                binder.buffer(b.set, b.binding, DevicePtr::NULL, b.min_size)
            }
            other => {
                log::debug!(
                    "binding ({}, {}) reflected as {other:?}, not registered",
                    b.set,
                    b.binding
                );
            }
        }
    }
}
