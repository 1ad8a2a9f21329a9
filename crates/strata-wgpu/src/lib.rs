//! wgpu backend for the strata device layer.
//!
//! [`WgpuDevice`] implements `Device`, `ComputeDevice` and `GraphicsDevice`.
//! Shaders (WGSL or SPIR-V) are reflected with naga to build binders and
//! pipeline layouts; command lists record into a deferred list that is
//! replayed into a wgpu encoder on submission.

mod allocator;
mod command;
mod device;
mod format;
mod init;
mod kernel;
mod layout;
mod pipeline;
mod reflect;
mod renderpass;
mod surface;

pub use command::WgpuCommandList;
pub use device::WgpuDevice;
pub use init::{DeviceInit, SurfaceInit};
pub use kernel::KernelLaunch;
pub use layout::DescriptorSetHandle;
pub use pipeline::WgpuPipeline;
pub use reflect::{reflect, reflect_module, register_bindings, ReflectedBinding, ReflectedType, ShaderReflection};
pub use surface::WgpuSurface;
