//! Backend-agnostic device layer.
//!
//! This crate owns the contract every backend implements:
//! - device registry and id assignment
//! - memory handles, allocation parameters and host mapping
//! - the cross-device kernel launch protocol
//! - resource binders, structural caches, descriptor pools
//! - fence bookkeeping for submitted command buffers
//!
//! Concrete backends live in sibling crates.

mod error;

pub mod binder;
pub mod cache;
pub mod compute;
pub mod device;
pub mod graphics;
pub mod host;
pub mod logging;
pub mod memory;
pub mod registry;
pub mod submission;

pub use binder::{DescriptorWrite, IndexFormat, ResourceBinder, ResourceKind, SetLayout};
pub use cache::{CacheHandle, DescriptorPool, ObjectCache, DESCRIPTOR_POOL_CAPACITY};
pub use compute::{ComputeDevice, SNodeMapping};
pub use device::{Device, DeviceCaps, DeviceIdSlot, DeviceType};
pub use error::{DeviceError, DeviceResult};
pub use graphics::{
    BufferFormat, ColorAttachment, CommandList, CullMode, DepthAttachment, FramebufferDesc,
    GraphicsDevice, Pipeline, PipelineSource, PipelineStage, RasterParams, RenderArea,
    RenderPassDesc, ShaderSourceKind, Surface, TopologyType, VertexInputAttribute,
    VertexInputBinding,
};
pub use host::HostDevice;
pub use memory::{
    AllocParams, DeviceAllocation, DeviceId, DevicePtr, DeviceRange, MappedRegion, MemoryType,
    WHOLE_SIZE,
};
pub use registry::{DeviceRegistry, MAX_DEVICES};
pub use submission::{SubmissionStats, SubmissionTracker, FENCE_TIMEOUT};
