//! Graphics-side contract: pipelines, command lists, render passes, surfaces.
//!
//! Types here are backend-neutral value objects. Render-pass and framebuffer
//! descriptors double as cache keys, so they derive `Hash`/`Eq` structurally.

use crate::binder::ResourceBinder;
use crate::cache::CacheHandle;
use crate::device::Device;
use crate::error::DeviceResult;
use crate::memory::{DeviceAllocation, DevicePtr};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferFormat {
    R8,
    Rg8,
    Rgba8,
    Rgba8Srgb,
    Bgra8,
    Bgra8Srgb,
    R8u,
    Rg8u,
    Rgba8u,
    R8i,
    Rg8i,
    Rgba8i,
    R16,
    Rg16,
    Rgba16,
    R16f,
    Rg16f,
    Rgba16f,
    R32u,
    Rg32u,
    Rgb32u,
    Rgba32u,
    R32i,
    Rg32i,
    Rgb32i,
    Rgba32i,
    R32f,
    Rg32f,
    Rgb32f,
    Rgba32f,
    Depth16,
    Depth24Stencil8,
    Depth32f,
}

impl BufferFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth16 | Self::Depth24Stencil8 | Self::Depth32f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Compute,
    Vertex,
    Fragment,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ShaderSourceKind {
    SpirvBinary,
    Wgsl,
}

/// Compiled shader blob tagged with its stage.
#[derive(Debug, Copy, Clone)]
pub struct PipelineSource<'a> {
    pub kind: ShaderSourceKind,
    pub stage: PipelineStage,
    pub data: &'a [u8],
    pub entry_point: &'a str,
}

impl<'a> PipelineSource<'a> {
    /// SPIR-V module with a `main` entry point.
    pub fn spirv(stage: PipelineStage, data: &'a [u8]) -> Self {
        Self {
            kind: ShaderSourceKind::SpirvBinary,
            stage,
            data,
            entry_point: "main",
        }
    }

    pub fn wgsl(stage: PipelineStage, source: &'a str, entry_point: &'a str) -> Self {
        Self {
            kind: ShaderSourceKind::Wgsl,
            stage,
            data: source.as_bytes(),
            entry_point,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum TopologyType {
    Points,
    Lines,
    #[default]
    Triangles,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RasterParams {
    pub prim_topology: TopologyType,
    pub cull_mode: CullMode,
    pub depth_test: bool,
    pub depth_write: bool,
}

impl Default for RasterParams {
    fn default() -> Self {
        Self {
            prim_topology: TopologyType::Triangles,
            cull_mode: CullMode::None,
            depth_test: false,
            depth_write: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct VertexInputBinding {
    pub binding: u32,
    pub stride: u64,
    pub instance: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct VertexInputAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: BufferFormat,
    pub offset: u64,
}

/// Attachment formats and clear behaviour of a render pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderPassDesc {
    /// `(format, clear)` per color attachment.
    pub color_attachments: Vec<(BufferFormat, bool)>,
    pub depth_attachment: Option<BufferFormat>,
    pub clear_depth: bool,
}

/// Concrete attachments bound to a cached render pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferDesc {
    pub attachments: Vec<DeviceAllocation>,
    pub width: u32,
    pub height: u32,
    pub renderpass: CacheHandle,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ColorAttachment {
    pub image: DeviceAllocation,
    pub clear: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DepthAttachment {
    pub image: DeviceAllocation,
    pub clear: bool,
}

/// Pixel rectangle `[x0, x1) × [y0, y1)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RenderArea {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl RenderArea {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }
}

/// Compiled pipeline plus the binding layout its shaders reflect.
pub trait Pipeline {
    fn name(&self) -> &str;

    fn is_graphics(&self) -> bool;

    /// Binder locked to this pipeline's reflected layout, all slots null.
    fn resource_binder(&self) -> ResourceBinder;
}

/// Recording half of a command buffer.
///
/// States go `recording → finalized`; recording after finalize panics.
pub trait CommandList {
    type Pipeline: Pipeline;

    fn bind_pipeline(&mut self, pipeline: &Self::Pipeline) -> DeviceResult<()>;

    fn bind_resources(&mut self, binder: &ResourceBinder) -> DeviceResult<()>;

    fn buffer_barrier(&mut self, ptr: DevicePtr, size: u64);

    fn memory_barrier(&mut self);

    fn buffer_copy(&mut self, dst: DevicePtr, src: DevicePtr, size: u64) -> DeviceResult<()>;

    fn buffer_fill(&mut self, ptr: DevicePtr, size: u64, data: u32) -> DeviceResult<()>;

    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    fn begin_renderpass(
        &mut self,
        area: RenderArea,
        color_attachments: &[ColorAttachment],
        depth_attachment: Option<DepthAttachment>,
    ) -> DeviceResult<()>;

    fn end_renderpass(&mut self);

    fn draw(&mut self, num_vertices: u32, start_vertex: u32);

    fn draw_indexed(&mut self, num_indices: u32, start_vertex: u32, start_index: u32);
}

/// Devices that build pipelines and record command lists.
///
/// A command list borrows its device and must be dropped before it.
pub trait GraphicsDevice: Device {
    type Pipeline: Pipeline;
    type CommandList<'a>: CommandList<Pipeline = Self::Pipeline>
    where
        Self: 'a;

    fn create_pipeline(&self, source: &PipelineSource<'_>, name: &str) -> DeviceResult<Self::Pipeline>;

    fn create_raster_pipeline(
        &self,
        sources: &[PipelineSource<'_>],
        render_target_formats: &[BufferFormat],
        vertex_inputs: &[VertexInputBinding],
        vertex_attrs: &[VertexInputAttribute],
        raster: &RasterParams,
        name: &str,
    ) -> DeviceResult<Self::Pipeline>;

    fn new_command_list(&self) -> DeviceResult<Self::CommandList<'_>>;

    /// Queues the list without waiting. Its resources stay in flight until
    /// the next [`command_sync`](Self::command_sync).
    fn submit(&self, list: Self::CommandList<'_>) -> DeviceResult<()>;

    /// Queues the list and blocks, bounded, until it completes.
    fn submit_synced(&self, list: Self::CommandList<'_>) -> DeviceResult<()>;

    /// Waits on all in-flight work and reclaims its buffers and sets.
    fn command_sync(&self) -> DeviceResult<()>;
}

/// Swapchain contract. Acquire and present must alternate.
pub trait Surface {
    /// Blocks until the next presentable image is available.
    fn get_target_image(&mut self) -> DeviceResult<DeviceAllocation>;

    /// Presents the most recently acquired image.
    fn present_image(&mut self) -> DeviceResult<()>;

    fn get_size(&self) -> (u32, u32);

    fn image_format(&self) -> BufferFormat;
}
