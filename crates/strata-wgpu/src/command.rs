//! Command lists.
//!
//! Commands are recorded into a flat list and replayed into a wgpu encoder on
//! submission. Compute passes are opened lazily and closed by barriers and
//! copies; reopening a compute pass re-applies the bound pipeline and groups.

use std::collections::BTreeMap;
use std::ops::Range;

use strata_device::{
    CacheHandle, ColorAttachment, CommandList, DepthAttachment, DeviceError, DevicePtr,
    DeviceResult, FramebufferDesc, Pipeline, RenderArea, RenderPassDesc, ResourceBinder,
    SetLayout,
};
use wgpu::util::DeviceExt;

use crate::allocator;
use crate::device::{ImageTarget, WgpuDevice};
use crate::format;
use crate::layout::DescriptorSetHandle;
use crate::pipeline::{PipelineKind, WgpuPipeline};
use crate::renderpass;

/// Command buffer slot tracked between submission and reclamation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CommandBufferId(pub u32);

enum Recorded {
    ComputePipeline(wgpu::ComputePipeline),
    RenderPipeline(wgpu::RenderPipeline),
    Viewport(RenderArea),
    BindGroup(u32, wgpu::BindGroup),
    VertexBuffer {
        slot: u32,
        buffer: wgpu::Buffer,
        offset: u64,
    },
    IndexBuffer {
        buffer: wgpu::Buffer,
        offset: u64,
        format: wgpu::IndexFormat,
    },
    Dispatch([u32; 3]),
    Barrier,
    Copy {
        src: wgpu::Buffer,
        src_offset: u64,
        dst: wgpu::Buffer,
        dst_offset: u64,
        size: u64,
    },
    Clear {
        buffer: wgpu::Buffer,
        offset: u64,
        size: u64,
    },
    BeginRenderPass {
        area: RenderArea,
        colors: Vec<(wgpu::TextureView, bool)>,
        depth: Option<(wgpu::TextureView, bool)>,
    },
    EndRenderPass,
    Draw {
        vertices: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
    },
}

struct Bound {
    graphics: bool,
    sets: Vec<(CacheHandle, SetLayout)>,
}

#[derive(Copy, Clone)]
struct RenderTarget {
    renderpass: CacheHandle,
    area: RenderArea,
}

/// Recording half of a command buffer, bound to the device that created it.
///
/// Descriptor sets allocated while recording go back to their pools when the
/// list drops: right away if it never ran, after the next
/// [`command_sync`](strata_device::GraphicsDevice::command_sync) otherwise.
pub struct WgpuCommandList<'d> {
    device: &'d WgpuDevice,
    buffer: CommandBufferId,
    commands: Vec<Recorded>,
    sets: Vec<DescriptorSetHandle>,
    bound: Option<Bound>,
    target: Option<RenderTarget>,
    finalized: bool,
}

fn copy_aligned(v: u64) -> bool {
    v % wgpu::COPY_BUFFER_ALIGNMENT == 0
}

/// `start..start + count`, or `None` when the end does not fit in `u32`.
fn span(start: u32, count: u32) -> Option<Range<u32>> {
    start.checked_add(count).map(|end| start..end)
}

fn attachment_format(target: &ImageTarget) -> DeviceResult<strata_device::BufferFormat> {
    format::buffer_format(target.format).ok_or_else(|| {
        DeviceError::precondition(format!("{:?} cannot be a render attachment", target.format))
    })
}

impl<'d> WgpuCommandList<'d> {
    pub(crate) fn new(device: &'d WgpuDevice) -> Self {
        Self {
            device,
            buffer: device.acquire_command_buffer(),
            commands: Vec::new(),
            sets: Vec::new(),
            bound: None,
            target: None,
            finalized: false,
        }
    }

    fn check_recording(&self) {
        assert!(!self.finalized, "command list is finalized");
    }

    fn check_outside_renderpass(&self, what: &str) -> DeviceResult<()> {
        if self.target.is_some() {
            return Err(DeviceError::precondition(format!("{what} inside a render pass")));
        }
        Ok(())
    }

    /// Ends recording and encodes the list.
    ///
    /// The first call returns the native command buffer; repeat calls return
    /// `None`. A buffer taken here is no longer submitted by the device.
    pub fn finalize(&mut self) -> Option<wgpu::CommandBuffer> {
        if self.finalized {
            return None;
        }
        if self.target.take().is_some() {
            log::warn!("finalizing with an open render pass; closing it");
            self.commands.push(Recorded::EndRenderPass);
        }
        self.finalized = true;
        Some(self.encode())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Descriptor sets allocated so far.
    pub fn descriptor_set_count(&self) -> usize {
        self.sets.len()
    }

    fn encode(&mut self) -> wgpu::CommandBuffer {
        let mut replay = Replay::new(self.device.raw());
        for cmd in std::mem::take(&mut self.commands) {
            replay.apply(cmd);
        }
        replay.finish()
    }

    /// Finalizes and queues the list. With `wait`, blocks until it ran.
    pub(crate) fn submit(mut self, wait: bool) -> DeviceResult<()> {
        let commands = self.finalize().ok_or_else(|| {
            DeviceError::precondition("command list was finalized by its caller, nothing left to submit")
        })?;
        let index = self.device.queue().submit(std::iter::once(commands));

        if wait {
            allocator::wait_for(self.device.raw(), Some(index))
        } else {
            self.device.mark_submitted(self.buffer, index)
        }
    }

    fn resolve_attachment(
        &self,
        image: strata_device::DeviceAllocation,
        extent: &mut Option<(u32, u32)>,
    ) -> DeviceResult<ImageTarget> {
        let target = self.device.image_target(image)?;
        let (w, h) = *extent.get_or_insert((target.width, target.height));
        if (w, h) != (target.width, target.height) {
            return Err(DeviceError::precondition(format!(
                "attachment of {}x{} in a {w}x{h} render pass",
                target.width, target.height
            )));
        }
        Ok(target)
    }
}

impl CommandList for WgpuCommandList<'_> {
    type Pipeline = WgpuPipeline;

    fn bind_pipeline(&mut self, pipeline: &WgpuPipeline) -> DeviceResult<()> {
        self.check_recording();

        let graphics = match pipeline.kind() {
            PipelineKind::Compute(native) => {
                self.check_outside_renderpass("compute pipeline bound")?;
                self.commands.push(Recorded::ComputePipeline(native.clone()));
                false
            }
            PipelineKind::Graphics(template) => {
                let target = self.target.ok_or_else(|| {
                    DeviceError::precondition(format!(
                        "raster pipeline `{}` bound outside a render pass",
                        pipeline.name()
                    ))
                })?;
                let info = self.device.renderpass_info(target.renderpass)?;
                let native = template.variant(
                    self.device.raw(),
                    pipeline.layout(),
                    target.renderpass,
                    &info,
                    pipeline.name(),
                )?;
                self.commands.push(Recorded::RenderPipeline(native));
                self.commands.push(Recorded::Viewport(target.area));
                true
            }
        };

        self.bound = Some(Bound {
            graphics,
            sets: pipeline.sets().to_vec(),
        });
        Ok(())
    }

    fn bind_resources(&mut self, binder: &ResourceBinder) -> DeviceResult<()> {
        self.check_recording();
        let Some(bound) = &self.bound else {
            return Err(DeviceError::precondition("bind_resources before bind_pipeline"));
        };
        let graphics = bound.graphics;
        let sets = bound.sets.clone();

        for (index, (layout, set_layout)) in (0u32..).zip(sets.iter()) {
            let set = self.device.alloc_desc_set(*layout)?;
            self.sets.push(set);
            let group = self.device.write_to_set(set, set_layout, binder, index)?;
            self.commands.push(Recorded::BindGroup(index, group));
        }

        if graphics {
            if let Some((ptr, fmt)) = binder.index_buffer_binding() {
                let (buffer, offset) = self.device.buffer_slice(ptr)?;
                self.commands.push(Recorded::IndexBuffer {
                    buffer,
                    offset,
                    format: format::index_format(fmt),
                });
            }
            for (slot, ptr) in binder.vertex_buffers() {
                let (buffer, offset) = self.device.buffer_slice(ptr)?;
                self.commands.push(Recorded::VertexBuffer { slot, buffer, offset });
            }
        }
        Ok(())
    }

    fn buffer_barrier(&mut self, _ptr: DevicePtr, _size: u64) {
        self.memory_barrier();
    }

    /// wgpu tracks hazards itself; a barrier only splits the compute pass.
    fn memory_barrier(&mut self) {
        self.check_recording();
        self.commands.push(Recorded::Barrier);
    }

    fn buffer_copy(&mut self, dst: DevicePtr, src: DevicePtr, size: u64) -> DeviceResult<()> {
        self.check_recording();
        self.check_outside_renderpass("buffer copy")?;

        let (src_buffer, len) = self.device.checked_range(src, size)?;
        let (dst_buffer, _) = self.device.checked_range(dst, len)?;
        if !(copy_aligned(src.offset) && copy_aligned(dst.offset) && copy_aligned(len)) {
            return Err(DeviceError::precondition(format!(
                "copy of {len} bytes from {} to {} is not 4-byte aligned",
                src.offset, dst.offset
            )));
        }

        self.commands.push(Recorded::Copy {
            src: src_buffer,
            src_offset: src.offset,
            dst: dst_buffer,
            dst_offset: dst.offset,
            size: len,
        });
        Ok(())
    }

    fn buffer_fill(&mut self, ptr: DevicePtr, size: u64, data: u32) -> DeviceResult<()> {
        self.check_recording();
        self.check_outside_renderpass("buffer fill")?;

        let (buffer, len) = self.device.checked_range(ptr, size)?;
        if !(copy_aligned(ptr.offset) && copy_aligned(len)) {
            return Err(DeviceError::precondition(format!(
                "fill of {len} bytes at {} is not 4-byte aligned",
                ptr.offset
            )));
        }
        if len == 0 {
            return Ok(());
        }

        if data == 0 {
            self.commands.push(Recorded::Clear {
                buffer,
                offset: ptr.offset,
                size: len,
            });
            return Ok(());
        }

        let words = vec![data; (len / 4) as usize];
        let pattern = self.device.raw().create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("strata fill pattern"),
            contents: bytemuck::cast_slice(&words),
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        self.commands.push(Recorded::Copy {
            src: pattern,
            src_offset: 0,
            dst: buffer,
            dst_offset: ptr.offset,
            size: len,
        });
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.check_recording();
        assert!(self.target.is_none(), "dispatch inside a render pass");
        self.commands.push(Recorded::Dispatch([x, y, z]));
    }

    fn begin_renderpass(
        &mut self,
        area: RenderArea,
        color_attachments: &[ColorAttachment],
        depth_attachment: Option<DepthAttachment>,
    ) -> DeviceResult<()> {
        self.check_recording();
        self.check_outside_renderpass("begin_renderpass")?;

        let mut desc = RenderPassDesc {
            color_attachments: Vec::with_capacity(color_attachments.len()),
            depth_attachment: None,
            clear_depth: false,
        };
        let mut attachments = Vec::with_capacity(color_attachments.len() + 1);
        let mut color_views = Vec::with_capacity(color_attachments.len());
        let mut extent = None;

        for c in color_attachments {
            let target = self.resolve_attachment(c.image, &mut extent)?;
            desc.color_attachments.push((attachment_format(&target)?, c.clear));
            attachments.push(c.image);
            color_views.push(target.view);
        }

        let depth_view = match depth_attachment {
            Some(d) => {
                let target = self.resolve_attachment(d.image, &mut extent)?;
                desc.depth_attachment = Some(attachment_format(&target)?);
                desc.clear_depth = d.clear;
                attachments.push(d.image);
                Some(target.view)
            }
            None => None,
        };

        let (width, height) =
            extent.ok_or_else(|| DeviceError::precondition("render pass without attachments"))?;

        let renderpass = self.device.get_renderpass(&desc)?;
        let framebuffer = self.device.get_framebuffer(&FramebufferDesc {
            attachments,
            width,
            height,
            renderpass,
        })?;
        let fb = self.device.framebuffer_info(framebuffer)?;

        // Load ops come from the cached render pass.
        let pass = self.device.renderpass_info(renderpass)?;
        let (colors, depth) = pass.with_load_flags(color_views, depth_view);

        if area.width() == 0 || area.height() == 0 || area.x1 > fb.width || area.y1 > fb.height {
            return Err(DeviceError::precondition(format!(
                "render area {area:?} outside {}x{} framebuffer",
                fb.width, fb.height
            )));
        }
        log::trace!(
            "render pass {renderpass:?} over {} attachments",
            fb.attachments.len()
        );

        self.commands.push(Recorded::BeginRenderPass { area, colors, depth });
        self.target = Some(RenderTarget { renderpass, area });
        Ok(())
    }

    fn end_renderpass(&mut self) {
        self.check_recording();
        assert!(self.target.take().is_some(), "end_renderpass without begin_renderpass");
        if self.bound.as_ref().is_some_and(|b| b.graphics) {
            self.bound = None;
        }
        self.commands.push(Recorded::EndRenderPass);
    }

    fn draw(&mut self, num_vertices: u32, start_vertex: u32) {
        self.check_recording();
        assert!(self.target.is_some(), "draw outside a render pass");
        match span(start_vertex, num_vertices) {
            Some(vertices) => self.commands.push(Recorded::Draw { vertices }),
            None => log::warn!("draw of {num_vertices} vertices from {start_vertex} overflows; skipped"),
        }
    }

    fn draw_indexed(&mut self, num_indices: u32, start_vertex: u32, start_index: u32) {
        self.check_recording();
        assert!(self.target.is_some(), "draw_indexed outside a render pass");
        let base_vertex = i32::try_from(start_vertex).ok();
        match (span(start_index, num_indices), base_vertex) {
            (Some(indices), Some(base_vertex)) => {
                self.commands.push(Recorded::DrawIndexed { indices, base_vertex })
            }
            _ => log::warn!(
                "indexed draw of {num_indices} indices from {start_index}, base vertex {start_vertex}, overflows; skipped"
            ),
        }
    }
}

impl Drop for WgpuCommandList<'_> {
    fn drop(&mut self) {
        self.device
            .release_command_list(self.buffer, std::mem::take(&mut self.sets));
    }
}

enum Pass {
    Idle,
    Compute(wgpu::ComputePass<'static>),
    Render(wgpu::RenderPass<'static>),
}

/// Encoder state while replaying a recorded list.
struct Replay {
    encoder: wgpu::CommandEncoder,
    pass: Pass,
    compute_pipeline: Option<wgpu::ComputePipeline>,
    compute_groups: BTreeMap<u32, wgpu::BindGroup>,
}

fn set_viewport(pass: &mut wgpu::RenderPass<'static>, area: RenderArea) {
    pass.set_viewport(
        area.x0 as f32,
        area.y0 as f32,
        area.width() as f32,
        area.height() as f32,
        0.0,
        1.0,
    );
    pass.set_scissor_rect(area.x0, area.y0, area.width(), area.height());
}

impl Replay {
    fn new(device: &wgpu::Device) -> Self {
        Self {
            encoder: device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("strata command list"),
            }),
            pass: Pass::Idle,
            compute_pipeline: None,
            compute_groups: BTreeMap::new(),
        }
    }

    fn close(&mut self) {
        self.pass = Pass::Idle;
    }

    fn compute(&mut self) -> &mut wgpu::ComputePass<'static> {
        if !matches!(self.pass, Pass::Compute(_)) {
            self.close();
            let mut pass = self
                .encoder
                .begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("strata compute pass"),
                    timestamp_writes: None,
                })
                .forget_lifetime();
            if let Some(pipeline) = &self.compute_pipeline {
                pass.set_pipeline(pipeline);
            }
            for (index, group) in &self.compute_groups {
                pass.set_bind_group(*index, group, &[]);
            }
            self.pass = Pass::Compute(pass);
        }

        let Pass::Compute(pass) = &mut self.pass else {
            unreachable!("compute pass opened above");
        };
        pass
    }

    fn render(&mut self) -> Option<&mut wgpu::RenderPass<'static>> {
        match &mut self.pass {
            Pass::Render(pass) => Some(pass),
            _ => None,
        }
    }

    fn apply(&mut self, cmd: Recorded) {
        match cmd {
            Recorded::ComputePipeline(pipeline) => {
                self.compute().set_pipeline(&pipeline);
                self.compute_pipeline = Some(pipeline);
            }
            Recorded::RenderPipeline(pipeline) => {
                if let Some(pass) = self.render() {
                    pass.set_pipeline(&pipeline);
                }
            }
            Recorded::Viewport(area) => {
                if let Some(pass) = self.render() {
                    set_viewport(pass, area);
                }
            }
            Recorded::BindGroup(index, group) => {
                if let Some(pass) = self.render() {
                    pass.set_bind_group(index, &group, &[]);
                } else {
                    self.compute().set_bind_group(index, &group, &[]);
                    self.compute_groups.insert(index, group);
                }
            }
            Recorded::VertexBuffer { slot, buffer, offset } => {
                if let Some(pass) = self.render() {
                    pass.set_vertex_buffer(slot, buffer.slice(offset..));
                }
            }
            Recorded::IndexBuffer { buffer, offset, format } => {
                if let Some(pass) = self.render() {
                    pass.set_index_buffer(buffer.slice(offset..), format);
                }
            }
            Recorded::Dispatch([x, y, z]) => self.compute().dispatch_workgroups(x, y, z),
            Recorded::Barrier => {
                if matches!(self.pass, Pass::Compute(_)) {
                    self.close();
                }
            }
            Recorded::Copy {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                self.close();
                self.encoder
                    .copy_buffer_to_buffer(&src, src_offset, &dst, dst_offset, size);
            }
            Recorded::Clear { buffer, offset, size } => {
                self.close();
                self.encoder.clear_buffer(&buffer, offset, Some(size));
            }
            Recorded::BeginRenderPass { area, colors, depth } => {
                self.close();

                let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = colors
                    .iter()
                    .map(|(view, clear)| {
                        Some(wgpu::RenderPassColorAttachment {
                            view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: renderpass::color_load(*clear),
                                store: wgpu::StoreOp::Store,
                            },
                            depth_slice: None,
                        })
                    })
                    .collect();

                let depth_stencil_attachment =
                    depth
                        .as_ref()
                        .map(|(view, clear)| wgpu::RenderPassDepthStencilAttachment {
                            view,
                            depth_ops: Some(wgpu::Operations {
                                load: renderpass::depth_load(*clear),
                                store: wgpu::StoreOp::Store,
                            }),
                            stencil_ops: None,
                        });

                let mut pass = self
                    .encoder
                    .begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("strata render pass"),
                        color_attachments: &color_attachments,
                        depth_stencil_attachment,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                        multiview_mask: None,
                    })
                    .forget_lifetime();
                set_viewport(&mut pass, area);
                self.pass = Pass::Render(pass);
            }
            Recorded::EndRenderPass => self.close(),
            Recorded::Draw { vertices } => {
                if let Some(pass) = self.render() {
                    pass.draw(vertices, 0..1);
                }
            }
            Recorded::DrawIndexed { indices, base_vertex } => {
                if let Some(pass) = self.render() {
                    pass.draw_indexed(indices, base_vertex, 0..1);
                }
            }
        }
    }

    fn finish(mut self) -> wgpu::CommandBuffer {
        self.close();
        self.encoder.finish()
    }
}
