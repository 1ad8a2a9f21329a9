//! Compute and graphics pipelines.
//!
//! Both kinds reflect their shaders into a locked [`ResourceBinder`] and own
//! a pipeline layout built from it. Graphics pipelines keep a fixed-function
//! template and build one native pipeline per render pass they are used with.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use strata_device::{
    CacheHandle, DeviceError, DeviceResult, Pipeline, PipelineSource, PipelineStage,
    RasterParams, ResourceBinder, SetLayout, ShaderSourceKind, VertexInputAttribute,
    VertexInputBinding,
};

use crate::device::WgpuDevice;
use crate::format;
use crate::reflect::{self, ShaderReflection};
use crate::renderpass::RenderPassInfo;

struct StageModule {
    module: wgpu::ShaderModule,
    entry_point: String,
}

#[derive(Default)]
struct VertexBufferDesc {
    stride: u64,
    step_mode: wgpu::VertexStepMode,
    attributes: Vec<wgpu::VertexAttribute>,
}

struct GraphicsTemplate {
    vertex: StageModule,
    fragment: Option<StageModule>,
    buffers: Vec<VertexBufferDesc>,
    primitive: wgpu::PrimitiveState,
    raster: RasterParams,
    render_target_count: usize,
}

pub(crate) struct GraphicsPipeline {
    template: GraphicsTemplate,
    variants: Mutex<HashMap<CacheHandle, wgpu::RenderPipeline>>,
}

pub(crate) enum PipelineKind {
    Compute(wgpu::ComputePipeline),
    Graphics(GraphicsPipeline),
}

pub struct WgpuPipeline {
    name: String,
    binder: ResourceBinder,
    /// Layout per bind group index; unused indices hold an empty layout.
    sets: Vec<(CacheHandle, SetLayout)>,
    layout: wgpu::PipelineLayout,
    kind: PipelineKind,
}

fn shader_module(device: &wgpu::Device, source: &PipelineSource<'_>, label: &str) -> DeviceResult<wgpu::ShaderModule> {
    let source = match source.kind {
        ShaderSourceKind::Wgsl => {
            let text = std::str::from_utf8(source.data)
                .map_err(|e| DeviceError::precondition(format!("WGSL source is not UTF-8: {e}")))?;
            wgpu::ShaderSource::Wgsl(Cow::Borrowed(text))
        }
        ShaderSourceKind::SpirvBinary => wgpu::util::make_spirv(source.data),
    };

    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source,
    }))
}

fn reflect_stage(source: &PipelineSource<'_>) -> DeviceResult<ShaderReflection> {
    let reflection = reflect::reflect(source)?;
    if !reflection.has_entry_point(source.entry_point, source.stage) {
        return Err(DeviceError::precondition(format!(
            "no {:?} entry point named `{}`",
            source.stage, source.entry_point
        )));
    }
    Ok(reflection)
}

fn locked_binder(reflections: &[ShaderReflection]) -> ResourceBinder {
    let mut binder = ResourceBinder::new();
    for r in reflections {
        reflect::register_bindings(&mut binder, r);
    }
    binder.lock_layout();
    binder
}

fn vertex_buffers(
    inputs: &[VertexInputBinding],
    attrs: &[VertexInputAttribute],
) -> DeviceResult<Vec<VertexBufferDesc>> {
    let slots = inputs.iter().map(|b| b.binding as usize + 1).max().unwrap_or(0);
    let mut buffers: Vec<VertexBufferDesc> = (0..slots).map(|_| VertexBufferDesc::default()).collect();

    for input in inputs {
        let desc = &mut buffers[input.binding as usize];
        desc.stride = input.stride;
        desc.step_mode = if input.instance {
            wgpu::VertexStepMode::Instance
        } else {
            wgpu::VertexStepMode::Vertex
        };
    }

    for attr in attrs {
        let desc = buffers.get_mut(attr.binding as usize).ok_or_else(|| {
            DeviceError::precondition(format!(
                "attribute {} references undeclared vertex binding {}",
                attr.location, attr.binding
            ))
        })?;
        let format = format::vertex_format(attr.format).ok_or_else(|| {
            DeviceError::precondition(format!("{:?} is not a vertex format", attr.format))
        })?;
        desc.attributes.push(wgpu::VertexAttribute {
            format,
            offset: attr.offset,
            shader_location: attr.location,
        });
    }

    Ok(buffers)
}

impl WgpuPipeline {
    pub(crate) fn compute(device: &WgpuDevice, source: &PipelineSource<'_>, name: &str) -> DeviceResult<Self> {
        if source.stage != PipelineStage::Compute {
            return Err(DeviceError::precondition(format!(
                "compute pipeline `{name}` given a {:?} shader",
                source.stage
            )));
        }

        let reflection = reflect_stage(source)?;
        let binder = locked_binder(std::slice::from_ref(&reflection));
        let (sets, layout) = device.pipeline_layout(&binder, name)?;

        let module = shader_module(device.raw(), source, name)?;
        let pipeline = device.raw().create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: Some(&layout),
            module: &module,
            entry_point: Some(source.entry_point),
            compilation_options: Default::default(),
            cache: None,
        });

        log::debug!("created compute pipeline `{name}` with {} sets", sets.len());

        Ok(Self {
            name: name.to_owned(),
            binder,
            sets,
            layout,
            kind: PipelineKind::Compute(pipeline),
        })
    }

    pub(crate) fn graphics(
        device: &WgpuDevice,
        sources: &[PipelineSource<'_>],
        render_target_count: usize,
        vertex_inputs: &[VertexInputBinding],
        vertex_attrs: &[VertexInputAttribute],
        raster: &RasterParams,
        name: &str,
    ) -> DeviceResult<Self> {
        let mut vertex = None;
        let mut fragment = None;
        let mut reflections = Vec::with_capacity(sources.len());

        for source in sources {
            let slot = match source.stage {
                PipelineStage::Vertex => &mut vertex,
                PipelineStage::Fragment => &mut fragment,
                PipelineStage::Compute => {
                    return Err(DeviceError::precondition(format!(
                        "raster pipeline `{name}` given a compute shader"
                    )));
                }
            };
            if slot.is_some() {
                return Err(DeviceError::precondition(format!(
                    "raster pipeline `{name}` has two {:?} shaders",
                    source.stage
                )));
            }

            reflections.push(reflect_stage(source)?);
            *slot = Some(StageModule {
                module: shader_module(device.raw(), source, name)?,
                entry_point: source.entry_point.to_owned(),
            });
        }

        let vertex = vertex.ok_or_else(|| {
            DeviceError::precondition(format!("raster pipeline `{name}` has no vertex shader"))
        })?;

        let binder = locked_binder(&reflections);
        let (sets, layout) = device.pipeline_layout(&binder, name)?;

        let primitive = wgpu::PrimitiveState {
            topology: format::topology(raster.prim_topology),
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: format::cull_mode(raster.cull_mode),
            unclipped_depth: false,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: false,
        };

        log::debug!("created raster pipeline template `{name}`");

        Ok(Self {
            name: name.to_owned(),
            binder,
            sets,
            layout,
            kind: PipelineKind::Graphics(GraphicsPipeline {
                template: GraphicsTemplate {
                    vertex,
                    fragment,
                    buffers: vertex_buffers(vertex_inputs, vertex_attrs)?,
                    primitive,
                    raster: *raster,
                    render_target_count,
                },
                variants: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub(crate) fn kind(&self) -> &PipelineKind {
        &self.kind
    }

    pub(crate) fn sets(&self) -> &[(CacheHandle, SetLayout)] {
        &self.sets
    }

    /// Number of render-pass variants built so far.
    pub fn variant_count(&self) -> usize {
        match &self.kind {
            PipelineKind::Compute(_) => 0,
            PipelineKind::Graphics(g) => g.variants.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

impl GraphicsPipeline {
    /// Native pipeline for `renderpass`, built on first use.
    pub(crate) fn variant(
        &self,
        device: &wgpu::Device,
        layout: &wgpu::PipelineLayout,
        renderpass: CacheHandle,
        info: &RenderPassInfo,
        name: &str,
    ) -> DeviceResult<wgpu::RenderPipeline> {
        let mut variants = self.variants.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(p) = variants.get(&renderpass) {
            return Ok(p.clone());
        }

        let t = &self.template;
        if info.color_formats.len() != t.render_target_count {
            return Err(DeviceError::precondition(format!(
                "pipeline `{name}` declares {} render targets, render pass has {}",
                t.render_target_count,
                info.color_formats.len()
            )));
        }

        let targets: Vec<Option<wgpu::ColorTargetState>> = info
            .color_formats
            .iter()
            .map(|f| {
                Some(wgpu::ColorTargetState {
                    format: *f,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let buffers: Vec<wgpu::VertexBufferLayout<'_>> = t
            .buffers
            .iter()
            .map(|b| wgpu::VertexBufferLayout {
                array_stride: b.stride,
                step_mode: b.step_mode,
                attributes: &b.attributes,
            })
            .collect();

        let depth_stencil = info.depth_format.map(|format| wgpu::DepthStencilState {
            format,
            depth_write_enabled: t.raster.depth_write,
            depth_compare: if t.raster.depth_test {
                wgpu::CompareFunction::GreaterEqual
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(name),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: &t.vertex.module,
                entry_point: Some(&t.vertex.entry_point),
                compilation_options: Default::default(),
                buffers: &buffers,
            },
            fragment: t.fragment.as_ref().map(|f| wgpu::FragmentState {
                module: &f.module,
                entry_point: Some(&f.entry_point),
                compilation_options: Default::default(),
                targets: &targets,
            }),
            primitive: t.primitive,
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        log::debug!("built variant of `{name}` for render pass {renderpass:?}");
        variants.insert(renderpass, pipeline.clone());
        Ok(pipeline)
    }
}

impl Pipeline for WgpuPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_graphics(&self) -> bool {
        matches!(self.kind, PipelineKind::Graphics(_))
    }

    fn resource_binder(&self) -> ResourceBinder {
        self.binder.clone()
    }
}

impl WgpuPipeline {
    pub(crate) fn layout(&self) -> &wgpu::PipelineLayout {
        &self.layout
    }
}

#[cfg(test)]
mod tests {
    use strata_device::BufferFormat;

    use super::*;

    #[test]
    fn vertex_buffers_fill_gaps_between_bindings() {
        let inputs = [
            VertexInputBinding { binding: 0, stride: 12, instance: false },
            VertexInputBinding { binding: 2, stride: 16, instance: true },
        ];
        let attrs = [
            VertexInputAttribute { location: 0, binding: 0, format: BufferFormat::Rgb32f, offset: 0 },
            VertexInputAttribute { location: 1, binding: 2, format: BufferFormat::Rgba32f, offset: 0 },
        ];

        let buffers = vertex_buffers(&inputs, &attrs).unwrap();
        assert_eq!(buffers.len(), 3);
        assert_eq!(buffers[1].stride, 0);
        assert!(buffers[1].attributes.is_empty());
        assert_eq!(buffers[2].step_mode, wgpu::VertexStepMode::Instance);
        assert_eq!(buffers[0].attributes[0].format, wgpu::VertexFormat::Float32x3);
    }

    #[test]
    fn attributes_need_a_declared_binding() {
        let attrs = [VertexInputAttribute { location: 0, binding: 1, format: BufferFormat::R32f, offset: 0 }];
        assert!(matches!(vertex_buffers(&[], &attrs), Err(DeviceError::Precondition(_))));
    }

    #[test]
    fn reflected_stage_must_export_the_entry_point() {
        let src = "@compute @workgroup_size(1) fn go() {}";
        let ok = PipelineSource::wgsl(PipelineStage::Compute, src, "go");
        assert!(reflect_stage(&ok).is_ok());

        let missing = PipelineSource::wgsl(PipelineStage::Compute, src, "main");
        assert!(reflect_stage(&missing).unwrap_err().is_precondition());
    }
}
