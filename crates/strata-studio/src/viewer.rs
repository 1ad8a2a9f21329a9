//! Windowed demo: one vertex-colored triangle per frame through a surface.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use strata_device::{
    AllocParams, BufferFormat, ColorAttachment, CommandList, Device, DeviceAllocation,
    GraphicsDevice, Pipeline, PipelineSource, PipelineStage, RasterParams, RenderArea,
    ResourceBinder, Surface, VertexInputAttribute, VertexInputBinding,
};
use strata_wgpu::{SurfaceInit, WgpuDevice, WgpuPipeline, WgpuSurface};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

const TRIANGLE: &str = r#"
    struct Frame { tint: vec4<f32> }
    @group(0) @binding(0) var<uniform> frame: Frame;

    struct VsOut {
        @builtin(position) position: vec4<f32>,
        @location(0) color: vec3<f32>,
    }

    @vertex
    fn vs(@location(0) position: vec2<f32>, @location(1) color: vec3<f32>) -> VsOut {
        var out: VsOut;
        out.position = vec4<f32>(position, 0.0, 1.0);
        out.color = color;
        return out;
    }

    @fragment
    fn fs(in: VsOut) -> @location(0) vec4<f32> {
        return vec4<f32>(in.color, 1.0) * frame.tint;
    }
"#;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

const VERTICES: [Vertex; 3] = [
    Vertex { position: [0.0, 0.6], color: [1.0, 0.2, 0.2] },
    Vertex { position: [-0.6, -0.5], color: [0.2, 1.0, 0.2] },
    Vertex { position: [0.6, -0.5], color: [0.2, 0.2, 1.0] },
];

/// Opens a window and renders until it is closed.
pub fn run(gpu: Arc<WgpuDevice>) -> Result<()> {
    let event_loop = EventLoop::new().context("failed to create winit EventLoop")?;
    let mut viewer = Viewer::new(gpu);
    event_loop
        .run_app(&mut viewer)
        .context("winit event loop terminated with error")?;
    Ok(())
}

struct Scene {
    gpu: Arc<WgpuDevice>,
    surface: WgpuSurface<'static>,
    window: Arc<Window>,
    pipeline: WgpuPipeline,
    binder: ResourceBinder,
    vertices: DeviceAllocation,
    frame: DeviceAllocation,
}

impl Scene {
    fn new(gpu: Arc<WgpuDevice>, window: Arc<Window>) -> Result<Self> {
        let size = window.inner_size();
        let surface = gpu.create_surface(window.clone(), size.width, size.height, &SurfaceInit::default())?;

        let sources = [
            PipelineSource::wgsl(PipelineStage::Vertex, TRIANGLE, "vs"),
            PipelineSource::wgsl(PipelineStage::Fragment, TRIANGLE, "fs"),
        ];
        let inputs = [VertexInputBinding {
            binding: 0,
            stride: size_of::<Vertex>() as u64,
            instance: false,
        }];
        let attrs = [
            VertexInputAttribute { location: 0, binding: 0, format: BufferFormat::Rg32f, offset: 0 },
            VertexInputAttribute { location: 1, binding: 0, format: BufferFormat::Rgb32f, offset: 8 },
        ];
        let pipeline = gpu.create_raster_pipeline(
            &sources,
            &[surface.image_format()],
            &inputs,
            &attrs,
            &RasterParams::default(),
            "triangle",
        )?;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&VERTICES);
        let vertices = gpu.allocate_memory(AllocParams::host_visible(vertex_bytes.len() as u64))?;
        gpu.write_range(vertices.ptr(0), vertex_bytes)?;
        let frame = gpu.allocate_memory(AllocParams::host_visible(16))?;

        let mut binder = pipeline.resource_binder();
        binder.buffer_alloc(0, 0, frame);
        binder.vertex_buffer(vertices.ptr(0), 0);

        Ok(Self { gpu, surface, window, pipeline, binder, vertices, frame })
    }

    fn draw(&mut self, seconds: f32) -> Result<()> {
        let pulse = 0.75 + 0.25 * seconds.sin();
        let tint = [pulse, pulse, pulse, 1.0f32];
        self.gpu.write_range(self.frame.ptr(0), bytemuck::cast_slice(&tint))?;

        let image = self.surface.get_target_image()?;
        let (width, height) = self.surface.get_size();

        let mut list = self.gpu.new_command_list()?;
        list.begin_renderpass(
            RenderArea::new(0, 0, width, height),
            &[ColorAttachment { image, clear: true }],
            None,
        )?;
        list.bind_pipeline(&self.pipeline)?;
        list.bind_resources(&self.binder)?;
        list.draw(3, 0);
        list.end_renderpass();
        self.gpu.submit(list)?;

        self.surface.present_image()?;
        self.gpu.command_sync()?;
        Ok(())
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        for alloc in [self.vertices, self.frame] {
            if let Err(e) = self.gpu.deallocate_memory(alloc) {
                log::warn!("releasing scene memory failed: {e}");
            }
        }
    }
}

struct Viewer {
    gpu: Arc<WgpuDevice>,
    scene: Option<Scene>,
    started: Instant,
}

impl Viewer {
    fn new(gpu: Arc<WgpuDevice>) -> Self {
        Self { gpu, scene: None, started: Instant::now() }
    }

    fn open(&self, event_loop: &ActiveEventLoop) -> Result<Scene> {
        let attrs = Window::default_attributes()
            .with_title("strata")
            .with_inner_size(LogicalSize::new(800.0, 600.0));
        let window = Arc::new(event_loop.create_window(attrs).context("failed to create window")?);
        Scene::new(self.gpu.clone(), window)
    }
}

impl ApplicationHandler for Viewer {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.scene.is_some() {
            return;
        }
        match self.open(event_loop) {
            Ok(scene) => {
                scene.window.request_redraw();
                self.scene = Some(scene);
            }
            Err(e) => {
                log::error!("{e:#}");
                event_loop.exit();
            }
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        event_loop.set_control_flow(ControlFlow::Wait);
        if let Some(scene) = &self.scene {
            scene.window.request_redraw();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(scene) = self.scene.as_mut() else { return };

        match event {
            WindowEvent::CloseRequested => {
                self.scene = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                scene.surface.resize(size.width, size.height);
                scene.window.request_redraw();
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = scene.draw(self.started.elapsed().as_secs_f32()) {
                    log::error!("frame failed: {e:#}");
                    self.scene = None;
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }
}
