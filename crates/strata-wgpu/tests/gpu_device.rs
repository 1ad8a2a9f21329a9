//! Device-level tests against a real adapter.
//!
//! Each test returns early when no adapter is available (headless CI without
//! a software rasterizer).

use std::sync::Arc;

use strata_device::{
    AllocParams, BufferFormat, ColorAttachment, CommandList, ComputeDevice, Device, DeviceRegistry,
    GraphicsDevice, Pipeline, PipelineSource, PipelineStage, RenderArea, RenderPassDesc,
    ResourceKind, SNodeMapping, SetLayout, SubmissionStats,
};
use strata_wgpu::{DeviceInit, KernelLaunch, WgpuDevice};

const DOUBLE: &str = r#"
    @group(0) @binding(0) var<storage, read_write> data: array<u32>;

    @compute @workgroup_size(64)
    fn main(@builtin(global_invocation_id) id: vec3<u32>) {
        if (id.x < arrayLength(&data)) {
            data[id.x] = data[id.x] * 2u;
        }
    }
"#;

fn setup() -> Option<(DeviceRegistry, Arc<WgpuDevice>)> {
    let device = match WgpuDevice::new_blocking(DeviceInit::default()) {
        Ok(device) => Arc::new(device),
        Err(e) => {
            eprintln!("no wgpu adapter, skipping: {e:#}");
            return None;
        }
    };
    let registry = DeviceRegistry::with_host().unwrap();
    registry.register_device(device.clone()).unwrap();
    Some((registry, device))
}

fn words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ── memory ────────────────────────────────────────────────────────────────

#[test]
fn map_write_unmap_map_read_round_trips() {
    let Some((_registry, gpu)) = setup() else { return };

    for size in [1usize, 3, 4, 64, 1000, 4096] {
        let alloc = gpu.allocate_memory(AllocParams::host_visible(size as u64)).unwrap();
        let expected: Vec<u8> = (0..size).map(|i| (i * 13 + 1) as u8).collect();

        let region = gpu.map(alloc).unwrap();
        assert_eq!(region.len(), size);
        unsafe { region.as_mut_slice() }.copy_from_slice(&expected);
        gpu.unmap(alloc).unwrap();

        let region = gpu.map(alloc).unwrap();
        assert_eq!(unsafe { region.as_slice() }, expected.as_slice());
        gpu.unmap(alloc).unwrap();

        gpu.deallocate_memory(alloc).unwrap();
    }
}

#[test]
fn double_map_is_rejected_until_unmapped() {
    let Some((_registry, gpu)) = setup() else { return };
    let alloc = gpu.allocate_memory(AllocParams::host_visible(256)).unwrap();

    gpu.map(alloc).unwrap();
    assert!(gpu.map(alloc).unwrap_err().is_precondition());
    gpu.unmap(alloc).unwrap();
    assert!(gpu.unmap(alloc).unwrap_err().is_precondition());
    gpu.map(alloc).unwrap();
    gpu.unmap(alloc).unwrap();
}

#[test]
fn device_local_memory_cannot_be_mapped() {
    let Some((_registry, gpu)) = setup() else { return };
    let alloc = gpu.allocate_memory(AllocParams::device_local(64)).unwrap();
    assert!(gpu.map(alloc).unwrap_err().is_precondition());
}

#[test]
fn unregistered_device_refuses_to_allocate() {
    let Ok(gpu) = WgpuDevice::new_blocking(DeviceInit::default()) else { return };
    assert!(gpu
        .allocate_memory(AllocParams::host_visible(16))
        .unwrap_err()
        .is_precondition());
}

// ── caches ────────────────────────────────────────────────────────────────

#[test]
fn structural_caches_return_the_same_handle() {
    let Some((_registry, gpu)) = setup() else { return };

    let layout = SetLayout::new(vec![(0, ResourceKind::ReadWriteBuffer), (1, ResourceKind::ReadOnlyBuffer)]);
    let a = gpu.get_set_layout(&layout).unwrap();
    let b = gpu.get_set_layout(&layout.clone()).unwrap();
    assert_eq!(a, b);

    let pass = RenderPassDesc {
        color_attachments: vec![(BufferFormat::Rgba8, true)],
        depth_attachment: Some(BufferFormat::Depth32f),
        clear_depth: true,
    };
    let before = gpu.render_pass_count();
    let p1 = gpu.get_renderpass(&pass).unwrap();
    let p2 = gpu.get_renderpass(&pass).unwrap();
    assert_eq!(p1, p2);
    assert_eq!(gpu.render_pass_count(), before + 1);

    let mut other = pass.clone();
    other.color_attachments[0].1 = false;
    assert_ne!(gpu.get_renderpass(&other).unwrap(), p1);
    assert!(gpu.set_layout_count() >= 1);
}

#[test]
fn native_handles_resolve_by_kind() {
    let Some((_registry, gpu)) = setup() else { return };

    let buffer = gpu.allocate_memory(AllocParams::device_local(128)).unwrap();
    let image = gpu.create_image(BufferFormat::Rgba8, 4, 4).unwrap();

    assert_eq!(gpu.get_native_buffer(buffer).unwrap().size(), 128);
    assert!(gpu.get_native_image(image).is_ok());
    assert!(gpu.get_native_buffer(image).is_err_and(|e| e.is_precondition()));
    assert!(gpu.get_native_image(buffer).is_err_and(|e| e.is_precondition()));

    gpu.destroy_image(image).unwrap();
    assert!(gpu.get_native_image(image).is_err_and(|e| e.is_precondition()));
}

// ── compute ───────────────────────────────────────────────────────────────

#[test]
fn fill_then_dispatch_doubles_every_word() {
    let Some((_registry, gpu)) = setup() else { return };
    let n = 256u64;

    let pipeline = gpu
        .create_pipeline(&PipelineSource::wgsl(PipelineStage::Compute, DOUBLE, "main"), "double")
        .unwrap();
    let alloc = gpu.allocate_memory(AllocParams::host_visible(n * 4)).unwrap();

    let mut binder = pipeline.resource_binder();
    binder.rw_buffer_alloc(0, 0, alloc);

    let mut list = gpu.new_command_list().unwrap();
    list.buffer_fill(alloc.ptr(0), strata_device::WHOLE_SIZE, 21).unwrap();
    list.buffer_barrier(alloc.ptr(0), n * 4);
    list.bind_pipeline(&pipeline).unwrap();
    list.bind_resources(&binder).unwrap();
    list.dispatch((n / 64) as u32, 1, 1);
    gpu.submit_synced(list).unwrap();

    let out = words(&gpu.read_range(alloc.range(n * 4)).unwrap());
    assert!(out.iter().all(|&w| w == 42));
}

#[test]
fn command_sync_reclaims_every_submission() {
    let Some((_registry, gpu)) = setup() else { return };

    let pipeline = gpu
        .create_pipeline(&PipelineSource::wgsl(PipelineStage::Compute, DOUBLE, "main"), "double")
        .unwrap();
    let alloc = gpu.allocate_memory(AllocParams::device_local(1024)).unwrap();
    let mut binder = pipeline.resource_binder();
    binder.rw_buffer_alloc(0, 0, alloc);

    for _ in 0..5 {
        let mut list = gpu.new_command_list().unwrap();
        list.bind_pipeline(&pipeline).unwrap();
        list.bind_resources(&binder).unwrap();
        assert_eq!(list.descriptor_set_count(), 1);
        list.dispatch(4, 1, 1);
        gpu.submit(list).unwrap();
    }
    let layout = gpu.get_set_layout(&binder.set_layout(0).unwrap()).unwrap();

    let stats = gpu.submission_stats();
    assert_eq!(stats.in_flight, 5);
    assert_eq!(stats.pending_sets, 5);

    gpu.command_sync().unwrap();
    assert_eq!(
        gpu.submission_stats(),
        SubmissionStats {
            free_buffers: 5,
            ..Default::default()
        }
    );
    assert_eq!(gpu.pool_usage(layout), Some((5, 5)));
}

#[test]
fn recording_after_finalize_panics() {
    let Some((_registry, gpu)) = setup() else { return };

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut list = gpu.new_command_list().unwrap();
        assert!(list.finalize().is_some());
        assert!(list.finalize().is_none());
        assert!(list.is_finalized());
        list.dispatch(1, 1, 1);
    }));
    assert!(result.is_err());
    assert_eq!(gpu.submission_stats().free_buffers, 1);
}

#[test]
fn finalize_hands_out_the_native_buffer_once() {
    let Some((_registry, gpu)) = setup() else { return };
    let alloc = gpu.allocate_memory(AllocParams::host_visible(64)).unwrap();

    let mut list = gpu.new_command_list().unwrap();
    list.buffer_fill(alloc.ptr(0), strata_device::WHOLE_SIZE, 9).unwrap();
    let native = list.finalize().expect("first finalize yields the command buffer");
    let index = gpu.queue().submit(std::iter::once(native));
    gpu.raw()
        .poll(wgpu::PollType::Wait { submission_index: Some(index), timeout: None })
        .unwrap();

    assert!(gpu.submit(list).unwrap_err().is_precondition());
    assert!(words(&gpu.read_range(alloc.range(64)).unwrap()).iter().all(|&w| w == 9));
}

// ── kernel launch ─────────────────────────────────────────────────────────

#[test]
fn kernel_over_host_memory_round_trips_through_the_gpu() {
    let Some((registry, gpu)) = setup() else { return };
    let host = registry.get_device_by_id(strata_device::DeviceId::HOST).unwrap();

    let pipeline = gpu
        .create_pipeline(&PipelineSource::wgsl(PipelineStage::Compute, DOUBLE, "main"), "double")
        .unwrap();
    gpu.register_kernel(7, KernelLaunch::new(Arc::new(pipeline), [1, 1, 1]).arg(0, 0, 0))
        .unwrap();
    assert_eq!(gpu.kernel_count(), 1);

    let input: Vec<u32> = (0..64).collect();
    let src = host.allocate_memory(AllocParams::host_visible(256)).unwrap();
    host.write_range(src.ptr(0), bytemuck::cast_slice(&input)).unwrap();

    let mut mapping = SNodeMapping::new();
    mapping.insert(0, src.range(256));

    let compute: &dyn ComputeDevice = &*gpu;
    compute.launch_kernel(&registry, 0, 7, &mapping).unwrap();

    let out = words(&host.read_range(src.range(256)).unwrap());
    let expected: Vec<u32> = input.iter().map(|v| v * 2).collect();
    assert_eq!(out, expected);

    compute.wait_for_stream_complete(0).unwrap();
    assert_eq!(gpu.submission_stats().pending_sets, 0);
}

#[test]
fn unknown_kernel_and_stream_are_rejected() {
    let Some((registry, gpu)) = setup() else { return };
    let compute: &dyn ComputeDevice = &*gpu;
    let mapping = SNodeMapping::new();

    assert!(compute.launch_kernel(&registry, 0, 99, &mapping).unwrap_err().is_precondition());
    assert!(compute.wait_for_stream_complete(3).unwrap_err().is_precondition());
}

// ── graphics ──────────────────────────────────────────────────────────────

const FULLSCREEN: &str = r#"
    struct Tint { color: vec4<f32> }
    @group(0) @binding(0) var<uniform> tint: Tint;

    @vertex
    fn vs(@builtin(vertex_index) i: u32) -> @builtin(position) vec4<f32> {
        let x = f32(i32(i & 1u) * 4 - 1);
        let y = f32(i32(i >> 1u) * 4 - 1);
        return vec4<f32>(x, y, 0.0, 1.0);
    }

    @fragment
    fn fs() -> @location(0) vec4<f32> {
        return tint.color;
    }
"#;

#[test]
fn raster_pipeline_builds_one_variant_per_render_pass() {
    let Some((_registry, gpu)) = setup() else { return };

    let sources = [
        PipelineSource::wgsl(PipelineStage::Vertex, FULLSCREEN, "vs"),
        PipelineSource::wgsl(PipelineStage::Fragment, FULLSCREEN, "fs"),
    ];
    let pipeline = gpu
        .create_raster_pipeline(
            &sources,
            &[BufferFormat::Rgba8],
            &[],
            &[],
            &Default::default(),
            "fullscreen",
        )
        .unwrap();

    let target = gpu.create_image(BufferFormat::Rgba8, 64, 64).unwrap();
    let tint = gpu.allocate_memory(AllocParams::host_visible(256)).unwrap();
    gpu.write_range(tint.ptr(0), bytemuck::cast_slice(&[1.0f32, 0.0, 0.0, 1.0])).unwrap();

    let mut binder = pipeline.resource_binder();
    binder.buffer_alloc(0, 0, tint);

    for clear in [true, false, true] {
        let mut list = gpu.new_command_list().unwrap();
        list.begin_renderpass(
            RenderArea::new(0, 0, 64, 64),
            &[ColorAttachment { image: target, clear }],
            None,
        )
        .unwrap();
        list.bind_pipeline(&pipeline).unwrap();
        list.bind_resources(&binder).unwrap();
        list.draw(3, 0);
        list.end_renderpass();
        gpu.submit(list).unwrap();
    }
    gpu.command_sync().unwrap();

    assert_eq!(pipeline.variant_count(), 2);
    assert_eq!(gpu.framebuffer_count(), 2);
    gpu.destroy_image(target).unwrap();
}

#[test]
fn overflowing_draws_are_skipped() {
    let Some((_registry, gpu)) = setup() else { return };
    let sources = [
        PipelineSource::wgsl(PipelineStage::Vertex, FULLSCREEN, "vs"),
        PipelineSource::wgsl(PipelineStage::Fragment, FULLSCREEN, "fs"),
    ];
    let pipeline = gpu
        .create_raster_pipeline(&sources, &[BufferFormat::Rgba8], &[], &[], &Default::default(), "overflow")
        .unwrap();
    let target = gpu.create_image(BufferFormat::Rgba8, 8, 8).unwrap();
    let tint = gpu.allocate_memory(AllocParams::host_visible(256)).unwrap();
    let mut binder = pipeline.resource_binder();
    binder.buffer_alloc(0, 0, tint);

    let mut list = gpu.new_command_list().unwrap();
    list.begin_renderpass(RenderArea::new(0, 0, 8, 8), &[ColorAttachment { image: target, clear: true }], None)
        .unwrap();
    list.bind_pipeline(&pipeline).unwrap();
    list.bind_resources(&binder).unwrap();
    list.draw(3, u32::MAX);
    list.draw_indexed(3, u32::MAX, 0);
    list.draw_indexed(3, 0, u32::MAX - 1);
    list.draw(3, 0);
    list.end_renderpass();
    gpu.submit_synced(list).unwrap();
}

#[test]
fn unbound_wide_uniform_gets_a_large_enough_placeholder() {
    const WIDE: &str = r#"
        struct Palette { colors: array<vec4<f32>, 64> }
        @group(0) @binding(0) var<uniform> palette: Palette;
        @group(0) @binding(1) var<storage, read_write> out: array<f32>;

        @compute @workgroup_size(1)
        fn main() {
            out[0] = palette.colors[63].w;
        }
    "#;
    let Some((_registry, gpu)) = setup() else { return };

    let pipeline = gpu
        .create_pipeline(&PipelineSource::wgsl(PipelineStage::Compute, WIDE, "main"), "wide")
        .unwrap();
    let out = gpu.allocate_memory(AllocParams::host_visible(4)).unwrap();
    let mut binder = pipeline.resource_binder();
    binder.rw_buffer_alloc(0, 1, out);

    let mut list = gpu.new_command_list().unwrap();
    list.bind_pipeline(&pipeline).unwrap();
    list.bind_resources(&binder).unwrap();
    list.dispatch(1, 1, 1);
    gpu.submit_synced(list).unwrap();

    assert!(gpu.placeholder_size() >= 1024);
}

#[test]
fn raster_pipeline_needs_a_render_pass() {
    let Some((_registry, gpu)) = setup() else { return };
    let sources = [PipelineSource::wgsl(PipelineStage::Vertex, FULLSCREEN, "vs")];
    let pipeline = gpu
        .create_raster_pipeline(&sources, &[], &[], &[], &Default::default(), "depthless")
        .unwrap();

    let mut list = gpu.new_command_list().unwrap();
    assert!(list.bind_pipeline(&pipeline).unwrap_err().is_precondition());
}
