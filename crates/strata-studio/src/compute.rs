use std::sync::Arc;

use anyhow::Result;
use strata_device::{
    AllocParams, ComputeDevice, DeviceId, DeviceRegistry, GraphicsDevice, PipelineSource,
    PipelineStage, SNodeMapping,
};
use strata_wgpu::{KernelLaunch, WgpuDevice};

const KERNEL_ID: u32 = 0;

const AFFINE: &str = r#"
    @group(0) @binding(0) var<storage, read_write> values: array<f32>;

    @compute @workgroup_size(64)
    fn main(@builtin(global_invocation_id) id: vec3<u32>) {
        if (id.x < arrayLength(&values)) {
            values[id.x] = values[id.x] * 2.0 + 1.0;
        }
    }
"#;

fn floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Runs `2x + 1` over `count` floats that live in host memory.
///
/// The launch protocol copies them to the GPU, runs the kernel and writes
/// them back.
pub fn run(registry: &DeviceRegistry, gpu: &Arc<WgpuDevice>, count: usize) -> Result<()> {
    let pipeline = gpu.create_pipeline(
        &PipelineSource::wgsl(PipelineStage::Compute, AFFINE, "main"),
        "affine",
    )?;
    let groups = count.div_ceil(64) as u32;
    gpu.register_kernel(
        KERNEL_ID,
        KernelLaunch::new(Arc::new(pipeline), [groups, 1, 1]).arg(0, 0, 0),
    )?;

    let host = registry.device(DeviceId::HOST)?;
    let bytes = (count * 4) as u64;
    let alloc = host.allocate_memory(AllocParams::host_visible(bytes))?;

    let input: Vec<f32> = (0..count).map(|i| i as f32).collect();
    host.write_range(alloc.ptr(0), bytemuck::cast_slice(&input))?;

    let mut mapping = SNodeMapping::new();
    mapping.insert(0, alloc.range(bytes));

    let compute: &dyn ComputeDevice = &**gpu;
    compute.launch_kernel(registry, 0, KERNEL_ID, &mapping)?;
    compute.wait_for_stream_complete(0)?;

    let output = floats(&host.read_range(alloc.range(bytes))?);
    let wrong = input
        .iter()
        .zip(&output)
        .filter(|(x, y)| **x * 2.0 + 1.0 != **y)
        .count();
    anyhow::ensure!(wrong == 0, "{wrong} of {count} values differ after the launch");

    log::info!("kernel {KERNEL_ID}: {count} host values round-tripped through the GPU");
    host.deallocate_memory(alloc)?;
    Ok(())
}
