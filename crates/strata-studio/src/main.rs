//! Demo driver for the strata device layer.
//!
//! Registers the host and a wgpu device, launches a kernel whose data lives
//! in host memory, and with `--window` draws through a swapchain surface.

mod compute;
mod viewer;

use std::sync::Arc;

use anyhow::Result;
use strata_device::logging::{LoggingConfig, init_logging};
use strata_device::{Device, DeviceRegistry};
use strata_wgpu::{DeviceInit, WgpuDevice};

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());

    let open_window = std::env::args().skip(1).any(|arg| arg == "--window");

    let registry = DeviceRegistry::with_host()?;
    let gpu = Arc::new(WgpuDevice::new_blocking(DeviceInit::default())?);
    let gpu_id = registry.register_device(gpu.clone())?;
    log::info!(
        "registered {} as {gpu_id:?}: {:?}, {:?}",
        gpu.info().name,
        gpu.query_type(),
        gpu.query_capabilities()
    );

    compute::run(&registry, &gpu, 4096)?;

    if open_window {
        viewer::run(gpu.clone())?;
    }

    registry.sync_all()?;
    Ok(())
}
