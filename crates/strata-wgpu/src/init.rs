/// Device bring-up parameters.
#[derive(Debug, Clone)]
pub struct DeviceInit {
    /// Backends wgpu may pick from. `WGPU_BACKEND` overrides this.
    pub backends: wgpu::Backends,

    pub power_preference: wgpu::PowerPreference,

    /// Accept only a software adapter.
    pub force_fallback_adapter: bool,

    /// Required wgpu features. Empty keeps the device portable.
    pub required_features: wgpu::Features,

    /// Limits requested from the adapter.
    pub required_limits: wgpu::Limits,

    pub memory_hints: wgpu::MemoryHints,

    pub label: &'static str,
}

impl Default for DeviceInit {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::all(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            label: "strata device",
        }
    }
}

/// Swapchain parameters for [`WgpuDevice::create_surface`](crate::WgpuDevice::create_surface).
#[derive(Debug, Clone)]
pub struct SurfaceInit {
    /// Prefer an sRGB format when the surface offers one.
    pub prefer_srgb: bool,

    /// FIFO is supported everywhere.
    pub present_mode: wgpu::PresentMode,

    /// Falls back to the first supported mode when unsupported.
    pub alpha_mode: Option<wgpu::CompositeAlphaMode>,

    /// Hint only; support depends on platform/backend.
    pub desired_maximum_frame_latency: u32,
}

impl Default for SurfaceInit {
    fn default() -> Self {
        Self {
            prefer_srgb: true,
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: None,
            desired_maximum_frame_latency: 2,
        }
    }
}
