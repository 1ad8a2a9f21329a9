//! Swapchain surfaces.
//!
//! A surface exposes its frames as one image allocation whose view is swapped
//! on every acquire, so render-pass and framebuffer caches see a stable key.

use std::sync::Arc;

use anyhow::{Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use strata_device::{BufferFormat, DeviceAllocation, DeviceError, DeviceResult, Surface};

use crate::device::WgpuDevice;
use crate::format;
use crate::init::SurfaceInit;

pub(crate) fn choose_surface_format(
    caps: &wgpu::SurfaceCapabilities,
    prefer_srgb: bool,
) -> Option<wgpu::TextureFormat> {
    // Only formats the device layer can name are usable as attachments.
    let usable: Vec<wgpu::TextureFormat> = caps
        .formats
        .iter()
        .copied()
        .filter(|f| format::buffer_format(*f).is_some())
        .collect();

    if prefer_srgb {
        let preferred = [
            wgpu::TextureFormat::Bgra8UnormSrgb,
            wgpu::TextureFormat::Rgba8UnormSrgb,
        ];
        for f in preferred {
            if usable.contains(&f) {
                return Some(f);
            }
        }
    }

    usable.first().copied()
}

pub(crate) fn choose_alpha_mode(
    caps: &wgpu::SurfaceCapabilities,
    requested: Option<wgpu::CompositeAlphaMode>,
) -> wgpu::CompositeAlphaMode {
    requested
        .filter(|m| caps.alpha_modes.contains(m))
        .or_else(|| caps.alpha_modes.first().copied())
        .unwrap_or(wgpu::CompositeAlphaMode::Auto)
}

/// Window swapchain driven through the [`Surface`] contract.
///
/// The window must outlive the surface, which `'w` enforces.
pub struct WgpuSurface<'w> {
    device: Arc<WgpuDevice>,
    surface: wgpu::Surface<'w>,
    config: wgpu::SurfaceConfiguration,
    format: BufferFormat,
    image: DeviceAllocation,
    frame: Option<wgpu::SurfaceTexture>,
}

impl WgpuDevice {
    /// Creates a swapchain for `window`, sized in physical pixels.
    pub fn create_surface<'w, W>(
        self: &Arc<Self>,
        window: W,
        width: u32,
        height: u32,
        init: &SurfaceInit,
    ) -> Result<WgpuSurface<'w>>
    where
        W: HasWindowHandle + HasDisplayHandle + Send + Sync + 'w,
    {
        let surface = self
            .instance()
            .create_surface(window)
            .context("failed to create wgpu surface")?;
        anyhow::ensure!(
            self.adapter().is_surface_supported(&surface),
            "adapter {} cannot present to this surface",
            self.info().name
        );

        let caps = surface.get_capabilities(self.adapter());
        let native = choose_surface_format(&caps, init.prefer_srgb)
            .context("no supported surface formats")?;
        let format = format::buffer_format(native).context("surface format has no image format")?;

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: native,
            width: width.max(1),
            height: height.max(1),
            present_mode: init.present_mode,
            alpha_mode: choose_alpha_mode(&caps, init.alpha_mode),
            view_formats: vec![],
            desired_maximum_frame_latency: init.desired_maximum_frame_latency,
        };
        surface.configure(self.raw(), &config);

        let image = self
            .import_image(native, config.width, config.height)
            .context("failed to register the surface image")?;
        log::debug!("created {format:?} surface {}x{}", config.width, config.height);

        Ok(WgpuSurface {
            device: Arc::clone(self),
            surface,
            config,
            format,
            image,
            frame: None,
        })
    }
}

impl WgpuSurface<'_> {
    /// Reconfigures the swapchain after a window resize.
    ///
    /// wgpu cannot configure a 0x0 surface; such sizes are ignored until the
    /// window has an area again.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(self.device.raw(), &self.config);
    }

    /// Image allocation that stands for every frame of this surface.
    pub fn image(&self) -> DeviceAllocation {
        self.image
    }

    fn acquire(&mut self) -> DeviceResult<wgpu::SurfaceTexture> {
        match self.surface.get_current_texture() {
            Ok(frame) => Ok(frame),
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::debug!("surface lost or outdated; reconfiguring");
                self.surface.configure(self.device.raw(), &self.config);
                self.surface
                    .get_current_texture()
                    .map_err(|e| DeviceError::backend(format!("surface acquire failed after reconfigure: {e}")))
            }
            Err(e) => Err(DeviceError::backend(format!("surface acquire failed: {e}"))),
        }
    }
}

impl Surface for WgpuSurface<'_> {
    fn get_target_image(&mut self) -> DeviceResult<DeviceAllocation> {
        if self.frame.is_some() {
            return Err(DeviceError::precondition("previous surface image was not presented"));
        }

        let frame = self.acquire()?;
        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.device.bind_image_view(
            self.image,
            Some(view),
            frame.texture.width(),
            frame.texture.height(),
        )?;
        self.frame = Some(frame);
        Ok(self.image)
    }

    fn present_image(&mut self) -> DeviceResult<()> {
        let frame = self
            .frame
            .take()
            .ok_or_else(|| DeviceError::precondition("present without an acquired surface image"))?;
        self.device
            .bind_image_view(self.image, None, self.config.width, self.config.height)?;
        frame.present();
        Ok(())
    }

    fn get_size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn image_format(&self) -> BufferFormat {
        self.format
    }
}

impl Drop for WgpuSurface<'_> {
    fn drop(&mut self) {
        self.frame = None;
        if let Err(e) = self.device.destroy_image(self.image) {
            log::warn!("releasing surface image failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(formats: Vec<wgpu::TextureFormat>, alpha_modes: Vec<wgpu::CompositeAlphaMode>) -> wgpu::SurfaceCapabilities {
        wgpu::SurfaceCapabilities {
            formats,
            alpha_modes,
            ..Default::default()
        }
    }

    #[test]
    fn srgb_is_preferred_when_offered() {
        let c = caps(
            vec![wgpu::TextureFormat::Bgra8Unorm, wgpu::TextureFormat::Bgra8UnormSrgb],
            vec![],
        );
        assert_eq!(choose_surface_format(&c, true), Some(wgpu::TextureFormat::Bgra8UnormSrgb));
        assert_eq!(choose_surface_format(&c, false), Some(wgpu::TextureFormat::Bgra8Unorm));
    }

    #[test]
    fn unnamed_formats_are_skipped() {
        let c = caps(
            vec![wgpu::TextureFormat::Rgb10a2Unorm, wgpu::TextureFormat::Rgba8Unorm],
            vec![],
        );
        assert_eq!(choose_surface_format(&c, true), Some(wgpu::TextureFormat::Rgba8Unorm));
        assert_eq!(choose_surface_format(&caps(vec![], vec![]), true), None);
    }

    #[test]
    fn unsupported_alpha_mode_falls_back() {
        let c = caps(vec![], vec![wgpu::CompositeAlphaMode::Opaque]);
        assert_eq!(
            choose_alpha_mode(&c, Some(wgpu::CompositeAlphaMode::PreMultiplied)),
            wgpu::CompositeAlphaMode::Opaque
        );
        assert_eq!(choose_alpha_mode(&caps(vec![], vec![]), None), wgpu::CompositeAlphaMode::Auto);
    }
}
