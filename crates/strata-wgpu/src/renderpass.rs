//! Render-pass and framebuffer descriptions resolved for wgpu.
//!
//! wgpu has no render-pass object; the cached value is the validated native
//! attachment layout, which also keys graphics pipeline variants.

use strata_device::{BufferFormat, DeviceAllocation, DeviceError, DeviceResult, RenderPassDesc};

use crate::format;

#[derive(Debug, Clone)]
pub(crate) struct RenderPassInfo {
    pub color_formats: Vec<wgpu::TextureFormat>,
    pub color_clear: Vec<bool>,
    pub depth_format: Option<wgpu::TextureFormat>,
    pub clear_depth: bool,
}

impl RenderPassInfo {
    /// Pairs attachment views with this pass's clear flags, in attachment order.
    pub fn with_load_flags<T>(&self, colors: Vec<T>, depth: Option<T>) -> (Vec<(T, bool)>, Option<(T, bool)>) {
        let colors = colors.into_iter().zip(self.color_clear.iter().copied()).collect();
        (colors, depth.map(|view| (view, self.clear_depth)))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FramebufferInfo {
    pub attachments: Vec<DeviceAllocation>,
    pub width: u32,
    pub height: u32,
}

fn native(format: BufferFormat) -> DeviceResult<wgpu::TextureFormat> {
    format::texture_format(format)
        .ok_or_else(|| DeviceError::precondition(format!("{format:?} cannot be a render attachment")))
}

pub(crate) fn create_render_pass(desc: &RenderPassDesc) -> DeviceResult<RenderPassInfo> {
    let mut color_formats = Vec::with_capacity(desc.color_attachments.len());
    for (format, _) in &desc.color_attachments {
        if format.is_depth() {
            return Err(DeviceError::precondition(format!("{format:?} used as a color attachment")));
        }
        color_formats.push(native(*format)?);
    }

    let depth_format = match desc.depth_attachment {
        Some(format) if !format.is_depth() => {
            return Err(DeviceError::precondition(format!("{format:?} used as a depth attachment")));
        }
        Some(format) => Some(native(format)?),
        None => None,
    };

    log::debug!(
        "creating render pass: {} color attachments, depth: {}",
        color_formats.len(),
        depth_format.is_some()
    );

    Ok(RenderPassInfo {
        color_formats,
        color_clear: desc.color_attachments.iter().map(|(_, clear)| *clear).collect(),
        depth_format,
        clear_depth: desc.clear_depth,
    })
}

/// Load op for an attachment; a set clear flag clears.
pub(crate) fn color_load(clear: bool) -> wgpu::LoadOp<wgpu::Color> {
    if clear {
        wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
    } else {
        wgpu::LoadOp::Load
    }
}

/// Depth is cleared to 0.0 and tested with `GreaterEqual`.
pub(crate) fn depth_load(clear: bool) -> wgpu::LoadOp<f32> {
    if clear {
        wgpu::LoadOp::Clear(0.0)
    } else {
        wgpu::LoadOp::Load
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(clear: bool) -> RenderPassDesc {
        RenderPassDesc {
            color_attachments: vec![(BufferFormat::Rgba8, clear), (BufferFormat::Rgba16f, false)],
            depth_attachment: Some(BufferFormat::Depth32f),
            clear_depth: true,
        }
    }

    #[test]
    fn render_pass_keeps_attachment_order() {
        let info = create_render_pass(&desc(true)).unwrap();
        assert_eq!(
            info.color_formats,
            vec![wgpu::TextureFormat::Rgba8Unorm, wgpu::TextureFormat::Rgba16Float]
        );
        assert_eq!(info.color_clear, vec![true, false]);
        assert_eq!(info.depth_format, Some(wgpu::TextureFormat::Depth32Float));
    }

    #[test]
    fn misplaced_formats_are_rejected() {
        let mut bad = desc(true);
        bad.color_attachments.push((BufferFormat::Depth16, false));
        assert!(create_render_pass(&bad).unwrap_err().is_precondition());

        let mut bad = desc(true);
        bad.depth_attachment = Some(BufferFormat::Rgba8);
        assert!(create_render_pass(&bad).unwrap_err().is_precondition());
    }

    #[test]
    fn load_flags_follow_the_cached_pass() {
        let info = create_render_pass(&desc(false)).unwrap();
        let (colors, depth) = info.with_load_flags(vec!["albedo", "normal"], Some("depth"));
        assert_eq!(colors, vec![("albedo", false), ("normal", false)]);
        assert_eq!(depth, Some(("depth", true)));

        let (colors, depth) = info.with_load_flags(vec!["albedo"], None);
        assert_eq!(colors, vec![("albedo", false)]);
        assert_eq!(depth, None);
    }

    #[test]
    fn clear_flag_selects_clear_load_op() {
        assert!(matches!(color_load(true), wgpu::LoadOp::Clear(_)));
        assert!(matches!(color_load(false), wgpu::LoadOp::Load));
        assert!(matches!(depth_load(true), wgpu::LoadOp::Clear(v) if v == 0.0));
    }
}
