//! Format and enum conversions between the device contract and wgpu.

use strata_device::{BufferFormat, CullMode, IndexFormat, TopologyType};

pub(crate) fn texture_format(format: BufferFormat) -> Option<wgpu::TextureFormat> {
    use wgpu::TextureFormat as T;
    Some(match format {
        BufferFormat::R8 => T::R8Unorm,
        BufferFormat::Rg8 => T::Rg8Unorm,
        BufferFormat::Rgba8 => T::Rgba8Unorm,
        BufferFormat::Rgba8Srgb => T::Rgba8UnormSrgb,
        BufferFormat::Bgra8 => T::Bgra8Unorm,
        BufferFormat::Bgra8Srgb => T::Bgra8UnormSrgb,
        BufferFormat::R8u => T::R8Uint,
        BufferFormat::Rg8u => T::Rg8Uint,
        BufferFormat::Rgba8u => T::Rgba8Uint,
        BufferFormat::R8i => T::R8Sint,
        BufferFormat::Rg8i => T::Rg8Sint,
        BufferFormat::Rgba8i => T::Rgba8Sint,
        BufferFormat::R16 => T::R16Unorm,
        BufferFormat::Rg16 => T::Rg16Unorm,
        BufferFormat::Rgba16 => T::Rgba16Unorm,
        BufferFormat::R16f => T::R16Float,
        BufferFormat::Rg16f => T::Rg16Float,
        BufferFormat::Rgba16f => T::Rgba16Float,
        BufferFormat::R32u => T::R32Uint,
        BufferFormat::Rg32u => T::Rg32Uint,
        BufferFormat::Rgba32u => T::Rgba32Uint,
        BufferFormat::R32i => T::R32Sint,
        BufferFormat::Rg32i => T::Rg32Sint,
        BufferFormat::Rgba32i => T::Rgba32Sint,
        BufferFormat::R32f => T::R32Float,
        BufferFormat::Rg32f => T::Rg32Float,
        BufferFormat::Rgba32f => T::Rgba32Float,
        BufferFormat::Depth16 => T::Depth16Unorm,
        BufferFormat::Depth24Stencil8 => T::Depth24PlusStencil8,
        BufferFormat::Depth32f => T::Depth32Float,
        // No three-channel textures in wgpu.
        BufferFormat::Rgb32u | BufferFormat::Rgb32i | BufferFormat::Rgb32f => return None,
    })
}

/// Inverse of [`texture_format`].
pub(crate) fn buffer_format(format: wgpu::TextureFormat) -> Option<BufferFormat> {
    use wgpu::TextureFormat as T;
    Some(match format {
        T::R8Unorm => BufferFormat::R8,
        T::Rg8Unorm => BufferFormat::Rg8,
        T::Rgba8Unorm => BufferFormat::Rgba8,
        T::Rgba8UnormSrgb => BufferFormat::Rgba8Srgb,
        T::Bgra8Unorm => BufferFormat::Bgra8,
        T::Bgra8UnormSrgb => BufferFormat::Bgra8Srgb,
        T::R8Uint => BufferFormat::R8u,
        T::Rg8Uint => BufferFormat::Rg8u,
        T::Rgba8Uint => BufferFormat::Rgba8u,
        T::R8Sint => BufferFormat::R8i,
        T::Rg8Sint => BufferFormat::Rg8i,
        T::Rgba8Sint => BufferFormat::Rgba8i,
        T::R16Unorm => BufferFormat::R16,
        T::Rg16Unorm => BufferFormat::Rg16,
        T::Rgba16Unorm => BufferFormat::Rgba16,
        T::R16Float => BufferFormat::R16f,
        T::Rg16Float => BufferFormat::Rg16f,
        T::Rgba16Float => BufferFormat::Rgba16f,
        T::R32Uint => BufferFormat::R32u,
        T::Rg32Uint => BufferFormat::Rg32u,
        T::Rgba32Uint => BufferFormat::Rgba32u,
        T::R32Sint => BufferFormat::R32i,
        T::Rg32Sint => BufferFormat::Rg32i,
        T::Rgba32Sint => BufferFormat::Rgba32i,
        T::R32Float => BufferFormat::R32f,
        T::Rg32Float => BufferFormat::Rg32f,
        T::Rgba32Float => BufferFormat::Rgba32f,
        T::Depth16Unorm => BufferFormat::Depth16,
        T::Depth24PlusStencil8 => BufferFormat::Depth24Stencil8,
        T::Depth32Float => BufferFormat::Depth32f,
        _ => return None,
    })
}

pub(crate) fn vertex_format(format: BufferFormat) -> Option<wgpu::VertexFormat> {
    use wgpu::VertexFormat as V;
    Some(match format {
        BufferFormat::Rg8 => V::Unorm8x2,
        BufferFormat::Rgba8 => V::Unorm8x4,
        BufferFormat::Rg8u => V::Uint8x2,
        BufferFormat::Rgba8u => V::Uint8x4,
        BufferFormat::Rg8i => V::Sint8x2,
        BufferFormat::Rgba8i => V::Sint8x4,
        BufferFormat::Rg16 => V::Unorm16x2,
        BufferFormat::Rgba16 => V::Unorm16x4,
        BufferFormat::Rg16f => V::Float16x2,
        BufferFormat::Rgba16f => V::Float16x4,
        BufferFormat::R32u => V::Uint32,
        BufferFormat::Rg32u => V::Uint32x2,
        BufferFormat::Rgb32u => V::Uint32x3,
        BufferFormat::Rgba32u => V::Uint32x4,
        BufferFormat::R32i => V::Sint32,
        BufferFormat::Rg32i => V::Sint32x2,
        BufferFormat::Rgb32i => V::Sint32x3,
        BufferFormat::Rgba32i => V::Sint32x4,
        BufferFormat::R32f => V::Float32,
        BufferFormat::Rg32f => V::Float32x2,
        BufferFormat::Rgb32f => V::Float32x3,
        BufferFormat::Rgba32f => V::Float32x4,
        _ => return None,
    })
}

pub(crate) fn topology(topology: TopologyType) -> wgpu::PrimitiveTopology {
    match topology {
        TopologyType::Points => wgpu::PrimitiveTopology::PointList,
        TopologyType::Lines => wgpu::PrimitiveTopology::LineList,
        TopologyType::Triangles => wgpu::PrimitiveTopology::TriangleList,
    }
}

pub(crate) fn cull_mode(mode: CullMode) -> Option<wgpu::Face> {
    match mode {
        CullMode::None => None,
        CullMode::Front => Some(wgpu::Face::Front),
        CullMode::Back => Some(wgpu::Face::Back),
    }
}

pub(crate) fn index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::U16 => wgpu::IndexFormat::Uint16,
        IndexFormat::U32 => wgpu::IndexFormat::Uint32,
    }
}
