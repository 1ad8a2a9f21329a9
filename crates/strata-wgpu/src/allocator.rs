//! Buffer and image tables plus host staging.
//!
//! wgpu only maps dedicated staging buffers, so a host mapping is a shadow
//! copy: `map` reads the region back, `unmap` uploads it again when the
//! allocation is host-writable.

use std::collections::HashMap;

use strata_device::{AllocParams, DeviceError, DeviceResult, MemoryType, FENCE_TIMEOUT};

const ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

#[inline]
pub(crate) fn align_up(value: u64) -> u64 {
    value.div_ceil(ALIGN) * ALIGN
}

#[inline]
pub(crate) fn align_down(value: u64) -> u64 {
    value / ALIGN * ALIGN
}

pub(crate) struct HostMapping {
    pub offset: u64,
    pub shadow: Box<[u8]>,
}

pub(crate) struct AllocationInternal {
    pub buffer: wgpu::Buffer,
    /// Requested size; the native buffer may be padded.
    pub size: u64,
    pub params: AllocParams,
    pub mapping: Option<HostMapping>,
}

pub(crate) struct ImageAllocation {
    /// Keeps an owned texture alive behind `view`; `None` for imported
    /// images such as swapchain frames.
    pub _texture: Option<wgpu::Texture>,
    pub view: Option<wgpu::TextureView>,
    pub format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
}

/// Allocation tables of one device. Buffers and images share one id counter.
#[derive(Default)]
pub(crate) struct Allocator {
    alloc_cnt: u32,
    buffers: HashMap<u32, AllocationInternal>,
    images: HashMap<u32, ImageAllocation>,
}

impl Allocator {
    fn next_id(&mut self) -> u32 {
        let id = self.alloc_cnt;
        self.alloc_cnt += 1;
        id
    }

    pub fn insert_buffer(&mut self, alloc: AllocationInternal) -> u32 {
        let id = self.next_id();
        self.buffers.insert(id, alloc);
        id
    }

    pub fn insert_image(&mut self, image: ImageAllocation) -> u32 {
        let id = self.next_id();
        self.images.insert(id, image);
        id
    }

    pub fn buffer(&self, alloc_id: u32) -> DeviceResult<&AllocationInternal> {
        self.buffers
            .get(&alloc_id)
            .ok_or_else(|| DeviceError::precondition(format!("unknown buffer allocation {alloc_id}")))
    }

    pub fn buffer_mut(&mut self, alloc_id: u32) -> DeviceResult<&mut AllocationInternal> {
        self.buffers
            .get_mut(&alloc_id)
            .ok_or_else(|| DeviceError::precondition(format!("unknown buffer allocation {alloc_id}")))
    }

    pub fn remove_buffer(&mut self, alloc_id: u32) -> Option<AllocationInternal> {
        self.buffers.remove(&alloc_id)
    }

    pub fn image(&self, alloc_id: u32) -> DeviceResult<&ImageAllocation> {
        self.images
            .get(&alloc_id)
            .ok_or_else(|| DeviceError::precondition(format!("unknown image allocation {alloc_id}")))
    }

    pub fn image_mut(&mut self, alloc_id: u32) -> DeviceResult<&mut ImageAllocation> {
        self.images
            .get_mut(&alloc_id)
            .ok_or_else(|| DeviceError::precondition(format!("unknown image allocation {alloc_id}")))
    }

    pub fn remove_image(&mut self, alloc_id: u32) -> Option<ImageAllocation> {
        self.images.remove(&alloc_id)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

fn label_for(ty: MemoryType) -> &'static str {
    match ty {
        MemoryType::Device => "strata device-local",
        MemoryType::HostShared => "strata host-shared",
        MemoryType::HostToDevice => "strata upload",
        MemoryType::DeviceToHost => "strata readback",
    }
}

/// Creates a buffer usable as storage, uniform, vertex, index and copy target.
///
/// Placement is left to wgpu; the memory type only names the buffer and
/// gates host access.
pub(crate) fn create_buffer(device: &wgpu::Device, params: &AllocParams) -> wgpu::Buffer {
    let size = align_up(params.size.max(ALIGN));
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label_for(params.memory_type())),
        size,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::UNIFORM
            | wgpu::BufferUsages::VERTEX
            | wgpu::BufferUsages::INDEX
            | wgpu::BufferUsages::INDIRECT
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Blocks until `submission` (or all work) completes, bounded by the fence timeout.
pub(crate) fn wait_for(device: &wgpu::Device, submission: Option<wgpu::SubmissionIndex>) -> DeviceResult<()> {
    device
        .poll(wgpu::PollType::Wait {
            submission_index: submission,
            timeout: Some(FENCE_TIMEOUT),
        })
        .map(|_| ())
        .map_err(|e| DeviceError::backend(format!("wgpu device poll failed: {e:?}")))
}

fn check_bounds(buffer: &wgpu::Buffer, start: u64, end: u64) -> DeviceResult<()> {
    if end > buffer.size() || start > end {
        return Err(DeviceError::precondition(format!(
            "range {start}..{end} exceeds buffer of {} bytes",
            buffer.size()
        )));
    }
    Ok(())
}

/// Copies `size` bytes at `offset` back to the host.
pub(crate) fn read_buffer(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
    offset: u64,
    size: u64,
) -> DeviceResult<Vec<u8>> {
    if size == 0 {
        return Ok(Vec::new());
    }

    let start = align_down(offset);
    let end = align_up(offset + size);
    check_bounds(buffer, start, end)?;

    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("strata readback staging"),
        size: end - start,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("strata readback"),
    });
    encoder.copy_buffer_to_buffer(buffer, start, &staging, 0, end - start);
    let submission = queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    wait_for(device, Some(submission))?;

    rx.recv()
        .map_err(|_| DeviceError::backend("readback map callback never ran"))?
        .map_err(|e| DeviceError::backend(format!("readback map failed: {e}")))?;

    let bytes = {
        let mapped = slice.get_mapped_range();
        let lo = (offset - start) as usize;
        mapped[lo..lo + size as usize].to_vec()
    };
    staging.unmap();
    Ok(bytes)
}

/// Writes host bytes into `buffer`. Lands before the next queue submission.
///
/// Unaligned edges are patched through a read-modify-write of the covering span.
pub(crate) fn write_buffer(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
    offset: u64,
    data: &[u8],
) -> DeviceResult<()> {
    if data.is_empty() {
        return Ok(());
    }

    let size = data.len() as u64;
    let start = align_down(offset);
    let end = align_up(offset + size);
    check_bounds(buffer, start, end)?;

    if start == offset && end == offset + size {
        queue.write_buffer(buffer, offset, data);
    } else {
        let mut span = read_buffer(device, queue, buffer, start, end - start)?;
        let lo = (offset - start) as usize;
        span[lo..lo + data.len()].copy_from_slice(data);
        queue.write_buffer(buffer, start, &span);
    }
    Ok(())
}
