use std::num::NonZeroU64;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use strata_device::memory::resolve_size;
use strata_device::{
    AllocParams, BufferFormat, CacheHandle, CommandList, ComputeDevice, Device, DeviceAllocation,
    DeviceCaps, DeviceError, DeviceId, DeviceIdSlot, DevicePtr, DeviceRange, DeviceResult, DeviceType,
    FramebufferDesc, GraphicsDevice, MappedRegion, MemoryType, ObjectCache, PipelineSource,
    RasterParams, RenderPassDesc, ResourceBinder, ResourceKind, SNodeMapping, SetLayout,
    SubmissionStats, SubmissionTracker, VertexInputAttribute, VertexInputBinding, WHOLE_SIZE,
};

use crate::allocator::{self, AllocationInternal, Allocator, HostMapping, ImageAllocation};
use crate::command::{CommandBufferId, WgpuCommandList};
use crate::format;
use crate::init::DeviceInit;
use crate::kernel::{KernelLaunch, KernelTable};
use crate::layout::{DescriptorCaches, DescriptorSetHandle};
use crate::pipeline::WgpuPipeline;
use crate::renderpass::{self, FramebufferInfo, RenderPassInfo};

/// Smallest placeholder bound to descriptor slots the binder leaves null.
const PLACEHOLDER_SIZE: u64 = 256;

fn placeholder_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("strata placeholder"),
        size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::UNIFORM,
        mapped_at_creation: false,
    })
}

/// Texture view and extent of an image allocation, resolved for recording.
pub(crate) struct ImageTarget {
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Default)]
pub(crate) struct DeviceState {
    allocator: Allocator,
    descriptors: DescriptorCaches,
    render_passes: ObjectCache<RenderPassDesc, RenderPassInfo>,
    framebuffers: ObjectCache<FramebufferDesc, FramebufferInfo>,
    tracker: SubmissionTracker<CommandBufferId, DescriptorSetHandle, wgpu::SubmissionIndex>,
    next_cmdbuffer: u32,
    kernels: KernelTable,
}

/// A wgpu adapter exposed through the device contract.
///
/// Owns the wgpu core objects plus every table and cache the backend needs:
/// allocations, set layouts and their pools, render passes, framebuffers,
/// the submission tracker and the kernel table.
pub struct WgpuDevice {
    id: DeviceIdSlot,
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: wgpu::AdapterInfo,
    placeholder: Mutex<wgpu::Buffer>,
    state: Mutex<DeviceState>,
}

impl WgpuDevice {
    /// Requests an adapter and a device.
    ///
    /// Adapter/device acquisition is asynchronous under wgpu.
    pub async fn new(init: DeviceInit) -> Result<Self> {
        let backends = wgpu::Backends::from_env().unwrap_or(init.backends);
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: init.power_preference,
                compatible_surface: None,
                force_fallback_adapter: init.force_fallback_adapter,
            })
            .await
            .context("failed to find a suitable GPU adapter")?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some(init.label),
                required_features: init.required_features,
                required_limits: init.required_limits,
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: init.memory_hints,
                trace: wgpu::Trace::Off,
            })
            .await
            .context("failed to create wgpu device/queue")?;

        let info = adapter.get_info();
        log::info!(
            "wgpu device: {} ({:?}, {:?})",
            info.name,
            info.backend,
            info.device_type
        );

        let placeholder = placeholder_buffer(&device, PLACEHOLDER_SIZE);

        Ok(Self {
            id: DeviceIdSlot::new(),
            instance,
            adapter,
            device,
            queue,
            info,
            placeholder: Mutex::new(placeholder),
            state: Mutex::new(DeviceState::default()),
        })
    }

    pub fn new_blocking(init: DeviceInit) -> Result<Self> {
        pollster::block_on(Self::new(init))
    }

    pub fn raw(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn adapter(&self) -> &wgpu::Adapter {
        &self.adapter
    }

    pub fn info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }

    pub(crate) fn instance(&self) -> &wgpu::Instance {
        &self.instance
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_local(&self, ptr: DevicePtr) -> DeviceResult<()> {
        if ptr.device != self.id() {
            return Err(DeviceError::precondition(format!(
                "pointer into {:?} used on device {:?}",
                ptr.device,
                self.id()
            )));
        }
        Ok(())
    }

    /// Allocations of an unregistered device would read as null pointers.
    fn registered_id(&self) -> DeviceResult<DeviceId> {
        match self.id() {
            DeviceId::UNASSIGNED => Err(DeviceError::precondition(
                "wgpu device must be registered before it allocates",
            )),
            id => Ok(id),
        }
    }

    /// Placeholder of at least `min_size` bytes and the range to bind of it.
    ///
    /// The buffer grows to the largest request seen and is shared by all sets.
    fn placeholder(&self, min_size: u64) -> (wgpu::Buffer, u64) {
        let size = allocator::align_up(min_size).max(PLACEHOLDER_SIZE);
        let mut buffer = self.placeholder.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.size() < size {
            log::debug!("growing descriptor placeholder to {size} bytes");
            *buffer = placeholder_buffer(&self.device, size);
        }
        (buffer.clone(), size)
    }

    /// Bytes currently backing the descriptor placeholder.
    pub fn placeholder_size(&self) -> u64 {
        self.placeholder.lock().unwrap_or_else(PoisonError::into_inner).size()
    }

    /// Native buffer behind `ptr` plus the allocation's requested size.
    fn resolve_buffer(&self, ptr: DevicePtr) -> DeviceResult<(wgpu::Buffer, u64)> {
        self.check_local(ptr)?;
        let state = self.state();
        let alloc = state.allocator.buffer(ptr.address_space)?;
        Ok((alloc.buffer.clone(), alloc.size))
    }

    /// Native buffer behind `ptr` and the resolved length of a `size`-byte range.
    pub(crate) fn checked_range(&self, ptr: DevicePtr, size: u64) -> DeviceResult<(wgpu::Buffer, u64)> {
        let (buffer, total) = self.resolve_buffer(ptr)?;
        let len = resolve_size(ptr.offset, size, total);
        match ptr.offset.checked_add(len) {
            Some(end) if end <= total => Ok((buffer, len)),
            _ => Err(DeviceError::precondition(format!(
                "{len} bytes at offset {} exceed allocation of {total} bytes",
                ptr.offset
            ))),
        }
    }

    // ── caches ────────────────────────────────────────────────────────────

    /// Resolves a set layout, creating its native layout and pool on a miss.
    pub fn get_set_layout(&self, layout: &SetLayout) -> DeviceResult<CacheHandle> {
        self.state().descriptors.get_set_layout(&self.device, layout)
    }

    /// Builds the pipeline layout for a locked binder.
    ///
    /// Set `n` binds at group `n`; unused group indices below the highest
    /// used one get an empty layout.
    pub(crate) fn pipeline_layout(
        &self,
        binder: &ResourceBinder,
        name: &str,
    ) -> DeviceResult<(Vec<(CacheHandle, SetLayout)>, wgpu::PipelineLayout)> {
        let count = binder.sets().map(|(i, _)| i + 1).max().unwrap_or(0);

        let mut sets = Vec::with_capacity(count as usize);
        let mut native = Vec::with_capacity(count as usize);
        {
            let mut state = self.state();
            for i in 0..count {
                let layout = binder.set_layout(i).unwrap_or_else(SetLayout::empty);
                let handle = state.descriptors.get_set_layout(&self.device, &layout)?;
                native.push(state.descriptors.bind_group_layout(handle)?.clone());
                sets.push((handle, layout));
            }
        }

        let refs: Vec<&wgpu::BindGroupLayout> = native.iter().collect();
        let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(name),
            bind_group_layouts: &refs,
            immediate_size: 0,
        });
        Ok((sets, layout))
    }

    pub fn get_renderpass(&self, desc: &RenderPassDesc) -> DeviceResult<CacheHandle> {
        self.state()
            .render_passes
            .get_or_try_insert_with(desc, renderpass::create_render_pass)
    }

    pub(crate) fn renderpass_info(&self, handle: CacheHandle) -> DeviceResult<RenderPassInfo> {
        self.state()
            .render_passes
            .get(handle)
            .cloned()
            .ok_or_else(|| DeviceError::precondition(format!("unknown render pass {handle:?}")))
    }

    /// Resolves a framebuffer: color attachments first, then depth.
    pub fn get_framebuffer(&self, desc: &FramebufferDesc) -> DeviceResult<CacheHandle> {
        let mut state = self.state();
        let state = &mut *state;

        let pass = state
            .render_passes
            .get(desc.renderpass)
            .ok_or_else(|| DeviceError::precondition(format!("unknown render pass {:?}", desc.renderpass)))?;
        let expected = pass.color_formats.len() + usize::from(pass.depth_format.is_some());
        if desc.attachments.len() != expected {
            return Err(DeviceError::precondition(format!(
                "render pass takes {expected} attachments, framebuffer has {}",
                desc.attachments.len()
            )));
        }

        let allocator = &state.allocator;
        state.framebuffers.get_or_try_insert_with(desc, |key| {
            for image in &key.attachments {
                allocator.image(image.alloc_id)?;
            }
            log::debug!(
                "creating framebuffer {}x{} with {} attachments",
                key.width,
                key.height,
                key.attachments.len()
            );
            Ok(FramebufferInfo {
                attachments: key.attachments.clone(),
                width: key.width,
                height: key.height,
            })
        })
    }

    pub(crate) fn framebuffer_info(&self, handle: CacheHandle) -> DeviceResult<FramebufferInfo> {
        self.state()
            .framebuffers
            .get(handle)
            .cloned()
            .ok_or_else(|| DeviceError::precondition(format!("unknown framebuffer {handle:?}")))
    }

    pub fn set_layout_count(&self) -> usize {
        self.state().descriptors.layout_count()
    }

    pub fn render_pass_count(&self) -> usize {
        self.state().render_passes.len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.state().framebuffers.len()
    }

    /// `(allocated, free)` descriptor sets of one layout.
    pub fn pool_usage(&self, layout: CacheHandle) -> Option<(usize, usize)> {
        self.state().descriptors.pool_usage(layout)
    }

    // ── descriptor sets ───────────────────────────────────────────────────

    pub(crate) fn alloc_desc_set(&self, layout: CacheHandle) -> DeviceResult<DescriptorSetHandle> {
        self.state().descriptors.alloc_set(layout)
    }

    /// Writes set `index` of `binder` into the slot `set`, producing its bind group.
    ///
    /// Every entry of `layout` is written. Null slots produce no write of
    /// their own and are filled with the placeholder, sized to the slot's
    /// reflected minimum.
    pub(crate) fn write_to_set(
        &self,
        set: DescriptorSetHandle,
        layout: &SetLayout,
        binder: &ResourceBinder,
        index: u32,
    ) -> DeviceResult<wgpu::BindGroup> {
        let limits = self.device.limits();
        let state = self.state();

        let mut resolved = Vec::with_capacity(layout.len());
        for &(binding, kind) in layout.entries() {
            let slot = binder.set(index).and_then(|s| s.get(binding));
            let Some(b) = slot.filter(|b| !b.ptr.is_null()) else {
                // wgpu bind groups must be complete; a null slot gets the placeholder.
                let (buffer, size) = self.placeholder(slot.map_or(0, |b| b.size));
                resolved.push((binding, buffer, 0, NonZeroU64::new(size)));
                continue;
            };

            self.check_local(b.ptr)?;
            let alloc = state.allocator.buffer(b.ptr.address_space)?;
            let size = resolve_size(b.ptr.offset, b.size, alloc.size);
            if b.ptr.offset.saturating_add(size) > alloc.size {
                return Err(DeviceError::precondition(format!(
                    "binding ({index}, {binding}) spans past allocation {}",
                    b.ptr.address_space
                )));
            }

            let align = match kind {
                ResourceKind::ReadOnlyBuffer => limits.min_uniform_buffer_offset_alignment,
                ResourceKind::ReadWriteBuffer | ResourceKind::ReadOnlyStorageBuffer => {
                    limits.min_storage_buffer_offset_alignment
                }
            };
            if b.ptr.offset % u64::from(align) != 0 {
                return Err(DeviceError::precondition(format!(
                    "binding ({index}, {binding}) offset {} is not {align}-byte aligned",
                    b.ptr.offset
                )));
            }

            resolved.push((
                binding,
                alloc.buffer.clone(),
                b.ptr.offset,
                NonZeroU64::new(allocator::align_up(size)),
            ));
        }

        let entries: Vec<wgpu::BindGroupEntry<'_>> = resolved
            .iter()
            .map(|(binding, buffer, offset, size)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer,
                    offset: *offset,
                    size: *size,
                }),
            })
            .collect();

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("strata descriptor set"),
            layout: state.descriptors.bind_group_layout(set.layout)?,
            entries: &entries,
        }))
    }

    // ── images ────────────────────────────────────────────────────────────

    /// Creates a 2D image usable as a render attachment.
    pub fn create_image(&self, format: BufferFormat, width: u32, height: u32) -> DeviceResult<DeviceAllocation> {
        let id = self.registered_id()?;
        let native = format::texture_format(format)
            .ok_or_else(|| DeviceError::precondition(format!("{format:?} has no image format")))?;

        let max = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(DeviceError::resource_limit(format!(
                "image of {width}x{height} outside 1..={max}"
            )));
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("strata image"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: native,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let alloc_id = self.state().allocator.insert_image(ImageAllocation {
            _texture: Some(texture),
            view: Some(view),
            format: native,
            width,
            height,
        });
        log::debug!("created {format:?} image {alloc_id} ({width}x{height})");
        Ok(DeviceAllocation::new(id, alloc_id))
    }

    pub fn destroy_image(&self, image: DeviceAllocation) -> DeviceResult<()> {
        self.check_local(image.ptr(0))?;
        self.state()
            .allocator
            .remove_image(image.alloc_id)
            .map(|_| ())
            .ok_or_else(|| DeviceError::precondition(format!("unknown image allocation {}", image.alloc_id)))
    }

    /// Registers an image whose texture is owned elsewhere, such as a swapchain frame.
    pub(crate) fn import_image(
        &self,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
    ) -> DeviceResult<DeviceAllocation> {
        let id = self.registered_id()?;
        let alloc_id = self.state().allocator.insert_image(ImageAllocation {
            _texture: None,
            view: None,
            format,
            width,
            height,
        });
        Ok(DeviceAllocation::new(id, alloc_id))
    }

    pub(crate) fn bind_image_view(
        &self,
        image: DeviceAllocation,
        view: Option<wgpu::TextureView>,
        width: u32,
        height: u32,
    ) -> DeviceResult<()> {
        let mut state = self.state();
        let entry = state.allocator.image_mut(image.alloc_id)?;
        entry.view = view;
        entry.width = width;
        entry.height = height;
        Ok(())
    }

    pub(crate) fn image_target(&self, image: DeviceAllocation) -> DeviceResult<ImageTarget> {
        self.check_local(image.ptr(0))?;
        let state = self.state();
        let entry = state.allocator.image(image.alloc_id)?;
        let view = entry.view.clone().ok_or_else(|| {
            DeviceError::precondition(format!("image {} has no acquired view", image.alloc_id))
        })?;
        Ok(ImageTarget {
            view,
            format: entry.format,
            width: entry.width,
            height: entry.height,
        })
    }

    pub fn get_native_buffer(&self, alloc: DeviceAllocation) -> DeviceResult<wgpu::Buffer> {
        self.resolve_buffer(alloc.ptr(0)).map(|(buffer, _)| buffer)
    }

    pub fn get_native_image(&self, image: DeviceAllocation) -> DeviceResult<wgpu::TextureView> {
        self.image_target(image).map(|t| t.view)
    }

    /// Native buffer and byte offset for a vertex or index binding.
    pub(crate) fn buffer_slice(&self, ptr: DevicePtr) -> DeviceResult<(wgpu::Buffer, u64)> {
        let (buffer, total) = self.resolve_buffer(ptr)?;
        if ptr.offset >= total {
            return Err(DeviceError::precondition(format!(
                "offset {} outside allocation of {total} bytes",
                ptr.offset
            )));
        }
        Ok((buffer, ptr.offset))
    }

    // ── submission ────────────────────────────────────────────────────────

    pub(crate) fn acquire_command_buffer(&self) -> CommandBufferId {
        let mut state = self.state();
        let state = &mut *state;
        let next = &mut state.next_cmdbuffer;
        state.tracker.acquire_buffer(|| {
            let id = CommandBufferId(*next);
            *next += 1;
            id
        })
    }

    pub(crate) fn mark_submitted(&self, buffer: CommandBufferId, index: wgpu::SubmissionIndex) -> DeviceResult<()> {
        self.state().tracker.mark_submitted(buffer, index)
    }

    /// Takes back a dropped command list's buffer and sets.
    pub(crate) fn release_command_list(&self, buffer: CommandBufferId, sets: Vec<DescriptorSetHandle>) {
        let mut state = self.state();
        let state = &mut *state;
        for set in state.tracker.release(buffer, sets) {
            state.descriptors.recycle_set(set);
        }
    }

    pub(crate) fn wait_idle(&self) -> DeviceResult<()> {
        allocator::wait_for(&self.device, None)
    }

    pub fn submission_stats(&self) -> SubmissionStats {
        self.state().tracker.stats()
    }

    // ── kernels ───────────────────────────────────────────────────────────

    pub fn register_kernel(&self, kernel_id: u32, launch: KernelLaunch) -> DeviceResult<()> {
        self.state().kernels.insert(kernel_id, launch)?;
        log::debug!("registered kernel {kernel_id}");
        Ok(())
    }

    pub fn kernel_count(&self) -> usize {
        self.state().kernels.len()
    }

    fn check_stream(&self, stream_id: u32) -> DeviceResult<()> {
        if stream_id >= self.num_streams() {
            return Err(DeviceError::precondition(format!(
                "stream {stream_id} out of range, device has {}",
                self.num_streams()
            )));
        }
        Ok(())
    }
}

fn device_type(ty: wgpu::DeviceType) -> DeviceType {
    match ty {
        wgpu::DeviceType::IntegratedGpu => DeviceType::GpuUma,
        wgpu::DeviceType::Cpu => DeviceType::Host,
        wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other => DeviceType::Gpu,
    }
}

impl Device for WgpuDevice {
    fn id_slot(&self) -> &DeviceIdSlot {
        &self.id
    }

    fn query_type(&self) -> DeviceType {
        device_type(self.info.device_type)
    }

    fn query_capabilities(&self) -> DeviceCaps {
        DeviceCaps::COMPUTE | DeviceCaps::GRAPHICS | DeviceCaps::DISPLAY
    }

    /// wgpu does not report heap sizes; the largest buffer it accepts is the bound.
    fn query_available_memory(&self, _ty: MemoryType) -> u64 {
        self.device.limits().max_buffer_size
    }

    fn allocate_memory(&self, params: AllocParams) -> DeviceResult<DeviceAllocation> {
        let id = self.registered_id()?;
        let max = self.device.limits().max_buffer_size;
        if params.size > max {
            return Err(DeviceError::resource_limit(format!(
                "allocation of {} bytes exceeds max buffer size {max}",
                params.size
            )));
        }

        let buffer = allocator::create_buffer(&self.device, &params);
        let alloc_id = self.state().allocator.insert_buffer(AllocationInternal {
            buffer,
            size: params.size,
            params,
            mapping: None,
        });
        log::trace!("allocated {} bytes as {:?} ({alloc_id})", params.size, params.memory_type());
        Ok(DeviceAllocation::new(id, alloc_id))
    }

    fn deallocate_memory(&self, alloc: DeviceAllocation) -> DeviceResult<()> {
        self.check_local(alloc.ptr(0))?;
        match self.state().allocator.remove_buffer(alloc.alloc_id) {
            Some(_) => Ok(()),
            None => Err(DeviceError::precondition(format!(
                "unknown buffer allocation {}",
                alloc.alloc_id
            ))),
        }
    }

    /// Work on one queue is ordered; wgpu inserts the native barriers itself.
    fn barrier(&self, _range: DeviceRange) -> DeviceResult<()> {
        Ok(())
    }

    fn sync_read(&self, range: DeviceRange, other: &dyn Device) -> DeviceResult<()> {
        if other.id() == self.id() {
            return Ok(());
        }
        other.sync_write(range, self)
    }

    fn sync_write(&self, _range: DeviceRange, _other: &dyn Device) -> DeviceResult<()> {
        self.wait_idle()
    }

    fn map(&self, alloc: DeviceAllocation) -> DeviceResult<MappedRegion> {
        self.map_range(alloc.ptr(0), WHOLE_SIZE)
    }

    fn map_range(&self, ptr: DevicePtr, size: u64) -> DeviceResult<MappedRegion> {
        let (buffer, len) = self.checked_range(ptr, size)?;
        {
            let state = self.state();
            let alloc = state.allocator.buffer(ptr.address_space)?;
            if !alloc.params.is_host_visible() {
                return Err(DeviceError::precondition(format!(
                    "allocation {} is device-local and cannot be mapped",
                    ptr.address_space
                )));
            }
            if alloc.mapping.is_some() {
                return Err(DeviceError::precondition(format!(
                    "allocation {} is already mapped",
                    ptr.address_space
                )));
            }
        }

        let mut shadow = allocator::read_buffer(&self.device, &self.queue, &buffer, ptr.offset, len)?.into_boxed_slice();
        let region_ptr = NonNull::from(&mut shadow[..]).cast::<u8>();

        let mut state = self.state();
        let alloc = state.allocator.buffer_mut(ptr.address_space)?;
        if alloc.mapping.is_some() {
            return Err(DeviceError::precondition(format!(
                "allocation {} is already mapped",
                ptr.address_space
            )));
        }
        alloc.mapping = Some(HostMapping {
            offset: ptr.offset,
            shadow,
        });

        // SAFETY: the shadow's heap block stays put until `unmap` takes it out of the table.
        Ok(unsafe { MappedRegion::new(region_ptr, len as usize) })
    }

    fn unmap(&self, alloc: DeviceAllocation) -> DeviceResult<()> {
        self.check_local(alloc.ptr(0))?;
        let (buffer, mapping, host_write) = {
            let mut state = self.state();
            let entry = state.allocator.buffer_mut(alloc.alloc_id)?;
            let mapping = entry.mapping.take().ok_or_else(|| {
                DeviceError::precondition(format!("allocation {} is not mapped", alloc.alloc_id))
            })?;
            (entry.buffer.clone(), mapping, entry.params.host_write)
        };

        if host_write {
            allocator::write_buffer(&self.device, &self.queue, &buffer, mapping.offset, &mapping.shadow)?;
        }
        Ok(())
    }

    fn read_range(&self, range: DeviceRange) -> DeviceResult<Vec<u8>> {
        let (buffer, len) = self.checked_range(range.ptr, range.length)?;
        allocator::read_buffer(&self.device, &self.queue, &buffer, range.ptr.offset, len)
    }

    fn write_range(&self, dst: DevicePtr, data: &[u8]) -> DeviceResult<()> {
        let (buffer, _) = self.checked_range(dst, data.len() as u64)?;
        allocator::write_buffer(&self.device, &self.queue, &buffer, dst.offset, data)
    }

    fn transfer(&self, dst: DevicePtr, src: DeviceRange, src_device: &dyn Device) -> DeviceResult<()> {
        self.check_local(dst)?;

        let aligned = |v: u64| v % wgpu::COPY_BUFFER_ALIGNMENT == 0;
        if src.device() == self.id() {
            let (src_buffer, len) = self.checked_range(src.ptr, src.length)?;
            let (dst_buffer, _) = self.checked_range(dst, len)?;
            if aligned(src.ptr.offset) && aligned(dst.offset) && aligned(len) {
                let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("strata transfer"),
                });
                encoder.copy_buffer_to_buffer(&src_buffer, src.ptr.offset, &dst_buffer, dst.offset, len);
                self.queue.submit(std::iter::once(encoder.finish()));
                return Ok(());
            }
        }

        let bytes = src_device.read_range(src)?;
        self.write_range(dst, &bytes)
    }

    fn sync_all(&self) -> DeviceResult<()> {
        self.wait_idle()
    }

    fn as_compute(&self) -> Option<&dyn ComputeDevice> {
        Some(self)
    }
}

impl ComputeDevice for WgpuDevice {
    fn launch_kernel_internal(&self, stream_id: u32, kernel_id: u32, mapping: &SNodeMapping) -> DeviceResult<()> {
        self.check_stream(stream_id)?;
        let kernel = self.state().kernels.get(kernel_id)?;
        let binder = kernel.binder(mapping)?;
        let [x, y, z] = kernel.workgroups;

        let mut list = self.new_command_list()?;
        list.bind_pipeline(&kernel.pipeline)?;
        list.bind_resources(&binder)?;
        list.dispatch(x, y, z);
        self.submit(list)?;

        log::trace!("launched kernel {kernel_id} with {x}x{y}x{z} workgroups");
        Ok(())
    }

    fn num_streams(&self) -> u32 {
        1
    }

    fn wait_for_stream_complete(&self, stream_id: u32) -> DeviceResult<()> {
        self.check_stream(stream_id)?;
        self.command_sync()
    }
}

impl GraphicsDevice for WgpuDevice {
    type Pipeline = WgpuPipeline;
    type CommandList<'a> = WgpuCommandList<'a>;

    fn create_pipeline(&self, source: &PipelineSource<'_>, name: &str) -> DeviceResult<WgpuPipeline> {
        WgpuPipeline::compute(self, source, name)
    }

    fn create_raster_pipeline(
        &self,
        sources: &[PipelineSource<'_>],
        render_target_formats: &[BufferFormat],
        vertex_inputs: &[VertexInputBinding],
        vertex_attrs: &[VertexInputAttribute],
        raster: &RasterParams,
        name: &str,
    ) -> DeviceResult<WgpuPipeline> {
        if let Some(bad) = render_target_formats.iter().find(|f| format::texture_format(**f).is_none()) {
            return Err(DeviceError::precondition(format!("{bad:?} cannot be a render target")));
        }
        WgpuPipeline::graphics(
            self,
            sources,
            render_target_formats.len(),
            vertex_inputs,
            vertex_attrs,
            raster,
            name,
        )
    }

    fn new_command_list(&self) -> DeviceResult<WgpuCommandList<'_>> {
        Ok(WgpuCommandList::new(self))
    }

    fn submit(&self, list: WgpuCommandList<'_>) -> DeviceResult<()> {
        list.submit(false)
    }

    fn submit_synced(&self, list: WgpuCommandList<'_>) -> DeviceResult<()> {
        list.submit(true)
    }

    fn command_sync(&self) -> DeviceResult<()> {
        let mut state = self.state();
        let state = &mut *state;
        let device = &self.device;
        let sets = state
            .tracker
            .sync_with(|index| allocator::wait_for(device, Some(index.clone())))?;
        for set in sets {
            state.descriptors.recycle_set(set);
        }
        Ok(())
    }
}

impl Drop for WgpuDevice {
    fn drop(&mut self) {
        if let Err(e) = self.command_sync() {
            log::error!("draining in-flight work on drop failed: {e}");
        }
        let state = self.state();
        log::debug!(
            "dropping wgpu device: {} buffers, {} images, {} set layouts",
            state.allocator.buffer_count(),
            state.allocator.image_count(),
            state.descriptors.layout_count()
        );
    }
}
