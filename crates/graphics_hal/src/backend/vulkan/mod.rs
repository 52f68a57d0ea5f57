//! Vulkan backend
//!
//! Explicit backend built on `ash`. Native objects are kept in a registry
//! keyed by [`NativeHandle`]; the HAL never sees raw Vulkan handles except
//! for shader programs, which the application supplies as raw
//! `vk::Pipeline` / `vk::PipelineLayout` values inside
//! [`crate::shader::ShaderComposition`].
//!
//! ## Pipeline contract
//!
//! Application pipelines must be created for dynamic rendering and declare
//! these dynamic states: viewport, scissor, primitive topology, cull mode,
//! front face, depth test/write/compare, stencil test, stencil reference,
//! depth bias, blend constants and vertex-input binding stride. Fill mode,
//! blend equations and vertex attribute formats stay baked into the
//! pipeline.
//!
//! Resources are bound with push descriptors. Pipeline layouts declare one
//! push-descriptor set at index 0 whose binding numbers are the HAL slot
//! index plus a per-class base: constant buffers from 0, shader resources
//! from 16, samplers from 144 and unordered-access views from 160.
//!
//! ## Synchronization
//!
//! Every image lives in `GENERAL` layout. Transfers, mip generation and
//! dispatches are followed by a full memory barrier. Maps other than
//! write-no-overwrite wait for the device to go idle first, so CPU reads only
//! observe work that was already submitted.

mod commands;
mod context;
mod instance;
mod memory;
mod sync;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ash::extensions::khr::PushDescriptor;
use ash::{vk, Device};

use self::commands::CommandPool;
use self::context::VulkanContext;
use self::instance::{create_logical_device, PhysicalDeviceInfo, VulkanInstance};
use self::memory::{
    buffer_usage, image_usage, is_host_accessible, sampler_info, BufferAllocation, ImageAllocation, TextureInfo,
};
use self::sync::{initial_layout_barrier, Fence};
use super::{
    CommandListLevel, ContextKind, NativeContext, NativeDevice, NativeHandle, NativeObject, NativeResource,
};
use crate::config::HalConfig;
use crate::device::DeviceCapabilities;
use crate::foundation::sync::lock;
use crate::resource::{ResourceDesc, ResourceFlags, ResourceKind};
use crate::shader::{InputElement, SamplerDesc, StateDesc};
use crate::{HalError, HalResult};

/// Native object behind a registry handle
pub(crate) enum VkObject {
    /// Buffer, also used as its own shader and unordered-access view
    Buffer(BufferAllocation),
    /// Device-local texture
    Image(ImageAllocation),
    /// Texture with CPU access, stored packed in a host-visible buffer
    HostTexture {
        /// Packed storage
        allocation: BufferAllocation,
        /// Shape
        info: TextureInfo,
    },
    /// Image view with the extent of its first mip
    View {
        /// View handle
        view: vk::ImageView,
        /// Extent of mip 0
        extent: vk::Extent2D,
    },
    /// Sampler
    Sampler(vk::Sampler),
    /// Dynamic-state description
    State(StateDesc),
    /// Vertex input description; attribute formats are baked into pipelines
    InputLayout(Vec<InputElement>),
}

impl VkObject {
    fn destroy(self, device: &Device) {
        match self {
            Self::Buffer(allocation) | Self::HostTexture { allocation, .. } => allocation.destroy(device),
            Self::Image(allocation) => allocation.destroy(device),
            Self::View { view, .. } => unsafe { device.destroy_image_view(view, None) },
            Self::Sampler(sampler) => unsafe { device.destroy_sampler(sampler, None) },
            Self::State(_) | Self::InputLayout(_) => {}
        }
    }
}

/// Command buffer behind a command-list handle
pub(crate) struct ListEntry {
    /// Command buffer
    pub buffer: vk::CommandBuffer,
    /// Primary or secondary
    pub level: CommandListLevel,
    /// Completion fence of primary lists
    pub fence: Option<Fence>,
    /// Primary list a secondary list was last executed in
    pub parent: Option<NativeHandle>,
    /// Staging buffers read by the recorded commands
    pub transient: Vec<BufferAllocation>,
}

/// State shared by the device and every context
pub(crate) struct Shared {
    pub device: Device,
    queue: Mutex<vk::Queue>,
    pub physical: PhysicalDeviceInfo,
    pub push_descriptor: PushDescriptor,
    upload: Mutex<Option<CommandPool>>,
    objects: Mutex<HashMap<NativeHandle, VkObject>>,
    lists: Mutex<HashMap<NativeHandle, ListEntry>>,
    next_handle: AtomicU64,
    // Dropped after the device is destroyed in `Drop`.
    pub instance: VulkanInstance,
}

impl Shared {
    pub fn handle(&self) -> NativeHandle {
        NativeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn register(&self, object: VkObject) -> NativeHandle {
        let handle = self.handle();
        lock(&self.objects).insert(handle, object);
        handle
    }

    pub fn objects(&self) -> MutexGuard<'_, HashMap<NativeHandle, VkObject>> {
        lock(&self.objects)
    }

    pub fn lists(&self) -> MutexGuard<'_, HashMap<NativeHandle, ListEntry>> {
        lock(&self.lists)
    }

    pub fn queue(&self) -> MutexGuard<'_, vk::Queue> {
        lock(&self.queue)
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.physical.memory_properties
    }

    fn destroy(&self, handle: NativeHandle) {
        if handle.is_null() {
            return;
        }
        match lock(&self.objects).remove(&handle) {
            Some(object) => object.destroy(&self.device),
            None => log::debug!("Vulkan release of unknown handle {handle}"),
        }
    }

    /// Free a command list and its staging buffers
    pub fn destroy_list(&self, handle: NativeHandle, pool: &CommandPool) {
        if let Some(entry) = lock(&self.lists).remove(&handle) {
            for staging in &entry.transient {
                staging.destroy(&self.device);
            }
            pool.free(entry.buffer);
        }
    }

    /// Record and run a one-shot command buffer on the upload pool
    fn run_once<F>(&self, record: F) -> HalResult<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer) -> HalResult<()>,
    {
        let upload = lock(&self.upload);
        let pool = upload
            .as_ref()
            .ok_or_else(|| HalError::invalid("device is shutting down"))?;
        let queue = self.queue();
        pool.run_once(*queue, record)
    }

    /// Create a view and register it
    fn register_view(&self, allocation: &ImageAllocation) -> HalResult<NativeHandle> {
        let view = allocation.create_view(&self.device)?;
        let extent = allocation.info.mip_extent(0);
        Ok(self.register(VkObject::View {
            view,
            extent: vk::Extent2D { width: extent.width, height: extent.height },
        }))
    }

    fn create_buffer(&self, desc: &ResourceDesc, initial_data: Option<&[u8]>) -> HalResult<NativeResource> {
        let host_visible = is_host_accessible(desc);
        let allocation = BufferAllocation::new(
            &self.device,
            self.memory_properties(),
            desc.size_in_bytes,
            buffer_usage(desc),
            host_visible,
        )?;

        if let Some(data) = initial_data {
            let data = &data[..data.len().min(desc.size_in_bytes as usize)];
            let uploaded = if host_visible {
                allocation.write(&self.device, 0, data)
            } else {
                self.upload_to_buffer(allocation.buffer, data)
            };
            if let Err(err) = uploaded {
                allocation.destroy(&self.device);
                return Err(err);
            }
        }

        let handle = self.register(VkObject::Buffer(allocation));
        let view = |wanted: bool| if wanted { handle } else { NativeHandle::NULL };
        Ok(NativeResource {
            handle,
            shader_view: view(desc.flags.contains(ResourceFlags::GPU_READ)),
            unordered_view: view(desc.flags.contains(ResourceFlags::UNORDERED_ACCESS)),
            size_in_bytes: allocation.size,
            ..NativeResource::default()
        })
    }

    fn upload_to_buffer(&self, buffer: vk::Buffer, data: &[u8]) -> HalResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let staging = BufferAllocation::staging(&self.device, self.memory_properties(), data)?;
        let result = self.run_once(|device, command_buffer| {
            let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size: data.len() as vk::DeviceSize };
            unsafe { device.cmd_copy_buffer(command_buffer, staging.buffer, buffer, &[region]) };
            Ok(())
        });
        staging.destroy(&self.device);
        result
    }

    fn create_host_texture(&self, desc: &ResourceDesc, initial_data: Option<&[u8]>) -> HalResult<NativeResource> {
        if matches!(desc.kind, ResourceKind::Surface | ResourceKind::DepthSurface) {
            return Err(HalError::Unsupported(format!(
                "{:?} with CPU access cannot be rendered to; render to a GPU surface and copy to staging",
                desc.kind
            )));
        }
        let info = TextureInfo::from_desc(desc)?;
        let usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        let allocation = BufferAllocation::new(&self.device, self.memory_properties(), info.packed_size(), usage, true)?;

        if let Some(data) = initial_data {
            let data = &data[..data.len().min(info.packed_size() as usize)];
            if let Err(err) = allocation.write(&self.device, 0, data) {
                allocation.destroy(&self.device);
                return Err(err);
            }
        }

        let handle = self.register(VkObject::HostTexture { allocation, info });
        Ok(NativeResource { handle, size_in_bytes: allocation.size, ..NativeResource::default() })
    }

    fn create_image(&self, desc: &ResourceDesc, initial_data: Option<&[u8]>) -> HalResult<NativeResource> {
        let info = TextureInfo::from_desc(desc)?;
        let allocation = ImageAllocation::new(&self.device, self.memory_properties(), info, image_usage(desc))?;

        let staging = match initial_data {
            Some(data) if !data.is_empty() => {
                let data = &data[..data.len().min(info.packed_size() as usize)];
                match BufferAllocation::staging(&self.device, self.memory_properties(), data) {
                    Ok(staging) => Some((staging, data.len() as u64)),
                    Err(err) => {
                        allocation.destroy(&self.device);
                        return Err(err);
                    }
                }
            }
            _ => None,
        };

        let result = self.run_once(|device, command_buffer| {
            initial_layout_barrier(device, command_buffer, allocation.image, info.aspect);
            if let Some((staging, len)) = &staging {
                let regions = packed_copy_regions(&info, *len)?;
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        command_buffer,
                        staging.buffer,
                        allocation.image,
                        vk::ImageLayout::GENERAL,
                        &regions,
                    );
                }
            }
            Ok(())
        });
        if let Some((staging, _)) = staging {
            staging.destroy(&self.device);
        }
        if let Err(err) = result {
            allocation.destroy(&self.device);
            return Err(err);
        }

        let size_in_bytes = info.packed_size();
        let mut resource = NativeResource { size_in_bytes, ..NativeResource::default() };
        let views = self.create_image_views(desc, &allocation, &mut resource);
        resource.handle = self.register(VkObject::Image(allocation));
        if let Err(err) = views {
            self.release_resource(resource);
            return Err(err);
        }
        Ok(resource)
    }

    fn create_image_views(
        &self,
        desc: &ResourceDesc,
        allocation: &ImageAllocation,
        resource: &mut NativeResource,
    ) -> HalResult<()> {
        if desc.flags.contains(ResourceFlags::GPU_READ) {
            resource.shader_view = self.register_view(allocation)?;
        }
        if desc.flags.contains(ResourceFlags::UNORDERED_ACCESS) {
            resource.unordered_view = self.register_view(allocation)?;
        }
        match desc.kind {
            ResourceKind::Surface => resource.target_view = self.register_view(allocation)?,
            ResourceKind::DepthSurface => {
                resource.depth_view = self.register_view(allocation)?;
                resource.read_only_depth_view = self.register_view(allocation)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn release_resource(&self, resource: NativeResource) {
        let mut handles = vec![
            resource.shader_view,
            resource.unordered_view,
            resource.target_view,
            resource.depth_view,
            resource.read_only_depth_view,
        ];
        handles.retain(|view| *view != resource.handle);
        handles.push(resource.handle);
        handles.sort_unstable();
        handles.dedup();
        for handle in handles {
            self.destroy(handle);
        }
    }
}

/// Copy regions moving a packed buffer prefix of `len` bytes into an image
pub(crate) fn packed_copy_regions(info: &TextureInfo, len: u64) -> HalResult<Vec<vk::BufferImageCopy>> {
    let mut regions = Vec::new();
    for subresource in 0..info.mip_levels * info.array_layers {
        let (offset, size) = info.packed_range(subresource)?;
        if offset + size > len {
            break;
        }
        let (mip, _) = info.split(subresource);
        regions.push(vk::BufferImageCopy {
            buffer_offset: offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: info.layers(subresource),
            image_offset: vk::Offset3D::default(),
            image_extent: info.mip_extent(mip),
        });
    }
    Ok(regions)
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        for (_, entry) in lock(&self.lists).drain() {
            for staging in &entry.transient {
                staging.destroy(&self.device);
            }
        }
        drop(lock(&self.upload).take());
        for (_, object) in lock(&self.objects).drain() {
            object.destroy(&self.device);
        }
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

/// Vulkan native device
///
/// Renders off-screen on the first Vulkan 1.3 GPU with a combined graphics
/// and compute queue, preferring discrete adapters.
pub struct VulkanDevice {
    shared: Arc<Shared>,
    capabilities: DeviceCapabilities,
}

impl VulkanDevice {
    /// Create the instance, pick a GPU and create the logical device
    pub fn new(config: &HalConfig) -> HalResult<Self> {
        let instance = VulkanInstance::new(&config.application_name, config.enable_debug_layer)?;
        let physical = PhysicalDeviceInfo::select(&instance.instance)?;
        let (device, queue) = create_logical_device(&instance.instance, &physical)?;
        let push_descriptor = PushDescriptor::new(&instance.instance, &device);

        let upload = match CommandPool::new(device.clone(), physical.queue_family) {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };

        let capabilities = capabilities_from_limits(&physical.properties.limits);
        log::info!(
            "Vulkan device ready: {} (queue family {})",
            physical.name(),
            physical.queue_family
        );

        Ok(Self {
            shared: Arc::new(Shared {
                device,
                queue: Mutex::new(queue),
                physical,
                push_descriptor,
                upload: Mutex::new(Some(upload)),
                objects: Mutex::default(),
                lists: Mutex::default(),
                next_handle: AtomicU64::new(0),
                instance,
            }),
            capabilities,
        })
    }
}

fn capabilities_from_limits(limits: &vk::PhysicalDeviceLimits) -> DeviceCapabilities {
    DeviceCapabilities {
        max_render_targets: limits.max_color_attachments,
        max_vertex_buffer_slots: limits.max_vertex_input_bindings.min(32),
        max_constant_buffer_slots: limits.max_per_stage_descriptor_uniform_buffers.min(14),
        max_shader_resource_slots: limits.max_per_stage_descriptor_sampled_images.min(128),
        max_sampler_slots: limits.max_per_stage_descriptor_samplers.min(16),
        max_unordered_access_slots: limits.max_per_stage_descriptor_storage_images.min(8),
        max_compute_groups: limits.max_compute_work_group_count,
        max_texture_dimension: limits.max_image_dimension2_d,
    }
}

impl NativeDevice for VulkanDevice {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    fn create_resource(&self, desc: &ResourceDesc, initial_data: Option<&[u8]>) -> HalResult<NativeResource> {
        if desc.kind.is_buffer() {
            self.shared.create_buffer(desc, initial_data)
        } else if is_host_accessible(desc) {
            self.shared.create_host_texture(desc, initial_data)
        } else {
            self.shared.create_image(desc, initial_data)
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> HalResult<NativeHandle> {
        let anisotropy = self.shared.physical.features.sampler_anisotropy == vk::TRUE;
        let create_info = sampler_info(desc, anisotropy);
        let sampler = unsafe {
            self.shared
                .device
                .create_sampler(&create_info, None)
                .map_err(HalError::Vulkan)?
        };
        Ok(self.shared.register(VkObject::Sampler(sampler)))
    }

    fn create_state(&self, desc: &StateDesc) -> HalResult<NativeHandle> {
        Ok(self.shared.register(VkObject::State(desc.clone())))
    }

    fn create_input_layout(&self, vertex_shader: NativeHandle, elements: &[InputElement]) -> HalResult<NativeHandle> {
        if vertex_shader.is_null() {
            return Err(HalError::Creation("input layout needs a vertex shader".into()));
        }
        Ok(self.shared.register(VkObject::InputLayout(elements.to_vec())))
    }

    fn release(&self, object: NativeObject) {
        match object {
            NativeObject::Resource(resource) => self.shared.release_resource(resource),
            NativeObject::Object(handle) => self.shared.destroy(handle),
        }
    }

    fn create_context(&self, kind: ContextKind) -> HalResult<Box<dyn NativeContext>> {
        Ok(Box::new(VulkanContext::new(Arc::clone(&self.shared), kind)?))
    }

    fn wait_idle(&self) -> HalResult<()> {
        unsafe { self.shared.device.device_wait_idle().map_err(HalError::Vulkan) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_clamp_to_slot_limits() {
        let limits = vk::PhysicalDeviceLimits {
            max_color_attachments: 8,
            max_vertex_input_bindings: 64,
            max_per_stage_descriptor_uniform_buffers: 200_000,
            max_per_stage_descriptor_sampled_images: 200_000,
            max_per_stage_descriptor_samplers: 4_000,
            max_per_stage_descriptor_storage_images: 4,
            max_compute_work_group_count: [65535, 65535, 65535],
            max_image_dimension2_d: 16384,
            ..vk::PhysicalDeviceLimits::default()
        };
        let caps = capabilities_from_limits(&limits);
        assert_eq!(caps.max_vertex_buffer_slots, 32);
        assert_eq!(caps.max_constant_buffer_slots, 14);
        assert_eq!(caps.max_unordered_access_slots, 4);
        assert!(caps.validate().is_ok());
    }

    #[test]
    fn test_packed_copy_regions_stop_at_data_end() {
        let info = TextureInfo {
            format: vk::Format::R8_UNORM,
            aspect: vk::ImageAspectFlags::COLOR,
            width: 4,
            height: 4,
            mip_levels: 3,
            array_layers: 1,
            texel_size: 1,
        };
        // 16 + 4 bytes cover mips 0 and 1 only
        let regions = packed_copy_regions(&info, 20).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].buffer_offset, 16);
        assert_eq!(regions[1].image_extent.width, 2);
    }
}
