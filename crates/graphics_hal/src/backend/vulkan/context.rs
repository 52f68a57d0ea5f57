//! Vulkan command context
//!
//! Immediate contexts record primary command buffers that `submit` hands to
//! the device queue; deferred contexts record secondary buffers that a
//! primary context executes. Draws open a dynamic-rendering instance over
//! the bound targets on demand; copies, dispatches and `execute` close it.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;

use ash::vk::{self, Handle};
use ash::Device;

use super::commands::CommandPool;
use super::memory::{compare_op, BufferAllocation, TextureInfo};
use super::sync::{full_barrier, Fence, Semaphore};
use super::{packed_copy_regions, ListEntry, Shared, VkObject};
use crate::backend::{
    CommandListFlags, CommandListLevel, ContextKind, DebugMessage, IndexFormat, MappedRegion, NativeCommandList,
    NativeContext, NativeHandle, NativeMapMode, NativeResource, Rect, ResourceRegion, VertexBufferBinding, Viewport,
};
use crate::shader::{
    CullMode, DepthStencilDesc, FillMode, PrimitiveTopology, RasterizerDesc, ShaderStageKind, StateDesc,
};
use crate::{HalError, HalResult};

/// Only one push-descriptor set is allowed per pipeline layout.
const PUSH_SET: u32 = 0;

/// First binding number of each class inside the push set
const CONSTANT_BUFFER_BASE: u32 = 0;
const SHADER_RESOURCE_BASE: u32 = 16;
const SAMPLER_BASE: u32 = 144;
const UNORDERED_ACCESS_BASE: u32 = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescriptorClass {
    ConstantBuffer,
    ShaderResource,
    Sampler,
    UnorderedAccess,
}

impl DescriptorClass {
    const fn base(self) -> u32 {
        match self {
            Self::ConstantBuffer => CONSTANT_BUFFER_BASE,
            Self::ShaderResource => SHADER_RESOURCE_BASE,
            Self::Sampler => SAMPLER_BASE,
            Self::UnorderedAccess => UNORDERED_ACCESS_BASE,
        }
    }
}

enum Descriptor {
    Buffer(vk::DescriptorType, vk::DescriptorBufferInfo),
    Image(vk::DescriptorType, vk::DescriptorImageInfo),
}

/// Where a resource's bytes live, resolved from the registry
#[derive(Debug, Clone, Copy)]
enum Location {
    Buffer { buffer: vk::Buffer, size: u64 },
    Image { image: vk::Image, info: TextureInfo },
    Packed { buffer: vk::Buffer, info: TextureInfo },
}

/// State of the command buffer being recorded
struct Recording {
    list: NativeHandle,
    buffer: vk::CommandBuffer,
    level: CommandListLevel,
    graphics_pipeline: vk::Pipeline,
    graphics_layout: vk::PipelineLayout,
    compute_layout: vk::PipelineLayout,
    targets: Vec<NativeHandle>,
    depth: NativeHandle,
    rendering: bool,
    event_depth: u32,
    transient: Vec<BufferAllocation>,
}

impl Recording {
    fn new(list: NativeHandle, buffer: vk::CommandBuffer, level: CommandListLevel) -> Self {
        Self {
            list,
            buffer,
            level,
            graphics_pipeline: vk::Pipeline::null(),
            graphics_layout: vk::PipelineLayout::null(),
            compute_layout: vk::PipelineLayout::null(),
            targets: Vec::new(),
            depth: NativeHandle::NULL,
            rendering: false,
            event_depth: 0,
            transient: Vec::new(),
        }
    }

    fn end_rendering(&mut self, device: &Device) {
        if self.rendering {
            unsafe { device.cmd_end_rendering(self.buffer) };
            self.rendering = false;
        }
    }

    /// Open a rendering instance over the bound targets
    fn begin_rendering(&mut self, shared: &Shared) {
        if self.rendering {
            return;
        }

        let (colors, depth, extent) = {
            let objects = shared.objects();
            let view_of = |handle: NativeHandle| match objects.get(&handle) {
                Some(VkObject::View { view, extent }) => Some((*view, *extent)),
                _ => None,
            };

            let mut extent = None;
            let colors: Vec<vk::RenderingAttachmentInfo> = self
                .targets
                .iter()
                .map(|&handle| {
                    let view = view_of(handle).map_or(vk::ImageView::null(), |(view, view_extent)| {
                        extent = extent.or(Some(view_extent));
                        view
                    });
                    attachment(view)
                })
                .collect();
            let depth = view_of(self.depth).map(|(view, view_extent)| {
                extent = extent.or(Some(view_extent));
                attachment(view)
            });
            (colors, depth, extent.unwrap_or_default())
        };

        if extent.width == 0 {
            log::warn!("Vulkan draw issued without render targets");
        }

        let mut info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent })
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            info = info.depth_attachment(depth);
        }

        unsafe { shared.device.cmd_begin_rendering(self.buffer, &info) };
        self.rendering = true;
    }
}

fn attachment(view: vk::ImageView) -> vk::RenderingAttachmentInfo {
    vk::RenderingAttachmentInfo::builder()
        .image_view(view)
        .image_layout(vk::ImageLayout::GENERAL)
        .load_op(vk::AttachmentLoadOp::LOAD)
        .store_op(vk::AttachmentStoreOp::STORE)
        .build()
}

/// Host-visible memory mapped for the lifetime of the region
struct VulkanRegion {
    device: Device,
    memory: vk::DeviceMemory,
    ptr: *mut u8,
    len: usize,
}

// The mapping stays valid until `drop`, and the single-map guard on the
// resource keeps a second region from aliasing it.
unsafe impl Send for VulkanRegion {}

impl MappedRegion for VulkanRegion {
    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for VulkanRegion {
    fn drop(&mut self) {
        unsafe { self.device.unmap_memory(self.memory) };
    }
}

/// Primary or secondary Vulkan context
pub(crate) struct VulkanContext {
    kind: ContextKind,
    pool: CommandPool,
    owned: Vec<NativeHandle>,
    current: Option<Recording>,
    // Submission chain, immediate contexts only
    semaphores: Option<[Semaphore; 2]>,
    submits: u64,
    // Dropped last so the device outlives the pool and semaphores.
    shared: Arc<Shared>,
}

impl VulkanContext {
    pub fn new(shared: Arc<Shared>, kind: ContextKind) -> HalResult<Self> {
        let pool = CommandPool::new(shared.device.clone(), shared.physical.queue_family)?;
        let semaphores = match kind {
            ContextKind::Immediate => Some([
                Semaphore::new(shared.device.clone())?,
                Semaphore::new(shared.device.clone())?,
            ]),
            ContextKind::Deferred => None,
        };
        Ok(Self {
            shared,
            kind,
            pool,
            owned: Vec::new(),
            current: None,
            semaphores,
            submits: 0,
        })
    }

    const fn level(&self) -> CommandListLevel {
        match self.kind {
            ContextKind::Immediate => CommandListLevel::Primary,
            ContextKind::Deferred => CommandListLevel::Secondary,
        }
    }

    fn allocate_list(&mut self) -> HalResult<(NativeHandle, vk::CommandBuffer)> {
        let level = self.level();
        let buffer = self.pool.allocate(level)?;
        let fence = match level {
            CommandListLevel::Primary => match Fence::new(self.shared.device.clone(), true) {
                Ok(fence) => Some(fence),
                Err(err) => {
                    self.pool.free(buffer);
                    return Err(err);
                }
            },
            CommandListLevel::Secondary => None,
        };

        let handle = self.shared.handle();
        self.shared.lists().insert(
            handle,
            ListEntry { buffer, level, fence, parent: None, transient: Vec::new() },
        );
        self.owned.push(handle);
        log::debug!("Allocated {level:?} command list {handle}");
        Ok((handle, buffer))
    }

    fn reuse_list(&self, handle: NativeHandle) -> HalResult<vk::CommandBuffer> {
        let mut lists = self.shared.lists();
        let entry = lists
            .get_mut(&handle)
            .ok_or_else(|| HalError::invalid(format!("command list {handle} is unknown")))?;
        for staging in entry.transient.drain(..) {
            staging.destroy(&self.shared.device);
        }
        entry.parent = None;
        unsafe {
            self.shared
                .device
                .reset_command_buffer(entry.buffer, vk::CommandBufferResetFlags::empty())
                .map_err(HalError::Vulkan)?;
        }
        Ok(entry.buffer)
    }

    fn location(&self, resource: &NativeResource) -> HalResult<Location> {
        match self.shared.objects().get(&resource.handle) {
            Some(VkObject::Buffer(allocation)) => Ok(Location::Buffer { buffer: allocation.buffer, size: allocation.size }),
            Some(VkObject::Image(allocation)) => Ok(Location::Image { image: allocation.image, info: allocation.info }),
            Some(VkObject::HostTexture { allocation, info }) => {
                Ok(Location::Packed { buffer: allocation.buffer, info: *info })
            }
            _ => Err(HalError::invalid(format!("no Vulkan resource behind {}", resource.handle))),
        }
    }

    fn recording(&mut self) -> HalResult<&mut Recording> {
        self.current.as_mut().ok_or(HalError::NotRecording)
    }

    fn push_descriptors(&mut self, stage: ShaderStageKind, first_slot: u32, handles: &[NativeHandle], class: DescriptorClass) {
        let Some(rec) = self.current.as_mut() else {
            log::warn!("Vulkan {stage} descriptors bound outside a recording");
            return;
        };

        let descriptors: Vec<(u32, Descriptor)> = {
            let objects = self.shared.objects();
            handles
                .iter()
                .enumerate()
                .filter(|(_, handle)| !handle.is_null())
                .filter_map(|(i, handle)| {
                    resolve_descriptor(&objects, *handle, class).map(|d| (class.base() + first_slot + i as u32, d))
                })
                .collect()
        };
        if descriptors.is_empty() {
            return;
        }

        let (bind_point, layout) = if stage == ShaderStageKind::Compute {
            (vk::PipelineBindPoint::COMPUTE, rec.compute_layout)
        } else {
            (vk::PipelineBindPoint::GRAPHICS, rec.graphics_layout)
        };
        if layout == vk::PipelineLayout::null() {
            log::warn!("Vulkan {stage} descriptors pushed before a pipeline layout was bound");
            return;
        }

        let writes: Vec<vk::WriteDescriptorSet> = descriptors
            .iter()
            .map(|(binding, descriptor)| {
                let write = vk::WriteDescriptorSet::builder().dst_binding(*binding).dst_array_element(0);
                match descriptor {
                    Descriptor::Buffer(ty, info) => write.descriptor_type(*ty).buffer_info(std::slice::from_ref(info)).build(),
                    Descriptor::Image(ty, info) => write.descriptor_type(*ty).image_info(std::slice::from_ref(info)).build(),
                }
            })
            .collect();

        unsafe {
            self.shared
                .push_descriptor
                .cmd_push_descriptor_set(rec.buffer, bind_point, layout, PUSH_SET, &writes);
        }
    }

    fn state_desc(&self, state: NativeHandle) -> Option<StateDesc> {
        match self.shared.objects().get(&state) {
            Some(VkObject::State(desc)) => Some(desc.clone()),
            _ => None,
        }
    }
}

fn resolve_descriptor(objects: &HashMap<NativeHandle, VkObject>, handle: NativeHandle, class: DescriptorClass) -> Option<Descriptor> {
    let buffer_info = |buffer: vk::Buffer| vk::DescriptorBufferInfo { buffer, offset: 0, range: vk::WHOLE_SIZE };
    let image_info = |view: vk::ImageView| vk::DescriptorImageInfo {
        sampler: vk::Sampler::null(),
        image_view: view,
        image_layout: vk::ImageLayout::GENERAL,
    };

    match (class, objects.get(&handle)) {
        (DescriptorClass::ConstantBuffer, Some(VkObject::Buffer(allocation))) => {
            Some(Descriptor::Buffer(vk::DescriptorType::UNIFORM_BUFFER, buffer_info(allocation.buffer)))
        }
        (DescriptorClass::ShaderResource | DescriptorClass::UnorderedAccess, Some(VkObject::Buffer(allocation))) => {
            Some(Descriptor::Buffer(vk::DescriptorType::STORAGE_BUFFER, buffer_info(allocation.buffer)))
        }
        (DescriptorClass::ShaderResource, Some(VkObject::View { view, .. })) => {
            Some(Descriptor::Image(vk::DescriptorType::SAMPLED_IMAGE, image_info(*view)))
        }
        (DescriptorClass::UnorderedAccess, Some(VkObject::View { view, .. })) => {
            Some(Descriptor::Image(vk::DescriptorType::STORAGE_IMAGE, image_info(*view)))
        }
        (DescriptorClass::Sampler, Some(VkObject::Sampler(sampler))) => Some(Descriptor::Image(
            vk::DescriptorType::SAMPLER,
            vk::DescriptorImageInfo { sampler: *sampler, ..vk::DescriptorImageInfo::default() },
        )),
        _ => {
            log::warn!("Vulkan handle {handle} cannot be bound as {class:?}");
            None
        }
    }
}

/// Offset and extent of a region inside one subresource
fn region_box(info: &TextureInfo, subresource: u32, region: Option<ResourceRegion>) -> (vk::Offset3D, vk::Extent3D) {
    let (mip, _) = info.split(subresource);
    match region {
        None => (vk::Offset3D::default(), info.mip_extent(mip)),
        Some(region) => (
            vk::Offset3D { x: region.left as i32, y: region.top as i32, z: region.front as i32 },
            vk::Extent3D {
                width: region.width(),
                height: region.bottom.saturating_sub(region.top).max(1),
                depth: region.back.saturating_sub(region.front).max(1),
            },
        ),
    }
}

/// Byte offset of a texel inside the packed layout
fn packed_offset(info: &TextureInfo, subresource: u32, x: u32, y: u32) -> HalResult<u64> {
    let (base, _) = info.packed_range(subresource)?;
    let (mip, _) = info.split(subresource);
    Ok(base + u64::from(y) * info.row_pitch(mip) + u64::from(x) * u64::from(info.texel_size))
}

/// Row-by-row copies between two packed layouts
fn packed_row_copies(
    source: &TextureInfo,
    source_subresource: u32,
    origin: vk::Offset3D,
    extent: vk::Extent3D,
    destination: &TextureInfo,
    destination_subresource: u32,
    offset: [u32; 3],
) -> HalResult<Vec<vk::BufferCopy>> {
    let row_bytes = u64::from(extent.width) * u64::from(source.texel_size);
    (0..extent.height)
        .map(|row| {
            Ok(vk::BufferCopy {
                src_offset: packed_offset(source, source_subresource, origin.x as u32, origin.y as u32 + row)?,
                dst_offset: packed_offset(destination, destination_subresource, offset[0], offset[1] + row)?,
                size: row_bytes,
            })
        })
        .collect()
}

const fn vk_topology(topology: PrimitiveTopology) -> Option<vk::PrimitiveTopology> {
    Some(match topology {
        PrimitiveTopology::Undefined => return None,
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopology::PatchList(_) => vk::PrimitiveTopology::PATCH_LIST,
    })
}

impl NativeContext for VulkanContext {
    fn kind(&self) -> ContextKind {
        self.kind
    }

    fn begin(&mut self, flags: CommandListFlags, reuse: Option<NativeCommandList>) -> HalResult<()> {
        if self.current.is_some() {
            return Err(HalError::AlreadyRecording);
        }

        let reusable = reuse.filter(|list| self.owned.contains(&list.handle));
        let (list, buffer) = match reusable {
            Some(list) => (list.handle, self.reuse_list(list.handle)?),
            None => self.allocate_list()?,
        };

        let level = self.level();
        let usage = if flags.contains(CommandListFlags::SINGLE_SUBMIT) {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let inheritance = vk::CommandBufferInheritanceInfo::builder();
        let mut begin_info = vk::CommandBufferBeginInfo::builder().flags(usage);
        if level == CommandListLevel::Secondary {
            begin_info = begin_info.inheritance_info(&inheritance);
        }

        unsafe {
            self.shared
                .device
                .begin_command_buffer(buffer, &begin_info)
                .map_err(HalError::Vulkan)?;
        }

        self.current = Some(Recording::new(list, buffer, level));
        Ok(())
    }

    fn end(&mut self, flags: CommandListFlags) -> HalResult<NativeCommandList> {
        let mut rec = self.current.take().ok_or(HalError::NotRecording)?;
        let device = &self.shared.device;
        rec.end_rendering(device);
        if let Some(debug_utils) = &self.shared.instance.debug_utils {
            for _ in 0..rec.event_depth {
                unsafe { debug_utils.cmd_end_debug_utils_label(rec.buffer) };
            }
        }

        unsafe {
            device.end_command_buffer(rec.buffer).map_err(HalError::Vulkan)?;
        }

        if let Some(entry) = self.shared.lists().get_mut(&rec.list) {
            entry.transient.append(&mut rec.transient);
        }

        let syncable = flags.contains(CommandListFlags::CPU_SYNCABLE) && rec.level == CommandListLevel::Primary;
        Ok(NativeCommandList {
            handle: rec.list,
            // The fence is owned by the list, so its handle doubles as the fence handle.
            fence: if syncable { rec.list } else { NativeHandle::NULL },
            level: rec.level,
        })
    }

    fn submit(&mut self, list: &NativeCommandList, _flags: CommandListFlags) -> HalResult<()> {
        if list.level != CommandListLevel::Primary {
            return Err(HalError::NotPrimary);
        }

        let (buffer, fence) = {
            let lists = self.shared.lists();
            let entry = lists
                .get(&list.handle)
                .ok_or_else(|| HalError::invalid(format!("command list {} is unknown", list.handle)))?;
            if let Some(fence) = &entry.fence {
                fence.reset()?;
            }
            (entry.buffer, entry.fence.as_ref().map_or(vk::Fence::null(), Fence::handle))
        };

        let (wait, signal) = match &self.semaphores {
            Some(chain) => {
                let current = (self.submits % 2) as usize;
                let wait = (self.submits > 0).then(|| chain[1 - current].handle());
                (wait, Some(chain[current].handle()))
            }
            None => (None, None),
        };
        let wait_semaphores: Vec<vk::Semaphore> = wait.into_iter().collect();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let signal_semaphores: Vec<vk::Semaphore> = signal.into_iter().collect();

        let command_buffers = [buffer];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        unsafe {
            let queue = self.shared.queue();
            self.shared
                .device
                .queue_submit(*queue, &[submit], fence)
                .map_err(HalError::Vulkan)?;
        }
        self.submits += 1;
        log::trace!("Submitted command list {} (submission {})", list.handle, self.submits);
        Ok(())
    }

    fn execute(&mut self, list: &NativeCommandList) -> HalResult<()> {
        let Some(rec) = self.current.as_mut() else {
            return Err(HalError::NotRecording);
        };
        rec.end_rendering(&self.shared.device);

        let buffer = {
            let mut lists = self.shared.lists();
            let entry = lists
                .get_mut(&list.handle)
                .ok_or_else(|| HalError::invalid(format!("command list {} is unknown", list.handle)))?;
            if entry.level != CommandListLevel::Secondary {
                return Err(HalError::NotDeferred);
            }
            entry.parent = Some(rec.list);
            entry.buffer
        };

        unsafe { self.shared.device.cmd_execute_commands(rec.buffer, &[buffer]) };

        // Bound pipeline and dynamic state are undefined after a secondary buffer.
        rec.graphics_pipeline = vk::Pipeline::null();
        rec.graphics_layout = vk::PipelineLayout::null();
        rec.compute_layout = vk::PipelineLayout::null();
        Ok(())
    }

    fn is_complete(&self, list: &NativeCommandList) -> bool {
        let lists = self.shared.lists();
        let Some(entry) = lists.get(&list.handle) else {
            return true;
        };
        match (&entry.fence, entry.parent) {
            (Some(fence), _) => fence.is_signaled(),
            (None, Some(parent)) => lists
                .get(&parent)
                .and_then(|parent| parent.fence.as_ref())
                .map_or(true, Fence::is_signaled),
            (None, None) => true,
        }
    }

    fn free_list(&mut self, list: NativeCommandList) {
        if let Some(index) = self.owned.iter().position(|handle| *handle == list.handle) {
            self.owned.swap_remove(index);
            self.shared.destroy_list(list.handle, &self.pool);
        }
    }

    fn set_shader(&mut self, stage: ShaderStageKind, program: NativeHandle, layout: NativeHandle) {
        let Some(rec) = self.current.as_mut() else {
            return;
        };
        let pipeline = vk::Pipeline::from_raw(program.0);
        let layout = vk::PipelineLayout::from_raw(layout.0);

        if stage == ShaderStageKind::Compute {
            if layout != vk::PipelineLayout::null() {
                rec.compute_layout = layout;
            }
            if pipeline != vk::Pipeline::null() {
                unsafe {
                    self.shared
                        .device
                        .cmd_bind_pipeline(rec.buffer, vk::PipelineBindPoint::COMPUTE, pipeline);
                }
            }
            return;
        }

        if layout != vk::PipelineLayout::null() {
            rec.graphics_layout = layout;
        }
        // Render stages share one pipeline object.
        if pipeline != vk::Pipeline::null() && pipeline != rec.graphics_pipeline {
            unsafe {
                self.shared
                    .device
                    .cmd_bind_pipeline(rec.buffer, vk::PipelineBindPoint::GRAPHICS, pipeline);
            }
            rec.graphics_pipeline = pipeline;
        }
    }

    fn set_constant_buffers(&mut self, stage: ShaderStageKind, first_slot: u32, buffers: &[NativeHandle]) {
        self.push_descriptors(stage, first_slot, buffers, DescriptorClass::ConstantBuffer);
    }

    fn set_shader_resources(&mut self, stage: ShaderStageKind, first_slot: u32, views: &[NativeHandle]) {
        self.push_descriptors(stage, first_slot, views, DescriptorClass::ShaderResource);
    }

    fn set_samplers(&mut self, stage: ShaderStageKind, first_slot: u32, samplers: &[NativeHandle]) {
        self.push_descriptors(stage, first_slot, samplers, DescriptorClass::Sampler);
    }

    fn set_unordered_access_views(&mut self, stage: ShaderStageKind, first_slot: u32, views: &[NativeHandle]) {
        self.push_descriptors(stage, first_slot, views, DescriptorClass::UnorderedAccess);
    }

    fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[VertexBufferBinding]) {
        let Some(rec) = self.current.as_ref() else {
            return;
        };

        let resolved: Vec<Option<(vk::Buffer, u64, u64)>> = {
            let objects = self.shared.objects();
            buffers
                .iter()
                .map(|binding| match objects.get(&binding.buffer) {
                    Some(VkObject::Buffer(allocation)) => {
                        Some((allocation.buffer, u64::from(binding.offset), u64::from(binding.stride)))
                    }
                    _ => None,
                })
                .collect()
        };

        // Null slots cannot be bound, so bind each contiguous run separately.
        let mut start = 0;
        while start < resolved.len() {
            if resolved[start].is_none() {
                start += 1;
                continue;
            }
            let run: Vec<(vk::Buffer, u64, u64)> = resolved[start..].iter().map_while(|slot| *slot).collect();
            let handles: Vec<vk::Buffer> = run.iter().map(|(buffer, _, _)| *buffer).collect();
            let offsets: Vec<vk::DeviceSize> = run.iter().map(|(_, offset, _)| *offset).collect();
            let strides: Vec<vk::DeviceSize> = run.iter().map(|(_, _, stride)| *stride).collect();
            unsafe {
                self.shared.device.cmd_bind_vertex_buffers2(
                    rec.buffer,
                    first_slot + start as u32,
                    &handles,
                    &offsets,
                    None,
                    Some(&strides),
                );
            }
            start += run.len();
        }
    }

    fn set_index_buffer(&mut self, buffer: NativeHandle, format: IndexFormat, offset: u32) {
        let Some(rec) = self.current.as_ref() else {
            return;
        };
        let vk_buffer = match self.shared.objects().get(&buffer) {
            Some(VkObject::Buffer(allocation)) => allocation.buffer,
            _ => return,
        };
        let index_type = match format {
            IndexFormat::U16 => vk::IndexType::UINT16,
            IndexFormat::U32 => vk::IndexType::UINT32,
        };
        unsafe {
            self.shared
                .device
                .cmd_bind_index_buffer(rec.buffer, vk_buffer, u64::from(offset), index_type);
        }
    }

    fn set_input_layout(&mut self, layout: NativeHandle) {
        log::trace!("Vulkan input layout {layout} is baked into the bound pipeline");
    }

    fn set_topology(&mut self, topology: PrimitiveTopology) {
        let Some(rec) = self.current.as_ref() else {
            return;
        };
        if let Some(topology) = vk_topology(topology) {
            unsafe { self.shared.device.cmd_set_primitive_topology(rec.buffer, topology) };
        }
    }

    fn set_blend_state(&mut self, _state: NativeHandle, blend_factor: [f32; 4], _sample_mask: u32) {
        let Some(rec) = self.current.as_ref() else {
            return;
        };
        unsafe { self.shared.device.cmd_set_blend_constants(rec.buffer, &blend_factor) };
    }

    fn set_depth_stencil_state(&mut self, state: NativeHandle, stencil_ref: u32) {
        let desc = match self.state_desc(state) {
            Some(StateDesc::DepthStencil(desc)) => desc,
            _ => DepthStencilDesc::default(),
        };
        let Some(rec) = self.current.as_ref() else {
            return;
        };
        let device = &self.shared.device;
        unsafe {
            device.cmd_set_depth_test_enable(rec.buffer, desc.depth_enabled);
            device.cmd_set_depth_write_enable(rec.buffer, desc.depth_write);
            device.cmd_set_depth_compare_op(rec.buffer, compare_op(desc.comparison));
            device.cmd_set_stencil_test_enable(rec.buffer, desc.stencil_enabled);
            device.cmd_set_stencil_reference(rec.buffer, vk::StencilFaceFlags::FRONT_AND_BACK, stencil_ref);
        }
    }

    fn set_rasterizer_state(&mut self, state: NativeHandle) {
        let desc = match self.state_desc(state) {
            Some(StateDesc::Rasterizer(desc)) => desc,
            _ => RasterizerDesc::default(),
        };
        let Some(rec) = self.current.as_ref() else {
            return;
        };
        if desc.fill == FillMode::Wireframe {
            log::trace!("Vulkan fill mode is baked into the bound pipeline");
        }
        let cull = match desc.cull {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
        };
        let front_face = if desc.front_counter_clockwise {
            vk::FrontFace::COUNTER_CLOCKWISE
        } else {
            vk::FrontFace::CLOCKWISE
        };
        let device = &self.shared.device;
        unsafe {
            device.cmd_set_cull_mode(rec.buffer, cull);
            device.cmd_set_front_face(rec.buffer, front_face);
            device.cmd_set_depth_bias(rec.buffer, desc.depth_bias as f32, 0.0, 0.0);
        }
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        let Some(rec) = self.current.as_ref() else {
            return;
        };
        if viewports.is_empty() {
            return;
        }
        let native: Vec<vk::Viewport> = viewports
            .iter()
            .map(|v| vk::Viewport {
                x: v.x,
                y: v.y,
                width: v.width,
                height: v.height,
                min_depth: v.min_depth,
                max_depth: v.max_depth,
            })
            .collect();
        unsafe { self.shared.device.cmd_set_viewport(rec.buffer, 0, &native) };
    }

    fn set_scissor_rects(&mut self, rects: &[Rect]) {
        let Some(rec) = self.current.as_ref() else {
            return;
        };
        if rects.is_empty() {
            return;
        }
        let native: Vec<vk::Rect2D> = rects
            .iter()
            .map(|r| vk::Rect2D {
                offset: vk::Offset2D { x: r.left, y: r.top },
                extent: vk::Extent2D { width: r.width().max(0) as u32, height: r.height().max(0) as u32 },
            })
            .collect();
        unsafe { self.shared.device.cmd_set_scissor(rec.buffer, 0, &native) };
    }

    fn set_render_targets(&mut self, targets: &[NativeHandle], depth: NativeHandle) {
        let Some(rec) = self.current.as_mut() else {
            return;
        };
        rec.end_rendering(&self.shared.device);
        rec.targets = targets.to_vec();
        rec.depth = depth;
    }

    fn draw(&mut self, vertex_count: u32, start_vertex: u32) {
        let Some(rec) = self.current.as_mut() else {
            return;
        };
        rec.begin_rendering(&self.shared);
        unsafe { self.shared.device.cmd_draw(rec.buffer, vertex_count, 1, start_vertex, 0) };
    }

    fn draw_instanced(&mut self, vertex_count_per_instance: u32, instance_count: u32, start_vertex: u32, start_instance: u32) {
        let Some(rec) = self.current.as_mut() else {
            return;
        };
        rec.begin_rendering(&self.shared);
        unsafe {
            self.shared
                .device
                .cmd_draw(rec.buffer, vertex_count_per_instance, instance_count, start_vertex, start_instance);
        }
    }

    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) {
        let Some(rec) = self.current.as_mut() else {
            return;
        };
        rec.begin_rendering(&self.shared);
        unsafe {
            self.shared
                .device
                .cmd_draw_indexed(rec.buffer, index_count, 1, start_index, base_vertex, 0);
        }
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count_per_instance: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        let Some(rec) = self.current.as_mut() else {
            return;
        };
        rec.begin_rendering(&self.shared);
        unsafe {
            self.shared.device.cmd_draw_indexed(
                rec.buffer,
                index_count_per_instance,
                instance_count,
                start_index,
                base_vertex,
                start_instance,
            );
        }
    }

    fn dispatch(&mut self, groups: [u32; 3]) {
        let Some(rec) = self.current.as_mut() else {
            return;
        };
        let device = &self.shared.device;
        rec.end_rendering(device);
        unsafe { device.cmd_dispatch(rec.buffer, groups[0], groups[1], groups[2]) };
        full_barrier(device, rec.buffer);
    }

    fn map(&mut self, resource: &NativeResource, subresource: u32, mode: NativeMapMode) -> HalResult<Box<dyn MappedRegion>> {
        let (memory, offset, len) = match self.shared.objects().get(&resource.handle) {
            Some(VkObject::Buffer(allocation)) if allocation.host_visible => {
                if subresource != 0 {
                    return Err(HalError::invalid(format!("buffers have one subresource, got {subresource}")));
                }
                (allocation.memory, 0, allocation.size)
            }
            Some(VkObject::HostTexture { allocation, info }) => {
                let (offset, len) = info.packed_range(subresource)?;
                (allocation.memory, offset, len)
            }
            Some(VkObject::Buffer(_) | VkObject::Image(_)) => {
                return Err(HalError::Unsupported(format!(
                    "resource {} lives in device-local memory; copy it to a staging resource first",
                    resource.handle
                )));
            }
            _ => return Err(HalError::invalid(format!("no Vulkan resource behind {}", resource.handle))),
        };

        let device = &self.shared.device;
        if mode != NativeMapMode::WriteNoOverwrite {
            unsafe { device.device_wait_idle().map_err(HalError::Vulkan)? };
        }

        let ptr = unsafe {
            device
                .map_memory(memory, offset, len.max(1), vk::MemoryMapFlags::empty())
                .map_err(HalError::Vulkan)?
        };
        Ok(Box::new(VulkanRegion { device: device.clone(), memory, ptr: ptr.cast::<u8>(), len: len as usize }))
    }

    fn unmap(&mut self, _resource: &NativeResource, _subresource: u32) {}

    fn update_subresource(
        &mut self,
        resource: &NativeResource,
        subresource: u32,
        region: Option<ResourceRegion>,
        data: &[u8],
        row_pitch: u32,
        _slice_pitch: u32,
    ) -> HalResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let location = self.location(resource)?;
        let staging = BufferAllocation::staging(&self.shared.device, self.shared.memory_properties(), data)?;
        let staging_info = |info: &TextureInfo, extent: vk::Extent3D| TextureInfo {
            width: row_pitch / info.texel_size.max(1),
            height: extent.height,
            mip_levels: 1,
            array_layers: 1,
            ..*info
        };

        let shared = Arc::clone(&self.shared);
        let rec = match self.recording() {
            Ok(rec) => rec,
            Err(err) => {
                staging.destroy(&shared.device);
                return Err(err);
            }
        };
        let device = &shared.device;
        rec.end_rendering(device);

        let recorded = match location {
            Location::Buffer { buffer, size } => {
                let offset = region.map_or(0, |r| u64::from(r.left));
                if offset + data.len() as u64 > size {
                    Err(HalError::invalid(format!("{} bytes at offset {offset} exceed buffer of {size} bytes", data.len())))
                } else {
                    let copy = vk::BufferCopy { src_offset: 0, dst_offset: offset, size: data.len() as u64 };
                    unsafe { device.cmd_copy_buffer(rec.buffer, staging.buffer, buffer, &[copy]) };
                    Ok(())
                }
            }
            Location::Image { image, info } => {
                let (offset, extent) = region_box(&info, subresource, region);
                let copy = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: row_pitch / info.texel_size.max(1),
                    buffer_image_height: 0,
                    image_subresource: info.layers(subresource),
                    image_offset: offset,
                    image_extent: extent,
                };
                unsafe {
                    device.cmd_copy_buffer_to_image(rec.buffer, staging.buffer, image, vk::ImageLayout::GENERAL, &[copy]);
                }
                Ok(())
            }
            Location::Packed { buffer, info } => {
                let (origin, extent) = region_box(&info, subresource, region);
                let source = staging_info(&info, extent);
                packed_row_copies(
                    &source,
                    0,
                    vk::Offset3D::default(),
                    extent,
                    &info,
                    subresource,
                    [origin.x as u32, origin.y as u32, 0],
                )
                .map(|copies| unsafe { device.cmd_copy_buffer(rec.buffer, staging.buffer, buffer, &copies) })
            }
        };

        match recorded {
            Ok(()) => {
                full_barrier(device, rec.buffer);
                rec.transient.push(staging);
                Ok(())
            }
            Err(err) => {
                staging.destroy(device);
                Err(err)
            }
        }
    }

    fn copy_resource(&mut self, source: &NativeResource, destination: &NativeResource) -> HalResult<()> {
        let from = self.location(source)?;
        let to = self.location(destination)?;
        let shared = Arc::clone(&self.shared);
        let rec = self.recording()?;
        let device = &shared.device;
        rec.end_rendering(device);

        unsafe {
            match (from, to) {
                (Location::Buffer { buffer: src, size: a }, Location::Buffer { buffer: dst, size: b }) => {
                    let copy = vk::BufferCopy { src_offset: 0, dst_offset: 0, size: a.min(b) };
                    device.cmd_copy_buffer(rec.buffer, src, dst, &[copy]);
                }
                (Location::Packed { buffer: src, info }, Location::Packed { buffer: dst, .. }) => {
                    let copy = vk::BufferCopy { src_offset: 0, dst_offset: 0, size: info.packed_size() };
                    device.cmd_copy_buffer(rec.buffer, src, dst, &[copy]);
                }
                (Location::Image { image: src, info }, Location::Image { image: dst, .. }) => {
                    let copies: Vec<vk::ImageCopy> = (0..info.mip_levels * info.array_layers)
                        .map(|sub| vk::ImageCopy {
                            src_subresource: info.layers(sub),
                            src_offset: vk::Offset3D::default(),
                            dst_subresource: info.layers(sub),
                            dst_offset: vk::Offset3D::default(),
                            extent: info.mip_extent(info.split(sub).0),
                        })
                        .collect();
                    device.cmd_copy_image(rec.buffer, src, vk::ImageLayout::GENERAL, dst, vk::ImageLayout::GENERAL, &copies);
                }
                (Location::Image { image, info }, Location::Packed { buffer, .. }) => {
                    let regions = packed_copy_regions(&info, info.packed_size())?;
                    device.cmd_copy_image_to_buffer(rec.buffer, image, vk::ImageLayout::GENERAL, buffer, &regions);
                }
                (Location::Packed { buffer, info }, Location::Image { image, .. }) => {
                    let regions = packed_copy_regions(&info, info.packed_size())?;
                    device.cmd_copy_buffer_to_image(rec.buffer, buffer, image, vk::ImageLayout::GENERAL, &regions);
                }
                _ => return Err(HalError::Unsupported("copies between buffers and textures".to_string())),
            }
        }

        full_barrier(device, rec.buffer);
        Ok(())
    }

    fn copy_subresource_region(
        &mut self,
        source: &NativeResource,
        source_subresource: u32,
        source_region: Option<ResourceRegion>,
        destination: &NativeResource,
        destination_subresource: u32,
        destination_offset: [u32; 3],
    ) -> HalResult<()> {
        let from = self.location(source)?;
        let to = self.location(destination)?;
        let shared = Arc::clone(&self.shared);
        let rec = self.recording()?;
        let device = &shared.device;
        rec.end_rendering(device);

        let dst_offset = vk::Offset3D {
            x: destination_offset[0] as i32,
            y: destination_offset[1] as i32,
            z: destination_offset[2] as i32,
        };

        unsafe {
            match (from, to) {
                (Location::Buffer { buffer: src, size }, Location::Buffer { buffer: dst, .. }) => {
                    let (offset, len) = source_region.map_or((0, size), |r| (u64::from(r.left), u64::from(r.width())));
                    let copy = vk::BufferCopy { src_offset: offset, dst_offset: u64::from(destination_offset[0]), size: len };
                    device.cmd_copy_buffer(rec.buffer, src, dst, &[copy]);
                }
                (Location::Image { image: src, info: src_info }, Location::Image { image: dst, info: dst_info }) => {
                    let (origin, extent) = region_box(&src_info, source_subresource, source_region);
                    let copy = vk::ImageCopy {
                        src_subresource: src_info.layers(source_subresource),
                        src_offset: origin,
                        dst_subresource: dst_info.layers(destination_subresource),
                        dst_offset,
                        extent,
                    };
                    device.cmd_copy_image(rec.buffer, src, vk::ImageLayout::GENERAL, dst, vk::ImageLayout::GENERAL, &[copy]);
                }
                (Location::Image { image, info: src_info }, Location::Packed { buffer, info: dst_info }) => {
                    let (origin, extent) = region_box(&src_info, source_subresource, source_region);
                    let (dst_mip, _) = dst_info.split(destination_subresource);
                    let copy = vk::BufferImageCopy {
                        buffer_offset: packed_offset(&dst_info, destination_subresource, destination_offset[0], destination_offset[1])?,
                        buffer_row_length: dst_info.mip_extent(dst_mip).width,
                        buffer_image_height: 0,
                        image_subresource: src_info.layers(source_subresource),
                        image_offset: origin,
                        image_extent: extent,
                    };
                    device.cmd_copy_image_to_buffer(rec.buffer, image, vk::ImageLayout::GENERAL, buffer, &[copy]);
                }
                (Location::Packed { buffer, info: src_info }, Location::Image { image, info: dst_info }) => {
                    let (origin, extent) = region_box(&src_info, source_subresource, source_region);
                    let (src_mip, _) = src_info.split(source_subresource);
                    let copy = vk::BufferImageCopy {
                        buffer_offset: packed_offset(&src_info, source_subresource, origin.x as u32, origin.y as u32)?,
                        buffer_row_length: src_info.mip_extent(src_mip).width,
                        buffer_image_height: 0,
                        image_subresource: dst_info.layers(destination_subresource),
                        image_offset: dst_offset,
                        image_extent: extent,
                    };
                    device.cmd_copy_buffer_to_image(rec.buffer, buffer, image, vk::ImageLayout::GENERAL, &[copy]);
                }
                (Location::Packed { buffer: src, info: src_info }, Location::Packed { buffer: dst, info: dst_info }) => {
                    let (origin, extent) = region_box(&src_info, source_subresource, source_region);
                    let copies = packed_row_copies(
                        &src_info,
                        source_subresource,
                        origin,
                        extent,
                        &dst_info,
                        destination_subresource,
                        destination_offset,
                    )?;
                    device.cmd_copy_buffer(rec.buffer, src, dst, &copies);
                }
                _ => return Err(HalError::Unsupported("copies between buffers and textures".to_string())),
            }
        }

        full_barrier(device, rec.buffer);
        Ok(())
    }

    fn generate_mips(&mut self, resource: &NativeResource) -> HalResult<()> {
        let Location::Image { image, info } = self.location(resource)? else {
            return Err(HalError::Unsupported("mip generation needs a device-local texture".to_string()));
        };
        let shared = Arc::clone(&self.shared);
        let rec = self.recording()?;
        let device = &shared.device;
        rec.end_rendering(device);

        let filter = if info.aspect.contains(vk::ImageAspectFlags::DEPTH) {
            vk::Filter::NEAREST
        } else {
            vk::Filter::LINEAR
        };
        let corner = |extent: vk::Extent3D| vk::Offset3D { x: extent.width as i32, y: extent.height as i32, z: 1 };
        let layers = |mip: u32| vk::ImageSubresourceLayers {
            aspect_mask: info.aspect,
            mip_level: mip,
            base_array_layer: 0,
            layer_count: info.array_layers,
        };

        for mip in 1..info.mip_levels {
            let blit = vk::ImageBlit {
                src_subresource: layers(mip - 1),
                src_offsets: [vk::Offset3D::default(), corner(info.mip_extent(mip - 1))],
                dst_subresource: layers(mip),
                dst_offsets: [vk::Offset3D::default(), corner(info.mip_extent(mip))],
            };
            unsafe {
                device.cmd_blit_image(rec.buffer, image, vk::ImageLayout::GENERAL, image, vk::ImageLayout::GENERAL, &[blit], filter);
            }
            full_barrier(device, rec.buffer);
        }
        Ok(())
    }

    fn begin_event(&mut self, label: &str) {
        let (Some(rec), Some(debug_utils)) = (self.current.as_mut(), self.shared.instance.debug_utils.as_ref()) else {
            return;
        };
        let Ok(name) = CString::new(label) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name);
        unsafe { debug_utils.cmd_begin_debug_utils_label(rec.buffer, &label) };
        rec.event_depth += 1;
    }

    fn end_event(&mut self) {
        let (Some(rec), Some(debug_utils)) = (self.current.as_mut(), self.shared.instance.debug_utils.as_ref()) else {
            return;
        };
        if rec.event_depth > 0 {
            unsafe { debug_utils.cmd_end_debug_utils_label(rec.buffer) };
            rec.event_depth -= 1;
        }
    }

    fn set_marker(&mut self, label: &str) {
        let (Some(rec), Some(debug_utils)) = (self.current.as_ref(), self.shared.instance.debug_utils.as_ref()) else {
            return;
        };
        let Ok(name) = CString::new(label) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name);
        unsafe { debug_utils.cmd_insert_debug_utils_label(rec.buffer, &label) };
    }

    fn drain_debug_messages(&mut self) -> Vec<DebugMessage> {
        self.shared.instance.drain_messages()
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.shared.device.device_wait_idle();
        }
        if let Some(rec) = self.current.take() {
            for staging in &rec.transient {
                staging.destroy(&self.shared.device);
            }
        }
        for handle in std::mem::take(&mut self.owned) {
            self.shared.destroy_list(handle, &self.pool);
        }
    }
}
