//! Command queues
//!
//! A [`CommandQueue`] wraps one native context. It owns every binding slot
//! of that context, records draws and dispatches through the
//! validate-then-bind-then-issue path, and exposes resource mapping, copies
//! and debug events. Queues are used from one thread at a time; deferred
//! queues may be filled on worker threads and executed on a primary queue.

mod apply;
mod draw_info;
mod profiler;
mod tracker;
mod validation;

#[cfg(test)]
mod tests;

pub use draw_info::{BatchDrawInfo, CustomDrawInfo};
pub use profiler::{FrameStats, RenderProfiler};
pub use tracker::CommandList;
pub use validation::{BindResult, QueueValidationMode};

use std::collections::VecDeque;
use std::sync::Arc;

use apply::ShaderStage;
use tracker::FrameTracker;

use crate::backend::{
    CommandListFlags, ContextKind, NativeContext, NativeMapMode, Rect, ResourceRegion, Viewport,
};
use crate::binding::{BindingSlot, BindingSlotGroup, SurfaceBinder, UnorderedAccessBinder, VertexBufferBinder};
use crate::device::GraphicsDevice;
use crate::resource::{GraphicsPriority, GraphicsResource, GraphicsStream, MapType, ResourceFlags, ResourceKind, ResourceTask};
use crate::shader::{
    BlendState, DepthStencilState, DepthWritePermission, PrimitiveTopology, RasterizerState, Shader, ShaderStageKind,
    VertexInputLayout,
};
use crate::{HalError, HalResult};

/// Recording front-end of one native context
pub struct CommandQueue {
    device: Arc<GraphicsDevice>,
    native: Box<dyn NativeContext>,
    kind: ContextKind,
    flags: CommandListFlags,
    branch: u32,
    draw_info: BatchDrawInfo,
    tracker: FrameTracker,
    profiler: RenderProfiler,
    closed: VecDeque<Arc<CommandList>>,
    executed: Vec<Arc<CommandList>>,

    shader: BindingSlot<Shader>,
    stages: Vec<ShaderStage>,
    vertex_buffers: BindingSlotGroup<GraphicsResource, VertexBufferBinder>,
    index_buffer: BindingSlot<GraphicsResource>,
    input_layout: BindingSlot<VertexInputLayout>,
    render_uavs: BindingSlotGroup<GraphicsResource, UnorderedAccessBinder>,
    blend_state: BindingSlot<BlendState>,
    depth_state: BindingSlot<DepthStencilState>,
    rasterizer_state: BindingSlot<RasterizerState>,
    surfaces: BindingSlotGroup<GraphicsResource, SurfaceBinder>,
    depth_surface: BindingSlot<GraphicsResource>,
    bound_depth_mode: DepthWritePermission,
    topology: PrimitiveTopology,
    viewports: Vec<Viewport>,
    viewports_dirty: bool,
    scissors: Vec<Rect>,
    scissors_dirty: bool,
    layout_cache: Vec<Arc<VertexInputLayout>>,
}

impl CommandQueue {
    pub(crate) fn new(device: Arc<GraphicsDevice>, native: Box<dyn NativeContext>) -> Self {
        let caps = device.capabilities().clone();
        let kind = native.kind();
        let pool_size = device.config().command_list_pool_size;
        log::debug!("Created {kind:?} command queue");

        Self {
            native,
            kind,
            flags: CommandListFlags::empty(),
            branch: 0,
            draw_info: BatchDrawInfo::default(),
            tracker: FrameTracker::new(pool_size),
            profiler: RenderProfiler::default(),
            closed: VecDeque::new(),
            executed: Vec::new(),
            shader: BindingSlot::new(0),
            stages: ShaderStageKind::ALL.iter().map(|&stage| ShaderStage::new(stage, &caps)).collect(),
            vertex_buffers: BindingSlotGroup::new(caps.max_vertex_buffer_slots, VertexBufferBinder),
            index_buffer: BindingSlot::new(0),
            input_layout: BindingSlot::new(0),
            render_uavs: BindingSlotGroup::new(
                caps.max_unordered_access_slots,
                UnorderedAccessBinder { stage: ShaderStageKind::Pixel },
            ),
            blend_state: BindingSlot::new(0),
            depth_state: BindingSlot::new(0),
            rasterizer_state: BindingSlot::new(0),
            surfaces: BindingSlotGroup::new(caps.max_render_targets, SurfaceBinder),
            depth_surface: BindingSlot::new(0),
            bound_depth_mode: DepthWritePermission::Enabled,
            topology: PrimitiveTopology::Undefined,
            viewports: Vec::new(),
            viewports_dirty: false,
            scissors: Vec::new(),
            scissors_dirty: false,
            layout_cache: Vec::new(),
            device,
        }
    }

    // ---- lifecycle ----

    /// Start recording a command list
    ///
    /// Deferred queues always record with [`CommandListFlags::DEFERRED`].
    /// Every binding is re-sent on the first draw of the new list.
    pub fn begin(&mut self, flags: CommandListFlags) -> HalResult<()> {
        if self.draw_info.began {
            return Err(HalError::AlreadyRecording);
        }
        let mut flags = flags;
        if self.kind == ContextKind::Deferred {
            flags |= CommandListFlags::DEFERRED;
        }

        let reuse = self.tracker.acquire();
        self.native.begin(flags, reuse)?;
        self.flags = flags;
        self.branch = self.tracker.next_branch();
        self.draw_info.began = true;
        self.invalidate_bindings();
        log::trace!("Begin {:?} list (frame {}, branch {})", self.kind, self.tracker.frame(), self.branch);
        Ok(())
    }

    /// Close the current command list
    ///
    /// The list is tracked until neither the GPU nor the caller references
    /// it. Primary lists wait, in closing order, for the next [`Self::submit`].
    pub fn end(&mut self) -> HalResult<Arc<CommandList>> {
        if !self.draw_info.began {
            return Err(HalError::NotRecording);
        }
        let native = self.native.end(self.flags)?;
        let dependencies = std::mem::take(&mut self.executed);
        let list = Arc::new(CommandList::new(native, self.flags, self.tracker.frame(), self.branch, dependencies));

        self.tracker.track(Arc::clone(&list));
        if !list.is_deferred() {
            self.closed.push_back(Arc::clone(&list));
        }
        self.draw_info.reset();
        log::trace!("End list {} ({} tracked)", native.handle, self.tracker.tracked());
        Ok(list)
    }

    /// Submit every closed primary list to the device, oldest first
    ///
    /// A list whose native submission fails stays queued together with the
    /// lists closed after it.
    pub fn submit(&mut self, flags: CommandListFlags) -> HalResult<()> {
        if self.kind == ContextKind::Deferred || flags.contains(CommandListFlags::DEFERRED) {
            return Err(HalError::NotPrimary);
        }
        if self.closed.is_empty() {
            return Err(HalError::NothingToSubmit);
        }
        while let Some(list) = self.closed.front() {
            self.native.submit(list.native(), flags)?;
            list.mark_submitted();
            log::debug!("Submitted list {} (frame {})", list.native().handle, list.frame());
            self.closed.pop_front();
        }
        Ok(())
    }

    /// Closed primary lists waiting for [`Self::submit`]
    pub fn pending_submissions(&self) -> usize {
        self.closed.len()
    }

    /// Replay a deferred list inside the current recording
    ///
    /// The list stays alive until the list recording it has been retired.
    pub fn execute(&mut self, list: &Arc<CommandList>) -> HalResult<()> {
        if self.kind == ContextKind::Deferred {
            return Err(HalError::NotPrimary);
        }
        if !list.is_deferred() {
            return Err(HalError::NotDeferred);
        }
        if !self.draw_info.began {
            return Err(HalError::NotRecording);
        }
        self.native.execute(list.native())?;
        self.executed.push(Arc::clone(list));
        // Native state after a replay is unknown.
        self.invalidate_bindings();
        Ok(())
    }

    /// Whether the GPU has finished with `list`
    pub fn is_complete(&self, list: &CommandList) -> bool {
        self.native.is_complete(list.native())
    }

    /// Start this queue's frame without advancing the device
    ///
    /// Resets the profiler and branch counter and retires finished lists.
    /// [`GraphicsDevice::begin_frame`] calls this for the queue it is given;
    /// every other queue, deferred ones included, calls it once per frame.
    pub fn start_frame(&mut self) {
        self.profiler.begin_frame();
        let frame = self.device.frame_index();
        let retired = self.tracker.start_frame(frame, self.native.as_mut());
        log::trace!("{:?} queue started frame {frame}, {retired} lists retired", self.kind);
    }

    /// Close this queue's frame and return its counters
    pub fn end_frame(&mut self) -> FrameStats {
        self.profiler.end_frame()
    }

    // ---- draws ----

    /// Bind the shader used by subsequent draws
    pub fn set_shader(&mut self, shader: Option<Arc<Shader>>) {
        self.shader.set(shader);
    }

    /// Shader used by subsequent draws
    pub fn shader(&self) -> Option<&Arc<Shader>> {
        self.shader.value()
    }

    /// Non-indexed draw
    pub fn draw(&mut self, vertex_count: u32, start_vertex: u32) -> HalResult<BindResult> {
        self.apply_state(QueueValidationMode::Unindexed, |ctx| ctx.draw(vertex_count, start_vertex))
    }

    /// Instanced draw; needs vertex-buffer slot 0 and an instanced input layout
    pub fn draw_instanced(
        &mut self,
        vertex_count_per_instance: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> HalResult<BindResult> {
        self.apply_state(QueueValidationMode::Instanced, |ctx| {
            ctx.draw_instanced(vertex_count_per_instance, instance_count, start_vertex, start_instance);
        })
    }

    /// Indexed draw; needs vertex-buffer slot 0 and an index buffer
    pub fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) -> HalResult<BindResult> {
        self.apply_state(QueueValidationMode::Indexed, |ctx| ctx.draw_indexed(index_count, start_index, base_vertex))
    }

    /// Indexed instanced draw
    pub fn draw_indexed_instanced(
        &mut self,
        index_count_per_instance: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> HalResult<BindResult> {
        self.apply_state(QueueValidationMode::InstancedIndexed, |ctx| {
            ctx.draw_indexed_instanced(index_count_per_instance, instance_count, start_index, base_vertex, start_instance);
        })
    }

    /// Run the compute passes of `shader`
    ///
    /// A zero axis in `groups` falls back to the pass's own group count.
    pub fn dispatch(&mut self, shader: &Arc<Shader>, groups: [u32; 3]) -> HalResult<BindResult> {
        if !self.draw_info.began {
            return Err(HalError::NotRecording);
        }
        // The dispatch shader only occupies the slot for this call.
        let staged = self.shader.value().cloned();
        self.shader.set(Some(Arc::clone(shader)));
        self.draw_info.custom.compute_groups = groups;
        let result = self.apply_state(QueueValidationMode::Compute, |_| {});
        self.draw_info.custom.compute_groups = [0; 3];
        self.shader.set(staged);
        result
    }

    /// Values shared with pass callbacks for the current recording
    pub fn draw_info_mut(&mut self) -> &mut CustomDrawInfo {
        &mut self.draw_info.custom
    }

    // ---- input assembly ----

    /// Bind one vertex buffer
    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: Option<Arc<GraphicsResource>>) -> HalResult<()> {
        if let Some(buffer) = buffer.as_deref() {
            expect_kind(buffer, &[ResourceKind::VertexBuffer, ResourceKind::StructuredBuffer])?;
        }
        if !self.vertex_buffers.set(slot, buffer) {
            return Err(HalError::invalid(format!(
                "vertex buffer slot {slot} exceeds the {} available",
                self.vertex_buffers.len()
            )));
        }
        Ok(())
    }

    /// Bind consecutive vertex buffers starting at `first_slot`
    pub fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[Option<Arc<GraphicsResource>>]) -> HalResult<()> {
        for (offset, buffer) in buffers.iter().enumerate() {
            self.set_vertex_buffer(first_slot + offset as u32, buffer.clone())?;
        }
        Ok(())
    }

    /// Bind the index buffer
    pub fn set_index_buffer(&mut self, buffer: Option<Arc<GraphicsResource>>) -> HalResult<()> {
        if let Some(buffer) = buffer.as_deref() {
            expect_kind(buffer, &[ResourceKind::IndexBuffer])?;
        }
        self.index_buffer.set(buffer);
        Ok(())
    }

    // ---- output merger ----

    /// Replace every render target; slot `i` receives `surfaces[i]`
    ///
    /// The first viewport is reset to cover the first surface.
    pub fn set_render_surfaces(&mut self, surfaces: &[Option<Arc<GraphicsResource>>]) -> HalResult<()> {
        if surfaces.len() > self.surfaces.len() {
            return Err(HalError::invalid(format!(
                "{} render surfaces exceed the {} supported",
                surfaces.len(),
                self.surfaces.len()
            )));
        }
        for surface in surfaces.iter().flatten() {
            expect_kind(surface, &[ResourceKind::Surface])?;
        }

        self.surfaces.clear();
        for (slot, surface) in surfaces.iter().enumerate() {
            self.surfaces.set(slot as u32, surface.clone());
        }
        if let Some(first) = surfaces.iter().flatten().next() {
            let desc = first.desc();
            self.set_viewport(Viewport::new(desc.width as f32, desc.height as f32));
        }
        Ok(())
    }

    /// Replace one render target
    pub fn set_render_surface(&mut self, surface: Option<Arc<GraphicsResource>>, slot: u32) -> HalResult<()> {
        if let Some(surface) = surface.as_deref() {
            expect_kind(surface, &[ResourceKind::Surface])?;
        }
        if !self.surfaces.set(slot, surface) {
            return Err(HalError::invalid(format!("render surface slot {slot} exceeds the {} supported", self.surfaces.len())));
        }
        Ok(())
    }

    /// Unbind every render target and the depth surface
    pub fn reset_render_surfaces(&mut self) {
        self.surfaces.clear();
        self.depth_surface.set(None);
    }

    /// Render target in `slot`
    pub fn render_surface(&self, slot: u32) -> Option<&Arc<GraphicsResource>> {
        self.surfaces.value(slot)
    }

    /// Bind the depth-stencil surface
    pub fn set_depth_surface(&mut self, surface: Option<Arc<GraphicsResource>>) -> HalResult<()> {
        if let Some(surface) = surface.as_deref() {
            expect_kind(surface, &[ResourceKind::DepthSurface])?;
        }
        self.depth_surface.set(surface);
        Ok(())
    }

    /// Depth-stencil surface
    pub fn depth_surface(&self) -> Option<&Arc<GraphicsResource>> {
        self.depth_surface.value()
    }

    /// Set the viewport of the first render target
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.set_viewports(&[viewport]);
    }

    /// Set one viewport per render target
    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        let max = self.surfaces.len();
        if viewports.len() > max {
            log::warn!("{} viewports given, only {max} used", viewports.len());
        }
        let viewports = &viewports[..viewports.len().min(max)];
        if self.viewports != viewports {
            self.viewports = viewports.to_vec();
            self.viewports_dirty = true;
        }
    }

    /// Current viewports
    pub fn viewports(&self) -> &[Viewport] {
        &self.viewports
    }

    /// Set the scissor rectangle of the first render target
    pub fn set_scissor_rectangle(&mut self, rect: Rect) {
        self.set_scissor_rectangles(&[rect]);
    }

    /// Set one scissor rectangle per render target
    pub fn set_scissor_rectangles(&mut self, rects: &[Rect]) {
        let max = self.surfaces.len();
        if rects.len() > max {
            log::warn!("{} scissor rectangles given, only {max} used", rects.len());
        }
        let rects = &rects[..rects.len().min(max)];
        if self.scissors != rects {
            self.scissors = rects.to_vec();
            self.scissors_dirty = true;
        }
    }

    /// Current scissor rectangles
    pub fn scissor_rectangles(&self) -> &[Rect] {
        &self.scissors
    }

    // ---- resources ----

    /// Open a map of one subresource
    ///
    /// `Read` needs [`ResourceFlags::CPU_READ`]; `Write` and `Discard` need
    /// [`ResourceFlags::CPU_WRITE`]. `Write` on vertex and index buffers and
    /// on write-only buffers maps without overwrite synchronization. Only one
    /// map can be open per resource; close it with [`Self::unmap_resource`].
    pub fn map_resource<'a>(
        &mut self,
        resource: &'a GraphicsResource,
        subresource: u32,
        byte_offset: u32,
        map_type: MapType,
    ) -> HalResult<GraphicsStream<'a>> {
        let mode = select_map_mode(resource, map_type)?;
        resource.begin_map()?;

        let region = resource
            .require_native()
            .and_then(|native| self.native.map(&native, subresource, mode).map(|region| (native, region)));
        let (native, region) = match region {
            Ok(mapped) => mapped,
            Err(err) => {
                let _ = resource.end_map();
                return Err(err);
            }
        };

        if byte_offset as usize > region.bytes().len() {
            drop(region);
            self.native.unmap(&native, subresource);
            let _ = resource.end_map();
            return Err(HalError::InvalidMapAccess {
                name: resource.name().to_string(),
                reason: format!("offset {byte_offset} is past the end of the subresource"),
            });
        }

        let stats = self.profiler.stats_mut();
        match mode {
            NativeMapMode::WriteDiscard => stats.map_discard_count += 1,
            NativeMapMode::WriteNoOverwrite => stats.map_no_overwrite_count += 1,
            NativeMapMode::Read | NativeMapMode::Write | NativeMapMode::ReadWrite => stats.map_read_write_count += 1,
        }
        log::trace!("Mapped '{}' subresource {subresource} as {mode:?}", resource.name());
        Ok(GraphicsStream::new(resource, region, subresource, mode, u64::from(byte_offset)))
    }

    /// Close a map opened with [`Self::map_resource`]
    pub fn unmap_resource(&mut self, mut stream: GraphicsStream<'_>) -> HalResult<()> {
        let resource = stream.resource();
        let region = stream.take_region().ok_or_else(|| HalError::NotMapped { name: resource.name().to_string() })?;
        drop(region);
        self.native.unmap(&resource.native(), stream.subresource());
        resource.end_map()
    }

    /// Write bytes through the command stream
    ///
    /// `region` selects a byte range for buffers or a texel box for textures;
    /// `None` replaces the whole subresource.
    pub fn update_resource(
        &mut self,
        resource: &GraphicsResource,
        subresource: u32,
        region: Option<ResourceRegion>,
        data: &[u8],
    ) -> HalResult<()> {
        let native = resource.require_native()?;
        let desc = resource.desc();
        let row_pitch = match region {
            Some(region) if !desc.kind.is_buffer() => region.width() * desc.format.bytes_per_pixel(),
            Some(region) => region.width(),
            None => desc.row_pitch(),
        };
        let slice_pitch = if desc.kind.is_buffer() { row_pitch } else { row_pitch * desc.height.max(1) };

        self.native.update_subresource(&native, subresource, region, data, row_pitch, slice_pitch)?;
        self.profiler.stats_mut().update_subresource_count += 1;
        Ok(())
    }

    /// Copy a whole resource into another of the same shape
    pub fn copy_resource(&mut self, source: &GraphicsResource, destination: &GraphicsResource) -> HalResult<()> {
        if std::ptr::eq(source, destination) {
            return Err(HalError::invalid(format!("cannot copy '{}' onto itself", source.name())));
        }
        let (src, dst) = (source.require_native()?, destination.require_native()?);
        if src.size_in_bytes != dst.size_in_bytes {
            return Err(HalError::invalid(format!(
                "copy from '{}' ({} bytes) to '{}' ({} bytes)",
                source.name(),
                src.size_in_bytes,
                destination.name(),
                dst.size_in_bytes
            )));
        }
        self.native.copy_resource(&src, &dst)?;
        self.profiler.stats_mut().copy_resource_count += 1;
        Ok(())
    }

    /// Copy a region of one subresource into another
    pub fn copy_resource_region(
        &mut self,
        source: &GraphicsResource,
        source_subresource: u32,
        source_region: Option<ResourceRegion>,
        destination: &GraphicsResource,
        destination_subresource: u32,
        destination_offset: [u32; 3],
    ) -> HalResult<()> {
        let (src, dst) = (source.require_native()?, destination.require_native()?);
        self.native.copy_subresource_region(
            &src,
            source_subresource,
            source_region,
            &dst,
            destination_subresource,
            destination_offset,
        )?;
        self.profiler.stats_mut().copy_subresource_count += 1;
        Ok(())
    }

    /// Rebuild a texture's mip chain
    pub fn generate_mips(&mut self, resource: &GraphicsResource) -> HalResult<()> {
        if !resource.flags().contains(ResourceFlags::MIP_GENERATION) {
            return Err(HalError::invalid(format!("'{}' was not created for mip generation", resource.name())));
        }
        let native = resource.require_native()?;
        self.native.generate_mips(&native)
    }

    /// Run or queue a resource task
    ///
    /// Immediate tasks run now on this queue and return whether they
    /// invalidated the resource; other priorities are queued and return
    /// `false`.
    pub fn queue_resource_task<T: ResourceTask + 'static>(
        &mut self,
        resource: &Arc<GraphicsResource>,
        priority: GraphicsPriority,
        task: T,
    ) -> HalResult<bool> {
        if priority == GraphicsPriority::Immediate {
            let mut task = task;
            return resource.process_task(self, &mut task);
        }
        resource.queue_task(priority, task)?;
        Ok(false)
    }

    // ---- debug ----

    /// Open a named debug event
    pub fn begin_event(&mut self, label: &str) {
        self.native.begin_event(label);
    }

    /// Close the innermost debug event
    pub fn end_event(&mut self) {
        self.native.end_event();
    }

    /// Insert a debug marker
    pub fn set_marker(&mut self, label: &str) {
        self.native.set_marker(label);
    }

    // ---- accessors ----

    /// Owning device
    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.device
    }

    /// Immediate or deferred
    pub const fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Whether `begin` has been called without a matching `end`
    pub const fn is_recording(&self) -> bool {
        self.draw_info.began
    }

    /// Per-frame counters
    pub const fn profiler(&self) -> &RenderProfiler {
        &self.profiler
    }

    /// Command lists still tracked by this queue
    pub fn tracked_lists(&self) -> usize {
        self.tracker.tracked()
    }

    /// Input layouts created so far
    pub fn cached_layouts(&self) -> usize {
        self.layout_cache.len()
    }

    /// Backend context
    pub fn native(&mut self) -> &mut dyn NativeContext {
        self.native.as_mut()
    }

    fn invalidate_bindings(&mut self) {
        self.shader.invalidate();
        for stage in &mut self.stages {
            stage.invalidate();
        }
        self.vertex_buffers.invalidate();
        self.index_buffer.invalidate();
        self.input_layout.invalidate();
        self.render_uavs.invalidate();
        self.blend_state.invalidate();
        self.depth_state.invalidate();
        self.rasterizer_state.invalidate();
        self.surfaces.invalidate();
        self.depth_surface.invalidate();
        self.topology = PrimitiveTopology::Undefined;
        self.viewports_dirty = !self.viewports.is_empty();
        self.scissors_dirty = !self.scissors.is_empty();
    }
}

fn expect_kind(resource: &GraphicsResource, allowed: &[ResourceKind]) -> HalResult<()> {
    let kind = resource.kind();
    if allowed.contains(&kind) {
        Ok(())
    } else {
        Err(HalError::invalid(format!("'{}' is a {kind:?}, expected one of {allowed:?}", resource.name())))
    }
}

fn select_map_mode(resource: &GraphicsResource, map_type: MapType) -> HalResult<NativeMapMode> {
    let flags = resource.flags();
    let denied = |reason: &str| HalError::InvalidMapAccess {
        name: resource.name().to_string(),
        reason: reason.to_string(),
    };

    match map_type {
        MapType::Read => {
            if !flags.contains(ResourceFlags::CPU_READ) {
                return Err(denied("resource is not CPU-readable"));
            }
            Ok(if flags.contains(ResourceFlags::CPU_WRITE) { NativeMapMode::ReadWrite } else { NativeMapMode::Read })
        }
        MapType::Write => {
            if !flags.contains(ResourceFlags::CPU_WRITE) {
                return Err(denied("resource is not CPU-writable"));
            }
            let kind = resource.kind();
            let geometry = matches!(kind, ResourceKind::VertexBuffer | ResourceKind::IndexBuffer);
            let write_only = !flags.contains(ResourceFlags::CPU_READ) && kind != ResourceKind::ConstantBuffer;
            Ok(if geometry || write_only { NativeMapMode::WriteNoOverwrite } else { NativeMapMode::Write })
        }
        MapType::Discard => {
            if !flags.contains(ResourceFlags::CPU_WRITE) {
                return Err(denied("resource is not CPU-writable"));
            }
            Ok(NativeMapMode::WriteDiscard)
        }
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("kind", &self.kind)
            .field("recording", &self.draw_info.began)
            .field("frame", &self.tracker.frame())
            .field("tracked_lists", &self.tracker.tracked())
            .finish_non_exhaustive()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.closed.clear();
        self.executed.clear();
        self.tracker.drain(self.native.as_mut());
    }
}
