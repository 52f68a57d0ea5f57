//! Headless backend
//!
//! Behaves like an immediate-mode, driver-managed API without a GPU: resource
//! memory lives on the CPU, the immediate context executes calls as they are
//! issued, and deferred contexts record calls that are replayed by
//! `execute`. Every executed call is appended to a log that tests inspect
//! through [`HeadlessDevice::calls`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    CommandListFlags, CommandListLevel, ContextKind, DebugMessage, DebugSeverity, IndexFormat, MappedRegion,
    NativeCommandList, NativeContext, NativeDevice, NativeHandle, NativeMapMode, NativeObject, NativeResource, Rect,
    ResourceRegion, VertexBufferBinding, Viewport,
};
use crate::device::DeviceCapabilities;
use crate::foundation::sync::lock;
use crate::resource::{ResourceDesc, ResourceFlags, ResourceKind};
use crate::shader::{InputElement, PrimitiveTopology, SamplerDesc, ShaderStageKind, StateDesc};
use crate::{HalError, HalResult};

/// Native call as executed by the headless backend
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    /// Program bound to a stage
    SetShader {
        /// Stage receiving the program
        stage: ShaderStageKind,
        /// Program handle, null to unbind
        program: NativeHandle,
    },
    /// Constant buffers bound
    SetConstantBuffers {
        /// Stage receiving the buffers
        stage: ShaderStageKind,
        /// First slot written
        first: u32,
        /// One handle per slot from `first`
        buffers: Vec<NativeHandle>,
    },
    /// Shader-resource views bound
    SetShaderResources {
        /// Stage receiving the views
        stage: ShaderStageKind,
        /// First slot written
        first: u32,
        /// One view per slot from `first`
        views: Vec<NativeHandle>,
    },
    /// Samplers bound
    SetSamplers {
        /// Stage receiving the samplers
        stage: ShaderStageKind,
        /// First slot written
        first: u32,
        /// One sampler per slot from `first`
        samplers: Vec<NativeHandle>,
    },
    /// Unordered-access views bound
    SetUnorderedAccessViews {
        /// Stage receiving the views
        stage: ShaderStageKind,
        /// First slot written
        first: u32,
        /// One view per slot from `first`
        views: Vec<NativeHandle>,
    },
    /// Vertex buffers bound
    SetVertexBuffers {
        /// First input slot written
        first: u32,
        /// One binding per slot from `first`
        buffers: Vec<VertexBufferBinding>,
    },
    /// Index buffer bound
    SetIndexBuffer {
        /// Buffer handle, null to unbind
        buffer: NativeHandle,
        /// Width of one index
        format: IndexFormat,
    },
    /// Input layout bound
    SetInputLayout(NativeHandle),
    /// Topology set
    SetTopology(PrimitiveTopology),
    /// Blend state bound
    SetBlendState(NativeHandle),
    /// Depth-stencil state bound
    SetDepthStencilState(NativeHandle),
    /// Rasterizer state bound
    SetRasterizerState(NativeHandle),
    /// Viewports set
    SetViewports(Vec<Viewport>),
    /// Scissor rectangles set
    SetScissorRects(Vec<Rect>),
    /// Render targets bound
    SetRenderTargets {
        /// Color target views in slot order
        targets: Vec<NativeHandle>,
        /// Depth view, null when none
        depth: NativeHandle,
    },
    /// `draw`
    Draw {
        /// Vertices drawn
        vertex_count: u32,
        /// First vertex read
        start_vertex: u32,
    },
    /// `draw_instanced`
    DrawInstanced {
        /// Vertices per instance
        vertex_count: u32,
        /// Instances drawn
        instance_count: u32,
    },
    /// `draw_indexed`
    DrawIndexed {
        /// Indices drawn
        index_count: u32,
        /// First index read
        start_index: u32,
        /// Added to every index before the vertex fetch
        base_vertex: i32,
    },
    /// `draw_indexed_instanced`
    DrawIndexedInstanced {
        /// Indices per instance
        index_count: u32,
        /// Instances drawn
        instance_count: u32,
    },
    /// `dispatch`
    Dispatch([u32; 3]),
    /// Bytes written through the command stream
    UpdateSubresource {
        /// Destination resource
        resource: NativeHandle,
        /// Destination subresource index
        subresource: u32,
        /// Destination box, whole subresource when `None`
        region: Option<ResourceRegion>,
        /// Bytes written
        data: Vec<u8>,
        /// Bytes per source row
        row_pitch: u32,
    },
    /// Whole-resource copy
    CopyResource {
        /// Resource read
        source: NativeHandle,
        /// Resource written
        destination: NativeHandle,
    },
    /// Region copy
    CopySubresourceRegion {
        /// Resource read
        source: NativeHandle,
        /// Subresource read
        source_subresource: u32,
        /// Source box, whole subresource when `None`
        region: Option<ResourceRegion>,
        /// Resource written
        destination: NativeHandle,
        /// Subresource written
        destination_subresource: u32,
        /// Texel offset of the copy in the destination
        offset: [u32; 3],
    },
    /// Mip generation
    GenerateMips(NativeHandle),
    /// Primary list submitted
    Submit(NativeHandle),
    /// Deferred list replayed
    Execute(NativeHandle),
    /// Debug event opened
    BeginEvent(String),
    /// Debug event closed
    EndEvent,
    /// Debug marker
    Marker(String),
}

impl NativeCall {
    /// Whether the call issues GPU work
    pub const fn is_draw(&self) -> bool {
        matches!(
            self,
            Self::Draw { .. } | Self::DrawInstanced { .. } | Self::DrawIndexed { .. } | Self::DrawIndexedInstanced { .. }
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Subresource {
    offset: usize,
    len: usize,
    row_pitch: usize,
    width: usize,
    height: usize,
}

#[derive(Debug)]
struct Memory {
    bytes: Vec<u8>,
    subresources: Vec<Subresource>,
    texel_size: usize,
    is_buffer: bool,
}

impl Memory {
    fn new(desc: &ResourceDesc) -> Self {
        let is_buffer = desc.kind.is_buffer();
        let texel_size = if is_buffer { 1 } else { desc.format.bytes_per_pixel() as usize };
        let mut subresources = Vec::new();
        let mut offset = 0;

        if is_buffer {
            let len = desc.size_in_bytes as usize;
            subresources.push(Subresource { offset, len, row_pitch: len, width: len, height: 1 });
            offset = len;
        } else {
            for _ in 0..desc.array_size.max(1) {
                for level in 0..desc.mip_levels.max(1) {
                    let width = (desc.width >> level).max(1) as usize;
                    let height = (desc.height >> level).max(1) as usize;
                    let row_pitch = width * texel_size;
                    let len = row_pitch * height;
                    subresources.push(Subresource { offset, len, row_pitch, width, height });
                    offset += len;
                }
            }
        }
        Self { bytes: vec![0; offset], subresources, texel_size, is_buffer }
    }

    fn subresource(&self, index: u32) -> HalResult<Subresource> {
        self.subresources
            .get(index as usize)
            .copied()
            .ok_or_else(|| HalError::invalid(format!("subresource {index} does not exist")))
    }

    /// Byte box `(first byte, row bytes, rows)` of `region` inside `sub`
    fn region_box(&self, sub: Subresource, region: Option<ResourceRegion>) -> HalResult<(usize, usize, usize)> {
        let Some(region) = region else {
            return Ok((sub.offset, sub.row_pitch, sub.len / sub.row_pitch.max(1)));
        };
        let (left, right) = (region.left as usize, region.right as usize);
        let (top, bottom) = (region.top as usize, region.bottom as usize);
        if self.is_buffer {
            if right > sub.len || left > right {
                return Err(HalError::invalid(format!("byte range {left}..{right} exceeds {} bytes", sub.len)));
            }
            return Ok((sub.offset + left, right - left, 1));
        }
        if right > sub.width || bottom > sub.height || left > right || top > bottom {
            return Err(HalError::invalid(format!("region {region:?} exceeds {}x{}", sub.width, sub.height)));
        }
        Ok((sub.offset + top * sub.row_pitch + left * self.texel_size, (right - left) * self.texel_size, bottom - top))
    }

    fn write_rows(&mut self, start: usize, row_bytes: usize, rows: usize, pitch: usize, data: &[u8]) -> HalResult<()> {
        let needed = rows.saturating_sub(1) * pitch + row_bytes;
        if rows > 0 && data.len() < needed {
            return Err(HalError::invalid(format!("{} bytes given, {needed} needed", data.len())));
        }
        let dst_pitch = self.row_pitch_at(start);
        for row in 0..rows {
            let dst = start + row * dst_pitch;
            let src = row * pitch;
            self.bytes[dst..dst + row_bytes].copy_from_slice(&data[src..src + row_bytes]);
        }
        Ok(())
    }

    fn read_rows(&self, start: usize, row_bytes: usize, rows: usize) -> Vec<u8> {
        let pitch = self.row_pitch_at(start);
        let mut out = Vec::with_capacity(row_bytes * rows);
        for row in 0..rows {
            let src = start + row * pitch;
            out.extend_from_slice(&self.bytes[src..src + row_bytes]);
        }
        out
    }

    fn row_pitch_at(&self, byte: usize) -> usize {
        self.subresources
            .iter()
            .find(|sub| byte >= sub.offset && byte < sub.offset + sub.len.max(1))
            .map_or(1, |sub| sub.row_pitch)
    }

    /// Point-sample every mip level from the one above it
    fn generate_mips(&mut self) {
        for level in 1..self.subresources.len() {
            let (src, dst) = (self.subresources[level - 1], self.subresources[level]);
            if src.offset + src.len != dst.offset {
                continue;
            }
            for y in 0..dst.height {
                for x in 0..dst.width {
                    let from = src.offset + (y * 2).min(src.height - 1) * src.row_pitch + (x * 2).min(src.width - 1) * self.texel_size;
                    let to = dst.offset + y * dst.row_pitch + x * self.texel_size;
                    self.bytes.copy_within(from..from + self.texel_size, to);
                }
            }
        }
    }
}

type SharedMemory = Arc<Mutex<Memory>>;

#[derive(Debug, Default)]
struct Shared {
    next_handle: AtomicU64,
    memory: Mutex<HashMap<NativeHandle, SharedMemory>>,
    released: Mutex<Vec<NativeObject>>,
    calls: Mutex<Vec<NativeCall>>,
    debug: Mutex<Vec<DebugMessage>>,
    recorded: Mutex<HashMap<NativeHandle, Vec<NativeCall>>>,
    gpu_busy: AtomicBool,
}

impl Shared {
    fn handle(&self) -> NativeHandle {
        NativeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn memory(&self, handle: NativeHandle) -> HalResult<SharedMemory> {
        lock(&self.memory)
            .get(&handle)
            .cloned()
            .ok_or_else(|| HalError::invalid(format!("no memory behind {handle}")))
    }

    /// Perform a call's memory effects and log it
    fn execute(&self, call: NativeCall) -> HalResult<()> {
        let result = match &call {
            NativeCall::UpdateSubresource { resource, subresource, region, data, row_pitch } => {
                self.update(*resource, *subresource, *region, data, *row_pitch as usize)
            }
            NativeCall::CopyResource { source, destination } => self.copy(*source, *destination),
            NativeCall::CopySubresourceRegion { source, source_subresource, region, destination, destination_subresource, offset } => {
                self.copy_region(*source, *source_subresource, *region, *destination, *destination_subresource, *offset)
            }
            NativeCall::GenerateMips(resource) => self.memory(*resource).map(|memory| {
                lock(&memory).generate_mips();
            }),
            _ => Ok(()),
        };
        log::trace!("headless: {call:?}");
        lock(&self.calls).push(call);
        result
    }

    fn update(&self, handle: NativeHandle, subresource: u32, region: Option<ResourceRegion>, data: &[u8], pitch: usize) -> HalResult<()> {
        let memory = self.memory(handle)?;
        let mut memory = lock(&memory);
        let sub = memory.subresource(subresource)?;
        if region.is_none() {
            if data.len() > sub.len {
                return Err(HalError::invalid(format!("{} bytes exceed subresource of {} bytes", data.len(), sub.len)));
            }
            memory.bytes[sub.offset..sub.offset + data.len()].copy_from_slice(data);
            return Ok(());
        }
        let (start, row_bytes, rows) = memory.region_box(sub, region)?;
        memory.write_rows(start, row_bytes, rows, pitch.max(row_bytes), data)
    }

    fn copy(&self, source: NativeHandle, destination: NativeHandle) -> HalResult<()> {
        let bytes = lock(&*self.memory(source)?).bytes.clone();
        let destination = self.memory(destination)?;
        let mut destination = lock(&destination);
        if destination.bytes.len() != bytes.len() {
            return Err(HalError::invalid("copy between resources of different sizes"));
        }
        destination.bytes.copy_from_slice(&bytes);
        Ok(())
    }

    fn copy_region(
        &self,
        source: NativeHandle,
        source_subresource: u32,
        region: Option<ResourceRegion>,
        destination: NativeHandle,
        destination_subresource: u32,
        offset: [u32; 3],
    ) -> HalResult<()> {
        let (bytes, row_bytes, rows, texel_size) = {
            let memory = self.memory(source)?;
            let memory = lock(&memory);
            let sub = memory.subresource(source_subresource)?;
            let (start, row_bytes, rows) = memory.region_box(sub, region)?;
            (memory.read_rows(start, row_bytes, rows), row_bytes, rows, memory.texel_size)
        };

        let memory = self.memory(destination)?;
        let mut memory = lock(&memory);
        let sub = memory.subresource(destination_subresource)?;
        let width = (row_bytes / texel_size.max(1)) as u32;
        let target = if memory.is_buffer {
            ResourceRegion::bytes(offset[0], row_bytes as u32)
        } else {
            ResourceRegion {
                left: offset[0],
                top: offset[1],
                front: offset[2],
                right: offset[0] + width,
                bottom: offset[1] + rows as u32,
                back: offset[2] + 1,
            }
        };
        let (start, dst_row_bytes, dst_rows) = memory.region_box(sub, Some(target))?;
        memory.write_rows(start, dst_row_bytes, dst_rows, row_bytes, &bytes)
    }
}

/// Headless native device
///
/// Cloning yields another handle to the same device, so tests can keep one
/// to inspect the call log after moving the other into a
/// [`crate::device::GraphicsDevice`].
#[derive(Debug, Clone, Default)]
pub struct HeadlessDevice {
    capabilities: DeviceCapabilities,
    shared: Arc<Shared>,
}

impl HeadlessDevice {
    /// Device reporting `capabilities`
    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self { capabilities, shared: Arc::default() }
    }

    /// Every call executed so far, in order
    pub fn calls(&self) -> Vec<NativeCall> {
        lock(&self.shared.calls).clone()
    }

    /// Number of executed calls matching `predicate`
    pub fn count_calls(&self, predicate: impl Fn(&NativeCall) -> bool) -> usize {
        lock(&self.shared.calls).iter().filter(|call| predicate(call)).count()
    }

    /// Forget the call log
    pub fn clear_calls(&self) {
        lock(&self.shared.calls).clear();
    }

    /// Objects released so far
    pub fn released(&self) -> Vec<NativeObject> {
        lock(&self.shared.released).clone()
    }

    /// Contents of a resource
    pub fn memory_of(&self, resource: &NativeResource) -> Option<Vec<u8>> {
        lock(&self.shared.memory).get(&resource.handle).map(|memory| lock(memory).bytes.clone())
    }

    /// Queue a debug-layer message for the next drain
    pub fn push_debug_message(&self, severity: DebugSeverity, text: impl Into<String>) {
        lock(&self.shared.debug).push(DebugMessage { severity, text: text.into() });
    }

    /// Make every command list report as still executing
    pub fn set_gpu_busy(&self, busy: bool) {
        self.shared.gpu_busy.store(busy, Ordering::Release);
    }
}

impl NativeDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    fn create_resource(&self, desc: &ResourceDesc, initial_data: Option<&[u8]>) -> HalResult<NativeResource> {
        let mut memory = Memory::new(desc);
        if let Some(data) = initial_data {
            let len = data.len().min(memory.bytes.len());
            memory.bytes[..len].copy_from_slice(&data[..len]);
        }

        let shared = &self.shared;
        let view = |wanted: bool| if wanted { shared.handle() } else { NativeHandle::NULL };
        let depth = desc.kind == ResourceKind::DepthSurface;
        let resource = NativeResource {
            handle: shared.handle(),
            shader_view: view(desc.flags.contains(ResourceFlags::GPU_READ)),
            unordered_view: view(desc.flags.contains(ResourceFlags::UNORDERED_ACCESS)),
            target_view: view(desc.kind == ResourceKind::Surface),
            depth_view: view(depth),
            read_only_depth_view: view(depth),
            size_in_bytes: memory.bytes.len() as u64,
        };
        lock(&shared.memory).insert(resource.handle, Arc::new(Mutex::new(memory)));
        Ok(resource)
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> HalResult<NativeHandle> {
        Ok(self.shared.handle())
    }

    fn create_state(&self, _desc: &StateDesc) -> HalResult<NativeHandle> {
        Ok(self.shared.handle())
    }

    fn create_input_layout(&self, vertex_shader: NativeHandle, _elements: &[InputElement]) -> HalResult<NativeHandle> {
        if vertex_shader.is_null() {
            return Err(HalError::Creation("input layout needs a vertex shader".into()));
        }
        Ok(self.shared.handle())
    }

    fn release(&self, object: NativeObject) {
        if let NativeObject::Resource(resource) = object {
            lock(&self.shared.memory).remove(&resource.handle);
        }
        lock(&self.shared.released).push(object);
    }

    fn create_context(&self, kind: ContextKind) -> HalResult<Box<dyn NativeContext>> {
        Ok(Box::new(HeadlessContext { kind, shared: Arc::clone(&self.shared), recording: None }))
    }

    fn wait_idle(&self) -> HalResult<()> {
        Ok(())
    }
}

struct Recording {
    list: NativeHandle,
    calls: Vec<NativeCall>,
}

/// Immediate or deferred headless context
struct HeadlessContext {
    kind: ContextKind,
    shared: Arc<Shared>,
    recording: Option<Recording>,
}

impl HeadlessContext {
    fn issue(&mut self, call: NativeCall) -> HalResult<()> {
        match (self.kind, self.recording.as_mut()) {
            (ContextKind::Deferred, Some(recording)) => {
                recording.calls.push(call);
                Ok(())
            }
            (ContextKind::Deferred, None) => Err(HalError::NotRecording),
            (ContextKind::Immediate, _) => self.shared.execute(call),
        }
    }

    fn record(&mut self, call: NativeCall) {
        if let Err(err) = self.issue(call) {
            log::error!("headless: {err}");
        }
    }
}

struct HeadlessRegion {
    bytes: Vec<u8>,
    memory: SharedMemory,
    offset: usize,
    write_back: bool,
}

impl MappedRegion for HeadlessRegion {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for HeadlessRegion {
    fn drop(&mut self) {
        if self.write_back {
            let mut memory = lock(&self.memory);
            let end = self.offset + self.bytes.len();
            memory.bytes[self.offset..end].copy_from_slice(&self.bytes);
        }
    }
}

impl NativeContext for HeadlessContext {
    fn kind(&self) -> ContextKind {
        self.kind
    }

    fn begin(&mut self, _flags: CommandListFlags, reuse: Option<NativeCommandList>) -> HalResult<()> {
        let list = reuse.map_or_else(|| self.shared.handle(), |list| list.handle);
        self.recording = Some(Recording { list, calls: Vec::new() });
        Ok(())
    }

    fn end(&mut self, flags: CommandListFlags) -> HalResult<NativeCommandList> {
        let recording = self.recording.take().ok_or(HalError::NotRecording)?;
        let level = match self.kind {
            ContextKind::Immediate => CommandListLevel::Primary,
            ContextKind::Deferred => CommandListLevel::Secondary,
        };
        if self.kind == ContextKind::Deferred {
            lock(&self.shared.recorded).insert(recording.list, recording.calls);
        }
        let fence = if flags.contains(CommandListFlags::CPU_SYNCABLE) { self.shared.handle() } else { NativeHandle::NULL };
        Ok(NativeCommandList { handle: recording.list, fence, level })
    }

    fn submit(&mut self, list: &NativeCommandList, _flags: CommandListFlags) -> HalResult<()> {
        self.shared.execute(NativeCall::Submit(list.handle))
    }

    fn execute(&mut self, list: &NativeCommandList) -> HalResult<()> {
        let calls = lock(&self.shared.recorded)
            .get(&list.handle)
            .cloned()
            .ok_or_else(|| HalError::invalid(format!("command list {} was never recorded", list.handle)))?;
        self.issue(NativeCall::Execute(list.handle))?;
        for call in calls {
            self.issue(call)?;
        }
        Ok(())
    }

    fn is_complete(&self, _list: &NativeCommandList) -> bool {
        !self.shared.gpu_busy.load(Ordering::Acquire)
    }

    fn free_list(&mut self, list: NativeCommandList) {
        lock(&self.shared.recorded).remove(&list.handle);
    }

    fn set_shader(&mut self, stage: ShaderStageKind, program: NativeHandle, _layout: NativeHandle) {
        self.record(NativeCall::SetShader { stage, program });
    }

    fn set_constant_buffers(&mut self, stage: ShaderStageKind, first_slot: u32, buffers: &[NativeHandle]) {
        self.record(NativeCall::SetConstantBuffers { stage, first: first_slot, buffers: buffers.to_vec() });
    }

    fn set_shader_resources(&mut self, stage: ShaderStageKind, first_slot: u32, views: &[NativeHandle]) {
        self.record(NativeCall::SetShaderResources { stage, first: first_slot, views: views.to_vec() });
    }

    fn set_samplers(&mut self, stage: ShaderStageKind, first_slot: u32, samplers: &[NativeHandle]) {
        self.record(NativeCall::SetSamplers { stage, first: first_slot, samplers: samplers.to_vec() });
    }

    fn set_unordered_access_views(&mut self, stage: ShaderStageKind, first_slot: u32, views: &[NativeHandle]) {
        self.record(NativeCall::SetUnorderedAccessViews { stage, first: first_slot, views: views.to_vec() });
    }

    fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[VertexBufferBinding]) {
        self.record(NativeCall::SetVertexBuffers { first: first_slot, buffers: buffers.to_vec() });
    }

    fn set_index_buffer(&mut self, buffer: NativeHandle, format: IndexFormat, _offset: u32) {
        self.record(NativeCall::SetIndexBuffer { buffer, format });
    }

    fn set_input_layout(&mut self, layout: NativeHandle) {
        self.record(NativeCall::SetInputLayout(layout));
    }

    fn set_topology(&mut self, topology: PrimitiveTopology) {
        self.record(NativeCall::SetTopology(topology));
    }

    fn set_blend_state(&mut self, state: NativeHandle, _blend_factor: [f32; 4], _sample_mask: u32) {
        self.record(NativeCall::SetBlendState(state));
    }

    fn set_depth_stencil_state(&mut self, state: NativeHandle, _stencil_ref: u32) {
        self.record(NativeCall::SetDepthStencilState(state));
    }

    fn set_rasterizer_state(&mut self, state: NativeHandle) {
        self.record(NativeCall::SetRasterizerState(state));
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.record(NativeCall::SetViewports(viewports.to_vec()));
    }

    fn set_scissor_rects(&mut self, rects: &[Rect]) {
        self.record(NativeCall::SetScissorRects(rects.to_vec()));
    }

    fn set_render_targets(&mut self, targets: &[NativeHandle], depth: NativeHandle) {
        self.record(NativeCall::SetRenderTargets { targets: targets.to_vec(), depth });
    }

    fn draw(&mut self, vertex_count: u32, start_vertex: u32) {
        self.record(NativeCall::Draw { vertex_count, start_vertex });
    }

    fn draw_instanced(&mut self, vertex_count_per_instance: u32, instance_count: u32, _start_vertex: u32, _start_instance: u32) {
        self.record(NativeCall::DrawInstanced { vertex_count: vertex_count_per_instance, instance_count });
    }

    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) {
        self.record(NativeCall::DrawIndexed { index_count, start_index, base_vertex });
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count_per_instance: u32,
        instance_count: u32,
        _start_index: u32,
        _base_vertex: i32,
        _start_instance: u32,
    ) {
        self.record(NativeCall::DrawIndexedInstanced { index_count: index_count_per_instance, instance_count });
    }

    fn dispatch(&mut self, groups: [u32; 3]) {
        self.record(NativeCall::Dispatch(groups));
    }

    fn map(&mut self, resource: &NativeResource, subresource: u32, mode: NativeMapMode) -> HalResult<Box<dyn MappedRegion>> {
        let memory = self.shared.memory(resource.handle)?;
        let (offset, bytes) = {
            let guard = lock(&memory);
            let sub = guard.subresource(subresource)?;
            let bytes = match mode {
                NativeMapMode::WriteDiscard => vec![0; sub.len],
                _ => guard.bytes[sub.offset..sub.offset + sub.len].to_vec(),
            };
            (sub.offset, bytes)
        };
        Ok(Box::new(HeadlessRegion { bytes, memory, offset, write_back: mode.can_write() }))
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
        self.issue(NativeCall::UpdateSubresource {
            resource: resource.handle,
            subresource,
            region,
            data: data.to_vec(),
            row_pitch,
        })
    }

    fn copy_resource(&mut self, source: &NativeResource, destination: &NativeResource) -> HalResult<()> {
        self.issue(NativeCall::CopyResource { source: source.handle, destination: destination.handle })
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
        self.issue(NativeCall::CopySubresourceRegion {
            source: source.handle,
            source_subresource,
            region: source_region,
            destination: destination.handle,
            destination_subresource,
            offset: destination_offset,
        })
    }

    fn generate_mips(&mut self, resource: &NativeResource) -> HalResult<()> {
        self.issue(NativeCall::GenerateMips(resource.handle))
    }

    fn begin_event(&mut self, label: &str) {
        self.record(NativeCall::BeginEvent(label.to_string()));
    }

    fn end_event(&mut self) {
        self.record(NativeCall::EndEvent);
    }

    fn set_marker(&mut self, label: &str) {
        self.record(NativeCall::Marker(label.to_string()));
    }

    fn drain_debug_messages(&mut self) -> Vec<DebugMessage> {
        std::mem::take(&mut *lock(&self.shared.debug))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Format;

    fn buffer(device: &HeadlessDevice, bytes: &[u8]) -> NativeResource {
        let desc = ResourceDesc::buffer(ResourceKind::StructuredBuffer, bytes.len() as u64, 4, ResourceFlags::GPU_READ);
        device.create_resource(&desc, Some(bytes)).unwrap()
    }

    #[test]
    fn test_views_follow_flags() {
        let device = HeadlessDevice::default();
        let surface = device.create_resource(&ResourceDesc::surface(4, 4, Format::R8G8B8A8Unorm), None).unwrap();
        assert!(!surface.target_view.is_null());
        assert!(!surface.shader_view.is_null());
        assert!(surface.depth_view.is_null());
        assert_eq!(surface.size_in_bytes, 64);
    }

    #[test]
    fn test_deferred_calls_replay_on_execute() {
        let device = HeadlessDevice::default();
        let mut deferred = device.create_context(ContextKind::Deferred).unwrap();
        let mut immediate = device.create_context(ContextKind::Immediate).unwrap();

        deferred.begin(CommandListFlags::DEFERRED, None).unwrap();
        deferred.draw(3, 0);
        let list = deferred.end(CommandListFlags::DEFERRED).unwrap();
        assert_eq!(device.count_calls(NativeCall::is_draw), 0);

        immediate.begin(CommandListFlags::empty(), None).unwrap();
        immediate.execute(&list).unwrap();
        immediate.execute(&list).unwrap();
        assert_eq!(device.count_calls(NativeCall::is_draw), 2);
    }

    #[test]
    fn test_update_and_copy_region() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let source = buffer(&device, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let destination = buffer(&device, &[0; 8]);

        ctx.update_subresource(&source, 0, Some(ResourceRegion::bytes(0, 2)), &[9, 9], 2, 2).unwrap();
        ctx.copy_subresource_region(&source, 0, Some(ResourceRegion::bytes(0, 4)), &destination, 0, [4, 0, 0])
            .unwrap();
        assert_eq!(device.memory_of(&destination).unwrap(), vec![0, 0, 0, 0, 9, 9, 3, 4]);
    }

    #[test]
    fn test_texture_region_update() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let desc = ResourceDesc::texture(4, 4, 1, Format::R8Unorm, ResourceFlags::GPU_READ);
        let texture = device.create_resource(&desc, None).unwrap();

        let region = ResourceRegion { left: 1, top: 1, front: 0, right: 3, bottom: 3, back: 1 };
        ctx.update_subresource(&texture, 0, Some(region), &[1, 2, 3, 4], 2, 4).unwrap();
        let bytes = device.memory_of(&texture).unwrap();
        assert_eq!(&bytes[4..8], &[0, 1, 2, 0]);
        assert_eq!(&bytes[8..12], &[0, 3, 4, 0]);
    }

    #[test]
    fn test_map_writes_back_on_drop() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let resource = buffer(&device, &[0; 4]);

        let mut region = ctx.map(&resource, 0, NativeMapMode::WriteDiscard).unwrap();
        region.bytes_mut().copy_from_slice(&[4, 3, 2, 1]);
        drop(region);
        assert_eq!(device.memory_of(&resource).unwrap(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_generate_mips_point_samples() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        let desc = ResourceDesc::texture(2, 2, 2, Format::R8Unorm, ResourceFlags::GPU_READ);
        let texture = device.create_resource(&desc, Some(&[7, 1, 1, 1])).unwrap();
        ctx.generate_mips(&texture).unwrap();
        assert_eq!(device.memory_of(&texture).unwrap(), vec![7, 1, 1, 1, 7]);
    }

    #[test]
    fn test_debug_messages_drain_once() {
        let device = HeadlessDevice::default();
        let mut ctx = device.create_context(ContextKind::Immediate).unwrap();
        device.push_debug_message(DebugSeverity::Warning, "unused binding");
        assert_eq!(ctx.drain_debug_messages().len(), 1);
        assert!(ctx.drain_debug_messages().is_empty());
    }
}
