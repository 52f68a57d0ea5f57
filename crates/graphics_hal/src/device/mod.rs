//! Graphics device
//!
//! The device owns the backend device, creates resources and state objects,
//! runs the frame-boundary task queues and defers the release of native
//! objects until the GPU can no longer reference them.

mod capabilities;

pub use capabilities::DeviceCapabilities;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::{Receiver, Sender};

use crate::backend::headless::HeadlessDevice;
use crate::backend::vulkan::VulkanDevice;
use crate::backend::{ContextKind, IndexFormat, NativeDevice, NativeObject, NativeResource};
use crate::binding::Bindable;
use crate::config::{BackendKind, HalConfig};
use crate::foundation::sync::{self, lock};
use crate::queue::{CommandQueue, FrameStats};
use crate::resource::{Format, GraphicsPriority, GraphicsResource, ResourceDesc, ResourceFlags, ResourceKind, ResourceTask};
use crate::shader::{
    input_elements, BlendDesc, BlendState, DepthStencilDesc, DepthStencilState, RasterizerDesc, RasterizerState,
    SamplerDesc, ShaderComposition, ShaderSampler, StateDesc, StateObject, VertexFormat, VertexInputLayout,
};
use crate::{HalError, HalResult};

/// Resource task waiting for a frame boundary
pub(crate) struct FrameTask {
    resource: Arc<GraphicsResource>,
    task: Box<dyn ResourceTask>,
}

impl FrameTask {
    pub(crate) fn new(resource: Arc<GraphicsResource>, task: Box<dyn ResourceTask>) -> Self {
        Self { resource, task }
    }
}

struct TaskChannel {
    tx: Sender<FrameTask>,
    rx: Receiver<FrameTask>,
}

impl TaskChannel {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRelease {
    frame: u64,
    object: NativeObject,
}

/// Backend device plus the shared services every queue relies on
pub struct GraphicsDevice {
    native: Box<dyn NativeDevice>,
    capabilities: DeviceCapabilities,
    config: HalConfig,
    frame_tasks: [TaskChannel; 2],
    release_tx: Sender<PendingRelease>,
    release_rx: Receiver<PendingRelease>,
    delayed: Mutex<VecDeque<PendingRelease>>,
    frame: AtomicU64,
    shutting_down: AtomicBool,
    allocated_vram: AtomicU64,
    samplers: Mutex<HashMap<SamplerDesc, Arc<ShaderSampler>>>,
    weak_self: Weak<Self>,
}

impl GraphicsDevice {
    /// Wrap a backend device
    ///
    /// Capability overrides from `config` replace the limits the backend
    /// reports.
    pub fn new(native: Box<dyn NativeDevice>, config: HalConfig) -> HalResult<Arc<Self>> {
        config.validate().map_err(HalError::Initialization)?;
        let capabilities = config.capabilities_override.clone().unwrap_or_else(|| native.capabilities());
        capabilities.validate().map_err(HalError::Initialization)?;

        log::info!(
            "Graphics device '{}' for '{}' (release delay {} frames)",
            native.name(),
            config.application_name,
            config.release_delay_frames
        );

        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        Ok(Arc::new_cyclic(|weak_self| Self {
            native,
            capabilities,
            config,
            frame_tasks: [TaskChannel::new(), TaskChannel::new()],
            release_tx,
            release_rx,
            delayed: Mutex::new(VecDeque::new()),
            frame: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            allocated_vram: AtomicU64::new(0),
            samplers: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        }))
    }

    /// Create the backend named by `config`
    pub fn from_config(config: HalConfig) -> HalResult<Arc<Self>> {
        let native: Box<dyn NativeDevice> = match config.backend {
            BackendKind::Headless => Box::new(HeadlessDevice::default()),
            BackendKind::Vulkan => Box::new(VulkanDevice::new(&config)?),
        };
        Self::new(native, config)
    }

    /// Create a command queue with its own native context
    pub fn create_queue(self: &Arc<Self>, kind: ContextKind) -> HalResult<CommandQueue> {
        let context = self.native.create_context(kind)?;
        Ok(CommandQueue::new(Arc::clone(self), context))
    }

    /// Create a buffer or texture
    pub fn create_resource(
        &self,
        name: impl Into<String>,
        desc: ResourceDesc,
        initial_data: Option<&[u8]>,
    ) -> HalResult<Arc<GraphicsResource>> {
        let name = name.into();
        desc.validate(&self.capabilities)
            .map_err(|reason| HalError::Creation(format!("'{name}': {reason}")))?;
        if let Some(data) = initial_data {
            if data.len() as u64 > desc.byte_size() {
                return Err(HalError::Creation(format!(
                    "'{name}': {} bytes of initial data exceed {} bytes",
                    data.len(),
                    desc.byte_size()
                )));
            }
        }

        let native = self.create_native_resource(&desc, initial_data)?;
        log::debug!("Created {:?} '{}' ({} bytes)", desc.kind, name, native.size_in_bytes);
        Ok(Arc::new(GraphicsResource::new(name, desc, native, self.weak_self.clone())))
    }

    /// Create a vertex buffer filled with `vertices`
    pub fn create_vertex_buffer<T: bytemuck::Pod>(
        &self,
        name: impl Into<String>,
        format: VertexFormat,
        vertices: &[T],
        flags: ResourceFlags,
    ) -> HalResult<Arc<GraphicsResource>> {
        let size = std::mem::size_of::<T>() as u32;
        if size != format.stride() {
            return Err(HalError::Creation(format!(
                "vertex type is {size} bytes but the format stride is {}",
                format.stride()
            )));
        }
        let desc = ResourceDesc::vertex_buffer(format, vertices.len() as u32, flags);
        self.create_resource(name, desc, Some(bytemuck::cast_slice(vertices)))
    }

    /// Create an index buffer of `u16` or `u32` indices
    pub fn create_index_buffer<T: bytemuck::Pod>(
        &self,
        name: impl Into<String>,
        indices: &[T],
        flags: ResourceFlags,
    ) -> HalResult<Arc<GraphicsResource>> {
        let format = match std::mem::size_of::<T>() {
            2 => IndexFormat::U16,
            4 => IndexFormat::U32,
            size => return Err(HalError::Creation(format!("{size}-byte indices are not supported"))),
        };
        let desc = ResourceDesc::index_buffer(format, indices.len() as u32, flags);
        self.create_resource(name, desc, Some(bytemuck::cast_slice(indices)))
    }

    /// Create a CPU-writable constant buffer
    pub fn create_constant_buffer(&self, name: impl Into<String>, size_in_bytes: u64) -> HalResult<Arc<GraphicsResource>> {
        self.create_resource(name, ResourceDesc::constant_buffer(size_in_bytes), None)
    }

    /// Create a sampled 2D texture
    pub fn create_texture(
        &self,
        name: impl Into<String>,
        width: u32,
        height: u32,
        format: Format,
        data: Option<&[u8]>,
    ) -> HalResult<Arc<GraphicsResource>> {
        let desc = ResourceDesc::texture(width, height, 1, format, ResourceFlags::GPU_READ);
        self.create_resource(name, desc, data)
    }

    /// Create a render target
    pub fn create_surface(&self, name: impl Into<String>, width: u32, height: u32, format: Format) -> HalResult<Arc<GraphicsResource>> {
        self.create_resource(name, ResourceDesc::surface(width, height, format), None)
    }

    /// Create a depth-stencil target
    pub fn create_depth_surface(
        &self,
        name: impl Into<String>,
        width: u32,
        height: u32,
        format: Format,
    ) -> HalResult<Arc<GraphicsResource>> {
        self.create_resource(name, ResourceDesc::depth_surface(width, height, format), None)
    }

    /// Create a CPU-readable resource shaped like `source`
    pub fn create_staging_for(&self, source: &GraphicsResource) -> HalResult<Arc<GraphicsResource>> {
        let desc = ResourceDesc::staging_for(&source.desc());
        self.create_resource(format!("{} (staging)", source.name()), desc, None)
    }

    pub(crate) fn create_native_resource(&self, desc: &ResourceDesc, data: Option<&[u8]>) -> HalResult<NativeResource> {
        if desc.kind == ResourceKind::DepthSurface && !desc.format.is_depth() {
            return Err(HalError::Unsupported(format!("{:?} as a depth format", desc.format)));
        }
        let native = self.native.create_resource(desc, data)?;
        self.allocated_vram.fetch_add(native.size_in_bytes, Ordering::AcqRel);
        Ok(native)
    }

    /// Sampler for `desc`, shared with every other request for the same description
    pub fn get_sampler(&self, desc: &SamplerDesc) -> HalResult<Arc<ShaderSampler>> {
        let mut samplers = lock(&self.samplers);
        if let Some(sampler) = samplers.get(desc) {
            return Ok(Arc::clone(sampler));
        }
        let native = self.native.create_sampler(desc)?;
        let sampler = StateObject::new(desc.clone(), native, self.weak_self.clone());
        samplers.insert(desc.clone(), Arc::clone(&sampler));
        log::trace!("Cached sampler {native} ({} cached)", samplers.len());
        Ok(sampler)
    }

    /// Create a blend state object
    pub fn create_blend_state(&self, desc: BlendDesc) -> HalResult<Arc<BlendState>> {
        let native = self.native.create_state(&StateDesc::Blend(desc.clone()))?;
        Ok(StateObject::new(desc, native, self.weak_self.clone()))
    }

    /// Create a depth-stencil state object
    pub fn create_depth_state(&self, desc: DepthStencilDesc) -> HalResult<Arc<DepthStencilState>> {
        let native = self.native.create_state(&StateDesc::DepthStencil(desc.clone()))?;
        Ok(StateObject::new(desc, native, self.weak_self.clone()))
    }

    /// Create a rasterizer state object
    pub fn create_rasterizer_state(&self, desc: RasterizerDesc) -> HalResult<Arc<RasterizerState>> {
        let native = self.native.create_state(&StateDesc::Rasterizer(desc.clone()))?;
        Ok(StateObject::new(desc, native, self.weak_self.clone()))
    }

    /// Create an input layout binding `vertex_shader` to per-slot vertex formats
    pub fn create_input_layout(
        &self,
        vertex_shader: &ShaderComposition,
        signature: Vec<Option<VertexFormat>>,
    ) -> HalResult<Arc<VertexInputLayout>> {
        let elements = input_elements(&signature);
        let shader = vertex_shader.native_handle();
        let native = self.native.create_input_layout(shader, &elements)?;
        log::debug!("Created input layout {native} with {} elements", elements.len());
        Ok(Arc::new(VertexInputLayout::new(native, shader, signature, self.weak_self.clone())))
    }

    /// Queue a native object for release once the GPU is done with it
    ///
    /// Releases immediately when the device is shutting down.
    pub fn mark_for_release(&self, object: NativeObject) {
        if self.shutting_down.load(Ordering::Acquire) {
            self.release_now(object);
            return;
        }
        let pending = PendingRelease { frame: self.frame_index(), object };
        if let Err(err) = self.release_tx.send(pending) {
            self.release_now(err.into_inner().object);
        }
    }

    /// Number of native objects waiting for release
    pub fn pending_release_count(&self) -> usize {
        let delayed = lock(&self.delayed).len();
        self.release_rx.len() + delayed
    }

    /// Release every queued object whose delay has elapsed
    pub fn dispose_marked(&self) {
        let frame = self.frame_index();
        let delay = u64::from(self.config.release_delay_frames);
        let mut delayed = lock(&self.delayed);
        delayed.extend(self.release_rx.try_iter());

        let before = delayed.len();
        delayed.retain(|pending| {
            if pending.frame + delay <= frame {
                self.release_now(pending.object);
                false
            } else {
                true
            }
        });
        let released = before - delayed.len();
        if released > 0 {
            log::debug!("Released {released} native objects at frame {frame} ({} pending)", delayed.len());
        }
    }

    fn release_now(&self, object: NativeObject) {
        if let NativeObject::Resource(resource) = object {
            let _ = self
                .allocated_vram
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| Some(used.saturating_sub(resource.size_in_bytes)));
        }
        self.native.release(object);
    }

    pub(crate) fn push_frame_task(&self, priority: GraphicsPriority, task: FrameTask) -> HalResult<()> {
        let slot = priority
            .frame_slot()
            .ok_or_else(|| HalError::invalid(format!("{priority:?} is not a frame priority")))?;
        log::trace!("Queued {priority:?} task '{}' on '{}'", task.task.label(), task.resource.name());
        self.frame_tasks[slot]
            .tx
            .send(task)
            .map_err(|_| HalError::invalid("Frame task queue disconnected"))
    }

    /// Number of tasks waiting for the given frame boundary
    pub fn pending_frame_tasks(&self, priority: GraphicsPriority) -> usize {
        priority.frame_slot().map_or(0, |slot| self.frame_tasks[slot].rx.len())
    }

    /// Run the tasks queued for a frame boundary in FIFO order
    ///
    /// Tasks queued while draining wait for the next boundary. Every task
    /// runs even if an earlier one fails; the first failure is returned.
    fn run_frame_tasks(&self, priority: GraphicsPriority, queue: &mut CommandQueue) -> HalResult<()> {
        let Some(slot) = priority.frame_slot() else {
            return Ok(());
        };
        let channel = &self.frame_tasks[slot];
        let mut first_error = None;

        for _ in 0..channel.rx.len() {
            let Ok(FrameTask { resource, mut task }) = channel.rx.try_recv() else {
                break;
            };
            if let Err(err) = resource.process_task(queue, task.as_mut()) {
                log::error!("{priority:?} task '{}' on '{}' failed: {}", task.label(), resource.name(), err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Start a frame on the primary `queue`
    ///
    /// Advances the frame counter once, resets the queue's per-frame
    /// bookkeeping, releases objects whose delay has elapsed and runs
    /// start-of-frame tasks. Other queues call [`CommandQueue::start_frame`]
    /// afterwards to retire their own lists.
    pub fn begin_frame(&self, queue: &mut CommandQueue) -> HalResult<()> {
        let frame = self.frame.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("Begin frame {frame}");
        queue.start_frame();
        self.dispose_marked();
        self.run_frame_tasks(GraphicsPriority::StartOfFrame, queue)
    }

    /// Finish a frame on the primary `queue` after presentation
    ///
    /// Runs end-of-frame tasks and returns the frame's profiler counters.
    pub fn end_frame(&self, queue: &mut CommandQueue) -> HalResult<FrameStats> {
        let result = self.run_frame_tasks(GraphicsPriority::EndOfFrame, queue);
        let stats = queue.end_frame();
        result.map(|()| stats)
    }

    /// Limits used to size the binding-slot groups
    pub const fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Configuration the device was created with
    pub const fn config(&self) -> &HalConfig {
        &self.config
    }

    /// Bytes held by live native resources
    pub fn allocated_vram(&self) -> u64 {
        self.allocated_vram.load(Ordering::Acquire)
    }

    /// Frames begun so far
    pub fn frame_index(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Whether [`Self::shutdown`] has run
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Backend device
    pub fn native(&self) -> &dyn NativeDevice {
        self.native.as_ref()
    }

    /// Wait for the GPU, then release every queued and cached object
    ///
    /// Objects dropped after shutdown are released immediately.
    pub fn shutdown(&self) -> HalResult<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("Shutting down graphics device '{}'", self.native.name());
        self.native.wait_idle()?;
        self.release_pending();

        // Cached samplers release themselves on drop once nothing else holds them.
        let samplers = std::mem::take(&mut *lock(&self.samplers));
        drop(samplers);
        Ok(())
    }

    fn release_pending(&self) {
        let mut delayed = lock(&self.delayed);
        delayed.extend(self.release_rx.try_iter());
        let count = delayed.len();
        for pending in delayed.drain(..) {
            self.release_now(pending.object);
        }
        if count > 0 {
            log::debug!("Released {count} pending native objects");
        }
    }
}

impl std::fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("backend", &self.native.name())
            .field("frame", &self.frame_index())
            .field("allocated_vram", &self.allocated_vram())
            .field("pending_release", &self.pending_release_count())
            .finish_non_exhaustive()
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        if let Err(err) = self.native.wait_idle() {
            log::warn!("wait_idle failed during device drop: {err}");
        }
        self.release_pending();

        // Samplers cannot reach the device from their own drop any more.
        let samplers = std::mem::take(sync::get_mut(&mut self.samplers));
        for (_, sampler) in samplers {
            if Arc::strong_count(&sampler) == 1 {
                self.native.release(NativeObject::Object(sampler.native_handle()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessDevice;
    use crate::resource::SetDataTask;

    fn device() -> Arc<GraphicsDevice> {
        GraphicsDevice::new(Box::new(HeadlessDevice::default()), HalConfig::default()).unwrap()
    }

    #[test]
    fn test_capability_override() {
        let caps = DeviceCapabilities::default().with_max_compute_groups([64, 64, 1]);
        let config = HalConfig::default().with_capabilities(caps);
        let device = GraphicsDevice::new(Box::new(HeadlessDevice::default()), config).unwrap();
        assert_eq!(device.capabilities().max_compute_groups, [64, 64, 1]);
    }

    #[test]
    fn test_sampler_cache_shares_objects() {
        let device = device();
        let a = device.get_sampler(&SamplerDesc::default()).unwrap();
        let b = device.get_sampler(&SamplerDesc::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_release_waits_for_delay() {
        let device = device();
        let mut queue = device.create_queue(ContextKind::Immediate).unwrap();
        let buffer = device.create_constant_buffer("cb", 256).unwrap();
        assert_eq!(device.allocated_vram(), 256);

        drop(buffer);
        assert_eq!(device.pending_release_count(), 1);

        // Default delay is two frames.
        device.begin_frame(&mut queue).unwrap();
        assert_eq!(device.pending_release_count(), 1);
        assert_eq!(device.allocated_vram(), 256);

        device.begin_frame(&mut queue).unwrap();
        assert_eq!(device.pending_release_count(), 0);
        assert_eq!(device.allocated_vram(), 0);
    }

    #[test]
    fn test_release_is_immediate_after_shutdown() {
        let device = device();
        let buffer = device.create_constant_buffer("cb", 64).unwrap();
        device.shutdown().unwrap();
        drop(buffer);
        assert_eq!(device.pending_release_count(), 0);
        assert_eq!(device.allocated_vram(), 0);
    }

    #[test]
    fn test_frame_tasks_run_at_their_boundary_in_order() {
        let device = device();
        let mut queue = device.create_queue(ContextKind::Immediate).unwrap();
        let buffer = device.create_constant_buffer("cb", 16).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (priority, tag) in [
            (GraphicsPriority::EndOfFrame, "end-1"),
            (GraphicsPriority::StartOfFrame, "start-1"),
            (GraphicsPriority::StartOfFrame, "start-2"),
        ] {
            let order = Arc::clone(&order);
            buffer
                .queue_task(priority, move |_: &mut CommandQueue, _: &GraphicsResource| -> HalResult<bool> {
                    order.lock().unwrap().push(tag);
                    Ok(false)
                })
                .unwrap();
        }
        assert_eq!(device.pending_frame_tasks(GraphicsPriority::StartOfFrame), 2);

        device.begin_frame(&mut queue).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["start-1", "start-2"]);

        device.end_frame(&mut queue).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["start-1", "start-2", "end-1"]);
    }

    #[test]
    fn test_frame_task_failure_does_not_stop_the_bucket() {
        let device = device();
        let mut queue = device.create_queue(ContextKind::Immediate).unwrap();
        let buffer = device.create_constant_buffer("cb", 16).unwrap();

        // 32 bytes overflow the 16-byte buffer.
        buffer.queue_task(GraphicsPriority::StartOfFrame, SetDataTask::new(vec![0; 32])).unwrap();
        buffer.queue_task(GraphicsPriority::StartOfFrame, SetDataTask::new(vec![1; 16])).unwrap();

        assert!(device.begin_frame(&mut queue).is_err());
        assert_eq!(device.pending_frame_tasks(GraphicsPriority::StartOfFrame), 0);
    }

    #[test]
    fn test_initial_data_larger_than_resource_rejected() {
        let device = device();
        let desc = ResourceDesc::constant_buffer(4);
        assert!(matches!(device.create_resource("cb", desc, Some(&[0; 8])), Err(HalError::Creation(_))));
    }

    #[test]
    fn test_index_buffer_rejects_byte_indices() {
        let device = device();
        assert!(device.create_index_buffer("ib", &[0u8, 1, 2], ResourceFlags::GPU_READ).is_err());
        let ib = device.create_index_buffer("ib", &[0u16, 1, 2], ResourceFlags::GPU_READ).unwrap();
        assert_eq!(ib.stride(), 2);
    }
}
