//! GPU resources
//!
//! A [`GraphicsResource`] is a buffer or texture with a native representation
//! that may be recreated (resize), a version counter bumped on every
//! recreation, a FIFO of pending [`ResourceTask`]s, and a single-map guard.

mod stream;
mod task;

pub use stream::GraphicsStream;
pub use task::{CopyTask, GenerateMipsTask, GetDataTask, GraphicsPriority, ResizeTask, ResourceTask, SetDataTask};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::backend::{IndexFormat, NativeHandle, NativeObject, NativeResource};
use crate::binding::Bindable;
use crate::device::{DeviceCapabilities, FrameTask, GraphicsDevice};
use crate::foundation::sync;
use crate::queue::CommandQueue;
use crate::shader::VertexFormat;
use crate::{HalError, HalResult};

bitflags! {
    /// CPU and GPU access allowed on a resource
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceFlags: u32 {
        /// CPU may map for reading
        const CPU_READ = 1 << 0;
        /// CPU may map for writing
        const CPU_WRITE = 1 << 1;
        /// Shaders may read
        const GPU_READ = 1 << 2;
        /// GPU may write (render target, copy destination, UAV)
        const GPU_WRITE = 1 << 3;
        /// Bindable as an unordered-access view
        const UNORDERED_ACCESS = 1 << 4;
        /// Mip chain may be generated on the GPU
        const MIP_GENERATION = 1 << 5;
    }
}

/// What a resource is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Vertex data
    VertexBuffer,
    /// Index data
    IndexBuffer,
    /// Shader constants
    ConstantBuffer,
    /// Structured or raw shader data
    StructuredBuffer,
    /// CPU-accessible copy target
    StagingBuffer,
    /// Sampled texture
    Texture,
    /// Render target
    Surface,
    /// Depth-stencil target
    DepthSurface,
}

impl ResourceKind {
    /// Whether the resource is a buffer
    pub const fn is_buffer(self) -> bool {
        matches!(
            self,
            Self::VertexBuffer | Self::IndexBuffer | Self::ConstantBuffer | Self::StructuredBuffer | Self::StagingBuffer
        )
    }
}

/// CPU access requested by [`CommandQueue::map_resource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapType {
    /// Read the current contents
    Read,
    /// Write while keeping the current contents
    Write,
    /// Write the whole subresource; previous contents are undefined
    Discard,
}

/// Texel format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Format {
    /// No format (buffers)
    #[default]
    Unknown,
    /// 8-bit red
    R8Unorm,
    /// 8-bit RGBA
    R8G8B8A8Unorm,
    /// 8-bit BGRA
    B8G8R8A8Unorm,
    /// 16-bit float RGBA
    R16G16B16A16Float,
    /// 32-bit float red
    R32Float,
    /// 32-bit float RGBA
    R32G32B32A32Float,
    /// 24-bit depth, 8-bit stencil
    D24UnormS8Uint,
    /// 32-bit float depth
    D32Float,
}

impl Format {
    /// Bytes per texel
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Unknown => 1,
            Self::R8Unorm => 1,
            Self::R8G8B8A8Unorm | Self::B8G8R8A8Unorm | Self::R32Float | Self::D24UnormS8Uint | Self::D32Float => 4,
            Self::R16G16B16A16Float => 8,
            Self::R32G32B32A32Float => 16,
        }
    }

    /// Whether the format is a depth format
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::D24UnormS8Uint | Self::D32Float)
    }
}

/// Creation parameters of a resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDesc {
    /// Usage
    pub kind: ResourceKind,
    /// Access flags
    pub flags: ResourceFlags,
    /// Buffer size in bytes; ignored for textures
    pub size_in_bytes: u64,
    /// Bytes per element for buffers
    pub stride: u32,
    /// Texture width
    pub width: u32,
    /// Texture height
    pub height: u32,
    /// Texture array size
    pub array_size: u32,
    /// Texture mip levels
    pub mip_levels: u32,
    /// Texel format
    pub format: Format,
    /// Vertex layout of a vertex buffer
    pub vertex_format: Option<VertexFormat>,
}

impl ResourceDesc {
    /// Generic buffer
    pub const fn buffer(kind: ResourceKind, size_in_bytes: u64, stride: u32, flags: ResourceFlags) -> Self {
        Self {
            kind,
            flags,
            size_in_bytes,
            stride,
            width: 0,
            height: 0,
            array_size: 1,
            mip_levels: 1,
            format: Format::Unknown,
            vertex_format: None,
        }
    }

    /// Vertex buffer holding `vertex_count` vertices of `format`
    pub fn vertex_buffer(format: VertexFormat, vertex_count: u32, flags: ResourceFlags) -> Self {
        let stride = format.stride();
        Self {
            vertex_format: Some(format),
            ..Self::buffer(ResourceKind::VertexBuffer, u64::from(stride) * u64::from(vertex_count), stride, flags)
        }
    }

    /// Index buffer holding `index_count` indices
    pub const fn index_buffer(format: IndexFormat, index_count: u32, flags: ResourceFlags) -> Self {
        Self::buffer(
            ResourceKind::IndexBuffer,
            format.size() as u64 * index_count as u64,
            format.size(),
            flags,
        )
    }

    /// CPU-writable constant buffer
    pub const fn constant_buffer(size_in_bytes: u64) -> Self {
        Self::buffer(
            ResourceKind::ConstantBuffer,
            size_in_bytes,
            0,
            ResourceFlags::CPU_WRITE.union(ResourceFlags::GPU_READ),
        )
    }

    /// 2D texture
    pub const fn texture(width: u32, height: u32, mip_levels: u32, format: Format, flags: ResourceFlags) -> Self {
        Self {
            kind: ResourceKind::Texture,
            flags,
            size_in_bytes: 0,
            stride: 0,
            width,
            height,
            array_size: 1,
            mip_levels,
            format,
            vertex_format: None,
        }
    }

    /// Render target
    pub const fn surface(width: u32, height: u32, format: Format) -> Self {
        let mut desc = Self::texture(width, height, 1, format, ResourceFlags::GPU_READ.union(ResourceFlags::GPU_WRITE));
        desc.kind = ResourceKind::Surface;
        desc
    }

    /// Depth-stencil target
    pub const fn depth_surface(width: u32, height: u32, format: Format) -> Self {
        let mut desc = Self::texture(width, height, 1, format, ResourceFlags::GPU_WRITE);
        desc.kind = ResourceKind::DepthSurface;
        desc
    }

    /// CPU-readable staging copy of `source`
    pub fn staging_for(source: &Self) -> Self {
        let kind = if source.kind.is_buffer() { ResourceKind::StagingBuffer } else { ResourceKind::Texture };
        Self {
            kind,
            flags: ResourceFlags::CPU_READ | ResourceFlags::CPU_WRITE | ResourceFlags::GPU_WRITE,
            vertex_format: None,
            ..source.clone()
        }
    }

    /// Bytes occupied by the resource, including every mip level
    pub fn byte_size(&self) -> u64 {
        if self.kind.is_buffer() {
            return self.size_in_bytes;
        }
        let texel = u64::from(self.format.bytes_per_pixel());
        let layers = u64::from(self.array_size.max(1));
        (0..self.mip_levels.max(1))
            .map(|level| {
                let w = u64::from((self.width >> level).max(1));
                let h = u64::from((self.height >> level).max(1));
                w * h * texel
            })
            .sum::<u64>()
            * layers
    }

    /// Number of subresources (mips x array layers)
    pub fn subresource_count(&self) -> u32 {
        self.mip_levels.max(1) * self.array_size.max(1)
    }

    /// Bytes per row of mip level 0
    pub const fn row_pitch(&self) -> u32 {
        if self.kind.is_buffer() {
            self.size_in_bytes as u32
        } else {
            self.width * self.format.bytes_per_pixel()
        }
    }

    /// Check the description against device limits
    pub fn validate(&self, caps: &DeviceCapabilities) -> Result<(), String> {
        if self.kind.is_buffer() {
            if self.size_in_bytes == 0 {
                return Err(format!("{:?} must have a non-zero size", self.kind));
            }
            return Ok(());
        }
        if self.width == 0 || self.height == 0 {
            return Err(format!("{:?} must have non-zero dimensions", self.kind));
        }
        if self.width > caps.max_texture_dimension || self.height > caps.max_texture_dimension {
            return Err(format!(
                "{}x{} exceeds the maximum texture dimension {}",
                self.width, self.height, caps.max_texture_dimension
            ));
        }
        if (self.kind == ResourceKind::DepthSurface) != self.format.is_depth() {
            return Err(format!("{:?} cannot use format {:?}", self.kind, self.format));
        }
        Ok(())
    }
}

/// Buffer or texture shared between queues and threads
pub struct GraphicsResource {
    name: String,
    desc: RwLock<ResourceDesc>,
    native: RwLock<NativeResource>,
    version: AtomicU64,
    mapped: AtomicBool,
    task_tx: Sender<Box<dyn ResourceTask>>,
    task_rx: Receiver<Box<dyn ResourceTask>>,
    device: Weak<GraphicsDevice>,
}

impl GraphicsResource {
    pub(crate) fn new(name: impl Into<String>, desc: ResourceDesc, native: NativeResource, device: Weak<GraphicsDevice>) -> Self {
        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        Self {
            name: name.into(),
            desc: RwLock::new(desc),
            native: RwLock::new(native),
            version: AtomicU64::new(0),
            mapped: AtomicBool::new(false),
            task_tx,
            task_rx,
            device,
        }
    }

    /// Resource name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current description
    pub fn desc(&self) -> ResourceDesc {
        sync::read(&self.desc).clone()
    }

    /// Usage
    pub fn kind(&self) -> ResourceKind {
        sync::read(&self.desc).kind
    }

    /// Access flags
    pub fn flags(&self) -> ResourceFlags {
        sync::read(&self.desc).flags
    }

    /// Bytes per element
    pub fn stride(&self) -> u32 {
        sync::read(&self.desc).stride
    }

    /// Size of the native allocation
    pub fn size_in_bytes(&self) -> u64 {
        self.native().size_in_bytes
    }

    /// Vertex layout, for vertex buffers
    pub fn vertex_format(&self) -> Option<VertexFormat> {
        sync::read(&self.desc).vertex_format.clone()
    }

    /// Native objects; all null once released
    pub fn native(&self) -> NativeResource {
        *sync::read(&self.native)
    }

    /// Native objects, or an error if the resource has no live native object
    pub fn require_native(&self) -> HalResult<NativeResource> {
        let native = self.native();
        if native.is_valid() {
            Ok(native)
        } else {
            Err(HalError::Released(self.name.clone()))
        }
    }

    /// Owning device
    pub fn device(&self) -> HalResult<Arc<GraphicsDevice>> {
        self.device.upgrade().ok_or_else(|| HalError::Released(self.name.clone()))
    }

    /// Whether a map is open
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    pub(crate) fn begin_map(&self) -> HalResult<()> {
        self.mapped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| HalError::AlreadyMapped { name: self.name.clone() })
    }

    pub(crate) fn end_map(&self) -> HalResult<()> {
        self.mapped
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| HalError::NotMapped { name: self.name.clone() })
    }

    /// Whether Apply-priority tasks are waiting
    pub fn has_pending_tasks(&self) -> bool {
        !self.task_rx.is_empty()
    }

    /// Number of Apply-priority tasks waiting
    pub fn pending_task_count(&self) -> usize {
        self.task_rx.len()
    }

    /// Queue a task from any thread
    ///
    /// Apply tasks wait on this resource until it is next used by a draw or
    /// dispatch; frame-boundary tasks go to the device. Immediate tasks need a
    /// command queue and are rejected here; see [`CommandQueue::queue_resource_task`].
    pub fn queue_task<T: ResourceTask + 'static>(self: &Arc<Self>, priority: GraphicsPriority, task: T) -> HalResult<()> {
        match priority {
            GraphicsPriority::Immediate => Err(HalError::invalid(format!(
                "Immediate task on '{}' needs a command queue",
                self.name
            ))),
            GraphicsPriority::Apply => {
                log::trace!("Queued apply task '{}' on '{}'", task.label(), self.name);
                self.task_tx
                    .send(Box::new(task))
                    .map_err(|_| HalError::invalid("Resource task queue disconnected"))
            }
            GraphicsPriority::StartOfFrame | GraphicsPriority::EndOfFrame => {
                let device = self.device()?;
                device.push_frame_task(priority, FrameTask::new(Arc::clone(self), Box::new(task)))
            }
        }
    }

    /// Run a task now; bumps the version if it invalidated the native resource
    pub fn process_task(&self, queue: &mut CommandQueue, task: &mut dyn ResourceTask) -> HalResult<bool> {
        let invalidated = task.process(queue, self)?;
        if invalidated {
            self.bump_version();
        }
        Ok(invalidated)
    }

    /// Drain pending Apply tasks in enqueue order
    ///
    /// The version is bumped once if any task reported invalidation. A failing
    /// task stops the drain; tasks behind it stay queued.
    pub fn apply_changes(&self, queue: &mut CommandQueue) -> HalResult<()> {
        let mut invalidated = false;
        let mut result = Ok(());

        while let Ok(mut task) = self.task_rx.try_recv() {
            match task.process(queue, self) {
                Ok(changed) => invalidated |= changed,
                Err(err) => {
                    log::error!("Task '{}' on '{}' failed: {}", task.label(), self.name, err);
                    result = Err(err);
                    break;
                }
            }
        }

        if invalidated {
            self.bump_version();
        }
        result
    }

    /// Replace the native representation with one built from `desc`
    ///
    /// The old native objects are queued for deferred release.
    pub(crate) fn recreate(&self, desc: ResourceDesc) -> HalResult<()> {
        if self.is_mapped() {
            return Err(HalError::AlreadyMapped { name: self.name.clone() });
        }
        let device = self.device()?;
        let native = device.create_native_resource(&desc, None)?;

        let old = {
            let mut guard = sync::write(&self.native);
            std::mem::replace(&mut *guard, native)
        };
        *sync::write(&self.desc) = desc;

        if old.is_valid() {
            device.mark_for_release(NativeObject::Resource(old));
        }
        log::debug!("Recreated '{}' ({} bytes)", self.name, native.size_in_bytes);
        Ok(())
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

impl Bindable for GraphicsResource {
    fn native_handle(&self) -> NativeHandle {
        self.native().handle
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for GraphicsResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsResource")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("native", &self.native())
            .field("version", &self.version())
            .field("mapped", &self.is_mapped())
            .finish_non_exhaustive()
    }
}

impl Drop for GraphicsResource {
    fn drop(&mut self) {
        let native = self.native();
        if !native.is_valid() {
            return;
        }
        if let Some(device) = self.device.upgrade() {
            device.mark_for_release(NativeObject::Resource(native));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_byte_size_includes_mips() {
        let desc = ResourceDesc::texture(4, 4, 3, Format::R8G8B8A8Unorm, ResourceFlags::GPU_READ);
        // 4x4 + 2x2 + 1x1 texels
        assert_eq!(desc.byte_size(), (16 + 4 + 1) * 4);
        assert_eq!(desc.subresource_count(), 3);
    }

    #[test]
    fn test_vertex_buffer_desc_uses_format_stride() {
        let format = VertexFormat::new().with_element("POSITION", 0, crate::shader::VertexElementFormat::Float3);
        let desc = ResourceDesc::vertex_buffer(format, 36, ResourceFlags::GPU_READ);
        assert_eq!(desc.stride, 12);
        assert_eq!(desc.byte_size(), 36 * 12);
    }

    #[test]
    fn test_depth_surface_requires_depth_format() {
        let caps = DeviceCapabilities::default();
        assert!(ResourceDesc::depth_surface(64, 64, Format::D32Float).validate(&caps).is_ok());
        assert!(ResourceDesc::depth_surface(64, 64, Format::R8G8B8A8Unorm).validate(&caps).is_err());
    }

    #[test]
    fn test_zero_sized_buffer_rejected() {
        let caps = DeviceCapabilities::default();
        let desc = ResourceDesc::buffer(ResourceKind::StructuredBuffer, 0, 4, ResourceFlags::GPU_READ);
        assert!(desc.validate(&caps).is_err());
    }

    #[test]
    fn test_single_map_guard() {
        let resource = GraphicsResource::new(
            "guarded",
            ResourceDesc::constant_buffer(16),
            NativeResource::default(),
            Weak::new(),
        );
        assert!(resource.begin_map().is_ok());
        assert!(matches!(resource.begin_map(), Err(HalError::AlreadyMapped { .. })));
        assert!(resource.end_map().is_ok());
        assert!(matches!(resource.end_map(), Err(HalError::NotMapped { .. })));
    }
}
