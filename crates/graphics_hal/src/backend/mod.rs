//! Native backend seam
//!
//! The command queue and device never call a graphics API directly. They go
//! through [`NativeDevice`] (object creation and release) and
//! [`NativeContext`] (command recording), which each backend implements:
//!
//! - [`headless`]: immediate-mode, driver-managed backend that keeps resource
//!   memory on the CPU and records every native call
//! - [`vulkan`]: explicit backend with primary/secondary command buffers,
//!   fences and semaphores

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::device::DeviceCapabilities;
use crate::resource::ResourceDesc;
use crate::shader::{InputElement, PrimitiveTopology, SamplerDesc, ShaderStageKind, StateDesc};
use crate::HalResult;

pub mod headless;
pub mod vulkan;

/// Opaque native object handle; zero means "no object"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NativeHandle(pub u64);

impl NativeHandle {
    /// The null handle
    pub const NULL: Self = Self(0);

    /// Whether this is the null handle
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Native objects backing one resource
///
/// A resource owns a primary handle plus the views the pipeline binds it
/// through. Views a resource does not support stay null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeResource {
    /// Buffer or texture object
    pub handle: NativeHandle,
    /// Shader-resource view
    pub shader_view: NativeHandle,
    /// Unordered-access view
    pub unordered_view: NativeHandle,
    /// Render-target view
    pub target_view: NativeHandle,
    /// Writable depth-stencil view
    pub depth_view: NativeHandle,
    /// Read-only depth-stencil view
    pub read_only_depth_view: NativeHandle,
    /// Bytes allocated for the resource
    pub size_in_bytes: u64,
}

impl NativeResource {
    /// Whether the resource has a live native object
    pub const fn is_valid(&self) -> bool {
        !self.handle.is_null()
    }
}

/// Whether a context executes commands immediately or records them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextKind {
    /// Primary context: commands reach the GPU through `submit`
    Immediate,
    /// Deferred context: produces command lists executed by a primary queue
    Deferred,
}

/// Command-list level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandListLevel {
    /// Submitted directly to the device
    Primary,
    /// Executed from inside a primary list
    Secondary,
}

bitflags! {
    /// Options for recording and submitting command lists
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandListFlags: u32 {
        /// The list is recorded for later execution by a primary queue
        const DEFERRED = 1 << 0;
        /// Attach a completion fence the CPU can poll
        const CPU_SYNCABLE = 1 << 1;
        /// The list is submitted once and then recycled
        const SINGLE_SUBMIT = 1 << 2;
    }
}

/// A closed native command list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCommandList {
    /// Backend command-list object
    pub handle: NativeHandle,
    /// Completion fence, null when none was requested
    pub fence: NativeHandle,
    /// Primary or secondary
    pub level: CommandListLevel,
}

/// One vertex-buffer slot binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexBufferBinding {
    /// Buffer handle, null to clear the slot
    pub buffer: NativeHandle,
    /// Bytes between consecutive vertices
    pub stride: u32,
    /// Byte offset of the first vertex
    pub offset: u32,
}

/// Index element size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexFormat {
    /// 16-bit indices
    U16,
    /// 32-bit indices
    U32,
}

impl IndexFormat {
    /// Bytes per index
    pub const fn size(self) -> u32 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Pick the format matching an element stride
    pub const fn from_stride(stride: u32) -> Self {
        if stride == 2 { Self::U16 } else { Self::U32 }
    }
}

/// Viewport rectangle with depth range
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Viewport {
    /// Left edge
    pub x: f32,
    /// Top edge
    pub y: f32,
    /// Width in pixels
    pub width: f32,
    /// Height in pixels
    pub height: f32,
    /// Near depth
    pub min_depth: f32,
    /// Far depth
    pub max_depth: f32,
}

impl Viewport {
    /// Viewport covering `width` x `height` with the full depth range
    pub const fn new(width: f32, height: f32) -> Self {
        Self { x: 0.0, y: 0.0, width, height, min_depth: 0.0, max_depth: 1.0 }
    }
}

/// Integer rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge
    pub left: i32,
    /// Top edge
    pub top: i32,
    /// Right edge (exclusive)
    pub right: i32,
    /// Bottom edge (exclusive)
    pub bottom: i32,
}

impl Rect {
    /// Rectangle from origin and size
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { left: x, top: y, right: x + width, bottom: y + height }
    }

    /// Width in pixels
    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    /// Height in pixels
    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

/// Box inside a subresource, in texels (or bytes for buffers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceRegion {
    /// Left edge
    pub left: u32,
    /// Top edge
    pub top: u32,
    /// Front edge
    pub front: u32,
    /// Right edge (exclusive)
    pub right: u32,
    /// Bottom edge (exclusive)
    pub bottom: u32,
    /// Back edge (exclusive)
    pub back: u32,
}

impl ResourceRegion {
    /// Byte range of a buffer
    pub const fn bytes(offset: u32, len: u32) -> Self {
        Self { left: offset, top: 0, front: 0, right: offset + len, bottom: 1, back: 1 }
    }

    /// Width of the region
    pub const fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }
}

/// Native CPU-access mode chosen for a map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeMapMode {
    /// Read only
    Read,
    /// Write, existing contents preserved
    Write,
    /// Read and write
    ReadWrite,
    /// Write into fresh memory; previous contents are discarded
    WriteDiscard,
    /// Write without synchronizing against in-flight GPU reads
    WriteNoOverwrite,
}

impl NativeMapMode {
    /// Whether the mode allows CPU reads
    pub const fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether the mode allows CPU writes
    pub const fn can_write(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// CPU-visible memory returned by [`NativeContext::map`]
///
/// Dropping the region ends CPU access; backends that emulate mapping with a
/// copy publish the written bytes at that point.
pub trait MappedRegion: Send {
    /// Mapped bytes
    fn bytes(&self) -> &[u8];

    /// Mapped bytes, writable
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// Severity of a backend diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugSeverity {
    /// Informational
    Info,
    /// Suspicious usage
    Warning,
    /// Invalid usage
    Error,
}

/// Message produced by a backend debug layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Severity
    pub severity: DebugSeverity,
    /// Message text
    pub text: String,
}

/// Releasable native object queued for deferred disposal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeObject {
    /// Buffer or texture with its views
    Resource(NativeResource),
    /// Sampler, state object or input layout
    Object(NativeHandle),
}

/// Device-level backend interface
///
/// Implementations are shared between threads; object creation may happen on
/// any thread.
pub trait NativeDevice: Send + Sync {
    /// Backend name used in log messages
    fn name(&self) -> &str;

    /// Capability limits of the device
    fn capabilities(&self) -> DeviceCapabilities;

    /// Create a buffer or texture, optionally filled with `initial_data`
    fn create_resource(&self, desc: &ResourceDesc, initial_data: Option<&[u8]>) -> HalResult<NativeResource>;

    /// Create a sampler object
    fn create_sampler(&self, desc: &SamplerDesc) -> HalResult<NativeHandle>;

    /// Create a blend, depth-stencil or rasterizer state object
    fn create_state(&self, desc: &StateDesc) -> HalResult<NativeHandle>;

    /// Create an input layout matching `vertex_shader`'s input signature
    fn create_input_layout(&self, vertex_shader: NativeHandle, elements: &[InputElement]) -> HalResult<NativeHandle>;

    /// Free a native object
    fn release(&self, object: NativeObject);

    /// Create a command context
    fn create_context(&self, kind: ContextKind) -> HalResult<Box<dyn NativeContext>>;

    /// Block until the device has finished all submitted work
    fn wait_idle(&self) -> HalResult<()>;
}

/// Command-recording backend interface
///
/// A context is driven by exactly one [`crate::queue::CommandQueue`] and is
/// never shared between threads while recording. Binding calls take the
/// first slot plus a contiguous array, matching native bulk-bind entry points.
pub trait NativeContext: Send {
    /// Immediate or deferred
    fn kind(&self) -> ContextKind;

    /// Start recording, optionally reusing a retired command list
    fn begin(&mut self, flags: CommandListFlags, reuse: Option<NativeCommandList>) -> HalResult<()>;

    /// Stop recording and close the command list
    fn end(&mut self, flags: CommandListFlags) -> HalResult<NativeCommandList>;

    /// Submit a closed primary list to the device
    fn submit(&mut self, list: &NativeCommandList, flags: CommandListFlags) -> HalResult<()>;

    /// Execute a closed secondary list inside the current recording
    fn execute(&mut self, list: &NativeCommandList) -> HalResult<()>;

    /// Poll whether the GPU has finished with `list`
    fn is_complete(&self, list: &NativeCommandList) -> bool;

    /// Free a command list that will not be reused
    fn free_list(&mut self, list: NativeCommandList);

    /// Bind a shader program to a stage
    fn set_shader(&mut self, stage: ShaderStageKind, program: NativeHandle, layout: NativeHandle);

    /// Bind constant buffers starting at `first_slot`
    fn set_constant_buffers(&mut self, stage: ShaderStageKind, first_slot: u32, buffers: &[NativeHandle]);

    /// Bind shader-resource views starting at `first_slot`
    fn set_shader_resources(&mut self, stage: ShaderStageKind, first_slot: u32, views: &[NativeHandle]);

    /// Bind samplers starting at `first_slot`
    fn set_samplers(&mut self, stage: ShaderStageKind, first_slot: u32, samplers: &[NativeHandle]);

    /// Bind unordered-access views starting at `first_slot`
    fn set_unordered_access_views(&mut self, stage: ShaderStageKind, first_slot: u32, views: &[NativeHandle]);

    /// Bind vertex buffers starting at `first_slot`
    fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[VertexBufferBinding]);

    /// Bind the index buffer
    fn set_index_buffer(&mut self, buffer: NativeHandle, format: IndexFormat, offset: u32);

    /// Bind the input layout
    fn set_input_layout(&mut self, layout: NativeHandle);

    /// Set the primitive topology
    fn set_topology(&mut self, topology: PrimitiveTopology);

    /// Bind a blend state
    fn set_blend_state(&mut self, state: NativeHandle, blend_factor: [f32; 4], sample_mask: u32);

    /// Bind a depth-stencil state
    fn set_depth_stencil_state(&mut self, state: NativeHandle, stencil_ref: u32);

    /// Bind a rasterizer state
    fn set_rasterizer_state(&mut self, state: NativeHandle);

    /// Set viewports, one per render target
    fn set_viewports(&mut self, viewports: &[Viewport]);

    /// Set scissor rectangles, one per render target
    fn set_scissor_rects(&mut self, rects: &[Rect]);

    /// Bind render-target views and a depth view (null for none)
    fn set_render_targets(&mut self, targets: &[NativeHandle], depth: NativeHandle);

    /// Non-indexed draw
    fn draw(&mut self, vertex_count: u32, start_vertex: u32);

    /// Instanced draw
    fn draw_instanced(&mut self, vertex_count_per_instance: u32, instance_count: u32, start_vertex: u32, start_instance: u32);

    /// Indexed draw
    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32);

    /// Indexed instanced draw
    fn draw_indexed_instanced(
        &mut self,
        index_count_per_instance: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    );

    /// Compute dispatch
    fn dispatch(&mut self, groups: [u32; 3]);

    /// Map a subresource for CPU access
    fn map(&mut self, resource: &NativeResource, subresource: u32, mode: NativeMapMode) -> HalResult<Box<dyn MappedRegion>>;

    /// End CPU access to a subresource
    fn unmap(&mut self, resource: &NativeResource, subresource: u32);

    /// Write bytes into a subresource through the command stream
    fn update_subresource(
        &mut self,
        resource: &NativeResource,
        subresource: u32,
        region: Option<ResourceRegion>,
        data: &[u8],
        row_pitch: u32,
        slice_pitch: u32,
    ) -> HalResult<()>;

    /// Copy one resource into another of the same size
    fn copy_resource(&mut self, source: &NativeResource, destination: &NativeResource) -> HalResult<()>;

    /// Copy a region between subresources
    fn copy_subresource_region(
        &mut self,
        source: &NativeResource,
        source_subresource: u32,
        source_region: Option<ResourceRegion>,
        destination: &NativeResource,
        destination_subresource: u32,
        destination_offset: [u32; 3],
    ) -> HalResult<()>;

    /// Generate the mip chain of a texture from its top level
    fn generate_mips(&mut self, resource: &NativeResource) -> HalResult<()>;

    /// Open a named debug event
    fn begin_event(&mut self, label: &str);

    /// Close the innermost debug event
    fn end_event(&mut self);

    /// Insert a debug marker
    fn set_marker(&mut self, label: &str);

    /// Take pending debug-layer messages
    fn drain_debug_messages(&mut self) -> Vec<DebugMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        assert!(NativeHandle::NULL.is_null());
        assert!(!NativeHandle(7).is_null());
        assert_eq!(NativeHandle(255).to_string(), "0xff");
    }

    #[test]
    fn test_map_mode_access() {
        assert!(NativeMapMode::Read.can_read());
        assert!(!NativeMapMode::Read.can_write());
        assert!(NativeMapMode::WriteDiscard.can_write());
        assert!(!NativeMapMode::WriteNoOverwrite.can_read());
    }

    #[test]
    fn test_rect_size() {
        let rect = Rect::new(10, 20, 30, 40);
        assert_eq!(rect.width(), 30);
        assert_eq!(rect.height(), 40);
    }
}
