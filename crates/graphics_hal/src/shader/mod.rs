//! Shader bundles, passes and pipeline state
//!
//! A [`Shader`] is a reusable bundle of [`ShaderPass`]es run in declared
//! order. Each pass is either a compute pass (one compute stage) or a render
//! pass (any of the five render stages plus fixed-function state). Shader
//! compilation and reflection happen elsewhere; this module only carries the
//! compiled handles and the resource ids each stage reads.

mod layout;
mod state;

pub use layout::{input_elements, InputElement, VertexElement, VertexElementFormat, VertexFormat, VertexInputLayout};
pub(crate) use layout::trim_signature;
pub use state::*;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};

use crate::backend::NativeHandle;
use crate::binding::Bindable;
use crate::foundation::sync;
use crate::queue::CustomDrawInfo;
use crate::resource::GraphicsResource;
use crate::{HalError, HalResult};

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderStageKind {
    /// Vertex shader
    Vertex,
    /// Hull (tessellation control) shader
    Hull,
    /// Domain (tessellation evaluation) shader
    Domain,
    /// Geometry shader
    Geometry,
    /// Pixel (fragment) shader
    Pixel,
    /// Compute shader
    Compute,
}

impl ShaderStageKind {
    /// Number of stages
    pub const COUNT: usize = 6;

    /// Render stages in pipeline order
    pub const RENDER: [Self; 5] = [Self::Vertex, Self::Hull, Self::Domain, Self::Geometry, Self::Pixel];

    /// Every stage, render stages first
    pub const ALL: [Self; 6] = [Self::Vertex, Self::Hull, Self::Domain, Self::Geometry, Self::Pixel, Self::Compute];

    /// Dense index for per-stage arrays
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ShaderStageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vertex => "VS",
            Self::Hull => "HS",
            Self::Domain => "DS",
            Self::Geometry => "GS",
            Self::Pixel => "PS",
            Self::Compute => "CS",
        };
        f.write_str(name)
    }
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PrimitiveTopology {
    /// Not set; drawing with it fails validation
    #[default]
    Undefined,
    /// Points
    PointList,
    /// Independent lines
    LineList,
    /// Connected lines
    LineStrip,
    /// Independent triangles
    TriangleList,
    /// Connected triangles
    TriangleStrip,
    /// Tessellation patches with N control points
    PatchList(u8),
}

/// How a pass may use the bound depth surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DepthWritePermission {
    /// Depth test and write
    #[default]
    Enabled,
    /// Depth test through a read-only view
    ReadOnly,
    /// No depth surface bound
    Disabled,
}

/// Compiled program for one stage plus the resource ids it reads
///
/// Ids index the owning shader's binding tables and double as register
/// slots on the stage.
#[derive(Debug, Clone)]
pub struct ShaderComposition {
    stage: ShaderStageKind,
    entry_point: String,
    native: NativeHandle,
    layout: NativeHandle,
    constant_buffer_ids: Vec<u32>,
    resource_ids: Vec<u32>,
    sampler_ids: Vec<u32>,
    unordered_access_ids: Vec<u32>,
}

impl ShaderComposition {
    /// Wrap a compiled program
    pub fn new(stage: ShaderStageKind, entry_point: impl Into<String>, native: NativeHandle) -> Self {
        Self {
            stage,
            entry_point: entry_point.into(),
            native,
            layout: NativeHandle::NULL,
            constant_buffer_ids: Vec::new(),
            resource_ids: Vec::new(),
            sampler_ids: Vec::new(),
            unordered_access_ids: Vec::new(),
        }
    }

    /// Pipeline layout for explicit backends
    pub fn with_layout(mut self, layout: NativeHandle) -> Self {
        self.layout = layout;
        self
    }

    /// Constant-buffer ids read by the stage
    pub fn with_constant_buffers(mut self, ids: &[u32]) -> Self {
        self.constant_buffer_ids = ids.to_vec();
        self
    }

    /// Shader-resource ids read by the stage
    pub fn with_resources(mut self, ids: &[u32]) -> Self {
        self.resource_ids = ids.to_vec();
        self
    }

    /// Sampler ids read by the stage
    pub fn with_samplers(mut self, ids: &[u32]) -> Self {
        self.sampler_ids = ids.to_vec();
        self
    }

    /// Unordered-access ids written by the stage
    pub fn with_unordered_access(mut self, ids: &[u32]) -> Self {
        self.unordered_access_ids = ids.to_vec();
        self
    }

    /// Stage
    pub const fn stage(&self) -> ShaderStageKind {
        self.stage
    }

    /// Entry-point name
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Pipeline layout handle (null on immediate-mode backends)
    pub const fn layout(&self) -> NativeHandle {
        self.layout
    }

    /// Constant-buffer ids
    pub fn constant_buffer_ids(&self) -> &[u32] {
        &self.constant_buffer_ids
    }

    /// Shader-resource ids
    pub fn resource_ids(&self) -> &[u32] {
        &self.resource_ids
    }

    /// Sampler ids
    pub fn sampler_ids(&self) -> &[u32] {
        &self.sampler_ids
    }

    /// Unordered-access ids
    pub fn unordered_access_ids(&self) -> &[u32] {
        &self.unordered_access_ids
    }
}

impl Bindable for ShaderComposition {
    fn native_handle(&self) -> NativeHandle {
        self.native
    }
}

/// Callback run once a pass has issued all of its iterations
pub type PassCallback = Box<dyn Fn(&ShaderPass, &CustomDrawInfo) + Send + Sync>;

/// One pipeline configuration inside a shader
pub struct ShaderPass {
    name: String,
    enabled: AtomicBool,
    compositions: [Option<Arc<ShaderComposition>>; ShaderStageKind::COUNT],
    topology: PrimitiveTopology,
    blend_state: Option<Arc<BlendState>>,
    depth_state: Option<Arc<DepthStencilState>>,
    rasterizer_state: Option<Arc<RasterizerState>>,
    iterations: u32,
    compute_groups: [u32; 3],
    depth_write: DepthWritePermission,
    on_completed: Option<PassCallback>,
}

impl ShaderPass {
    /// Enabled triangle-list pass with no stages
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: AtomicBool::new(true),
            compositions: Default::default(),
            topology: PrimitiveTopology::TriangleList,
            blend_state: None,
            depth_state: None,
            rasterizer_state: None,
            iterations: 1,
            compute_groups: [1, 1, 1],
            depth_write: DepthWritePermission::Enabled,
            on_completed: None,
        }
    }

    /// Attach a stage program; replaces any program already on that stage
    pub fn with_stage(mut self, composition: ShaderComposition) -> Self {
        let index = composition.stage().index();
        self.compositions[index] = Some(Arc::new(composition));
        self
    }

    /// Primitive topology
    pub fn with_topology(mut self, topology: PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Blend state
    pub fn with_blend_state(mut self, state: Arc<BlendState>) -> Self {
        self.blend_state = Some(state);
        self
    }

    /// Depth-stencil state
    pub fn with_depth_state(mut self, state: Arc<DepthStencilState>) -> Self {
        self.depth_state = Some(state);
        self
    }

    /// Rasterizer state
    pub fn with_rasterizer_state(mut self, state: Arc<RasterizerState>) -> Self {
        self.rasterizer_state = Some(state);
        self
    }

    /// Times the draw or dispatch is issued per call
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// Default dispatch size used for axes the caller leaves at zero
    pub fn with_compute_groups(mut self, groups: [u32; 3]) -> Self {
        self.compute_groups = groups;
        self
    }

    /// Depth-surface usage
    pub fn with_depth_write(mut self, permission: DepthWritePermission) -> Self {
        self.depth_write = permission;
        self
    }

    /// Start disabled
    pub fn disabled(self) -> Self {
        self.enabled.store(false, Ordering::Relaxed);
        self
    }

    /// Completion callback
    pub fn on_completed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ShaderPass, &CustomDrawInfo) + Send + Sync + 'static,
    {
        self.on_completed = Some(Box::new(callback));
        self
    }

    /// Pass name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the pass runs
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enable or disable the pass
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether this is a compute pass
    pub fn is_compute(&self) -> bool {
        self.compositions[ShaderStageKind::Compute.index()].is_some()
    }

    /// Program bound to `stage`, if any
    pub fn composition(&self, stage: ShaderStageKind) -> Option<&Arc<ShaderComposition>> {
        self.compositions[stage.index()].as_ref()
    }

    /// Primitive topology
    pub const fn topology(&self) -> PrimitiveTopology {
        self.topology
    }

    /// Blend state
    pub const fn blend_state(&self) -> Option<&Arc<BlendState>> {
        self.blend_state.as_ref()
    }

    /// Depth-stencil state
    pub const fn depth_state(&self) -> Option<&Arc<DepthStencilState>> {
        self.depth_state.as_ref()
    }

    /// Rasterizer state
    pub const fn rasterizer_state(&self) -> Option<&Arc<RasterizerState>> {
        self.rasterizer_state.as_ref()
    }

    /// Iteration count
    pub const fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Default dispatch size
    pub const fn compute_groups(&self) -> [u32; 3] {
        self.compute_groups
    }

    /// Depth-surface usage
    pub const fn depth_write(&self) -> DepthWritePermission {
        self.depth_write
    }

    pub(crate) fn invoke_completed(&self, info: &CustomDrawInfo) {
        if let Some(callback) = &self.on_completed {
            callback(self, info);
        }
    }

    fn validate(&self) -> Result<(), String> {
        let has_render_stage = ShaderStageKind::RENDER
            .iter()
            .any(|stage| self.compositions[stage.index()].is_some());
        if self.is_compute() && has_render_stage {
            return Err(format!("Pass '{}' mixes a compute stage with render stages", self.name));
        }
        if self.iterations == 0 {
            return Err(format!("Pass '{}' has zero iterations", self.name));
        }
        Ok(())
    }
}

impl fmt::Debug for ShaderPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderPass")
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .field("compute", &self.is_compute())
            .field("topology", &self.topology)
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

/// Values a shader reads, indexed by the ids its compositions declare
#[derive(Debug, Default)]
pub struct ShaderBindings {
    constant_buffers: Vec<Option<Arc<GraphicsResource>>>,
    resources: Vec<Option<Arc<GraphicsResource>>>,
    samplers: Vec<Option<Arc<ShaderSampler>>>,
    unordered_access: Vec<Option<Arc<GraphicsResource>>>,
}

fn store<T>(table: &mut Vec<Option<Arc<T>>>, id: u32, value: Option<Arc<T>>) {
    let id = id as usize;
    if table.len() <= id {
        table.resize_with(id + 1, || None);
    }
    table[id] = value;
}

fn lookup<T>(table: &[Option<Arc<T>>], id: u32) -> Option<Arc<T>> {
    table.get(id as usize).cloned().flatten()
}

impl ShaderBindings {
    /// Constant buffer with `id`
    pub fn constant_buffer(&self, id: u32) -> Option<Arc<GraphicsResource>> {
        lookup(&self.constant_buffers, id)
    }

    /// Shader resource with `id`
    pub fn resource(&self, id: u32) -> Option<Arc<GraphicsResource>> {
        lookup(&self.resources, id)
    }

    /// Sampler with `id`
    pub fn sampler(&self, id: u32) -> Option<Arc<ShaderSampler>> {
        lookup(&self.samplers, id)
    }

    /// Unordered-access resource with `id`
    pub fn unordered_access(&self, id: u32) -> Option<Arc<GraphicsResource>> {
        lookup(&self.unordered_access, id)
    }

    /// Every resource referenced by the bindings
    pub fn resources_in_use(&self) -> impl Iterator<Item = &Arc<GraphicsResource>> {
        self.constant_buffers
            .iter()
            .chain(&self.resources)
            .chain(&self.unordered_access)
            .flatten()
    }
}

/// Named bundle of passes
pub struct Shader {
    name: String,
    passes: Vec<ShaderPass>,
    bindings: RwLock<ShaderBindings>,
}

impl Shader {
    /// Build a shader; fails if a pass mixes compute and render stages
    pub fn new(name: impl Into<String>, passes: Vec<ShaderPass>) -> HalResult<Self> {
        let name = name.into();
        for pass in &passes {
            pass.validate().map_err(HalError::invalid)?;
        }
        log::debug!("Shader '{}' created with {} pass(es)", name, passes.len());
        Ok(Self {
            name,
            passes,
            bindings: RwLock::new(ShaderBindings::default()),
        })
    }

    /// Shader name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Passes in execution order
    pub fn passes(&self) -> &[ShaderPass] {
        &self.passes
    }

    /// Set the constant buffer with `id`
    pub fn set_constant_buffer(&self, id: u32, buffer: Option<Arc<GraphicsResource>>) {
        store(&mut self.bindings_mut().constant_buffers, id, buffer);
    }

    /// Set the shader resource with `id`
    pub fn set_resource(&self, id: u32, resource: Option<Arc<GraphicsResource>>) {
        store(&mut self.bindings_mut().resources, id, resource);
    }

    /// Set the sampler with `id`
    pub fn set_sampler(&self, id: u32, sampler: Option<Arc<ShaderSampler>>) {
        store(&mut self.bindings_mut().samplers, id, sampler);
    }

    /// Set the unordered-access resource with `id`
    pub fn set_unordered_access(&self, id: u32, resource: Option<Arc<GraphicsResource>>) {
        store(&mut self.bindings_mut().unordered_access, id, resource);
    }

    /// Current binding values
    pub fn bindings(&self) -> RwLockReadGuard<'_, ShaderBindings> {
        sync::read(&self.bindings)
    }

    fn bindings_mut(&self) -> std::sync::RwLockWriteGuard<'_, ShaderBindings> {
        sync::write(&self.bindings)
    }
}

impl fmt::Debug for Shader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shader")
            .field("name", &self.name)
            .field("passes", &self.passes)
            .finish_non_exhaustive()
    }
}

impl Bindable for Shader {
    fn native_handle(&self) -> NativeHandle {
        NativeHandle::NULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vs() -> ShaderComposition {
        ShaderComposition::new(ShaderStageKind::Vertex, "main", NativeHandle(10))
    }

    fn cs() -> ShaderComposition {
        ShaderComposition::new(ShaderStageKind::Compute, "main", NativeHandle(20))
    }

    #[test]
    fn test_mixed_pass_rejected() {
        let pass = ShaderPass::new("bad").with_stage(vs()).with_stage(cs());
        assert!(Shader::new("mixed", vec![pass]).is_err());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let pass = ShaderPass::new("none").with_stage(vs()).with_iterations(0);
        assert!(Shader::new("zero", vec![pass]).is_err());
    }

    #[test]
    fn test_compute_pass_detection() {
        let shader = Shader::new(
            "two",
            vec![ShaderPass::new("draw").with_stage(vs()), ShaderPass::new("sim").with_stage(cs())],
        )
        .unwrap();
        assert!(!shader.passes()[0].is_compute());
        assert!(shader.passes()[1].is_compute());
    }

    #[test]
    fn test_pass_enable_toggle() {
        let pass = ShaderPass::new("p").disabled();
        assert!(!pass.is_enabled());
        pass.set_enabled(true);
        assert!(pass.is_enabled());
    }

    #[test]
    fn test_binding_tables_grow_on_demand() {
        let shader = Shader::new("empty", Vec::new()).unwrap();
        assert!(shader.bindings().sampler(3).is_none());
        shader.set_sampler(3, None);
        assert!(shader.bindings().sampler(3).is_none());
        assert_eq!(shader.bindings().samplers.len(), 4);
    }
}
