//! Fixed-function state objects and samplers

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::backend::{NativeHandle, NativeObject};
use crate::binding::Bindable;
use crate::device::GraphicsDevice;

/// Blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendFactor {
    /// 0
    Zero,
    /// 1
    One,
    /// Source color
    SourceColor,
    /// 1 - source color
    InverseSourceColor,
    /// Source alpha
    SourceAlpha,
    /// 1 - source alpha
    InverseSourceAlpha,
    /// Destination alpha
    DestinationAlpha,
    /// 1 - destination alpha
    InverseDestinationAlpha,
    /// Constant blend factor
    Constant,
}

/// Blend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendOp {
    /// src + dst
    Add,
    /// src - dst
    Subtract,
    /// dst - src
    ReverseSubtract,
    /// min(src, dst)
    Min,
    /// max(src, dst)
    Max,
}

/// Blend state description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendDesc {
    /// Whether blending is enabled
    pub enabled: bool,
    /// Source color factor
    pub source: BlendFactor,
    /// Destination color factor
    pub destination: BlendFactor,
    /// Color operation
    pub op: BlendOp,
    /// Source alpha factor
    pub source_alpha: BlendFactor,
    /// Destination alpha factor
    pub destination_alpha: BlendFactor,
    /// Alpha operation
    pub alpha_op: BlendOp,
    /// RGBA write mask, low four bits
    pub write_mask: u8,
    /// Constant used by [`BlendFactor::Constant`]
    pub blend_factor: [f32; 4],
    /// Multisample coverage mask
    pub sample_mask: u32,
}

impl BlendDesc {
    /// Standard premultiplied-free alpha blending
    pub fn alpha_blend() -> Self {
        Self {
            enabled: true,
            source: BlendFactor::SourceAlpha,
            destination: BlendFactor::InverseSourceAlpha,
            source_alpha: BlendFactor::One,
            destination_alpha: BlendFactor::InverseSourceAlpha,
            ..Self::default()
        }
    }
}

impl Default for BlendDesc {
    fn default() -> Self {
        Self {
            enabled: false,
            source: BlendFactor::One,
            destination: BlendFactor::Zero,
            op: BlendOp::Add,
            source_alpha: BlendFactor::One,
            destination_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            write_mask: 0xF,
            blend_factor: [1.0; 4],
            sample_mask: u32::MAX,
        }
    }
}

/// Comparison function for depth tests and comparison samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonFunc {
    /// Never passes
    Never,
    /// a < b
    Less,
    /// a == b
    Equal,
    /// a <= b
    LessEqual,
    /// a > b
    Greater,
    /// a != b
    NotEqual,
    /// a >= b
    GreaterEqual,
    /// Always passes
    Always,
}

/// Depth-stencil state description
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepthStencilDesc {
    /// Depth test enabled
    pub depth_enabled: bool,
    /// Depth writes enabled
    pub depth_write: bool,
    /// Depth comparison
    pub comparison: ComparisonFunc,
    /// Stencil test enabled
    pub stencil_enabled: bool,
    /// Stencil reference value
    pub stencil_ref: u32,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_enabled: true,
            depth_write: true,
            comparison: ComparisonFunc::Less,
            stencil_enabled: false,
            stencil_ref: 0,
        }
    }
}

/// Face culling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CullMode {
    /// Draw all faces
    None,
    /// Cull front faces
    Front,
    /// Cull back faces
    Back,
}

/// Polygon fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FillMode {
    /// Filled triangles
    Solid,
    /// Edges only
    Wireframe,
}

/// Rasterizer state description
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RasterizerDesc {
    /// Culling
    pub cull: CullMode,
    /// Fill
    pub fill: FillMode,
    /// Counter-clockwise triangles face forward
    pub front_counter_clockwise: bool,
    /// Scissor test enabled
    pub scissor_enabled: bool,
    /// Constant depth bias
    pub depth_bias: i32,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        Self {
            cull: CullMode::Back,
            fill: FillMode::Solid,
            front_counter_clockwise: false,
            scissor_enabled: false,
            depth_bias: 0,
        }
    }
}

/// Texture filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    /// Nearest texel
    Point,
    /// Linear interpolation
    Linear,
    /// Anisotropic
    Anisotropic,
}

/// Texture addressing outside [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressMode {
    /// Repeat
    Wrap,
    /// Mirror
    Mirror,
    /// Clamp to edge
    Clamp,
    /// Border color
    Border,
}

/// Sampler description; also the key of the device sampler cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SamplerDesc {
    /// Filter
    pub filter: Filter,
    /// U addressing
    pub address_u: AddressMode,
    /// V addressing
    pub address_v: AddressMode,
    /// W addressing
    pub address_w: AddressMode,
    /// Maximum anisotropy for [`Filter::Anisotropic`]
    pub max_anisotropy: u32,
    /// Comparison for shadow samplers
    pub comparison: Option<ComparisonFunc>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: Filter::Linear,
            address_u: AddressMode::Wrap,
            address_v: AddressMode::Wrap,
            address_w: AddressMode::Wrap,
            max_anisotropy: 1,
            comparison: None,
        }
    }
}

/// Any state description a backend can turn into a native object
#[derive(Debug, Clone, PartialEq)]
pub enum StateDesc {
    /// Blend state
    Blend(BlendDesc),
    /// Depth-stencil state
    DepthStencil(DepthStencilDesc),
    /// Rasterizer state
    Rasterizer(RasterizerDesc),
}

/// Immutable native state object
///
/// Dropping the last reference queues the native object for deferred release.
#[derive(Debug)]
pub struct StateObject<D> {
    desc: D,
    native: NativeHandle,
    device: Weak<GraphicsDevice>,
}

impl<D> StateObject<D> {
    pub(crate) fn new(desc: D, native: NativeHandle, device: Weak<GraphicsDevice>) -> Arc<Self> {
        Arc::new(Self { desc, native, device })
    }

    /// Description the object was created from
    pub const fn desc(&self) -> &D {
        &self.desc
    }
}

impl<D: Send + Sync> Bindable for StateObject<D> {
    fn native_handle(&self) -> NativeHandle {
        self.native
    }
}

impl<D> Drop for StateObject<D> {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            device.mark_for_release(NativeObject::Object(self.native));
        }
    }
}

/// Blend state object
pub type BlendState = StateObject<BlendDesc>;
/// Depth-stencil state object
pub type DepthStencilState = StateObject<DepthStencilDesc>;
/// Rasterizer state object
pub type RasterizerState = StateObject<RasterizerDesc>;
/// Sampler object
pub type ShaderSampler = StateObject<SamplerDesc>;
