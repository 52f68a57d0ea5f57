//! Slot binders
//!
//! One small binder type per resource category. Binders carry at most the
//! shader stage they serve; all state lives in the slots and in the native
//! context they write to.

use super::{Bindable, BindingSlot};
use crate::backend::{IndexFormat, NativeContext, NativeHandle, VertexBufferBinding};
use crate::resource::GraphicsResource;
use crate::shader::{
    BlendState, DepthStencilState, RasterizerState, Shader, ShaderComposition, ShaderSampler,
    ShaderStageKind, VertexInputLayout,
};

/// Strategy that turns slot changes into native calls
pub trait SlotBinder<T: Bindable> {
    /// Bind one value to `slot`
    fn bind(&self, ctx: &mut dyn NativeContext, slot: u32, value: &T);

    /// Clear `slot`
    fn unbind(&self, ctx: &mut dyn NativeContext, slot: u32);

    /// Bind a contiguous range starting at `first_slot`
    ///
    /// `slots` is the whole range; `changed` of them actually changed.
    fn bind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, slots: &[BindingSlot<T>], changed: u32) {
        let _ = changed;
        for (offset, slot) in slots.iter().enumerate() {
            let index = first_slot + offset as u32;
            match slot.value() {
                Some(value) => self.bind(ctx, index, value),
                None => self.unbind(ctx, index),
            }
        }
    }

    /// Clear `count` slots starting at `first_slot`
    fn unbind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, count: u32) {
        for slot in first_slot..first_slot + count {
            self.unbind(ctx, slot);
        }
    }
}

fn collect_views<T: Bindable>(slots: &[BindingSlot<T>], view: impl Fn(&T) -> NativeHandle) -> Vec<NativeHandle> {
    slots
        .iter()
        .map(|slot| slot.value().map_or(NativeHandle::NULL, |value| view(&**value)))
        .collect()
}

/// Shader bundle slot; stages are bound individually
#[derive(Debug, Default, Clone, Copy)]
pub struct ShaderBinder;

impl SlotBinder<Shader> for ShaderBinder {
    fn bind(&self, _ctx: &mut dyn NativeContext, _slot: u32, value: &Shader) {
        log::trace!("Shader '{}' staged", value.name());
    }

    fn unbind(&self, _ctx: &mut dyn NativeContext, _slot: u32) {}
}

/// Shader program of one pipeline stage
#[derive(Debug, Clone, Copy)]
pub struct StageShaderBinder {
    /// Stage served by this binder
    pub stage: ShaderStageKind,
}

impl SlotBinder<ShaderComposition> for StageShaderBinder {
    fn bind(&self, ctx: &mut dyn NativeContext, _slot: u32, value: &ShaderComposition) {
        ctx.set_shader(self.stage, value.native_handle(), value.layout());
    }

    fn unbind(&self, ctx: &mut dyn NativeContext, _slot: u32) {
        ctx.set_shader(self.stage, NativeHandle::NULL, NativeHandle::NULL);
    }
}

/// Constant buffers of one stage
#[derive(Debug, Clone, Copy)]
pub struct ConstantBufferBinder {
    /// Stage served by this binder
    pub stage: ShaderStageKind,
}

impl SlotBinder<GraphicsResource> for ConstantBufferBinder {
    fn bind(&self, ctx: &mut dyn NativeContext, slot: u32, value: &GraphicsResource) {
        ctx.set_constant_buffers(self.stage, slot, &[value.native_handle()]);
    }

    fn unbind(&self, ctx: &mut dyn NativeContext, slot: u32) {
        ctx.set_constant_buffers(self.stage, slot, &[NativeHandle::NULL]);
    }

    fn bind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, slots: &[BindingSlot<GraphicsResource>], _changed: u32) {
        let buffers = collect_views(slots, Bindable::native_handle);
        ctx.set_constant_buffers(self.stage, first_slot, &buffers);
    }

    fn unbind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, count: u32) {
        ctx.set_constant_buffers(self.stage, first_slot, &vec![NativeHandle::NULL; count as usize]);
    }
}

/// Shader-resource views of one stage
#[derive(Debug, Clone, Copy)]
pub struct ShaderResourceBinder {
    /// Stage served by this binder
    pub stage: ShaderStageKind,
}

impl SlotBinder<GraphicsResource> for ShaderResourceBinder {
    fn bind(&self, ctx: &mut dyn NativeContext, slot: u32, value: &GraphicsResource) {
        ctx.set_shader_resources(self.stage, slot, &[value.native().shader_view]);
    }

    fn unbind(&self, ctx: &mut dyn NativeContext, slot: u32) {
        ctx.set_shader_resources(self.stage, slot, &[NativeHandle::NULL]);
    }

    fn bind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, slots: &[BindingSlot<GraphicsResource>], _changed: u32) {
        let views = collect_views(slots, |res| res.native().shader_view);
        ctx.set_shader_resources(self.stage, first_slot, &views);
    }

    fn unbind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, count: u32) {
        ctx.set_shader_resources(self.stage, first_slot, &vec![NativeHandle::NULL; count as usize]);
    }
}

/// Samplers of one stage
#[derive(Debug, Clone, Copy)]
pub struct SamplerBinder {
    /// Stage served by this binder
    pub stage: ShaderStageKind,
}

impl SlotBinder<ShaderSampler> for SamplerBinder {
    fn bind(&self, ctx: &mut dyn NativeContext, slot: u32, value: &ShaderSampler) {
        ctx.set_samplers(self.stage, slot, &[value.native_handle()]);
    }

    fn unbind(&self, ctx: &mut dyn NativeContext, slot: u32) {
        ctx.set_samplers(self.stage, slot, &[NativeHandle::NULL]);
    }

    fn bind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, slots: &[BindingSlot<ShaderSampler>], _changed: u32) {
        let samplers = collect_views(slots, Bindable::native_handle);
        ctx.set_samplers(self.stage, first_slot, &samplers);
    }

    fn unbind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, count: u32) {
        ctx.set_samplers(self.stage, first_slot, &vec![NativeHandle::NULL; count as usize]);
    }
}

/// Unordered-access views of a stage (pixel stage = output merger)
#[derive(Debug, Clone, Copy)]
pub struct UnorderedAccessBinder {
    /// Stage served by this binder
    pub stage: ShaderStageKind,
}

impl SlotBinder<GraphicsResource> for UnorderedAccessBinder {
    fn bind(&self, ctx: &mut dyn NativeContext, slot: u32, value: &GraphicsResource) {
        ctx.set_unordered_access_views(self.stage, slot, &[value.native().unordered_view]);
    }

    fn unbind(&self, ctx: &mut dyn NativeContext, slot: u32) {
        ctx.set_unordered_access_views(self.stage, slot, &[NativeHandle::NULL]);
    }

    fn bind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, slots: &[BindingSlot<GraphicsResource>], _changed: u32) {
        let views = collect_views(slots, |res| res.native().unordered_view);
        ctx.set_unordered_access_views(self.stage, first_slot, &views);
    }

    fn unbind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, count: u32) {
        ctx.set_unordered_access_views(self.stage, first_slot, &vec![NativeHandle::NULL; count as usize]);
    }
}

/// Vertex buffer slots
#[derive(Debug, Default, Clone, Copy)]
pub struct VertexBufferBinder;

impl VertexBufferBinder {
    fn binding(value: Option<&GraphicsResource>) -> VertexBufferBinding {
        value.map_or_else(VertexBufferBinding::default, |buffer| VertexBufferBinding {
            buffer: buffer.native_handle(),
            stride: buffer.stride(),
            offset: 0,
        })
    }
}

impl SlotBinder<GraphicsResource> for VertexBufferBinder {
    fn bind(&self, ctx: &mut dyn NativeContext, slot: u32, value: &GraphicsResource) {
        ctx.set_vertex_buffers(slot, &[Self::binding(Some(value))]);
    }

    fn unbind(&self, ctx: &mut dyn NativeContext, slot: u32) {
        ctx.set_vertex_buffers(slot, &[VertexBufferBinding::default()]);
    }

    fn bind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, slots: &[BindingSlot<GraphicsResource>], _changed: u32) {
        let bindings: Vec<VertexBufferBinding> = slots
            .iter()
            .map(|slot| Self::binding(slot.value().map(|buffer| &**buffer)))
            .collect();
        ctx.set_vertex_buffers(first_slot, &bindings);
    }

    fn unbind_group(&self, ctx: &mut dyn NativeContext, first_slot: u32, count: u32) {
        ctx.set_vertex_buffers(first_slot, &vec![VertexBufferBinding::default(); count as usize]);
    }
}

/// Index buffer slot
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexBufferBinder;

impl SlotBinder<GraphicsResource> for IndexBufferBinder {
    fn bind(&self, ctx: &mut dyn NativeContext, _slot: u32, value: &GraphicsResource) {
        ctx.set_index_buffer(value.native_handle(), IndexFormat::from_stride(value.stride()), 0);
    }

    fn unbind(&self, ctx: &mut dyn NativeContext, _slot: u32) {
        ctx.set_index_buffer(NativeHandle::NULL, IndexFormat::U32, 0);
    }
}

/// Input layout slot
#[derive(Debug, Default, Clone, Copy)]
pub struct InputLayoutBinder;

impl SlotBinder<VertexInputLayout> for InputLayoutBinder {
    fn bind(&self, ctx: &mut dyn NativeContext, _slot: u32, value: &VertexInputLayout) {
        ctx.set_input_layout(value.native_handle());
    }

    fn unbind(&self, ctx: &mut dyn NativeContext, _slot: u32) {
        ctx.set_input_layout(NativeHandle::NULL);
    }
}

/// Blend state slot
#[derive(Debug, Default, Clone, Copy)]
pub struct BlendStateBinder;

impl SlotBinder<BlendState> for BlendStateBinder {
    fn bind(&self, ctx: &mut dyn NativeContext, _slot: u32, value: &BlendState) {
        ctx.set_blend_state(value.native_handle(), value.desc().blend_factor, value.desc().sample_mask);
    }

    fn unbind(&self, ctx: &mut dyn NativeContext, _slot: u32) {
        ctx.set_blend_state(NativeHandle::NULL, [1.0; 4], u32::MAX);
    }
}

/// Depth-stencil state slot
#[derive(Debug, Default, Clone, Copy)]
pub struct DepthStateBinder;

impl SlotBinder<DepthStencilState> for DepthStateBinder {
    fn bind(&self, ctx: &mut dyn NativeContext, _slot: u32, value: &DepthStencilState) {
        ctx.set_depth_stencil_state(value.native_handle(), value.desc().stencil_ref);
    }

    fn unbind(&self, ctx: &mut dyn NativeContext, _slot: u32) {
        ctx.set_depth_stencil_state(NativeHandle::NULL, 0);
    }
}

/// Rasterizer state slot
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterizerStateBinder;

impl SlotBinder<RasterizerState> for RasterizerStateBinder {
    fn bind(&self, ctx: &mut dyn NativeContext, _slot: u32, value: &RasterizerState) {
        ctx.set_rasterizer_state(value.native_handle());
    }

    fn unbind(&self, ctx: &mut dyn NativeContext, _slot: u32) {
        ctx.set_rasterizer_state(NativeHandle::NULL);
    }
}

/// Render-target slots
///
/// Render targets and the depth view go out in a single native call, so the
/// queue issues it after diffing both groups; the binder only tracks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SurfaceBinder;

impl SlotBinder<GraphicsResource> for SurfaceBinder {
    fn bind(&self, _ctx: &mut dyn NativeContext, _slot: u32, _value: &GraphicsResource) {}

    fn unbind(&self, _ctx: &mut dyn NativeContext, _slot: u32) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// Bindable test object with a bumpable version
    #[derive(Debug)]
    pub(crate) struct Obj {
        id: u64,
        version: AtomicU64,
    }

    impl Obj {
        pub(crate) fn new(id: u64) -> Self {
            Self { id, version: AtomicU64::new(0) }
        }

        pub(crate) fn bump(&self) {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Bindable for Obj {
        fn native_handle(&self) -> NativeHandle {
            NativeHandle(self.id)
        }

        fn version(&self) -> u64 {
            self.version.load(Ordering::SeqCst)
        }
    }

    /// Binder that counts calls instead of touching a context
    #[derive(Debug, Default)]
    pub(crate) struct CountingBinder {
        binds: Cell<usize>,
        unbinds: Cell<usize>,
        group_binds: Cell<usize>,
        group_unbinds: Cell<usize>,
        last_group: Cell<Option<(u32, u32)>>,
    }

    impl CountingBinder {
        pub(crate) fn binds(&self) -> usize {
            self.binds.get()
        }

        pub(crate) fn unbinds(&self) -> usize {
            self.unbinds.get()
        }

        pub(crate) fn group_binds(&self) -> usize {
            self.group_binds.get()
        }

        pub(crate) fn group_unbinds(&self) -> usize {
            self.group_unbinds.get()
        }

        /// First slot and length of the last bulk bind
        pub(crate) fn last_group_range(&self) -> Option<(u32, u32)> {
            self.last_group.get()
        }
    }

    impl SlotBinder<Obj> for CountingBinder {
        fn bind(&self, _ctx: &mut dyn NativeContext, _slot: u32, _value: &Obj) {
            self.binds.set(self.binds.get() + 1);
        }

        fn unbind(&self, _ctx: &mut dyn NativeContext, _slot: u32) {
            self.unbinds.set(self.unbinds.get() + 1);
        }

        fn bind_group(&self, _ctx: &mut dyn NativeContext, first_slot: u32, slots: &[BindingSlot<Obj>], _changed: u32) {
            self.group_binds.set(self.group_binds.get() + 1);
            self.last_group.set(Some((first_slot, slots.len() as u32)));
        }

        fn unbind_group(&self, _ctx: &mut dyn NativeContext, first_slot: u32, count: u32) {
            self.group_unbinds.set(self.group_unbinds.get() + 1);
            self.last_group.set(Some((first_slot, count)));
        }
    }
}
