//! Validate-then-bind-then-issue
//!
//! Every draw and dispatch goes through [`CommandQueue::apply_state`]: the
//! shader slot is resolved, pending apply-priority tasks of every referenced
//! resource are drained, then each enabled pass stages its bindings, sends
//! only what changed to the native context, validates, and issues the call
//! `iterations` times. The first failing pass stops the shader.

use std::sync::Arc;

use super::validation::{resolve_compute_groups, validate_compute, validate_draw, DrawBindings};
use super::{BindResult, CommandQueue, QueueValidationMode};
use crate::backend::{DebugSeverity, NativeContext, NativeHandle};
use crate::binding::{
    Bindable, BindingSlot, BindingSlotGroup, ConstantBufferBinder, IndexBufferBinder, InputLayoutBinder, SamplerBinder,
    ShaderBinder, ShaderResourceBinder, SlotBinder, StageShaderBinder, SurfaceBinder, UnorderedAccessBinder, VertexBufferBinder,
    BlendStateBinder, DepthStateBinder, RasterizerStateBinder,
};
use crate::device::DeviceCapabilities;
use crate::resource::GraphicsResource;
use crate::shader::{
    trim_signature, DepthWritePermission, PrimitiveTopology, Shader, ShaderBindings, ShaderComposition, ShaderPass,
    ShaderSampler, ShaderStageKind,
};
use crate::{HalError, HalResult};

/// Slot groups of one pipeline stage
#[derive(Debug)]
pub(crate) struct ShaderStage {
    kind: ShaderStageKind,
    binder: StageShaderBinder,
    shader: BindingSlot<ShaderComposition>,
    constant_buffers: BindingSlotGroup<GraphicsResource, ConstantBufferBinder>,
    resources: BindingSlotGroup<GraphicsResource, ShaderResourceBinder>,
    samplers: BindingSlotGroup<ShaderSampler, SamplerBinder>,
    unordered_access: Option<BindingSlotGroup<GraphicsResource, UnorderedAccessBinder>>,
}

impl ShaderStage {
    pub fn new(kind: ShaderStageKind, caps: &DeviceCapabilities) -> Self {
        let unordered_access = (kind == ShaderStageKind::Compute)
            .then(|| BindingSlotGroup::new(caps.max_unordered_access_slots, UnorderedAccessBinder { stage: kind }));
        Self {
            kind,
            binder: StageShaderBinder { stage: kind },
            shader: BindingSlot::new(0),
            constant_buffers: BindingSlotGroup::new(caps.max_constant_buffer_slots, ConstantBufferBinder { stage: kind }),
            resources: BindingSlotGroup::new(caps.max_shader_resource_slots, ShaderResourceBinder { stage: kind }),
            samplers: BindingSlotGroup::new(caps.max_sampler_slots, SamplerBinder { stage: kind }),
            unordered_access,
        }
    }

    pub fn composition(&self) -> Option<&Arc<ShaderComposition>> {
        self.shader.value()
    }

    pub fn is_shader_dirty(&self) -> bool {
        self.shader.is_dirty()
    }

    /// Stage the pass's program for this stage and the values its ids select
    pub fn stage_pass(&mut self, pass: &ShaderPass, bindings: &ShaderBindings) {
        let composition = pass.composition(self.kind).cloned();
        self.constant_buffers.clear();
        self.resources.clear();
        self.samplers.clear();
        if let Some(uavs) = self.unordered_access.as_mut() {
            uavs.clear();
        }

        if let Some(composition) = composition.as_deref() {
            for &id in composition.constant_buffer_ids() {
                stage_slot(&mut self.constant_buffers, self.kind, "constant buffer", id, bindings.constant_buffer(id));
            }
            for &id in composition.resource_ids() {
                stage_slot(&mut self.resources, self.kind, "resource", id, bindings.resource(id));
            }
            for &id in composition.sampler_ids() {
                stage_slot(&mut self.samplers, self.kind, "sampler", id, bindings.sampler(id));
            }
            if let Some(uavs) = self.unordered_access.as_mut() {
                for &id in composition.unordered_access_ids() {
                    stage_slot(uavs, self.kind, "unordered access", id, bindings.unordered_access(id));
                }
            }
        }
        self.shader.set(composition);
    }

    /// Send every changed slot of the stage
    pub fn bind(&mut self, ctx: &mut dyn NativeContext) {
        self.shader.bind(&self.binder, ctx);
        self.constant_buffers.bind_all(ctx);
        self.resources.bind_all(ctx);
        self.samplers.bind_all(ctx);
        if let Some(uavs) = self.unordered_access.as_mut() {
            uavs.bind_all(ctx);
        }
    }

    pub fn invalidate(&mut self) {
        self.shader.invalidate();
        self.constant_buffers.invalidate();
        self.resources.invalidate();
        self.samplers.invalidate();
        if let Some(uavs) = self.unordered_access.as_mut() {
            uavs.invalidate();
        }
    }
}

fn stage_slot<T, B>(group: &mut BindingSlotGroup<T, B>, stage: ShaderStageKind, what: &str, id: u32, value: Option<Arc<T>>)
where
    T: Bindable,
    B: SlotBinder<T>,
{
    if !group.set(id, value) {
        log::warn!("{stage} {what} id {id} is outside the {} available slots", group.len());
    }
}

impl CommandQueue {
    /// Bind the pipeline for the current shader and issue `issue` per render-pass iteration
    pub(crate) fn apply_state<F>(&mut self, mode: QueueValidationMode, mut issue: F) -> HalResult<BindResult>
    where
        F: FnMut(&mut dyn NativeContext),
    {
        if !self.draw_info.began {
            return Err(HalError::NotRecording);
        }

        self.shader.bind(&ShaderBinder, self.native.as_mut());
        let Some(shader) = self.shader.value().cloned() else {
            return Ok(BindResult::NO_SHADER);
        };

        self.apply_pending_tasks(&shader)?;

        self.native.begin_event(&format!("{mode} Call"));
        let result = self.apply_passes(mode, &shader, &mut issue);
        self.native.end_event();
        self.forward_debug_messages();
        result
    }

    fn apply_passes<F>(&mut self, mode: QueueValidationMode, shader: &Shader, issue: &mut F) -> HalResult<BindResult>
    where
        F: FnMut(&mut dyn NativeContext),
    {
        let passes = shader.passes();
        let mut result = BindResult::SUCCESSFUL;

        for (index, pass) in passes.iter().enumerate() {
            if !pass.is_enabled() {
                self.native.set_marker(&format!("Pass {} '{}' disabled", index + 1, pass.name()));
                continue;
            }

            result = if pass.is_compute() {
                self.apply_compute_pass(shader, pass)
            } else if mode.is_compute() {
                continue;
            } else {
                let result = self.apply_render_state(mode, shader, pass)?;
                if result.is_successful() {
                    for _ in 0..pass.iterations() {
                        issue(self.native.as_mut());
                        self.profiler.stats_mut().draw_calls += 1;
                    }
                    pass.invoke_completed(&self.draw_info.custom);
                }
                result
            };

            if !result.is_successful() {
                log::warn!(
                    "{mode} failed with {result}: pass {}/{} '{}' of shader '{}' (topology {:?}, compute: {})",
                    index + 1,
                    passes.len(),
                    pass.name(),
                    shader.name(),
                    pass.topology(),
                    pass.is_compute()
                );
                break;
            }
        }
        Ok(result)
    }

    fn apply_compute_pass(&mut self, shader: &Shader, pass: &ShaderPass) -> BindResult {
        {
            let bindings = shader.bindings();
            let stage = &mut self.stages[ShaderStageKind::Compute.index()];
            stage.stage_pass(pass, &bindings);
            stage.bind(self.native.as_mut());
        }

        let groups = resolve_compute_groups(self.draw_info.custom.compute_groups, pass.compute_groups());
        let result = validate_compute(groups, self.device.capabilities());
        if !result.is_successful() {
            return result;
        }

        for _ in 0..pass.iterations() {
            self.native.dispatch(groups);
            self.profiler.stats_mut().dispatch_calls += 1;
        }
        pass.invoke_completed(&self.draw_info.custom);
        result
    }

    /// Bind everything a render pass needs, in pipeline order, then validate
    fn apply_render_state(&mut self, mode: QueueValidationMode, shader: &Shader, pass: &ShaderPass) -> HalResult<BindResult> {
        let topology = pass.topology();
        if topology == PrimitiveTopology::Undefined {
            return Ok(BindResult::UNDEFINED_TOPOLOGY);
        }
        if self.topology != topology {
            self.native.set_topology(topology);
            self.topology = topology;
        }

        {
            let bindings = shader.bindings();
            for kind in ShaderStageKind::RENDER {
                self.stages[kind.index()].stage_pass(pass, &bindings);
            }
            self.render_uavs.clear();
            if let Some(pixel) = pass.composition(ShaderStageKind::Pixel) {
                for &id in pixel.unordered_access_ids() {
                    stage_slot(&mut self.render_uavs, ShaderStageKind::Pixel, "unordered access", id, bindings.unordered_access(id));
                }
            }
        }

        let vertex_shader_changed = self.stages[ShaderStageKind::Vertex.index()].is_shader_dirty();
        for kind in ShaderStageKind::RENDER {
            self.stages[kind.index()].bind(self.native.as_mut());
        }
        self.render_uavs.bind_all(self.native.as_mut());

        self.index_buffer.bind(&IndexBufferBinder, self.native.as_mut());
        let vertex_buffers_changed = self.vertex_buffers.bind_all(self.native.as_mut());
        self.update_input_layout(vertex_shader_changed || vertex_buffers_changed)?;
        self.input_layout.bind(&InputLayoutBinder, self.native.as_mut());

        self.blend_state.set(pass.blend_state().cloned());
        self.blend_state.bind(&BlendStateBinder, self.native.as_mut());
        self.depth_state.set(pass.depth_state().cloned());
        self.depth_state.bind(&DepthStateBinder, self.native.as_mut());
        self.rasterizer_state.set(pass.rasterizer_state().cloned());
        self.rasterizer_state.bind(&RasterizerStateBinder, self.native.as_mut());

        if self.scissors_dirty {
            self.native.set_scissor_rects(&self.scissors);
            self.scissors_dirty = false;
        }
        if self.viewports_dirty {
            self.native.set_viewports(&self.viewports);
            self.viewports_dirty = false;
        }

        self.bind_surfaces(pass.depth_write());

        let bindings = DrawBindings {
            has_vertex_buffer: self.vertex_buffers.value(0).is_some(),
            has_index_buffer: self.index_buffer.value().is_some(),
            instanced_layout: self.input_layout.value().is_some_and(|layout| layout.is_instanced()),
        };
        Ok(validate_draw(mode, bindings))
    }

    /// Pick the input layout for the bound vertex shader and vertex formats
    fn update_input_layout(&mut self, changed: bool) -> HalResult<()> {
        if !changed && self.input_layout.value().is_some() {
            return Ok(());
        }
        let Some(vertex_shader) = self.stages[ShaderStageKind::Vertex.index()].composition().cloned() else {
            self.input_layout.set(None);
            return Ok(());
        };

        let signature = trim_signature(
            self.vertex_buffers
                .iter()
                .map(|slot| slot.value().and_then(|buffer| buffer.vertex_format()))
                .collect(),
        );
        let cached = self
            .layout_cache
            .iter()
            .find(|layout| layout.is_match(vertex_shader.native_handle(), &signature))
            .cloned();

        let layout = match cached {
            Some(layout) => layout,
            None => {
                let layout = self.device.create_input_layout(&vertex_shader, signature)?;
                self.layout_cache.push(Arc::clone(&layout));
                layout
            }
        };
        self.input_layout.set(Some(layout));
        Ok(())
    }

    /// Send render targets and depth when either changed
    fn bind_surfaces(&mut self, permission: DepthWritePermission) {
        let surfaces_dirty = self.surfaces.iter().any(BindingSlot::is_dirty);
        let depth_dirty = self.depth_surface.is_dirty() || permission != self.bound_depth_mode;
        if !surfaces_dirty && !depth_dirty {
            return;
        }

        let count = self
            .surfaces
            .iter()
            .rposition(|slot| slot.value().is_some())
            .map_or(0, |last| last + 1);
        let targets: Vec<NativeHandle> = self
            .surfaces
            .iter()
            .take(count)
            .map(|slot| slot.value().map_or(NativeHandle::NULL, |surface| surface.native().target_view))
            .collect();
        let depth = match (self.depth_surface.value(), permission) {
            (Some(depth), DepthWritePermission::Enabled) => depth.native().depth_view,
            (Some(depth), DepthWritePermission::ReadOnly) => depth.native().read_only_depth_view,
            _ => NativeHandle::NULL,
        };

        self.native.set_render_targets(&targets, depth);
        self.surfaces.bind_all(self.native.as_mut());
        self.depth_surface.bind(&SurfaceBinder, self.native.as_mut());
        self.bound_depth_mode = permission;
        self.profiler.stats_mut().surface_bindings += 1;
    }

    /// Run apply-priority tasks of every resource the draw will read or write
    fn apply_pending_tasks(&mut self, shader: &Shader) -> HalResult<()> {
        let mut pending: Vec<Arc<GraphicsResource>> = shader
            .bindings()
            .resources_in_use()
            .filter(|resource| resource.has_pending_tasks())
            .cloned()
            .collect();

        let input_assembly = self.vertex_buffers.iter().filter_map(BindingSlot::value).chain(self.index_buffer.value());
        let outputs = self.surfaces.iter().filter_map(BindingSlot::value).chain(self.depth_surface.value());
        for resource in input_assembly.chain(outputs) {
            if resource.has_pending_tasks() && !pending.iter().any(|seen| Arc::ptr_eq(seen, resource)) {
                pending.push(Arc::clone(resource));
            }
        }

        for resource in pending {
            resource.apply_changes(self)?;
        }
        Ok(())
    }

    fn forward_debug_messages(&mut self) {
        let messages = self.native.drain_debug_messages();
        let backend = self.device.native().name();
        for message in messages {
            match message.severity {
                DebugSeverity::Error => log::error!("[{backend}] {}", message.text),
                DebugSeverity::Warning => log::warn!("[{backend}] {}", message.text),
                DebugSeverity::Info => log::debug!("[{backend}] {}", message.text),
            }
        }
    }
}
