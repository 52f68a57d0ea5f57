use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{Level, LevelFilter, Log, Metadata, Record};

use super::*;
use crate::backend::headless::{HeadlessDevice, NativeCall};
use crate::backend::{DebugSeverity, NativeHandle};
use crate::binding::Bindable;
use crate::config::HalConfig;
use crate::device::DeviceCapabilities;
use crate::resource::{Format, GetDataTask, ResizeTask, ResourceDesc, SetDataTask};
use crate::shader::{ShaderComposition, ShaderPass, VertexElementFormat, VertexFormat};

thread_local! {
    static CAPTURED: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
}

/// Collects records per test thread
struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        CAPTURED.with(|captured| captured.borrow_mut().push((record.level(), record.args().to_string())));
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

fn capture_logs() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Trace);
    CAPTURED.with(|captured| captured.borrow_mut().clear());
}

fn logged(level: Level, needle: &str) -> bool {
    CAPTURED.with(|captured| {
        captured
            .borrow()
            .iter()
            .any(|(lvl, text)| *lvl == level && text.contains(needle))
    })
}

struct Fixture {
    headless: HeadlessDevice,
    device: Arc<GraphicsDevice>,
    queue: CommandQueue,
}

fn fixture() -> Fixture {
    fixture_with(DeviceCapabilities::default())
}

fn fixture_with(capabilities: DeviceCapabilities) -> Fixture {
    let headless = HeadlessDevice::with_capabilities(capabilities);
    let device = GraphicsDevice::new(Box::new(headless.clone()), HalConfig::default()).unwrap();
    let queue = device.create_queue(ContextKind::Immediate).unwrap();
    Fixture { headless, device, queue }
}

fn vs() -> ShaderComposition {
    ShaderComposition::new(ShaderStageKind::Vertex, "main", NativeHandle(100))
}

fn ps() -> ShaderComposition {
    ShaderComposition::new(ShaderStageKind::Pixel, "main", NativeHandle(101))
}

fn cs() -> ShaderComposition {
    ShaderComposition::new(ShaderStageKind::Compute, "main", NativeHandle(102))
}

fn position() -> VertexFormat {
    VertexFormat::new().with_element("POSITION", 0, VertexElementFormat::Float3)
}

fn cube(device: &GraphicsDevice) -> Arc<GraphicsResource> {
    device
        .create_vertex_buffer("cube", position(), &[[0.0f32; 3]; 36], ResourceFlags::GPU_READ)
        .unwrap()
}

fn render_shader() -> Arc<Shader> {
    Arc::new(Shader::new("solid", vec![ShaderPass::new("main").with_stage(vs()).with_stage(ps())]).unwrap())
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&ShaderPass, &CustomDrawInfo) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    (count, move |_: &ShaderPass, _: &CustomDrawInfo| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
}

fn is_dispatch(call: &NativeCall) -> bool {
    matches!(call, NativeCall::Dispatch(_))
}

#[test]
fn test_draw_with_shader_and_vertex_buffer() {
    let mut f = fixture();
    let (completed, callback) = counter();
    let pass = ShaderPass::new("main").with_stage(vs()).with_stage(ps()).on_completed(callback);
    let shader = Arc::new(Shader::new("solid", vec![pass]).unwrap());
    let vb = cube(&f.device);

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(shader));
    f.queue.set_vertex_buffer(0, Some(vb)).unwrap();

    assert_eq!(f.queue.draw(36, 0).unwrap(), BindResult::SUCCESSFUL);
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 1);
    assert!(f.headless.calls().contains(&NativeCall::Draw { vertex_count: 36, start_vertex: 0 }));
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(f.queue.profiler().current().draw_calls, 1);
}

#[test]
fn test_iterations_repeat_the_draw() {
    let mut f = fixture();
    let (completed, callback) = counter();
    let pass = ShaderPass::new("blur").with_stage(vs()).with_iterations(3).on_completed(callback);
    let shader = Arc::new(Shader::new("blur", vec![pass]).unwrap());

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(shader));
    assert!(f.queue.draw(3, 0).unwrap().is_successful());
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 3);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_missing_shader_then_recovery() {
    let mut f = fixture();
    f.queue.begin(CommandListFlags::empty()).unwrap();

    assert_eq!(f.queue.draw(36, 0).unwrap(), BindResult::NO_SHADER);
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 0);

    f.queue.set_shader(Some(render_shader()));
    f.queue.set_vertex_buffer(0, Some(cube(&f.device))).unwrap();
    assert!(f.queue.draw(36, 0).unwrap().is_successful());
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 1);
}

#[test]
fn test_indexed_draw_without_index_buffer() {
    let mut f = fixture();
    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(render_shader()));
    f.queue.set_vertex_buffer(0, Some(cube(&f.device))).unwrap();

    let result = f.queue.draw_indexed(36, 0, 0).unwrap();
    assert!(result.contains(BindResult::MISSING_INDEX_SEGMENT));
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 0);

    let ib = f.device.create_index_buffer("indices", &[0u16; 36], ResourceFlags::GPU_READ).unwrap();
    f.queue.set_index_buffer(Some(ib)).unwrap();
    assert!(f.queue.draw_indexed(36, 0, 0).unwrap().is_successful());
    assert!(f.headless.calls().contains(&NativeCall::DrawIndexed { index_count: 36, start_index: 0, base_vertex: 0 }));
}

#[test]
fn test_dispatch_over_limit_is_rejected() {
    capture_logs();
    let caps = DeviceCapabilities::default().with_max_compute_groups([16, 16, 1]);
    let mut f = fixture_with(caps);
    let shader = Arc::new(Shader::new("simulate", vec![ShaderPass::new("step").with_stage(cs())]).unwrap());

    f.queue.begin(CommandListFlags::empty()).unwrap();
    let result = f.queue.dispatch(&shader, [17, 1, 1]).unwrap();

    assert_eq!(result, BindResult::INVALID_COMPUTE_GROUP_DIMENSION);
    assert_eq!(f.headless.count_calls(is_dispatch), 0);
    assert!(logged(Level::Error, "X dimension (17) is greater than supported (16)"));
}

#[test]
fn test_dispatch_zero_axis_uses_pass_default() {
    let mut f = fixture();
    let pass = ShaderPass::new("step").with_stage(cs()).with_compute_groups([8, 8, 1]);
    let shader = Arc::new(Shader::new("simulate", vec![pass]).unwrap());

    f.queue.begin(CommandListFlags::empty()).unwrap();
    assert!(f.queue.dispatch(&shader, [0, 4, 0]).unwrap().is_successful());
    assert!(f.headless.calls().contains(&NativeCall::Dispatch([8, 4, 1])));
    assert!(f.headless.calls().contains(&NativeCall::BeginEvent("Dispatch Call".to_string())));
    assert_eq!(f.queue.profiler().current().dispatch_calls, 1);
}

#[test]
fn test_dispatch_skips_render_passes() {
    let mut f = fixture();
    let shader = Arc::new(
        Shader::new(
            "particles",
            vec![
                ShaderPass::new("simulate").with_stage(cs()),
                ShaderPass::new("draw").with_stage(vs()).with_stage(ps()),
            ],
        )
        .unwrap(),
    );

    f.queue.begin(CommandListFlags::empty()).unwrap();
    assert!(f.queue.dispatch(&shader, [1, 1, 1]).unwrap().is_successful());
    assert_eq!(f.headless.count_calls(is_dispatch), 1);
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 0);

    // A draw runs both: compute passes are not filtered by draw mode.
    f.queue.set_shader(Some(Arc::clone(&shader)));
    assert!(f.queue.draw(4, 0).unwrap().is_successful());
    assert_eq!(f.headless.count_calls(is_dispatch), 2);
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 1);
}

#[test]
fn test_dispatch_keeps_the_draw_shader() {
    let mut f = fixture();
    let render = render_shader();
    let compute = Arc::new(Shader::new("simulate", vec![ShaderPass::new("step").with_stage(cs())]).unwrap());

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(Arc::clone(&render)));
    assert!(f.queue.draw(3, 0).unwrap().is_successful());
    assert!(f.queue.dispatch(&compute, [2, 1, 1]).unwrap().is_successful());
    assert!(f.queue.draw(3, 0).unwrap().is_successful());

    assert!(f.queue.shader().is_some_and(|shader| Arc::ptr_eq(shader, &render)));
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 2);
    assert_eq!(f.headless.count_calls(is_dispatch), 1);
}

#[test]
fn test_failing_pass_stops_the_shader() {
    let mut f = fixture();
    let (first, first_callback) = counter();
    let (second, second_callback) = counter();
    let shader = Arc::new(
        Shader::new(
            "broken",
            vec![
                ShaderPass::new("first")
                    .with_stage(vs())
                    .with_topology(PrimitiveTopology::Undefined)
                    .on_completed(first_callback),
                ShaderPass::new("second").with_stage(vs()).on_completed(second_callback),
            ],
        )
        .unwrap(),
    );

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(shader));
    assert_eq!(f.queue.draw(3, 0).unwrap(), BindResult::UNDEFINED_TOPOLOGY);
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 0);
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 0);
}

#[test]
fn test_disabled_pass_leaves_a_marker() {
    let mut f = fixture();
    let shader = Arc::new(
        Shader::new(
            "outline",
            vec![ShaderPass::new("outline").with_stage(vs()).disabled(), ShaderPass::new("fill").with_stage(vs())],
        )
        .unwrap(),
    );

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(Arc::clone(&shader)));
    assert!(f.queue.draw(3, 0).unwrap().is_successful());
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 1);
    assert!(f.headless.calls().contains(&NativeCall::Marker("Pass 1 'outline' disabled".to_string())));

    shader.passes()[0].set_enabled(true);
    assert!(f.queue.draw(3, 0).unwrap().is_successful());
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 3);
}

#[test]
fn test_repeated_draw_sends_bindings_once() {
    let mut f = fixture();
    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(render_shader()));
    f.queue.set_vertex_buffer(0, Some(cube(&f.device))).unwrap();

    f.queue.draw(36, 0).unwrap();
    f.queue.draw(36, 0).unwrap();

    let vertex_shader_binds = f
        .headless
        .count_calls(|call| matches!(call, NativeCall::SetShader { stage: ShaderStageKind::Vertex, .. }));
    let vertex_buffer_binds = f.headless.count_calls(|call| matches!(call, NativeCall::SetVertexBuffers { .. }));
    let topology_sets = f.headless.count_calls(|call| matches!(call, NativeCall::SetTopology(_)));
    assert_eq!(vertex_shader_binds, 1);
    assert_eq!(vertex_buffer_binds, 1);
    assert_eq!(topology_sets, 1);
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 2);
}

#[test]
fn test_begin_rebinds_everything() {
    let mut f = fixture();
    f.queue.set_shader(Some(render_shader()));
    f.queue.set_vertex_buffer(0, Some(cube(&f.device))).unwrap();

    for _ in 0..2 {
        f.queue.begin(CommandListFlags::empty()).unwrap();
        f.queue.draw(36, 0).unwrap();
        f.queue.end().unwrap();
    }
    let vertex_buffer_binds = f.headless.count_calls(|call| matches!(call, NativeCall::SetVertexBuffers { .. }));
    assert_eq!(vertex_buffer_binds, 2);
}

#[test]
fn test_apply_tasks_run_in_order_before_the_draw() {
    for invalidate in [false, true] {
        let mut f = fixture();
        let cb = f.device.create_constant_buffer("constants", 64).unwrap();
        let shader = Arc::new(
            Shader::new("lit", vec![ShaderPass::new("main").with_stage(vs().with_constant_buffers(&[0]))]).unwrap(),
        );
        shader.set_constant_buffer(0, Some(Arc::clone(&cb)));

        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 1..=3 {
            let order = Arc::clone(&order);
            let headless = f.headless.clone();
            cb.queue_task(GraphicsPriority::Apply, move |_: &mut CommandQueue, _: &GraphicsResource| -> HalResult<bool> {
                order.lock().unwrap().push((tag, headless.count_calls(NativeCall::is_draw)));
                Ok(invalidate && tag == 2)
            })
            .unwrap();
        }
        assert_eq!(cb.pending_task_count(), 3);

        f.queue.begin(CommandListFlags::empty()).unwrap();
        f.queue.set_shader(Some(shader));
        assert!(f.queue.draw(3, 0).unwrap().is_successful());

        assert_eq!(*order.lock().unwrap(), vec![(1, 0), (2, 0), (3, 0)]);
        assert!(!cb.has_pending_tasks());
        assert_eq!(cb.version(), u64::from(invalidate));
    }
}

#[test]
fn test_apply_set_data_is_visible_to_the_draw() {
    let mut f = fixture();
    let cb = f.device.create_constant_buffer("constants", 16).unwrap();
    let shader = Arc::new(
        Shader::new("lit", vec![ShaderPass::new("main").with_stage(vs().with_constant_buffers(&[0]))]).unwrap(),
    );
    shader.set_constant_buffer(0, Some(Arc::clone(&cb)));
    cb.queue_task(GraphicsPriority::Apply, SetDataTask::from_slice(&[1u32, 2, 3, 4])).unwrap();

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(shader));
    f.queue.draw(3, 0).unwrap();

    let expected: Vec<u8> = bytemuck::cast_slice(&[1u32, 2, 3, 4]).to_vec();
    assert_eq!(f.headless.memory_of(&cb.native()).unwrap(), expected);
    assert_eq!(f.queue.profiler().current().map_discard_count, 1);
}

#[test]
fn test_invalidating_task_rebinds_the_vertex_buffer() {
    let mut f = fixture();
    let vb = cube(&f.device);
    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(render_shader()));
    f.queue.set_vertex_buffer(0, Some(Arc::clone(&vb))).unwrap();
    f.queue.draw(36, 0).unwrap();

    vb.queue_task(GraphicsPriority::Apply, |_: &mut CommandQueue, _: &GraphicsResource| -> HalResult<bool> {
        Ok(true)
    })
    .unwrap();
    f.queue.draw(36, 0).unwrap();

    let vertex_buffer_binds = f.headless.count_calls(|call| matches!(call, NativeCall::SetVertexBuffers { .. }));
    assert_eq!(vertex_buffer_binds, 2);
}

#[test]
fn test_immediate_resize_bumps_version() {
    let mut f = fixture();
    let cb = f.device.create_constant_buffer("constants", 64).unwrap();

    assert!(cb.queue_task(GraphicsPriority::Immediate, ResizeTask::buffer(128)).is_err());
    assert!(f.queue.queue_resource_task(&cb, GraphicsPriority::Immediate, ResizeTask::buffer(128)).unwrap());
    assert_eq!(cb.version(), 1);
    assert_eq!(cb.size_in_bytes(), 128);
    assert_eq!(f.device.pending_release_count(), 1);

    // Same size: nothing to recreate.
    assert!(!f.queue.queue_resource_task(&cb, GraphicsPriority::Immediate, ResizeTask::buffer(128)).unwrap());
    assert_eq!(cb.version(), 1);
}

#[test]
fn test_readback_through_staging() {
    let mut f = fixture();
    let cb = f.device.create_constant_buffer("constants", 8).unwrap();
    f.queue
        .queue_resource_task(&cb, GraphicsPriority::Immediate, SetDataTask::from_slice(&[7u32, 9]))
        .unwrap();

    let result = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result);
    let task = GetDataTask::new(move |bytes| {
        *slot.lock().unwrap() = Some(bytes.unwrap());
    });
    f.queue.queue_resource_task(&cb, GraphicsPriority::Immediate, task).unwrap();

    let expected: Vec<u8> = bytemuck::cast_slice(&[7u32, 9]).to_vec();
    assert_eq!(result.lock().unwrap().clone(), Some(expected));
    assert_eq!(f.queue.profiler().current().copy_resource_count, 1);
}

#[test]
fn test_draw_without_begin_fails() {
    let mut f = fixture();
    f.queue.set_shader(Some(render_shader()));
    f.queue.set_vertex_buffer(0, Some(cube(&f.device))).unwrap();

    assert!(matches!(f.queue.draw(36, 0), Err(HalError::NotRecording)));
    assert!(matches!(f.queue.draw_instanced(36, 2, 0, 0), Err(HalError::NotRecording)));
    assert!(matches!(f.queue.dispatch(&render_shader(), [1, 1, 1]), Err(HalError::NotRecording)));
    assert!(matches!(f.queue.end(), Err(HalError::NotRecording)));
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 0);
}

#[test]
fn test_begin_twice_fails() {
    let mut f = fixture();
    f.queue.begin(CommandListFlags::empty()).unwrap();
    assert!(matches!(f.queue.begin(CommandListFlags::empty()), Err(HalError::AlreadyRecording)));
    assert!(f.queue.is_recording());
}

#[test]
fn test_submit_needs_a_closed_list() {
    let mut f = fixture();
    assert!(matches!(f.queue.submit(CommandListFlags::empty()), Err(HalError::NothingToSubmit)));

    f.queue.begin(CommandListFlags::empty()).unwrap();
    let list = f.queue.end().unwrap();
    f.queue.submit(CommandListFlags::empty()).unwrap();

    assert!(list.is_submitted());
    assert!(f.headless.calls().contains(&NativeCall::Submit(list.native().handle)));
    assert!(matches!(f.queue.submit(CommandListFlags::empty()), Err(HalError::NothingToSubmit)));
}

#[test]
fn test_closed_lists_submit_in_order() {
    let mut f = fixture();
    f.queue.set_shader(Some(render_shader()));

    let mut lists = Vec::new();
    for _ in 0..2 {
        f.queue.begin(CommandListFlags::empty()).unwrap();
        f.queue.draw(3, 0).unwrap();
        lists.push(f.queue.end().unwrap());
    }
    assert_eq!(f.queue.pending_submissions(), 2);

    f.queue.submit(CommandListFlags::empty()).unwrap();
    assert_eq!(f.queue.pending_submissions(), 0);
    assert!(lists.iter().all(|list| list.is_submitted()));

    let submitted: Vec<NativeHandle> = f
        .headless
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            NativeCall::Submit(handle) => Some(handle),
            _ => None,
        })
        .collect();
    assert_eq!(submitted, vec![lists[0].native().handle, lists[1].native().handle]);
    assert!(matches!(f.queue.submit(CommandListFlags::empty()), Err(HalError::NothingToSubmit)));
}

#[test]
fn test_deferred_list_replays_on_primary() {
    let mut f = fixture();
    let mut deferred = f.device.create_queue(ContextKind::Deferred).unwrap();

    deferred.begin(CommandListFlags::empty()).unwrap();
    deferred.set_shader(Some(render_shader()));
    deferred.set_vertex_buffer(0, Some(cube(&f.device))).unwrap();
    assert!(deferred.draw(36, 0).unwrap().is_successful());
    let list = deferred.end().unwrap();

    assert!(list.is_deferred());
    assert!(list.flags().contains(CommandListFlags::DEFERRED));
    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 0);
    assert!(matches!(deferred.submit(CommandListFlags::empty()), Err(HalError::NotPrimary)));
    assert!(matches!(deferred.execute(&list), Err(HalError::NotPrimary)));
    assert!(matches!(f.queue.execute(&list), Err(HalError::NotRecording)));

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.execute(&list).unwrap();
    f.queue.execute(&list).unwrap();
    let primary = f.queue.end().unwrap();

    assert_eq!(f.headless.count_calls(NativeCall::is_draw), 2);
    assert_eq!(primary.dependencies().len(), 2);
    assert!(matches!(f.queue.execute(&primary), Err(HalError::NotDeferred)));
}

#[test]
fn test_render_surfaces_set_viewport_and_bind_on_change() {
    let mut f = fixture();
    let color = f.device.create_surface("color", 64, 32, Format::R8G8B8A8Unorm).unwrap();
    let depth = f.device.create_depth_surface("depth", 64, 32, Format::D32Float).unwrap();

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(render_shader()));
    f.queue.set_render_surfaces(&[Some(Arc::clone(&color))]).unwrap();
    assert_eq!(f.queue.viewports(), &[Viewport::new(64.0, 32.0)]);

    f.queue.draw(3, 0).unwrap();
    f.queue.draw(3, 0).unwrap();
    assert_eq!(f.queue.profiler().current().surface_bindings, 1);
    assert_eq!(f.headless.count_calls(|call| matches!(call, NativeCall::SetViewports(_))), 1);

    f.queue.set_depth_surface(Some(Arc::clone(&depth))).unwrap();
    f.queue.draw(3, 0).unwrap();
    assert_eq!(f.queue.profiler().current().surface_bindings, 2);
    assert!(f.headless.calls().contains(&NativeCall::SetRenderTargets {
        targets: vec![color.native().target_view],
        depth: depth.native().depth_view,
    }));

    f.queue.reset_render_surfaces();
    assert!(f.queue.render_surface(0).is_none());
    assert!(f.queue.depth_surface().is_none());
}

#[test]
fn test_read_only_depth_pass_uses_read_only_view() {
    let mut f = fixture();
    let depth = f.device.create_depth_surface("depth", 16, 16, Format::D24UnormS8Uint).unwrap();
    let pass = ShaderPass::new("decals").with_stage(vs()).with_depth_write(DepthWritePermission::ReadOnly);
    let shader = Arc::new(Shader::new("decals", vec![pass]).unwrap());

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(shader));
    f.queue.set_depth_surface(Some(Arc::clone(&depth))).unwrap();
    f.queue.draw(3, 0).unwrap();

    assert!(f.headless.calls().contains(&NativeCall::SetRenderTargets {
        targets: Vec::new(),
        depth: depth.native().read_only_depth_view,
    }));
}

#[test]
fn test_surface_setters_check_kind_and_range() {
    let mut f = fixture();
    let texture = f.device.create_texture("albedo", 4, 4, Format::R8G8B8A8Unorm, None).unwrap();
    let color = f.device.create_surface("color", 4, 4, Format::R8G8B8A8Unorm).unwrap();
    let max = f.device.capabilities().max_render_targets;

    assert!(f.queue.set_render_surface(Some(texture), 0).is_err());
    assert!(f.queue.set_render_surface(Some(Arc::clone(&color)), max).is_err());
    assert!(f.queue.set_depth_surface(Some(Arc::clone(&color))).is_err());

    let too_many = vec![Some(color); max as usize + 1];
    assert!(f.queue.set_render_surfaces(&too_many).is_err());
}

#[test]
fn test_scissors_are_sent_only_when_changed() {
    let mut f = fixture();
    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(render_shader()));
    f.queue.set_scissor_rectangle(Rect::new(0, 0, 32, 32));
    f.queue.draw(3, 0).unwrap();
    f.queue.set_scissor_rectangle(Rect::new(0, 0, 32, 32));
    f.queue.draw(3, 0).unwrap();
    f.queue.set_scissor_rectangle(Rect::new(8, 8, 16, 16));
    f.queue.draw(3, 0).unwrap();

    assert_eq!(f.headless.count_calls(|call| matches!(call, NativeCall::SetScissorRects(_))), 2);
    assert_eq!(f.queue.scissor_rectangles(), &[Rect::new(8, 8, 16, 16)]);
}

#[test]
fn test_input_layouts_are_cached_by_signature() {
    let mut f = fixture();
    let first = cube(&f.device);
    let second = cube(&f.device);
    let wide_format = VertexFormat::new().with_element("POSITION", 0, VertexElementFormat::Float4);
    let wide = f
        .device
        .create_vertex_buffer("wide", wide_format, &[[0.0f32; 4]; 3], ResourceFlags::GPU_READ)
        .unwrap();

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(render_shader()));
    for buffer in [&first, &second, &first, &wide] {
        f.queue.set_vertex_buffer(0, Some(Arc::clone(buffer))).unwrap();
        f.queue.draw(3, 0).unwrap();
    }
    assert_eq!(f.queue.cached_layouts(), 2);
}

#[test]
fn test_instanced_draw_needs_instanced_layout() {
    let mut f = fixture();
    let instances = f
        .device
        .create_vertex_buffer(
            "offsets",
            VertexFormat::new().with_element("OFFSET", 0, VertexElementFormat::Float2).per_instance(),
            &[[0.0f32; 2]; 4],
            ResourceFlags::GPU_READ,
        )
        .unwrap();

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(render_shader()));
    f.queue.set_vertex_buffer(0, Some(cube(&f.device))).unwrap();
    assert_eq!(f.queue.draw_instanced(36, 4, 0, 0).unwrap(), BindResult::NON_INSTANCED_VERTEX_LAYOUT);

    f.queue.set_vertex_buffer(1, Some(instances)).unwrap();
    assert!(f.queue.draw_instanced(36, 4, 0, 0).unwrap().is_successful());
    assert!(f.headless.calls().contains(&NativeCall::DrawInstanced { vertex_count: 36, instance_count: 4 }));
}

#[test]
fn test_vertex_slot_checks_kind_and_range() {
    let mut f = fixture();
    let cb = f.device.create_constant_buffer("constants", 16).unwrap();
    let max = f.device.capabilities().max_vertex_buffer_slots;

    assert!(f.queue.set_vertex_buffer(0, Some(cb)).is_err());
    assert!(f.queue.set_vertex_buffer(max, Some(cube(&f.device))).is_err());
    assert!(f.queue.set_index_buffer(Some(cube(&f.device))).is_err());
}

#[test]
fn test_map_type_selects_native_mode() {
    let mut f = fixture();
    let dynamic_vb = f
        .device
        .create_vertex_buffer("dynamic", position(), &[[0.0f32; 3]; 4], ResourceFlags::GPU_READ | ResourceFlags::CPU_WRITE)
        .unwrap();
    let cb = f.device.create_constant_buffer("constants", 16).unwrap();
    let readable = f
        .device
        .create_resource(
            "readback",
            ResourceDesc::buffer(ResourceKind::StagingBuffer, 16, 4, ResourceFlags::CPU_READ),
            None,
        )
        .unwrap();

    let stream = f.queue.map_resource(&dynamic_vb, 0, 0, MapType::Write).unwrap();
    assert_eq!(stream.mode(), NativeMapMode::WriteNoOverwrite);
    f.queue.unmap_resource(stream).unwrap();

    let stream = f.queue.map_resource(&cb, 0, 0, MapType::Write).unwrap();
    assert_eq!(stream.mode(), NativeMapMode::Write);
    f.queue.unmap_resource(stream).unwrap();

    let stream = f.queue.map_resource(&cb, 0, 0, MapType::Discard).unwrap();
    assert_eq!(stream.mode(), NativeMapMode::WriteDiscard);
    f.queue.unmap_resource(stream).unwrap();

    let stream = f.queue.map_resource(&readable, 0, 0, MapType::Read).unwrap();
    assert_eq!(stream.mode(), NativeMapMode::Read);
    f.queue.unmap_resource(stream).unwrap();

    assert!(matches!(f.queue.map_resource(&cb, 0, 0, MapType::Read), Err(HalError::InvalidMapAccess { .. })));
    assert!(matches!(f.queue.map_resource(&readable, 0, 0, MapType::Write), Err(HalError::InvalidMapAccess { .. })));

    let stats = f.queue.profiler().current();
    assert_eq!(stats.map_no_overwrite_count, 1);
    assert_eq!(stats.map_discard_count, 1);
    assert_eq!(stats.map_read_write_count, 2);
}

#[test]
fn test_second_map_fails_until_unmapped() {
    let mut f = fixture();
    let cb = f.device.create_constant_buffer("constants", 16).unwrap();

    let mut stream = f.queue.map_resource(&cb, 0, 0, MapType::Write).unwrap();
    assert!(cb.is_mapped());
    assert!(matches!(f.queue.map_resource(&cb, 0, 0, MapType::Write), Err(HalError::AlreadyMapped { .. })));

    stream.write_slice(&[5u32, 6, 7, 8]).unwrap();
    f.queue.unmap_resource(stream).unwrap();
    assert!(!cb.is_mapped());

    let stream = f.queue.map_resource(&cb, 0, 0, MapType::Write).unwrap();
    f.queue.unmap_resource(stream).unwrap();
    let expected: Vec<u8> = bytemuck::cast_slice(&[5u32, 6, 7, 8]).to_vec();
    assert_eq!(f.headless.memory_of(&cb.native()).unwrap(), expected);
}

#[test]
fn test_map_offset_past_end_releases_the_guard() {
    let mut f = fixture();
    let cb = f.device.create_constant_buffer("constants", 16).unwrap();

    assert!(matches!(f.queue.map_resource(&cb, 0, 32, MapType::Write), Err(HalError::InvalidMapAccess { .. })));
    assert!(!cb.is_mapped());
}

#[test]
fn test_copies_and_updates_are_counted() {
    let mut f = fixture();
    let source = f.device.create_constant_buffer("source", 16).unwrap();
    let destination = f.device.create_constant_buffer("destination", 16).unwrap();
    let small = f.device.create_constant_buffer("small", 8).unwrap();

    f.queue.update_resource(&source, 0, None, &[3; 16]).unwrap();
    f.queue.copy_resource(&source, &destination).unwrap();
    f.queue
        .copy_resource_region(&source, 0, Some(ResourceRegion::bytes(0, 8)), &small, 0, [0, 0, 0])
        .unwrap();

    assert!(f.queue.copy_resource(&source, &small).is_err());
    assert!(f.queue.copy_resource(&source, &source).is_err());
    assert_eq!(f.headless.memory_of(&destination.native()).unwrap(), vec![3; 16]);
    assert_eq!(f.headless.memory_of(&small.native()).unwrap(), vec![3; 8]);

    let stats = f.queue.profiler().current();
    assert_eq!(stats.update_subresource_count, 1);
    assert_eq!(stats.copy_resource_count, 1);
    assert_eq!(stats.copy_subresource_count, 1);
}

#[test]
fn test_generate_mips_needs_the_flag() {
    let mut f = fixture();
    let plain = f.device.create_texture("plain", 4, 4, Format::R8Unorm, None).unwrap();
    let desc = ResourceDesc::texture(4, 4, 3, Format::R8Unorm, ResourceFlags::GPU_READ | ResourceFlags::MIP_GENERATION);
    let mipped = f.device.create_resource("mipped", desc, None).unwrap();

    assert!(f.queue.generate_mips(&plain).is_err());
    f.queue.generate_mips(&mipped).unwrap();
    assert!(f.headless.calls().contains(&NativeCall::GenerateMips(mipped.native().handle)));
}

#[test]
fn test_draw_is_wrapped_in_an_event_and_forwards_debug_messages() {
    capture_logs();
    let mut f = fixture();
    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(render_shader()));
    f.headless.push_debug_message(DebugSeverity::Warning, "descriptor set out of date");
    f.queue.draw(3, 0).unwrap();

    let calls = f.headless.calls();
    let begin = calls.iter().position(|call| *call == NativeCall::BeginEvent("Draw Call".to_string())).unwrap();
    let draw = calls.iter().position(NativeCall::is_draw).unwrap();
    let end = calls.iter().rposition(|call| *call == NativeCall::EndEvent).unwrap();
    assert!(begin < draw && draw < end);
    assert!(logged(Level::Warn, "[headless] descriptor set out of date"));
}

#[test]
fn test_begin_unbinds_resources_the_next_shader_leaves_empty() {
    let mut f = fixture();
    let albedo = f.device.create_texture("albedo", 4, 4, Format::R8G8B8A8Unorm, None).unwrap();
    let textured = Arc::new(
        Shader::new("textured", vec![ShaderPass::new("main").with_stage(vs()).with_stage(ps().with_resources(&[3]))])
            .unwrap(),
    );
    textured.set_resource(3, Some(albedo));

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(textured));
    f.queue.draw(3, 0).unwrap();
    f.queue.end().unwrap();

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(render_shader()));
    f.queue.draw(3, 0).unwrap();

    assert!(f.headless.calls().contains(&NativeCall::SetShaderResources {
        stage: ShaderStageKind::Pixel,
        first: 3,
        views: vec![NativeHandle::NULL],
    }));
}

#[test]
fn test_deferred_queue_retires_its_own_lists() {
    let mut f = fixture();
    let mut deferred = f.device.create_queue(ContextKind::Deferred).unwrap();

    for frame in 1..=2 {
        f.device.begin_frame(&mut f.queue).unwrap();
        deferred.start_frame();
        assert_eq!(f.device.frame_index(), frame);
        assert_eq!(deferred.tracked_lists(), 0);

        deferred.begin(CommandListFlags::empty()).unwrap();
        deferred.set_shader(Some(render_shader()));
        deferred.draw(3, 0).unwrap();
        let list = deferred.end().unwrap();
        assert_eq!(list.frame(), frame);

        f.queue.begin(CommandListFlags::empty()).unwrap();
        f.queue.execute(&list).unwrap();
        f.queue.end().unwrap();
        f.queue.submit(CommandListFlags::empty()).unwrap();
        deferred.end_frame();
        f.device.end_frame(&mut f.queue).unwrap();
    }
    assert_eq!(deferred.tracked_lists(), 1);

    // The primary list holds its deferred dependencies until it retires.
    f.device.begin_frame(&mut f.queue).unwrap();
    assert_eq!(f.queue.tracked_lists(), 0);
    deferred.start_frame();
    assert_eq!(deferred.tracked_lists(), 0);
    assert_eq!(f.device.frame_index(), 3);
}

#[test]
fn test_frames_reset_profiler_and_retire_lists() {
    let mut f = fixture();
    f.device.begin_frame(&mut f.queue).unwrap();

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.set_shader(Some(render_shader()));
    f.queue.draw(3, 0).unwrap();
    let list = f.queue.end().unwrap();
    let handle = list.native().handle;
    f.queue.submit(CommandListFlags::empty()).unwrap();

    let stats = f.device.end_frame(&mut f.queue).unwrap();
    assert_eq!(stats.draw_calls, 1);
    assert_eq!(f.queue.profiler().previous().draw_calls, 1);

    // Still referenced by the caller.
    f.device.begin_frame(&mut f.queue).unwrap();
    assert_eq!(f.queue.tracked_lists(), 1);
    assert_eq!(f.queue.profiler().current().draw_calls, 0);

    drop(list);
    f.headless.set_gpu_busy(true);
    f.device.begin_frame(&mut f.queue).unwrap();
    assert_eq!(f.queue.tracked_lists(), 1);

    f.headless.set_gpu_busy(false);
    f.device.begin_frame(&mut f.queue).unwrap();
    assert_eq!(f.queue.tracked_lists(), 0);

    f.queue.begin(CommandListFlags::empty()).unwrap();
    let reused = f.queue.end().unwrap();
    assert_eq!(reused.native().handle, handle);
}

#[test]
fn test_branch_counts_restart_each_frame() {
    let mut f = fixture();
    let mut branches = Vec::new();
    for _ in 0..2 {
        f.device.begin_frame(&mut f.queue).unwrap();
        for _ in 0..2 {
            f.queue.begin(CommandListFlags::empty()).unwrap();
            let list = f.queue.end().unwrap();
            branches.push((list.frame(), list.branch()));
        }
    }
    assert_eq!(branches, vec![(1, 0), (1, 1), (2, 0), (2, 1)]);
}

#[test]
fn test_pass_callback_sees_draw_info() {
    let mut f = fixture();
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let pass = ShaderPass::new("main").with_stage(vs()).on_completed(move |_, info| {
        *sink.lock().unwrap() = info.get::<u32>("layer").copied();
    });
    let shader = Arc::new(Shader::new("layered", vec![pass]).unwrap());

    f.queue.begin(CommandListFlags::empty()).unwrap();
    f.queue.draw_info_mut().set("layer", 4u32);
    f.queue.set_shader(Some(shader));
    f.queue.draw(3, 0).unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(4));

    f.queue.end().unwrap();
    f.queue.begin(CommandListFlags::empty()).unwrap();
    assert!(f.queue.draw_info_mut().get::<u32>("layer").is_none());
}
