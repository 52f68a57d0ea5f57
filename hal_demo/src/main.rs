//! Headless HAL demo
//!
//! Drives a few frames through the command queue: a triangle draw into an
//! offscreen surface, a compute dispatch, and a constant-buffer update queued
//! for the start of the next frame. Pass a `.toml` or `.ron` path to load a [`HalConfig`].

use std::sync::Arc;

use graphics_hal::foundation::logging;
use graphics_hal::prelude::*;
use graphics_hal::resource::{Format, SetDataTask};
use graphics_hal::shader::{VertexElementFormat, VertexFormat};

const FRAME_COUNT: u64 = 3;

/// Resources and queue for the demo frame loop
struct HalDemoApp {
    device: Arc<GraphicsDevice>,
    queue: CommandQueue,
    color: Arc<GraphicsResource>,
    vertices: Arc<GraphicsResource>,
    constants: Arc<GraphicsResource>,
    draw_shader: Arc<Shader>,
    compute_shader: Arc<Shader>,
}

impl HalDemoApp {
    fn new(config: HalConfig) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate()?;
        log::info!("Creating '{}' device ({:?} backend)", config.application_name, config.backend);

        let device = GraphicsDevice::from_config(config)?;
        let queue = device.create_queue(ContextKind::Immediate)?;

        let color = device.create_surface("demo_color", 320, 240, Format::R8G8B8A8Unorm)?;
        let format = VertexFormat::new().with_element("POSITION", 0, VertexElementFormat::Float3);
        let triangle: [[f32; 3]; 3] = [[0.0, 0.5, 0.0], [0.5, -0.5, 0.0], [-0.5, -0.5, 0.0]];
        let vertices = device.create_vertex_buffer("triangle", format, &triangle, ResourceFlags::GPU_READ)?;
        let constants = device.create_constant_buffer("frame_constants", 64)?;

        let draw_pass = ShaderPass::new("main")
            .with_stage(ShaderComposition::new(ShaderStageKind::Vertex, "vs_main", NativeHandle(1)))
            .with_stage(ShaderComposition::new(ShaderStageKind::Pixel, "ps_main", NativeHandle(2)))
            .on_completed(|pass, _| log::debug!("Pass '{}' completed", pass.name()));
        let draw_shader = Arc::new(Shader::new("solid", vec![draw_pass])?);

        let compute_pass = ShaderPass::new("simulate")
            .with_stage(ShaderComposition::new(ShaderStageKind::Compute, "cs_main", NativeHandle(3)))
            .with_compute_groups([8, 8, 1]);
        let compute_shader = Arc::new(Shader::new("particles", vec![compute_pass])?);

        Ok(Self { device, queue, color, vertices, constants, draw_shader, compute_shader })
    }

    fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        for frame in 0..FRAME_COUNT {
            self.render_frame(frame)?;
        }
        log::info!(
            "Rendered {FRAME_COUNT} frames, {} bytes of VRAM in use, {} start-of-frame tasks left",
            self.device.allocated_vram(),
            self.device.pending_frame_tasks(GraphicsPriority::StartOfFrame)
        );
        self.device.shutdown()?;
        Ok(())
    }

    fn render_frame(&mut self, frame: u64) -> Result<(), Box<dyn std::error::Error>> {
        self.device.begin_frame(&mut self.queue)?;
        self.queue.begin(CommandListFlags::empty())?;

        let mut constants = vec![0u8; 64];
        constants[..8].copy_from_slice(&frame.to_le_bytes());
        self.queue
            .queue_resource_task(&self.constants, GraphicsPriority::StartOfFrame, SetDataTask::new(constants))?;

        self.queue.begin_event("Scene");
        self.queue.set_render_surfaces(&[Some(Arc::clone(&self.color))])?;
        self.queue.set_viewport(Viewport::new(320.0, 240.0));
        self.queue.set_shader(Some(Arc::clone(&self.draw_shader)));
        self.queue.set_vertex_buffer(0, Some(Arc::clone(&self.vertices)))?;
        let result = self.queue.draw(3, 0)?;
        if !result.is_successful() {
            log::warn!("Frame {frame}: draw skipped ({result:?})");
        }
        self.queue.end_event();

        let result = self.queue.dispatch(&self.compute_shader, [0, 0, 0])?;
        if !result.is_successful() {
            log::warn!("Frame {frame}: dispatch skipped ({result:?})");
        }

        self.queue.end()?;
        self.queue.submit(CommandListFlags::empty())?;

        let stats = self.device.end_frame(&mut self.queue)?;
        log::info!(
            "Frame {frame}: {} draws, {} dispatches, {} surface bindings",
            stats.draw_calls,
            stats.dispatch_calls,
            stats.surface_bindings
        );
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_with_level(logging::LevelFilter::Info);
    log::info!("Starting graphics HAL demo");

    let config = match std::env::args().nth(1) {
        Some(path) => HalConfig::load(path)?,
        None => HalConfig::default(),
    };

    let mut app = HalDemoApp::new(config)?;
    match app.run() {
        Ok(()) => {
            log::info!("Graphics HAL demo completed successfully");
            Ok(())
        }
        Err(e) => {
            log::error!("Graphics HAL demo failed: {e}");
            Err(e)
        }
    }
}
