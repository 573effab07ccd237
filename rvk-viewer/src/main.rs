#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::{
    fs::{self, File},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use clap::Parser;
use eyre::WrapErr;
use glam::{Mat4, Vec3};
use rvk_render::{
    ash::vk,
    device::{Device, DeviceConfig},
    frame::{FrameOutcome, FramePacer, FrameRenderer, FrameSlots, ResizeSignal},
    instance::{Instance, InstanceExtensions},
    renderable::{MeshData, PixelData, Renderable, Vertex},
    resource::ResourceAllocator,
    scene::{Scene, UniformBufferObject},
    shader::ShaderModule,
    surface::{PresentTarget, Surface},
    swapchain::{ChainState, PresentationChain, SurfacePreferences},
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};
use winit::{
    application::ApplicationHandler,
    dpi::{LogicalSize, PhysicalSize},
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow},
    window::{Window as WinitWindow, WindowAttributes},
};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Debug,
    Info,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            // Never used: `Off` skips installing a subscriber.
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for rvk_render::log::VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => rvk_render::log::VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => rvk_render::log::VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => rvk_render::log::VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => rvk_render::log::VulkanLogLevel::Error,
        }
    }
}

/// Spinning textured quad on rvk-render.
#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    log_level: TracingLogLevel,
    /// Enable the validation layer, forwarding messages at this level and
    /// above.
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(2..=3))]
    frames_in_flight: u8,
    /// Present with FIFO instead of preferring mailbox.
    #[arg(long)]
    vsync: bool,
    /// Compiled SPIR-V for the vertex stage.
    #[arg(long, default_value = "rvk-viewer/shaders/scene.vert.spv")]
    vertex_shader: PathBuf,
    /// Compiled SPIR-V for the fragment stage.
    #[arg(long, default_value = "rvk-viewer/shaders/scene.frag.spv")]
    fragment_shader: PathBuf,
    /// Edge length of the generated checkerboard texture.
    #[arg(long, default_value_t = 256, value_parser = clap::value_parser!(u32).range(1..=8192))]
    texture_size: u32,
}

/// Everything needed to (re)build the renderer, loaded once at startup.
#[derive(Debug)]
struct ViewerConfig {
    frames_in_flight: usize,
    vsync: bool,
    mesh: MeshData,
    texture: PixelData,
    vertex_spirv: Vec<u8>,
    fragment_spirv: Vec<u8>,
}

const CHECKER_CELLS: u32 = 8;

const CLEAR_COLOR: [f32; 4] = [0.01, 0.01, 0.02, 1.0];

/// Black and white squares, `CHECKER_CELLS` per side.
fn checkerboard(size: u32) -> PixelData {
    let cell = (size / CHECKER_CELLS).max(1);
    let rgba = (0..size)
        .flat_map(|y| (0..size).map(move |x| (x, y)))
        .flat_map(|(x, y)| {
            let v = if (x / cell + y / cell).is_multiple_of(2) { 255 } else { 32 };
            [v, v, v, 255]
        })
        .collect();
    // The length is size * size * 4 by construction.
    match PixelData::new(size, size, rgba) {
        Ok(pixels) => pixels,
        Err(e) => unreachable!("checkerboard size mismatch: {e}"),
    }
}

fn quad_mesh() -> MeshData {
    let v = |position: [f32; 3], color: [f32; 3], tex_coord: [f32; 2]| Vertex {
        position,
        color,
        tex_coord,
    };
    MeshData {
        vertices: vec![
            v([-0.5, -0.5, 0.0], [1.0, 0.0, 0.0], [1.0, 0.0]),
            v([0.5, -0.5, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0]),
            v([0.5, 0.5, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
            v([-0.5, 0.5, 0.0], [1.0, 1.0, 1.0], [1.0, 1.0]),
        ],
        indices: vec![0, 1, 2, 2, 3, 0],
    }
}

/// Quarter turn per second about Z, seen from (2, 2, 2).
fn frame_uniforms(elapsed_secs: f32, extent: vk::Extent2D) -> UniformBufferObject {
    let model = Mat4::from_rotation_z(elapsed_secs * 90f32.to_radians());
    let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);
    let aspect = extent.width as f32 / extent.height.max(1) as f32;
    let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
    // Vulkan clip space has Y pointing down.
    proj.y_axis.y *= -1.0;
    UniformBufferObject {
        model: model.to_cols_array_2d(),
        view: view.to_cols_array_2d(),
        proj: proj.to_cols_array_2d(),
    }
}

fn extent_of(size: PhysicalSize<u32>) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

fn main() -> eyre::Result<()> {
    let app_dirs = directories::ProjectDirs::from("", "rvk", "rvk-viewer");

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let cli_args = CliArgs::parse();

    if cli_args.log_level != TracingLogLevel::Off {
        fs::create_dir_all(&log_dir)?;

        let mut log_file_path = log_dir.clone();
        log_file_path.push("log-file");
        log_file_path.set_extension("txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        println!("log_file_path: {}", log_file_path.display());

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                        cli_args.log_level.into(),
                    ))
                    .and_then(file_log),
            )
            .init();
    }
    tracing::debug!("cli_args: {:#?}", cli_args);

    let config = ViewerConfig {
        frames_in_flight: cli_args.frames_in_flight.into(),
        vsync: cli_args.vsync,
        mesh: quad_mesh(),
        texture: checkerboard(cli_args.texture_size),
        vertex_spirv: fs::read(&cli_args.vertex_shader).wrap_err_with(|| {
            format!("reading vertex shader {}", cli_args.vertex_shader.display())
        })?,
        fragment_spirv: fs::read(&cli_args.fragment_shader).wrap_err_with(|| {
            format!(
                "reading fragment shader {}",
                cli_args.fragment_shader.display()
            )
        })?,
    };

    let event_loop = winit::event_loop::EventLoop::builder().build()?;

    // SAFETY: loads the Vulkan loader through libloading, once, before any
    // other Vulkan call.
    let instance = Arc::new(unsafe {
        Instance::new(
            "rvk-viewer",
            cli_args.graphics_debug_level.map(Into::into),
            Some(&event_loop),
            InstanceExtensions { surface: true },
        )
    }?);

    let mut app = AppRunner(Some(App::Initializing(InitializingState {
        instance,
        config,
    })));

    tracing::trace!("Entering main event loop");
    Ok(event_loop.run_app(&mut app)?)
}

type Renderer = FrameRenderer<WinitWindow, Scene>;

#[derive(Debug)]
struct AppRunner(Option<App>);

#[derive(Debug)]
enum App {
    Initializing(InitializingState),
    Running(RunningState),
    Suspended(SuspendedState),
    Exiting,
}

#[derive(Debug)]
struct InitializingState {
    instance: Arc<Instance>,
    config: ViewerConfig,
}

#[derive(Debug)]
struct RunningState {
    // Dropped first: waits for the device, then releases the chain and
    // surface.
    renderer: Renderer,
    pacer: FramePacer,
    /// The pacer deferred a rebuild for lack of area; sleep until the
    /// window is resized.
    waiting_for_area: bool,
    started: Instant,
    allocator: ResourceAllocator,
    device: Arc<Device>,
    win: Arc<WinitWindow>,
    instance: Arc<Instance>,
    config: ViewerConfig,
}

#[derive(Debug)]
struct SuspendedState {
    allocator: ResourceAllocator,
    device: Arc<Device>,
    win: Arc<WinitWindow>,
    instance: Arc<Instance>,
    config: ViewerConfig,
}

/// Surface, chain, frame slots and scene for `win`.
fn build_renderer(
    instance: &Arc<Instance>,
    win: &Arc<WinitWindow>,
    device: &Arc<Device>,
    surface: Arc<Surface<WinitWindow>>,
    allocator: &ResourceAllocator,
    config: &ViewerConfig,
) -> eyre::Result<(Renderer, FramePacer)> {
    let _span = tracing::debug_span!("build_renderer").entered();
    debug_assert!(Arc::ptr_eq(surface.get_parent(), instance));

    let chain = PresentationChain::new(
        device,
        &surface,
        SurfacePreferences::with_vsync(config.vsync),
        extent_of(win.inner_size()),
    )?;
    if chain.state() == ChainState::Uninitialized {
        eyre::bail!("window has no drawable area");
    }

    let pacer = FramePacer::new(config.frames_in_flight, ResizeSignal::new())?;
    let slots = FrameSlots::new::<UniformBufferObject>(device, pacer.slot_count())?;

    let vertex_shader =
        ShaderModule::new(device, &config.vertex_spirv, Some("scene vertex shader"))?;
    let fragment_shader = ShaderModule::new(
        device,
        &config.fragment_spirv,
        Some("scene fragment shader"),
    )?;
    let quad = Renderable::new(allocator, &config.mesh, Some(&config.texture))?;
    let mut scene = Scene::new(
        allocator,
        &slots,
        vec![quad],
        &vertex_shader,
        &fragment_shader,
        chain.format(),
    )?;
    scene.set_clear_color(CLEAR_COLOR);

    Ok((FrameRenderer::new(chain, slots, scene), pacer))
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        assert!(self.0.is_some());
        match self.0.take() {
            Some(App::Initializing(state)) => {
                event_loop.set_control_flow(ControlFlow::Poll);
                match Self::start(state, event_loop) {
                    Ok(running) => {
                        tracing::debug!("State transition: Initializing -> Running");
                        self.0 = Some(App::Running(running));
                    }
                    Err(e) => {
                        tracing::error!("Error while initializing: {e:#}");
                        self.transition_to_exiting("Initializing", event_loop);
                    }
                }
            }
            Some(App::Suspended(state)) => {
                event_loop.set_control_flow(ControlFlow::Poll);
                match Self::resume(state) {
                    Ok(running) => {
                        tracing::debug!("State transition: Suspended -> Running");
                        self.0 = Some(App::Running(running));
                    }
                    Err(e) => {
                        tracing::error!("Error while resuming: {e:#}");
                        self.transition_to_exiting("Suspended", event_loop);
                    }
                }
            }
            Some(other) => {
                tracing::warn!("resumed() called while in state {other:?}");
                self.0 = Some(other);
            }
            None => unreachable!(),
        }
    }

    fn suspended(&mut self, event_loop: &ActiveEventLoop) {
        assert!(self.0.is_some());
        let Some(App::Running(running)) = self.0.take_if(|s| matches!(s, App::Running(_)))
        else {
            return;
        };
        event_loop.set_control_flow(ControlFlow::Wait);
        let RunningState {
            renderer,
            allocator,
            device,
            win,
            instance,
            config,
            ..
        } = running;
        // The renderer waits for the device before releasing the surface.
        drop(renderer);

        tracing::debug!("State transition: Running -> Suspended");
        self.0 = Some(App::Suspended(SuspendedState {
            allocator,
            device,
            win,
            instance,
            config,
        }));
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: winit::window::WindowId,
        window_event: WindowEvent,
    ) {
        assert!(self.0.is_some());
        let Some(App::Running(running)) = self.0.as_mut() else {
            return;
        };
        if window_id != running.win.id() {
            return;
        }

        match window_event {
            WindowEvent::CloseRequested => {
                tracing::trace!("Close window request received for window");
                self.exit_from_running(event_loop);
            }
            WindowEvent::Resized(size) => {
                Self::resize(running, size, event_loop);
            }
            WindowEvent::ScaleFactorChanged { .. } => {
                let size = running.win.inner_size();
                Self::resize(running, size, event_loop);
            }
            WindowEvent::RedrawRequested => match Self::draw(running) {
                Ok(FrameOutcome::Deferred) => {
                    tracing::debug!("Waiting for the window to regain an area");
                    running.waiting_for_area = true;
                    event_loop.set_control_flow(ControlFlow::Wait);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Error while drawing frame: {e:#}");
                    self.exit_from_running(event_loop);
                }
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(App::Running(running)) = self.0.as_ref()
            && !running.waiting_for_area
        {
            running.win.request_redraw();
        }
    }
}

impl AppRunner {
    fn start(
        state: InitializingState,
        event_loop: &ActiveEventLoop,
    ) -> eyre::Result<RunningState> {
        let InitializingState { instance, config } = state;
        let win = Arc::new(
            event_loop.create_window(
                WindowAttributes::default()
                    .with_title("rvk-viewer")
                    .with_inner_size(LogicalSize {
                        width: 1280,
                        height: 720,
                    }),
            )?,
        );
        // SAFETY: the surface is owned by the renderer, which is dropped in
        // `suspended` before the platform invalidates the window.
        let surface = Arc::new(unsafe { Surface::new(&instance, Arc::clone(&win)) }?);
        let device = Arc::new(Device::new(
            &instance,
            Some(&*surface as &dyn PresentTarget),
            DeviceConfig {
                swapchain: true,
                dynamic_rendering: true,
            },
        )?);
        let allocator = ResourceAllocator::new(&device)?;
        let (renderer, pacer) =
            build_renderer(&instance, &win, &device, surface, &allocator, &config)?;
        Ok(RunningState {
            renderer,
            pacer,
            waiting_for_area: false,
            started: Instant::now(),
            allocator,
            device,
            win,
            instance,
            config,
        })
    }

    fn resume(state: SuspendedState) -> eyre::Result<RunningState> {
        let SuspendedState {
            allocator,
            device,
            win,
            instance,
            config,
        } = state;
        // SAFETY: as in `start`, the renderer owning the surface is dropped
        // on the next suspend.
        let surface = Arc::new(unsafe { Surface::new(&instance, Arc::clone(&win)) }?);
        let (renderer, pacer) =
            build_renderer(&instance, &win, &device, surface, &allocator, &config)?;
        Ok(RunningState {
            renderer,
            pacer,
            waiting_for_area: false,
            started: Instant::now(),
            allocator,
            device,
            win,
            instance,
            config,
        })
    }

    fn draw(running: &mut RunningState) -> eyre::Result<FrameOutcome> {
        let elapsed = running.started.elapsed().as_secs_f32();
        let uniforms = frame_uniforms(elapsed, running.renderer.chain().extent());
        running.renderer.recorder_mut().set_uniforms(uniforms);
        let outcome = running.pacer.draw_frame(&mut running.renderer)?;
        tracing::trace!("Frame outcome: {outcome:?}");
        Ok(outcome)
    }

    /// Hand the new size to the renderer and wake the frame loop.
    fn resize(
        running: &mut RunningState,
        size: PhysicalSize<u32>,
        event_loop: &ActiveEventLoop,
    ) {
        running.renderer.set_framebuffer_size(extent_of(size));
        running.pacer.resize_signal().signal();
        if running.waiting_for_area {
            running.waiting_for_area = false;
            event_loop.set_control_flow(ControlFlow::Poll);
            running.win.request_redraw();
        }
    }

    fn transition_to_exiting(&mut self, from_state: &'static str, event_loop: &ActiveEventLoop) {
        tracing::debug!("State transition: {} -> Exiting", from_state);
        self.0 = Some(App::Exiting);
        event_loop.exit();
    }

    fn exit_from_running(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(App::Running(running)) = self.0.take_if(|s| matches!(s, App::Running(_))) {
            // Renderer drop waits for the device to go idle.
            drop(running);
            self.transition_to_exiting("Running", event_loop);
        } else {
            tracing::warn!("Requested Running -> Exiting transition while not in Running state");
            event_loop.exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_cells() {
        let pixels = checkerboard(16);
        assert_eq!(pixels.rgba().len(), 16 * 16 * 4);
        let texel = |x: usize, y: usize| pixels.rgba()[(y * 16 + x) * 4];
        // Cells are two texels wide at this size.
        assert_eq!(texel(0, 0), 255);
        assert_eq!(texel(1, 1), 255);
        assert_eq!(texel(2, 0), 32);
        assert_eq!(texel(2, 2), 255);
    }

    #[test]
    fn tiny_checkerboards_still_fill_every_texel() {
        let pixels = checkerboard(3);
        assert_eq!(pixels.rgba().len(), 3 * 3 * 4);
        assert!(pixels.rgba().chunks(4).all(|px| px[3] == 255));
    }

    #[test]
    fn quad_indices_stay_in_range() {
        let mesh = quad_mesh();
        assert_eq!(mesh.indices.len(), 6);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
    }

    #[test]
    fn projection_is_flipped_for_vulkan() {
        let extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let ubo = frame_uniforms(0.0, extent);
        assert!(ubo.proj[1][1] < 0.0);
        assert_eq!(ubo.model, Mat4::IDENTITY.to_cols_array_2d());
    }

    #[test]
    fn model_turns_a_quarter_per_second() {
        let extent = vk::Extent2D {
            width: 100,
            height: 100,
        };
        let ubo = frame_uniforms(1.0, extent);
        let x_axis = ubo.model[0];
        assert!(x_axis[0].abs() < 1e-5);
        assert!((x_axis[1] - 1.0).abs() < 1e-5);
    }
}
