#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::{
    fs::{self, File},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use clap::Parser;
use qvk::{
    device::Device,
    frame::FrameEngine,
    instance::Instance,
    pipeline::Vertex,
    shader::load_spirv,
    surface::Surface,
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::ControlFlow,
    window::{Window as WinitWindow, WindowAttributes},
};

/// The quad, centered at the origin with half-unit extents, one corner per
/// primary color plus white.
const QUAD_VERTICES: [Vertex; 4] = [
    Vertex::new([-0.5, -0.5], [1.0, 0.0, 0.0]),
    Vertex::new([0.5, -0.5], [0.0, 1.0, 0.0]),
    Vertex::new([0.5, 0.5], [0.0, 0.0, 1.0]),
    Vertex::new([-0.5, 0.5], [1.0, 1.0, 1.0]),
];

/// Two counter-clockwise triangles covering the quad.
const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

const FPS_LOG_INTERVAL: u32 = 1000;

#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum,
)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            //We clamp this to the lowest possible level but this shouldn't happen
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    #[default]
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for qvk::log::VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => qvk::log::VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => qvk::log::VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => qvk::log::VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => qvk::log::VulkanLogLevel::Error,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    #[arg(short, long, default_value = "warning")]
    graphics_debug_level: CliVulkanLogLevel,
    /// Directory containing quad.vert.spv and quad.frag.spv.
    #[arg(short, long, default_value = "shaders")]
    shader_dir: PathBuf,
}

fn main() -> eyre::Result<()> {
    let app_dirs = directories::ProjectDirs::from("", "", "quad-app");

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        fs::create_dir_all(&log_dir)?;

        let mut log_file_path = log_dir.clone();
        log_file_path.push("log-file");
        log_file_path.set_extension("txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        println!("log_file_path: {}", log_file_path.display());
        println!("cli_args: {:#?}", cli_args);

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(
                        tracing_subscriber::filter::LevelFilter::from_level(
                            cli_args.tracing_log_level.into(),
                        ),
                    )
                    .and_then(file_log),
            )
            .init();
    }

    let vert_spirv = load_spirv(cli_args.shader_dir.join("quad.vert.spv"))?;
    let frag_spirv = load_spirv(cli_args.shader_dir.join("quad.frag.spv"))?;

    let event_loop = winit::event_loop::EventLoop::builder().build()?;

    //SAFETY: Loads vulkan via libloading which is kinda unsafe but we're fine
    let instance = Arc::new(unsafe {
        Instance::new(
            "quad-app",
            cli_args.graphics_debug_level.into(),
            Some(&event_loop),
        )
    }?);

    let mut app = AppRunner(Some(App::Initializing(InitializingState {
        instance,
        vert_spirv,
        frag_spirv,
    })));

    tracing::trace!("Entering main event loop");
    Ok(event_loop.run_app(&mut app)?)
}

#[derive(Debug)]
struct AppRunner(Option<App>);

#[derive(Debug)]
enum App {
    Running(RunningState),
    Initializing(InitializingState),
    Suspended(SuspendedState),
    Exiting(ExitingState),
}

#[derive(Debug)]
struct InitializingState {
    instance: Arc<Instance>,
    vert_spirv: Vec<u8>,
    frag_spirv: Vec<u8>,
}

struct RunningState {
    instance: Arc<Instance>,
    win: Arc<WinitWindow>,
    device: Arc<Device>,
    surface: Arc<Surface<WinitWindow>>,
    engine: FrameEngine<WinitWindow>,
    vert_spirv: Vec<u8>,
    frag_spirv: Vec<u8>,
    frames_since_log: u32,
    last_log: Instant,
}

impl std::fmt::Debug for RunningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningState")
            .field("window_id", &self.win.id())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct SuspendedState {
    instance: Arc<Instance>,
    win: Arc<WinitWindow>,
    device: Arc<Device>,
    vert_spirv: Vec<u8>,
    frag_spirv: Vec<u8>,
}

#[derive(Debug)]
struct ExitingState {}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        assert!(self.0.is_some());
        if let Some(initializing_state) = self.take_initializing() {
            event_loop.set_control_flow(ControlFlow::Poll);
            let win = Arc::new(
                match event_loop.create_window(
                    WindowAttributes::default()
                        .with_title("quad-app")
                        .with_inner_size(LogicalSize {
                            width: 1600,
                            height: 900,
                        }),
                ) {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::error!("Error while creating window: {}", e);
                        self.transition_to_exiting("Initializing", event_loop);
                        return;
                    }
                },
            );
            //SAFETY: We will drop surface when we enter into `suspend`
            let surface = Arc::new(
                match unsafe {
                    Surface::new(&initializing_state.instance, Arc::clone(&win))
                } {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("Error while creating surface: {}", e);
                        self.transition_to_exiting("Initializing", event_loop);
                        return;
                    }
                },
            );

            let device = match Device::create_compatible(
                &initializing_state.instance,
                &surface,
            ) {
                Ok(d) => Arc::new(d),
                Err(e) => {
                    tracing::error!("Error while creating device: {}", e);
                    self.transition_to_exiting("Initializing", event_loop);
                    return;
                }
            };

            let engine = match build_engine(
                &device,
                &surface,
                &win,
                &initializing_state.vert_spirv,
                &initializing_state.frag_spirv,
            ) {
                Ok(engine) => engine,
                Err(e) => {
                    tracing::error!("Error while building frame engine: {}", e);
                    self.transition_to_exiting("Initializing", event_loop);
                    return;
                }
            };

            tracing::debug!("State transition: Initializing -> Running");
            win.request_redraw();
            self.set_running(RunningState {
                instance: initializing_state.instance,
                win,
                device,
                surface,
                engine,
                vert_spirv: initializing_state.vert_spirv,
                frag_spirv: initializing_state.frag_spirv,
                frames_since_log: 0,
                last_log: Instant::now(),
            });
        } else if let Some(suspended_state) = self.take_suspended() {
            event_loop.set_control_flow(ControlFlow::Poll);
            //SAFETY: We will drop surface when we enter into `suspend`
            let surface = Arc::new(
                match unsafe {
                    Surface::new(
                        &suspended_state.instance,
                        Arc::clone(&suspended_state.win),
                    )
                } {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("Error while creating surface: {}", e);
                        self.transition_to_exiting("Suspended", event_loop);
                        return;
                    }
                },
            );

            let engine = match build_engine(
                &suspended_state.device,
                &surface,
                &suspended_state.win,
                &suspended_state.vert_spirv,
                &suspended_state.frag_spirv,
            ) {
                Ok(engine) => engine,
                Err(e) => {
                    tracing::error!(
                        "Error while rebuilding frame engine on resume: {}",
                        e
                    );
                    self.transition_to_exiting("Suspended", event_loop);
                    return;
                }
            };

            tracing::debug!("State transition: Suspended -> Running");
            suspended_state.win.request_redraw();
            self.set_running(RunningState {
                instance: suspended_state.instance,
                win: suspended_state.win,
                device: suspended_state.device,
                surface,
                engine,
                vert_spirv: suspended_state.vert_spirv,
                frag_spirv: suspended_state.frag_spirv,
                frames_since_log: 0,
                last_log: Instant::now(),
            });
        } else if self.is_exiting() {
            tracing::warn!("resumed() called while in Exiting state");
        }
    }

    fn suspended(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        assert!(self.0.is_some());
        if let Some(running_state) = self.take_running() {
            event_loop.set_control_flow(ControlFlow::Wait);
            let RunningState {
                instance,
                win,
                device,
                surface,
                engine,
                vert_spirv,
                frag_spirv,
                frames_since_log: _,
                last_log: _,
            } = running_state;

            if let Err(e) = device.wait_idle() {
                tracing::error!(
                    "Error while waiting for device idle during suspend: {}",
                    e
                );
                self.transition_to_exiting("Running", event_loop);
                return;
            }
            // The surface is implicitly invalidated on suspend; the engine
            // holds swapchain resources derived from it and goes with it.
            drop(engine);
            drop(surface);

            tracing::debug!("State transition: Running -> Suspended");
            self.set_suspended(SuspendedState {
                instance,
                win,
                device,
                vert_spirv,
                frag_spirv,
            });
        }
    }

    fn window_event(
        &mut self,
        event_loop: &winit::event_loop::ActiveEventLoop,
        window_id: winit::window::WindowId,
        window_event: winit::event::WindowEvent,
    ) {
        assert!(self.0.is_some());
        if !self.is_running_window(window_id) {
            return;
        }

        match &window_event {
            WindowEvent::CloseRequested => {
                tracing::trace!("Close window request received for window");
                self.exit_from_running(event_loop);
            }
            WindowEvent::Resized(_)
            | WindowEvent::ScaleFactorChanged { .. } => {
                if let Some(running_state) = self.as_running_mut() {
                    // Recreation is deferred to the next draw, which also
                    // handles the zero-size (minimized) case.
                    running_state.engine.notify_resized();
                }
            }
            WindowEvent::RedrawRequested => {
                let keep_running = match self.as_running_mut() {
                    Some(running_state) => running_state.draw(),
                    None => return,
                };
                if !keep_running {
                    self.exit_from_running(event_loop);
                }
            }
            _ => {}
        }
    }
}

impl RunningState {
    /// Draw one frame and schedule the next. Returns `false` on an
    /// unrecoverable rendering error.
    fn draw(&mut self) -> bool {
        let win_size = self.win.inner_size();
        let window_extent = qvk::ash::vk::Extent2D {
            width: win_size.width,
            height: win_size.height,
        };

        if let Err(e) = self.engine.draw_frame(window_extent) {
            tracing::error!("Error while drawing frame: {}", e);
            return false;
        }

        self.frames_since_log += 1;
        if self.frames_since_log == FPS_LOG_INTERVAL {
            let elapsed = self.last_log.elapsed().as_secs_f64();
            tracing::info!(
                "Rendered {} frames in {:.2}s ({:.1} fps)",
                FPS_LOG_INTERVAL,
                elapsed,
                f64::from(FPS_LOG_INTERVAL) / elapsed,
            );
            self.frames_since_log = 0;
            self.last_log = Instant::now();
        }

        self.win.request_redraw();
        true
    }
}

fn build_engine(
    device: &Arc<Device>,
    surface: &Arc<Surface<WinitWindow>>,
    win: &WinitWindow,
    vert_spirv: &[u8],
    frag_spirv: &[u8],
) -> Result<FrameEngine<WinitWindow>, qvk::frame::CreateFrameEngineError> {
    let win_size = win.inner_size();
    FrameEngine::new(
        device,
        surface,
        qvk::ash::vk::Extent2D {
            width: win_size.width,
            height: win_size.height,
        },
        vert_spirv.to_vec(),
        frag_spirv.to_vec(),
        &QUAD_VERTICES,
        &QUAD_INDICES,
    )
}

#[allow(dead_code, reason = "these functions exist for API completeness")]
impl AppRunner {
    fn transition_to_exiting(
        &mut self,
        from_state: &'static str,
        event_loop: &winit::event_loop::ActiveEventLoop,
    ) {
        tracing::debug!("State transition: {} -> Exiting", from_state);
        self.set_exiting(ExitingState {});
        event_loop.exit();
    }

    fn exit_from_running(
        &mut self,
        event_loop: &winit::event_loop::ActiveEventLoop,
    ) {
        if self.take_running().is_some() {
            self.transition_to_exiting("Running", event_loop);
        } else {
            tracing::warn!(
                "Requested Running -> Exiting transition while not in Running state"
            );
            event_loop.exit();
        }
    }

    fn is_running_window(&self, window_id: winit::window::WindowId) -> bool {
        if let Some(running_state) = self.as_running()
            && window_id == running_state.win.id()
        {
            true
        } else {
            false
        }
    }

    fn is_initializing(&self) -> bool {
        assert!(self.0.is_some());
        matches!(self.0, Some(App::Initializing(_)))
    }

    fn take_initializing(&mut self) -> Option<InitializingState> {
        assert!(self.0.is_some());
        if matches!(self.0, Some(App::Initializing(_))) {
            match self.0.take() {
                Some(App::Initializing(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn set_initializing(&mut self, state: InitializingState) {
        assert!(self.0.is_none());
        self.0 = Some(App::Initializing(state));
    }

    fn is_running(&self) -> bool {
        assert!(self.0.is_some());
        matches!(self.0, Some(App::Running(_)))
    }

    fn take_running(&mut self) -> Option<RunningState> {
        assert!(self.0.is_some());
        if matches!(self.0, Some(App::Running(_))) {
            match self.0.take() {
                Some(App::Running(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn as_running(&self) -> Option<&RunningState> {
        assert!(self.0.is_some());
        match &self.0 {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn as_running_mut(&mut self) -> Option<&mut RunningState> {
        assert!(self.0.is_some());
        match &mut self.0 {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn set_running(&mut self, state: RunningState) {
        assert!(self.0.is_none());
        self.0 = Some(App::Running(state));
    }

    fn is_suspended(&self) -> bool {
        assert!(self.0.is_some());
        matches!(self.0, Some(App::Suspended(_)))
    }

    fn take_suspended(&mut self) -> Option<SuspendedState> {
        assert!(self.0.is_some());
        if matches!(self.0, Some(App::Suspended(_))) {
            match self.0.take() {
                Some(App::Suspended(s)) => Some(s),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    fn as_suspended(&self) -> Option<&SuspendedState> {
        assert!(self.0.is_some());
        match &self.0 {
            Some(App::Suspended(s)) => Some(s),
            _ => None,
        }
    }

    fn set_suspended(&mut self, state: SuspendedState) {
        assert!(self.0.is_none());
        self.0 = Some(App::Suspended(state));
    }

    fn is_exiting(&self) -> bool {
        assert!(self.0.is_some());
        matches!(self.0, Some(App::Exiting(_)))
    }

    fn as_exiting(&self) -> Option<&ExitingState> {
        assert!(self.0.is_some());
        match &self.0 {
            Some(App::Exiting(s)) => Some(s),
            _ => None,
        }
    }

    fn set_exiting(&mut self, state: ExitingState) {
        assert!(self.0.is_none());
        self.0 = Some(App::Exiting(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_indices_form_two_triangles_over_the_vertices() {
        assert_eq!(QUAD_INDICES.len(), 6);
        for &index in &QUAD_INDICES {
            assert!((index as usize) < QUAD_VERTICES.len());
        }
    }
}
