//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kestrel_gpu::{GpuError, Severity};
use kestrel_render::{FrameStats, Renderer, RendererConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::KestrelApp;
use crate::context::AppContext;

/// Application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Window title, also the Vulkan application name.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Renderer settings. Title, vsync and validation above override the
    /// matching fields.
    pub renderer: RendererConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Kestrel Engine".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            renderer: RendererConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_renderer(mut self, renderer: RendererConfig) -> Self {
        self.renderer = renderer;
        self
    }

    /// Renderer config with the window-level settings applied.
    pub fn renderer_config(&self) -> RendererConfig {
        self.renderer
            .clone()
            .with_app_name(self.title.clone())
            .with_vsync(self.vsync)
            .with_validation(self.validation)
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// What the frame loop does with a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Escalation {
    /// Log and keep running.
    Continue,
    /// Log and abort the process.
    Abort,
}

/// Classify an error surfacing in the frame loop.
///
/// GPU errors follow their severity. Errors from application code that carry
/// no GPU error are treated as caller errors.
pub(crate) fn escalation(err: &anyhow::Error) -> Escalation {
    match err.downcast_ref::<GpuError>().map(GpuError::severity) {
        Some(Severity::Fatal) => Escalation::Abort,
        Some(Severity::SurfaceStale | Severity::CallerError) | None => Escalation::Continue,
    }
}

fn handle_error(operation: &str, err: &anyhow::Error) {
    match escalation(err) {
        Escalation::Abort => {
            error!(operation, "fatal error: {err:#}");
            std::process::abort();
        }
        Escalation::Continue => warn!(operation, "{err:#}"),
    }
}

/// Run a `KestrelApp` with the given configuration.
///
/// Initializes logging, creates the window and renderer, and runs the event
/// loop until the window closes.
pub fn run_app<A: KestrelApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
    };

    if let Err(e) = event_loop.run_app(&mut runner) {
        error!("Event loop error: {e}");
    }

    Ok(())
}

struct AppRunner<A: KestrelApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
}

struct AppState<A: KestrelApp> {
    ctx: AppContext,
    app: A,
    target_frame_time: Option<Duration>,
    stats: FrameStats,
}

impl<A: KestrelApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    state.render_frame();
                    state.ctx.window.request_redraw();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    state.handle_resize(size.width, size.height);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: KestrelApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);
        let size = window.inner_size();

        let renderer = Renderer::initialize(
            self.config.renderer_config(),
            window.as_ref(),
            (size.width, size.height),
        )?;

        let mut ctx = AppContext::new(window, renderer);
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            ctx,
            app,
            target_frame_time: self.config.target_frame_time(),
            stats: FrameStats::new(),
        })
    }
}

impl<A: KestrelApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) {
        let frame_start = Instant::now();
        let dt = self.stats.tick().as_secs_f32();

        self.app.update(&self.ctx, dt);

        match self.ctx.renderer.frame_begin() {
            Ok(true) => {}
            // Surface rebuilt; skip this frame.
            Ok(false) => return,
            Err(e) => {
                handle_error("frame_begin", &e.into());
                return;
            }
        }

        if let Err(e) = self.app.render(&mut self.ctx) {
            handle_error("render", &e);
        }

        if let Err(e) = self.ctx.renderer.frame_end() {
            handle_error("frame_end", &e.into());
        }

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }
    }

    fn handle_resize(&mut self, width: u32, height: u32) {
        self.ctx.renderer.resize(width, height);
        if width == 0 || height == 0 {
            return;
        }
        self.app.on_resize(&mut self.ctx, width, height);
        info!("Resized to {}x{}", width, height);
    }

    fn cleanup(&mut self) {
        self.stats.log_summary();

        info!("Starting cleanup...");
        self.app.cleanup(&mut self.ctx);
        match self.ctx.renderer.shutdown() {
            Ok(()) => info!("Cleanup complete"),
            Err(e) => error!("Renderer shutdown failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_settings_override_renderer_config() {
        let config = AppConfig::new("viewer")
            .with_vsync(true)
            .with_validation(false)
            .with_renderer(RendererConfig::default().with_vsync(false));
        let renderer = config.renderer_config();
        assert_eq!(renderer.app_name, "viewer");
        assert!(renderer.vsync);
        assert!(!renderer.validation);
    }

    #[test]
    fn target_fps_sets_frame_budget() {
        let config = AppConfig::default().with_target_fps(50);
        assert_eq!(config.target_frame_time(), Some(Duration::from_millis(20)));
        assert_eq!(AppConfig::default().target_frame_time(), None);
        assert_eq!(AppConfig::default().with_target_fps(0).target_frame_time(), None);
    }

    #[test]
    fn fatal_gpu_errors_abort() {
        let device_lost = anyhow::Error::from(GpuError::Vulkan(
            ash::vk::Result::ERROR_DEVICE_LOST,
        ));
        assert_eq!(escalation(&device_lost), Escalation::Abort);

        let timed_out = anyhow::Error::from(GpuError::FenceTimeout {
            slot: 0,
            timeout_ns: 1,
        })
        .context("frame_begin");
        assert_eq!(escalation(&timed_out), Escalation::Abort);
    }

    #[test]
    fn caller_errors_continue() {
        let misuse = anyhow::Error::from(GpuError::InvalidUsage("render called twice".into()));
        assert_eq!(escalation(&misuse), Escalation::Continue);
        assert_eq!(
            escalation(&anyhow::anyhow!("scene not ready")),
            Escalation::Continue
        );
    }
}
