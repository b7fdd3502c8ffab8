//! Application framework for the Kestrel engine.
//!
//! The runner owns the window, the [`Renderer`] and the winit event loop,
//! initializes logging and drives the frame loop:
//! - `update`, then `frame_begin / render / frame_end` once per redraw
//! - surface rebuild on resize
//! - fatal GPU errors logged and escalated to a process abort
//!
//! # Example
//!
//! ```no_run
//! use kestrel_app::{run_app, AppConfig, AppContext, KestrelApp};
//! use kestrel_render::{Camera, DirectionalLight, Scene};
//!
//! struct MyApp {
//!     scene: Scene,
//!     camera: Camera,
//!     light: DirectionalLight,
//! }
//!
//! impl KestrelApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp {
//!             scene: Scene::new(ctx.renderer.config().pipeline_count()),
//!             camera: Camera::default(),
//!             light: DirectionalLight::default(),
//!         })
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, ctx: &mut AppContext) -> anyhow::Result<()> {
//!         ctx.renderer.render(&mut self.scene, &self.camera, &self.light)?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod runner;

pub use app::KestrelApp;
pub use context::AppContext;
pub use runner::{run_app, AppConfig};

pub use kestrel_render::{Renderer, RendererConfig};
pub use winit::event::WindowEvent;
