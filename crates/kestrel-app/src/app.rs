//! `KestrelApp` trait definition.

use crate::context::AppContext;
use winit::event::WindowEvent;

/// Trait for Kestrel applications.
///
/// The runner owns the window, the renderer and the event loop. Each frame it
/// calls [`update`](Self::update), opens the frame, hands the renderer to
/// [`render`](Self::render) and closes the frame.
pub trait KestrelApp: Sized {
    /// Initialize the application.
    ///
    /// Called once, after the window and renderer exist. Register meshes and
    /// build the scene here.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// # Arguments
    /// * `ctx` - Application context
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Record the frame.
    ///
    /// Called between `frame_begin` and `frame_end`, at most once per frame.
    /// Implementations usually forward their scene, camera and light to
    /// [`Renderer::render`](kestrel_render::Renderer::render).
    fn render(&mut self, ctx: &mut AppContext) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// The renderer has already been told to rebuild its surface.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) {}

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Called before the renderer shuts down.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
