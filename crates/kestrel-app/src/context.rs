//! Application context.

use std::sync::Arc;

use kestrel_render::Renderer;
use winit::window::Window;

/// State shared with every [`KestrelApp`](crate::KestrelApp) callback.
pub struct AppContext {
    /// Renderer bound to the window's surface. Declared first so it drops
    /// before the window.
    pub renderer: Renderer,
    /// The window handle.
    pub window: Arc<Window>,
}

impl AppContext {
    pub(crate) fn new(window: Arc<Window>, renderer: Renderer) -> Self {
        Self { renderer, window }
    }

    /// Current framebuffer size in physical pixels.
    pub fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    /// Frames submitted so far.
    pub fn frame_number(&self) -> u64 {
        self.renderer.frame_number()
    }
}
