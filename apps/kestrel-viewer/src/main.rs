//! Kestrel Engine Demo Viewer
//!
//! Renders a grid of cubes split across two material pipelines, a ground slab
//! and one skinned column, all drawn through GPU-generated indirect commands
//! with a directional shadow.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p kestrel-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--grid <N>`: Cubes per side of the grid (default: 8)
//! - `--shaders <DIR>`: Load SPIR-V from a directory instead of the embedded shaders
//! - `-h, --help`: Print help message
//!
//! Without the `compile` feature no shaders are embedded and `--shaders` is
//! required.
//!
//! ## Controls
//!
//! - `Space`: pause or resume the animation
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;
mod meshes;

use kestrel_app::{run_app, AppConfig, RendererConfig};
use kestrel_render::MaterialPipeline;
use kestrel_shaders::ShaderSource;

use crate::app::{Viewer, ViewerParams};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const TARGET_FPS: u32 = 240;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let params = ViewerParams::from_args();
    let shaders = params
        .shaders
        .map_or(ShaderSource::Embedded, ShaderSource::Directory);

    // Order defines the pipeline indices `app::MATTE` and `app::FOLIAGE`.
    let materials = vec![
        MaterialPipeline::new("matte", [0.75, 0.72, 0.68, 1.0]),
        MaterialPipeline::new("foliage", [0.35, 0.6, 0.3, 1.0]).double_sided(),
    ];

    run_app::<Viewer>(
        AppConfig::new("Kestrel Engine - Viewer")
            .with_size(WIDTH, HEIGHT)
            .with_target_fps(TARGET_FPS)
            .with_vsync(true)
            .with_renderer(
                RendererConfig::default()
                    .with_materials(materials)
                    .with_shaders(shaders)
                    .with_clear_color([0.05, 0.06, 0.08, 1.0]),
            ),
    )
}

fn print_help() {
    eprintln!(
        "Kestrel Engine Demo Viewer

USAGE:
    cargo run -p kestrel-viewer -- [OPTIONS]

OPTIONS:
    --grid <N>          Cubes per side of the grid (default: 8)
    --shaders <DIR>     Directory of compiled .spv files
                        Required unless built with --features compile
    -h, --help          Print this help message

CONTROLS:
    Space               Pause or resume the animation

EXAMPLES:
    # Embedded shaders
    cargo run -p kestrel-viewer --features compile

    # Precompiled SPIR-V
    cargo run -p kestrel-viewer -- --shaders target/spv --grid 16

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}
