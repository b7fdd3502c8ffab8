//! Viewer application: a rotating grid of cubes over a ground slab, split
//! across two material pipelines, plus one skinned column bending in place.

use std::path::PathBuf;

use glam::{Mat4, Quat, Vec3};
use kestrel_app::{AppContext, KestrelApp, WindowEvent};
use kestrel_render::{
    BucketSet, Camera, DirectionalLight, MeshId, MeshInstance, NodeId, ObjectFlags, Scene,
    Transform,
};
use tracing::{debug, info};
use winit::event::ElementState;
use winit::keyboard::{Key, NamedKey};

use crate::meshes;

/// Material pipeline indices, matching the order in `main`.
pub const MATTE: u32 = 0;
pub const FOLIAGE: u32 = 1;

const COLUMN_HEIGHT: f32 = 3.0;
/// Camera orbit speed in radians per second.
const ORBIT_SPEED: f32 = 0.15;
const GRID_SPIN_SPEED: f32 = 0.1;

/// Command line parameters.
#[derive(Debug, Clone)]
pub struct ViewerParams {
    /// Cubes per side of the grid.
    pub grid: u32,
    /// Directory of `.spv` files; embedded shaders are used when unset.
    pub shaders: Option<PathBuf>,
}

impl Default for ViewerParams {
    fn default() -> Self {
        Self {
            grid: 8,
            shaders: None,
        }
    }
}

impl ViewerParams {
    /// Parse parameters from command line arguments.
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut params = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--grid" => {
                    if let Some(v) = args.next().and_then(|v| v.parse().ok()) {
                        params.grid = v;
                    }
                }
                "--shaders" => params.shaders = args.next().map(PathBuf::from),
                _ => {}
            }
        }
        params
    }
}

/// Viewer application state.
pub struct Viewer {
    scene: Scene,
    camera: Camera,
    light: DirectionalLight,
    grid_root: NodeId,
    column: MeshId,
    time: f32,
    paused: bool,
}

impl Viewer {
    fn build_scene(pipeline_count: u32, grid: u32) -> anyhow::Result<(Scene, NodeId, MeshId)> {
        let mut scene = Scene::new(pipeline_count);
        let cube = scene.register_mesh(&meshes::cube(1.0))?;
        let column = scene.register_mesh(&meshes::skinned_column(0.4, COLUMN_HEIGHT, 12))?;

        // Ground receives shadows but casts none.
        let ground = Transform::from_translation(Vec3::new(0.0, -1.0, 0.0))
            .with_scale(Vec3::new(grid as f32 * 2.0 + 4.0, 0.2, grid as f32 * 2.0 + 4.0));
        let mut instance = MeshInstance::new(cube, MATTE);
        instance.flags = ObjectFlags::VISIBLE;
        scene.add_mesh_node(None, "ground", ground, instance)?;

        let grid_root = scene.add_node(None, "grid", Transform::default())?;
        let half = (grid as f32 - 1.0) * 0.5;
        for z in 0..grid {
            for x in 0..grid {
                let pipeline = if (x + z) % 2 == 0 { MATTE } else { FOLIAGE };
                let position = Vec3::new((x as f32 - half) * 2.0, 0.0, (z as f32 - half) * 2.0);
                let local = Transform::from_translation(position)
                    .with_rotation(Quat::from_rotation_y((x * 7 + z * 3) as f32 * 0.3))
                    .with_scale(Vec3::splat(0.8));
                scene.add_mesh_node(
                    Some(grid_root),
                    &format!("cube_{x}_{z}"),
                    local,
                    MeshInstance::new(cube, pipeline),
                )?;
            }
        }

        scene.add_mesh_node(
            None,
            "column",
            Transform::from_translation(Vec3::new(0.0, -0.9, 0.0)),
            MeshInstance::new(column, MATTE),
        )?;

        Ok((scene, grid_root, column))
    }

    fn animate(&mut self) -> anyhow::Result<()> {
        let bend = (self.time * 1.5).sin() * 0.6;
        let pivot = Vec3::Y * (COLUMN_HEIGHT * 0.5);
        let upper = Mat4::from_translation(pivot)
            * Mat4::from_rotation_z(bend)
            * Mat4::from_translation(-pivot);
        self.scene
            .meshes_mut()
            .set_joint_matrices(self.column, &[Mat4::IDENTITY, upper])?;

        self.scene.set_transform(
            self.grid_root,
            Transform::default().with_rotation(Quat::from_rotation_y(self.time * GRID_SPIN_SPEED)),
        )?;

        let angle = self.time * ORBIT_SPEED;
        let radius = self.light.coverage.radius * 0.9;
        self.camera.position = Vec3::new(angle.cos() * radius, radius * 0.45, angle.sin() * radius);
        self.camera.look_at(Vec3::ZERO);
        Ok(())
    }
}

impl KestrelApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let params = ViewerParams::from_args();
        let (scene, grid_root, column) =
            Self::build_scene(ctx.renderer.config().pipeline_count(), params.grid)?;
        info!(
            nodes = scene.node_count(),
            meshes = scene.meshes().len(),
            "scene built"
        );

        let mut light = DirectionalLight::default();
        light.coverage.radius = scene_radius(params.grid);

        let mut camera = Camera::default();
        let (width, height) = ctx.framebuffer_size();
        camera.set_viewport(width, height);

        let mut viewer = Self {
            scene,
            camera,
            light,
            grid_root,
            column,
            time: 0.0,
            paused: false,
        };
        viewer.animate()?;
        Ok(viewer)
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        if self.paused {
            return;
        }
        self.time += dt;
        if let Err(e) = self.animate() {
            tracing::warn!("animation update failed: {e}");
        }
    }

    fn render(&mut self, ctx: &mut AppContext) -> anyhow::Result<()> {
        let summary = ctx
            .renderer
            .render(&mut self.scene, &self.camera, &self.light)?;
        if ctx.frame_number() % 600 == 0 {
            debug!(
                frame = ctx.frame_number(),
                objects = summary.objects,
                max_main_draws = ctx.renderer.max_draws(BucketSet::Main),
                "frame recorded"
            );
        }
        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) {
        self.camera.set_viewport(width, height);
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        if let WindowEvent::KeyboardInput { event, .. } = event {
            if event.state == ElementState::Pressed
                && !event.repeat
                && event.logical_key == Key::Named(NamedKey::Space)
            {
                self.paused = !self.paused;
                info!(paused = self.paused, "animation toggled");
                return true;
            }
        }
        false
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        info!(
            frames = ctx.frame_number(),
            nodes = self.scene.node_count(),
            "viewer closing"
        );
    }
}

/// Radius enclosing the grid, the ground slab and the column.
fn scene_radius(grid: u32) -> f32 {
    (grid as f32 + 2.0) * std::f32::consts::SQRT_2 + COLUMN_HEIGHT
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{GrowableArray, MemoryTag};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn parses_grid_and_shader_dir() {
        let params = ViewerParams::parse(args(&["--grid", "3", "--shaders", "out/spv"]));
        assert_eq!(params.grid, 3);
        assert_eq!(params.shaders, Some(PathBuf::from("out/spv")));
    }

    #[test]
    fn ignores_malformed_values() {
        let params = ViewerParams::parse(args(&["--grid", "many", "--verbose"]));
        assert_eq!(params.grid, 8);
        assert!(params.shaders.is_none());
    }

    #[test]
    fn scene_splits_cubes_across_materials() {
        let (mut scene, _, column) = Viewer::build_scene(2, 4).unwrap();
        // ground + grid root + 16 cubes + column
        assert_eq!(scene.node_count(), 19);
        assert!(scene.meshes().get(column).unwrap().skin.is_some());

        scene.update_transforms();
        let mut objects = GrowableArray::new(MemoryTag::Scene);
        scene.object_table(&mut objects);
        let on = |pipeline| objects.iter().filter(|o| o.pipeline == pipeline).count();
        assert_eq!(on(FOLIAGE), 8);
        assert_eq!(on(MATTE), 10);
    }
}
