//! Camera and light views.

use crate::gpu_types::FrameUniforms;
use glam::{Mat4, Vec3};
use kestrel_core::{BoundingSphere, Frustum};

/// Camera for rendering.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Camera at `position` looking at `target`.
    pub fn looking_at(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            direction: (target - position).normalize(),
            ..Self::default()
        }
    }

    /// Look at a target position.
    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize();
    }

    /// Set the aspect ratio from a framebuffer size. Zero-area sizes are ignored.
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Perspective projection with Vulkan's downward y axis.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        projection.y_axis.y = -projection.y_axis.y;
        projection
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Extract frustum planes from the current camera state.
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.view_projection_matrix())
    }
}

/// Directional light casting the scene's shadow.
#[derive(Debug, Clone)]
pub struct DirectionalLight {
    /// Direction the light travels in.
    pub direction: Vec3,
    /// Region the shadow map covers.
    pub coverage: BoundingSphere,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.4, -1.0, -0.3).normalize(),
            coverage: BoundingSphere::new(Vec3::ZERO, 25.0),
        }
    }
}

impl DirectionalLight {
    /// Orthographic view-projection enclosing `coverage`.
    pub fn view_projection_matrix(&self) -> Mat4 {
        let radius = self.coverage.radius.max(f32::EPSILON);
        let eye = self.coverage.center - self.direction * radius * 2.0;
        let up = if self.direction.abs().dot(Vec3::Y) > 0.99 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        let view = Mat4::look_to_rh(eye, self.direction, up);
        let projection =
            Mat4::orthographic_rh(-radius, radius, -radius, radius, radius, radius * 3.0);
        projection * view
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.view_projection_matrix())
    }
}

impl FrameUniforms {
    pub fn new(camera: &Camera, light: &DirectionalLight) -> Self {
        Self {
            view_proj: camera.view_projection_matrix().to_cols_array_2d(),
            light_view_proj: light.view_projection_matrix().to_cols_array_2d(),
            light_dir: light.direction.extend(0.0).to_array(),
            camera_pos: camera.position.extend(1.0).to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frustum_contains_what_the_camera_faces() {
        let camera = Camera::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO);
        let frustum = camera.frustum();
        assert!(frustum.test_sphere(&BoundingSphere::new(Vec3::ZERO, 1.0)));
        assert!(!frustum.test_sphere(&BoundingSphere::new(Vec3::new(0.0, 0.0, 20.0), 1.0)));
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let camera = Camera::default();
        let clip = camera.view_projection_matrix() * Vec3::new(0.0, 1.0, 0.0).extend(1.0);
        assert!(clip.y < 0.0);
    }

    #[test]
    fn viewport_ignores_zero_area() {
        let mut camera = Camera::default();
        camera.set_viewport(800, 400);
        assert_eq!(camera.aspect, 2.0);
        camera.set_viewport(0, 400);
        assert_eq!(camera.aspect, 2.0);
    }

    #[test]
    fn light_frustum_covers_its_region() {
        let light = DirectionalLight::default();
        let frustum = light.frustum();
        assert!(frustum.test_sphere(&BoundingSphere::new(Vec3::ZERO, 0.5)));
        assert!(frustum.test_sphere(&BoundingSphere::new(Vec3::new(20.0, 0.0, 0.0), 0.5)));
        assert!(!frustum.test_sphere(&BoundingSphere::new(Vec3::new(100.0, 0.0, 0.0), 0.5)));

        let straight_down = DirectionalLight {
            direction: Vec3::NEG_Y,
            ..DirectionalLight::default()
        };
        assert!(straight_down
            .frustum()
            .test_sphere(&BoundingSphere::new(Vec3::ZERO, 0.5)));
    }
}
