//! Culling math.

use glam::{Mat4, Vec3, Vec4};

/// Bounding sphere.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingSphere {
    /// Sphere center
    pub center: Vec3,
    /// Sphere radius
    pub radius: f32,
}

impl BoundingSphere {
    /// Create a new bounding sphere
    #[inline]
    pub const fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Sphere enclosing every point, centered on their AABB midpoint.
    pub fn from_points(points: impl IntoIterator<Item = Vec3> + Clone) -> Self {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        let mut any = false;
        for p in points.clone() {
            min = min.min(p);
            max = max.max(p);
            any = true;
        }
        if !any {
            return Self::default();
        }

        let center = (min + max) * 0.5;
        let radius = points
            .into_iter()
            .map(|p| p.distance(center))
            .fold(0.0_f32, f32::max);
        Self { center, radius }
    }

    /// Transform the sphere, scaling the radius by the largest axis scale.
    pub fn transformed(&self, matrix: Mat4) -> Self {
        let center = matrix.transform_point3(self.center);
        let scale = matrix
            .x_axis
            .truncate()
            .length()
            .max(matrix.y_axis.truncate().length())
            .max(matrix.z_axis.truncate().length());
        Self {
            center,
            radius: self.radius * scale,
        }
    }

    /// Pack as `(center, radius)` for GPU upload.
    pub fn to_vec4(&self) -> Vec4 {
        self.center.extend(self.radius)
    }
}

/// Frustum for culling operations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    /// Six frustum planes (left, right, bottom, top, near, far)
    /// Each plane is (nx, ny, nz, d) where n is normal and d is distance
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Extract frustum planes from a view-projection matrix with `[0, 1]` clip depth.
    pub fn from_view_projection(vp: Mat4) -> Self {
        let row0 = vp.row(0);
        let row1 = vp.row(1);
        let row2 = vp.row(2);
        let row3 = vp.row(3);

        let planes = [
            row3 + row0, // Left
            row3 - row0, // Right
            row3 + row1, // Bottom
            row3 - row1, // Top
            row2,        // Near
            row3 - row2, // Far
        ]
        .map(normalize_plane);

        Self { planes }
    }

    /// Frustum that accepts everything.
    pub fn infinite() -> Self {
        Self {
            planes: [Vec4::new(0.0, 0.0, 0.0, 1.0); 6],
        }
    }

    /// Test if a sphere is inside or intersects the frustum
    pub fn test_sphere(&self, sphere: &BoundingSphere) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(sphere.center) + plane.w >= -sphere.radius)
    }

    /// Planes as plain arrays for GPU upload.
    pub fn to_arrays(&self) -> [[f32; 4]; 6] {
        self.planes.map(|plane| plane.to_array())
    }
}

fn normalize_plane(plane: Vec4) -> Vec4 {
    let length = plane.truncate().length();
    if length > 0.0 {
        plane / length
    } else {
        plane
    }
}
