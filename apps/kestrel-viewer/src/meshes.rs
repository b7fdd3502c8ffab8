//! Procedural meshes for the demo scene.

use glam::{Vec2, Vec3};
use kestrel_render::{MeshData, SkinData, SkinInfluence, Vertex};

/// Axis-aligned cube of edge `size`, centered at the origin, with flat
/// per-face normals.
pub fn cube(size: f32) -> MeshData {
    let h = size * 0.5;
    let faces = [
        (Vec3::X, Vec3::Y),
        (Vec3::NEG_X, Vec3::Y),
        (Vec3::Y, Vec3::Z),
        (Vec3::NEG_Y, Vec3::Z),
        (Vec3::Z, Vec3::Y),
        (Vec3::NEG_Z, Vec3::Y),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, up) in faces {
        let right = up.cross(normal);
        let base = vertices.len() as u32;
        let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
        for (u, v) in corners {
            let position = (normal + right * u + up * v) * h;
            let uv = Vec2::new((u + 1.0) * 0.5, (v + 1.0) * 0.5);
            vertices.push(Vertex::new(position, normal, uv));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    MeshData {
        vertices,
        indices,
        skin: None,
    }
}

/// Square column of `height` rising from the origin, split into `segments`
/// rings and bound to two joints: the lower half follows joint 0, the upper
/// half joint 1, blended across the middle.
pub fn skinned_column(width: f32, height: f32, segments: u32) -> MeshData {
    let segments = segments.max(2);
    let h = width * 0.5;
    let sides = [Vec3::X, Vec3::Z, Vec3::NEG_X, Vec3::NEG_Z];

    let mut vertices = Vec::new();
    let mut influences = Vec::new();
    let mut indices = Vec::new();
    for normal in sides {
        let right = Vec3::Y.cross(normal);
        let base = vertices.len() as u32;
        for ring in 0..=segments {
            let t = ring as f32 / segments as f32;
            let y = t * height;
            let upper = smoothstep(0.35, 0.65, t);
            for u in [-1.0, 1.0] {
                let position = normal * h + right * (u * h) + Vec3::Y * y;
                vertices.push(Vertex::new(position, normal, Vec2::new((u + 1.0) * 0.5, t)));
                influences.push(SkinInfluence {
                    joints: [0, 1, 0, 0],
                    weights: [1.0 - upper, upper, 0.0, 0.0],
                });
            }
        }
        for ring in 0..segments {
            let a = base + ring * 2;
            let b = a + 2;
            indices.extend_from_slice(&[a, a + 1, b + 1, a, b + 1, b]);
        }
    }

    MeshData {
        vertices,
        indices,
        skin: Some(SkinData {
            influences,
            joint_count: 2,
        }),
    }
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cube_faces_point_outward() {
        let mesh = cube(2.0);
        assert_eq!(mesh.vertices.len(), 24);
        assert_eq!(mesh.indices.len(), 36);
        for vertex in &mesh.vertices {
            assert_relative_eq!(vertex.position().dot(vertex.normal()), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn cube_triangles_wind_counter_clockwise() {
        let mesh = cube(1.0);
        for tri in mesh.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| mesh.vertices[i as usize]);
            let face = (b.position() - a.position()).cross(c.position() - a.position());
            assert!(face.dot(a.normal()) > 0.0);
        }
    }

    #[test]
    fn column_weights_are_normalized() {
        let mesh = skinned_column(0.5, 3.0, 8);
        let skin = mesh.skin.as_ref().unwrap();
        assert_eq!(skin.influences.len(), mesh.vertices.len());
        for (vertex, influence) in mesh.vertices.iter().zip(&skin.influences) {
            let total: f32 = influence.weights.iter().sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-6);
            if vertex.position().y < 0.3 * 3.0 {
                assert_relative_eq!(influence.weights[0], 1.0);
            }
        }
        assert!(mesh
            .indices
            .iter()
            .all(|&i| (i as usize) < mesh.vertices.len()));
    }
}
