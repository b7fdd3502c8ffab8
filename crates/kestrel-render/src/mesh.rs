//! Mesh registration.
//!
//! The asset layer hands over flattened vertex and index arrays; the
//! registry appends them to shared arrays that mirror the device-local
//! vertex, index and geometry buffers one-to-one. Skinned meshes also keep
//! their bind pose, per-vertex influences and a slice of the joint palette.

use crate::gpu_types::{GpuGeometry, SkinInfluence, SkinParams, Vertex};
use glam::Mat4;
use kestrel_core::{BoundingSphere, Error, GrowableArray, MemoryTag, Result};

/// Handle of a registered mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u32);

/// Skinning data of a mesh.
#[derive(Clone, Debug, Default)]
pub struct SkinData {
    /// One entry per vertex.
    pub influences: Vec<SkinInfluence>,
    pub joint_count: u32,
}

/// Decoded mesh as produced by the asset layer.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    /// Triangle list, relative to this mesh's first vertex.
    pub indices: Vec<u32>,
    pub skin: Option<SkinData>,
}

impl MeshData {
    fn validate(&self) -> Result<()> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(Error::InvalidData("mesh has no vertices or indices".into()));
        }
        if self.indices.len() % 3 != 0 {
            return Err(Error::InvalidData(format!(
                "{} indices do not form whole triangles",
                self.indices.len()
            )));
        }
        let vertex_count = self.vertices.len();
        if let Some(&index) = self.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(Error::IndexOutOfRange {
                index: index as usize,
                length: vertex_count,
            });
        }
        if let Some(skin) = &self.skin {
            if skin.influences.len() != vertex_count {
                return Err(Error::InvalidData(format!(
                    "{} skin influences for {vertex_count} vertices",
                    skin.influences.len()
                )));
            }
            if skin.joint_count == 0 {
                return Err(Error::InvalidData("skinned mesh has no joints".into()));
            }
            let joint_count = skin.joint_count;
            let out_of_range = skin.influences.iter().any(|influence| {
                influence
                    .joints
                    .iter()
                    .zip(&influence.weights)
                    .any(|(&joint, &weight)| weight != 0.0 && joint >= joint_count)
            });
            if out_of_range {
                return Err(Error::InvalidData(format!(
                    "skin references a joint beyond {joint_count}"
                )));
            }
        }
        Ok(())
    }
}

/// Per-mesh bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct MeshRecord {
    pub geometry: u32,
    pub bounds: BoundingSphere,
    pub skin: Option<SkinParams>,
}

/// Skinned meshes cull against their bind-pose sphere grown by this factor.
const SKINNED_BOUNDS_SCALE: f32 = 1.5;

/// Flattened storage of every registered mesh.
pub struct MeshRegistry {
    vertices: GrowableArray<Vertex>,
    indices: GrowableArray<u32>,
    geometries: GrowableArray<GpuGeometry>,
    bind_pose: GrowableArray<Vertex>,
    influences: GrowableArray<SkinInfluence>,
    joints: GrowableArray<Mat4>,
    meshes: GrowableArray<MeshRecord>,
    version: u64,
}

impl Default for MeshRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshRegistry {
    pub fn new() -> Self {
        Self {
            vertices: GrowableArray::new(MemoryTag::Scene),
            indices: GrowableArray::new(MemoryTag::Scene),
            geometries: GrowableArray::new(MemoryTag::Scene),
            bind_pose: GrowableArray::new(MemoryTag::Scene),
            influences: GrowableArray::new(MemoryTag::Scene),
            joints: GrowableArray::new(MemoryTag::Scene),
            meshes: GrowableArray::new(MemoryTag::Scene),
            version: 0,
        }
    }

    /// Append a mesh. Invalid data is rejected without side effects.
    pub fn register(&mut self, data: &MeshData) -> Result<MeshId> {
        data.validate().inspect_err(|e| {
            tracing::warn!("rejected mesh: {e}");
        })?;

        let id = MeshId(self.meshes.len() as u32);
        let first_vertex = self.vertices.len() as u32;
        let geometry = GpuGeometry {
            index_count: data.indices.len() as u32,
            first_index: self.indices.len() as u32,
            vertex_offset: first_vertex as i32,
            _pad: 0,
        };

        self.vertices.extend(data.vertices.iter().copied());
        self.indices.extend(data.indices.iter().copied());
        let geometry_index = self.geometries.len() as u32;
        self.geometries.push(geometry);

        let mut bounds = BoundingSphere::from_points(data.vertices.iter().map(Vertex::position));
        let skin = data.skin.as_ref().map(|skin| {
            bounds.radius *= SKINNED_BOUNDS_SCALE;
            let params = SkinParams {
                vertex_count: data.vertices.len() as u32,
                src_offset: self.bind_pose.len() as u32,
                dst_offset: first_vertex,
                joint_offset: self.joints.len() as u32,
            };
            self.bind_pose.extend(data.vertices.iter().copied());
            self.influences.extend(skin.influences.iter().copied());
            self.joints
                .extend(std::iter::repeat(Mat4::IDENTITY).take(skin.joint_count as usize));
            params
        });

        self.meshes.push(MeshRecord {
            geometry: geometry_index,
            bounds,
            skin,
        });
        self.version += 1;

        tracing::debug!(
            mesh = id.0,
            vertices = data.vertices.len(),
            indices = data.indices.len(),
            skinned = skin.is_some(),
            "registered mesh"
        );
        Ok(id)
    }

    pub fn get(&self, id: MeshId) -> Option<&MeshRecord> {
        self.meshes.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    /// Replace a skinned mesh's joint matrices.
    pub fn set_joint_matrices(&mut self, id: MeshId, matrices: &[Mat4]) -> Result<()> {
        let record = self.get(id).ok_or(Error::IndexOutOfRange {
            index: id.0 as usize,
            length: self.meshes.len(),
        })?;
        let Some(skin) = record.skin else {
            return Err(Error::InvalidArgument(format!("mesh {} is not skinned", id.0)));
        };

        let start = skin.joint_offset as usize;
        let joint_count = self.joint_count(id);
        if matrices.len() != joint_count {
            return Err(Error::InvalidArgument(format!(
                "mesh {} has {joint_count} joints, got {} matrices",
                id.0,
                matrices.len()
            )));
        }
        self.joints[start..start + joint_count].copy_from_slice(matrices);
        Ok(())
    }

    fn joint_count(&self, id: MeshId) -> usize {
        let Some(skin) = self.get(id).and_then(|record| record.skin) else {
            return 0;
        };
        // Palette slices are contiguous in registration order.
        let next = self.meshes[id.0 as usize + 1..]
            .iter()
            .find_map(|record| record.skin.map(|s| s.joint_offset as usize))
            .unwrap_or(self.joints.len());
        next - skin.joint_offset as usize
    }

    /// Bumped on every registration; uploads compare against it.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn geometries(&self) -> &[GpuGeometry] {
        &self.geometries
    }

    pub fn bind_pose(&self) -> &[Vertex] {
        &self.bind_pose
    }

    pub fn influences(&self) -> &[SkinInfluence] {
        &self.influences
    }

    pub fn joints(&self) -> &[Mat4] {
        &self.joints
    }

    /// Skinning work of every skinned mesh.
    pub fn skin_jobs(&self) -> impl Iterator<Item = SkinParams> + '_ {
        self.meshes.iter().filter_map(|record| record.skin)
    }
}
