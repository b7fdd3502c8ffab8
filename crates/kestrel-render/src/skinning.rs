//! Compute skinning.
//!
//! Skinned meshes keep their bind pose and joint influences in dedicated
//! buffers. Every frame the joint palette is uploaded and `skin.comp`
//! rewrites each mesh's range of the shared vertex buffer, which the mesh
//! and shadow passes then read like any static geometry. The written range
//! is barriered for vertex input before any draw.

use crate::gpu_types::{SkinInfluence, SkinParams, Vertex};
use crate::recorder::{BarrierKind, BufferRange, BufferRole, FrameRecorder, RangeBarrier};
use glam::{Mat4, Vec4};
use kestrel_core::constants::SKIN_WORKGROUP_SIZE;
use kestrel_gpu::error::Result;

/// Bytes of vertex buffer a job writes.
pub fn skinned_range(params: &SkinParams) -> BufferRange {
    BufferRange::new(
        u64::from(params.dst_offset) * u64::from(Vertex::STRIDE),
        u64::from(params.vertex_count) * u64::from(Vertex::STRIDE),
    )
}

/// CPU version of `skin.comp` for one job.
///
/// Influences naming a joint outside `joints` contribute nothing.
pub fn skin_vertices(
    bind_pose: &[Vertex],
    influences: &[SkinInfluence],
    joints: &[Mat4],
    params: &SkinParams,
    output: &mut [Vertex],
) {
    let src = params.src_offset as usize;
    let dst = params.dst_offset as usize;

    for i in 0..params.vertex_count as usize {
        let (Some(vertex), Some(influence)) = (bind_pose.get(src + i), influences.get(src + i))
        else {
            continue;
        };

        let mut skin = Mat4::ZERO;
        for (&joint, &weight) in influence.joints.iter().zip(&influence.weights) {
            if let Some(matrix) = joints.get(params.joint_offset as usize + joint as usize) {
                skin += *matrix * weight;
            }
        }

        let position = skin.transform_point3(vertex.position());
        let normal = skin.transform_vector3(vertex.normal());
        let length = normal.length();
        let normal = if length > 0.0 {
            normal / length
        } else {
            vertex.normal()
        };

        if let Some(out) = output.get_mut(dst + i) {
            *out = Vertex {
                position: position.extend(vertex.position[3]).to_array(),
                normal: normal.extend(vertex.normal[3]).to_array(),
            };
        }
    }
}

/// Records joint upload, skinning dispatches and their barriers.
#[derive(Clone, Debug, Default)]
pub struct SkinningPass;

impl SkinningPass {
    /// Work groups covering `vertex_count` invocations.
    pub fn dispatch_groups(vertex_count: u32) -> u32 {
        vertex_count.div_ceil(SKIN_WORKGROUP_SIZE)
    }

    pub fn record(
        &self,
        recorder: &mut impl FrameRecorder,
        jobs: &[SkinParams],
        joints: &[Mat4],
    ) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let palette: Vec<[Vec4; 4]> = joints
            .iter()
            .map(|m| [m.x_axis, m.y_axis, m.z_axis, m.w_axis])
            .collect();
        let palette_bytes: &[u8] = bytemuck::cast_slice(&palette);
        let palette_range = BufferRange::new(0, palette_bytes.len() as u64);

        let mut before = Vec::with_capacity(jobs.len() + 1);
        let mut after = Vec::with_capacity(jobs.len());
        for job in jobs.iter().filter(|job| job.vertex_count > 0) {
            let range = skinned_range(job);
            before.push(RangeBarrier::new(
                BufferRole::Vertices,
                range,
                BarrierKind::ReadsToCompute,
            ));
            after.push(RangeBarrier::new(
                BufferRole::Vertices,
                range,
                BarrierKind::ComputeToVertex,
            ));
        }

        if !palette_range.is_empty() {
            recorder.barriers(&[RangeBarrier::new(
                BufferRole::Joints,
                palette_range,
                BarrierKind::ReadsToTransfer,
            )]);
            recorder.upload(BufferRole::Joints, 0, palette_bytes)?;
            before.push(RangeBarrier::new(
                BufferRole::Joints,
                palette_range,
                BarrierKind::TransferToCompute,
            ));
        }
        recorder.barriers(&before);

        for job in jobs.iter().filter(|job| job.vertex_count > 0) {
            recorder.dispatch_skin(job, Self::dispatch_groups(job.vertex_count))?;
        }
        recorder.barriers(&after);

        tracing::trace!(jobs = jobs.len(), joints = joints.len(), "recorded skinning");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::{Quat, Vec2, Vec3};

    fn bind_pose() -> Vec<Vertex> {
        vec![
            Vertex::new(Vec3::new(1.0, 0.0, 0.0), Vec3::X, Vec2::new(0.1, 0.2)),
            Vertex::new(Vec3::new(0.0, 2.0, 0.0), Vec3::Y, Vec2::ZERO),
        ]
    }

    #[test]
    fn single_joint_applies_its_transform() {
        let joints = [Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0))];
        let influences = [SkinInfluence::single(0), SkinInfluence::single(0)];
        let params = SkinParams {
            vertex_count: 2,
            src_offset: 0,
            dst_offset: 3,
            joint_offset: 0,
        };
        let mut out = vec![Vertex::default(); 5];

        skin_vertices(&bind_pose(), &influences, &joints, &params, &mut out);
        assert_eq!(out[3].position(), Vec3::new(1.0, 0.0, 5.0));
        assert_eq!(out[4].position(), Vec3::new(0.0, 2.0, 5.0));
        assert_eq!(out[3].uv(), Vec2::new(0.1, 0.2));
        assert_eq!(out[0], Vertex::default());
    }

    #[test]
    fn weights_blend_joint_transforms() {
        let joints = [
            Mat4::IDENTITY,
            Mat4::from_rotation_translation(
                Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
                Vec3::ZERO,
            ),
        ];
        let influences = [SkinInfluence {
            joints: [0, 1, 0, 0],
            weights: [0.5, 0.5, 0.0, 0.0],
        }];
        let params = SkinParams {
            vertex_count: 1,
            ..Default::default()
        };
        let mut out = vec![Vertex::default(); 1];

        skin_vertices(&bind_pose()[..1], &influences, &joints, &params, &mut out);
        let p = out[0].position();
        assert_relative_eq!(p.x, 0.5, epsilon = 1e-6);
        assert_relative_eq!(p.y, 0.5, epsilon = 1e-6);
        assert_relative_eq!(out[0].normal().length(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn joint_offset_selects_palette_slice() {
        let joints = [
            Mat4::from_translation(Vec3::X),
            Mat4::from_translation(Vec3::Z),
        ];
        let influences = [SkinInfluence::single(0)];
        let params = SkinParams {
            vertex_count: 1,
            joint_offset: 1,
            ..Default::default()
        };
        let mut out = vec![Vertex::default(); 1];
        skin_vertices(&bind_pose()[..1], &influences, &joints, &params, &mut out);
        assert_eq!(out[0].position(), Vec3::new(1.0, 0.0, 1.0));
    }

    #[test]
    fn range_and_groups() {
        let params = SkinParams {
            vertex_count: 65,
            src_offset: 0,
            dst_offset: 10,
            joint_offset: 0,
        };
        assert_eq!(skinned_range(&params), BufferRange::new(320, 65 * 32));
        assert_eq!(SkinningPass::dispatch_groups(65), 2);
        assert_eq!(SkinningPass::dispatch_groups(64), 1);
    }
}
