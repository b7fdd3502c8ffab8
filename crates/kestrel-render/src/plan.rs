//! Per-frame GPU work, in recording order.
//!
//! The plan is the single description of a frame that both recorders
//! execute: geometry upload when the mesh registry changed, object table
//! upload, skinning, main and shadow culling, then the shadow and main
//! passes consuming the indirect buffers. Shared device buffers outlive a
//! frame, so every overwrite is preceded by a barrier ordering it after the
//! previous frames' reads.

use crate::draw_gen::DrawGenerator;
use crate::gpu_types::{GpuObject, SkinParams};
use crate::mesh::MeshRegistry;
use crate::recorder::{
    BarrierKind, BufferRange, BufferRole, FrameRecorder, PassKind, RangeBarrier,
};
use crate::skinning::SkinningPass;
use kestrel_core::Frustum;
use kestrel_gpu::error::Result;

/// Everything one frame reads from the scene.
pub struct FrameInputs<'a> {
    pub objects: &'a [GpuObject],
    pub meshes: &'a MeshRegistry,
    pub skin_jobs: &'a [SkinParams],
    pub camera: Frustum,
    pub light: Frustum,
}

/// What a recorded frame contained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub objects: u32,
    pub skin_jobs: u32,
    pub geometry_uploaded: bool,
}

/// Byte sizes of the mesh registry's device buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeometrySizes {
    pub vertices: u64,
    pub indices: u64,
    pub geometries: u64,
    pub bind_pose: u64,
    pub influences: u64,
    pub joints: u64,
}

impl GeometrySizes {
    pub fn of(meshes: &MeshRegistry) -> Self {
        Self {
            vertices: byte_len(meshes.vertices()),
            indices: byte_len(meshes.indices()),
            geometries: byte_len(meshes.geometries()),
            bind_pose: byte_len(meshes.bind_pose()),
            influences: byte_len(meshes.influences()),
            joints: byte_len(meshes.joints()),
        }
    }

    /// Required size of each role's buffer.
    pub fn by_role(&self) -> [(BufferRole, u64); 6] {
        [
            (BufferRole::Vertices, self.vertices),
            (BufferRole::Indices, self.indices),
            (BufferRole::Geometries, self.geometries),
            (BufferRole::BindPose, self.bind_pose),
            (BufferRole::Influences, self.influences),
            (BufferRole::Joints, self.joints),
        ]
    }
}

fn byte_len<T: bytemuck::Pod>(items: &[T]) -> u64 {
    std::mem::size_of_val(items) as u64
}

/// Records frames against any [`FrameRecorder`].
pub struct RenderPlan {
    main: DrawGenerator,
    shadow: DrawGenerator,
    skinning: SkinningPass,
    uploaded_version: Option<u64>,
}

impl RenderPlan {
    pub fn new(pipeline_count: u32, max_draws_per_pipeline: u32) -> Result<Self> {
        Ok(Self {
            main: DrawGenerator::main(pipeline_count, max_draws_per_pipeline)?,
            shadow: DrawGenerator::shadow(max_draws_per_pipeline)?,
            skinning: SkinningPass,
            uploaded_version: None,
        })
    }

    pub fn main(&self) -> &DrawGenerator {
        &self.main
    }

    pub fn shadow(&self) -> &DrawGenerator {
        &self.shadow
    }

    /// Required sizes of the indirect command and count buffers.
    pub fn draw_buffer_sizes(&self) -> [(BufferRole, u64); 4] {
        let sizes = |generator: &DrawGenerator| {
            let layout = generator.layout();
            [
                (BufferRole::DrawCommands(generator.set()), layout.commands_size()),
                (BufferRole::DrawCounts(generator.set()), layout.counts_size()),
            ]
        };
        let [main_commands, main_counts] = sizes(&self.main);
        let [shadow_commands, shadow_counts] = sizes(&self.shadow);
        [main_commands, main_counts, shadow_commands, shadow_counts]
    }

    /// Whether the next frame re-uploads the mesh registry.
    pub fn needs_geometry_upload(&self, meshes: &MeshRegistry) -> bool {
        self.uploaded_version != Some(meshes.version())
    }

    /// Force a geometry upload on the next frame, e.g. after buffers were replaced.
    pub fn invalidate_geometry(&mut self) {
        self.uploaded_version = None;
    }

    pub fn record(
        &mut self,
        recorder: &mut impl FrameRecorder,
        inputs: &FrameInputs<'_>,
    ) -> Result<PlanSummary> {
        let geometry_uploaded = self.needs_geometry_upload(inputs.meshes);
        if geometry_uploaded {
            upload_geometry(recorder, inputs.meshes)?;
            self.uploaded_version = Some(inputs.meshes.version());
        }

        let object_count = inputs.objects.len() as u32;
        let object_bytes: &[u8] = bytemuck::cast_slice(inputs.objects);
        upload_with_barriers(
            recorder,
            BufferRole::Objects,
            object_bytes,
            BarrierKind::TransferToShaderRead,
        )?;

        self.skinning
            .record(recorder, inputs.skin_jobs, inputs.meshes.joints())?;
        self.main.record(recorder, &inputs.camera, object_count)?;
        self.shadow.record(recorder, &inputs.light, object_count)?;

        recorder.begin_pass(PassKind::Shadow)?;
        self.shadow.record_draws(recorder);
        recorder.end_pass();

        recorder.begin_pass(PassKind::Main)?;
        self.main.record_draws(recorder);
        recorder.end_pass();

        Ok(PlanSummary {
            objects: object_count,
            skin_jobs: inputs.skin_jobs.len() as u32,
            geometry_uploaded,
        })
    }
}

/// Overwrite the start of `role` with `data`, ordered after earlier reads
/// and before the `consumer` stages.
fn upload_with_barriers(
    recorder: &mut impl FrameRecorder,
    role: BufferRole,
    data: &[u8],
    consumer: BarrierKind,
) -> Result<()> {
    let range = BufferRange::new(0, data.len() as u64);
    if range.is_empty() {
        return Ok(());
    }
    recorder.barriers(&[RangeBarrier::new(role, range, BarrierKind::ReadsToTransfer)]);
    recorder.upload(role, 0, data)?;
    recorder.barriers(&[RangeBarrier::new(role, range, consumer)]);
    Ok(())
}

fn upload_geometry(recorder: &mut impl FrameRecorder, meshes: &MeshRegistry) -> Result<()> {
    let uploads: [(BufferRole, &[u8], BarrierKind); 5] = [
        (
            BufferRole::Vertices,
            bytemuck::cast_slice(meshes.vertices()),
            BarrierKind::TransferToVertexInput,
        ),
        (
            BufferRole::Indices,
            bytemuck::cast_slice(meshes.indices()),
            BarrierKind::TransferToVertexInput,
        ),
        (
            BufferRole::Geometries,
            bytemuck::cast_slice(meshes.geometries()),
            BarrierKind::TransferToShaderRead,
        ),
        (
            BufferRole::BindPose,
            bytemuck::cast_slice(meshes.bind_pose()),
            BarrierKind::TransferToShaderRead,
        ),
        (
            BufferRole::Influences,
            bytemuck::cast_slice(meshes.influences()),
            BarrierKind::TransferToShaderRead,
        ),
    ];

    let live: Vec<_> = uploads
        .iter()
        .filter(|(_, data, _)| !data.is_empty())
        .collect();
    let barriers = |kind: Option<BarrierKind>| -> Vec<RangeBarrier> {
        live.iter()
            .map(|(role, data, consumer)| {
                let range = BufferRange::new(0, data.len() as u64);
                RangeBarrier::new(*role, range, kind.unwrap_or(*consumer))
            })
            .collect()
    };

    recorder.barriers(&barriers(Some(BarrierKind::ReadsToTransfer)));
    for (role, data, _) in &live {
        recorder.upload(*role, 0, data)?;
    }
    recorder.barriers(&barriers(None));

    tracing::debug!(
        version = meshes.version(),
        meshes = meshes.len(),
        vertices = meshes.vertices().len(),
        indices = meshes.indices().len(),
        "uploaded geometry"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_types::{ObjectFlags, SkinInfluence, Vertex};
    use crate::mesh::{MeshData, SkinData};
    use crate::recorder::BucketSet;
    use crate::reference::{RecordedOp, ReferenceRecorder};
    use crate::scene::{MeshInstance, Scene, Transform};
    use glam::{Mat4, Vec2, Vec3};
    use kestrel_core::{GrowableArray, MemoryTag};

    fn quad() -> MeshData {
        MeshData {
            vertices: vec![
                Vertex::new(Vec3::new(-0.5, -0.5, 0.0), Vec3::Z, Vec2::ZERO),
                Vertex::new(Vec3::new(0.5, -0.5, 0.0), Vec3::Z, Vec2::X),
                Vertex::new(Vec3::new(0.5, 0.5, 0.0), Vec3::Z, Vec2::ONE),
                Vertex::new(Vec3::new(-0.5, 0.5, 0.0), Vec3::Z, Vec2::Y),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
            skin: None,
        }
    }

    fn skinned_quad() -> MeshData {
        let mut data = quad();
        data.skin = Some(SkinData {
            influences: vec![SkinInfluence::single(0); 4],
            joint_count: 1,
        });
        data
    }

    struct Fixture {
        scene: Scene,
        plan: RenderPlan,
        recorder: ReferenceRecorder,
        table: GrowableArray<GpuObject>,
    }

    impl Fixture {
        fn new(pipelines: u32) -> Self {
            Self {
                scene: Scene::new(pipelines),
                plan: RenderPlan::new(pipelines, 16).unwrap(),
                recorder: ReferenceRecorder::new(),
                table: GrowableArray::new(MemoryTag::Scene),
            }
        }

        fn frame(&mut self) -> PlanSummary {
            self.scene.update_transforms();
            self.scene.object_table(&mut self.table);
            let jobs = self.scene.skin_jobs();
            self.recorder.begin_frame();
            self.plan
                .record(
                    &mut self.recorder,
                    &FrameInputs {
                        objects: &self.table,
                        meshes: self.scene.meshes(),
                        skin_jobs: &jobs,
                        camera: Frustum::infinite(),
                        light: Frustum::infinite(),
                    },
                )
                .unwrap()
        }
    }

    #[test]
    fn frames_record_without_hazards() {
        let mut fx = Fixture::new(2);
        let mesh = fx.scene.register_mesh(&quad()).unwrap();
        for i in 0..4 {
            fx.scene
                .add_mesh_node(
                    None,
                    "quad",
                    Transform::from_translation(Vec3::X * i as f32),
                    MeshInstance::new(mesh, i % 2),
                )
                .unwrap();
        }

        let first = fx.frame();
        assert!(first.geometry_uploaded);
        assert_eq!(first.objects, 4);
        for _ in 0..3 {
            assert!(!fx.frame().geometry_uploaded);
        }

        assert!(fx.recorder.hazards().is_empty(), "{:?}", fx.recorder.hazards());
        assert_eq!(fx.recorder.count(BucketSet::Main, 0), 2);
        assert_eq!(fx.recorder.count(BucketSet::Main, 1), 2);
        assert_eq!(fx.recorder.count(BucketSet::Shadow, 0), 4);
    }

    #[test]
    fn shadow_pass_draws_before_main_pass() {
        let mut fx = Fixture::new(1);
        let mesh = fx.scene.register_mesh(&quad()).unwrap();
        fx.scene
            .add_mesh_node(None, "q", Transform::IDENTITY, MeshInstance::new(mesh, 0))
            .unwrap();
        fx.frame();

        let passes: Vec<_> = fx.recorder.draws().iter().map(|d| d.pass).collect();
        assert_eq!(passes, vec![PassKind::Shadow, PassKind::Main]);
        let main = &fx.recorder.draws()[1];
        assert_eq!(main.commands.len(), 1);
        assert_eq!(main.index_total(), 6);
    }

    #[test]
    fn registering_a_mesh_mid_run_reuploads_safely() {
        let mut fx = Fixture::new(1);
        let a = fx.scene.register_mesh(&quad()).unwrap();
        fx.scene
            .add_mesh_node(None, "a", Transform::IDENTITY, MeshInstance::new(a, 0))
            .unwrap();
        fx.frame();
        fx.frame();

        let b = fx.scene.register_mesh(&quad()).unwrap();
        fx.scene
            .add_mesh_node(None, "b", Transform::IDENTITY, MeshInstance::new(b, 0))
            .unwrap();
        assert!(fx.frame().geometry_uploaded);
        fx.frame();

        assert!(fx.recorder.hazards().is_empty(), "{:?}", fx.recorder.hazards());
        let commands = &fx.recorder.draws()[1].commands;
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].vertex_offset, 4);
    }

    #[test]
    fn skinned_vertices_are_written_before_drawing() {
        let mut fx = Fixture::new(1);
        let rigid = fx.scene.register_mesh(&quad()).unwrap();
        let skinned = fx.scene.register_mesh(&skinned_quad()).unwrap();
        fx.scene
            .add_mesh_node(None, "r", Transform::IDENTITY, MeshInstance::new(rigid, 0))
            .unwrap();
        fx.scene
            .add_mesh_node(None, "s", Transform::IDENTITY, MeshInstance::new(skinned, 0))
            .unwrap();

        let lift = Mat4::from_translation(Vec3::Y * 2.0);
        fx.scene
            .meshes_mut()
            .set_joint_matrices(skinned, &[lift])
            .unwrap();
        let summary = fx.frame();
        assert_eq!(summary.skin_jobs, 1);
        fx.frame();

        assert!(fx.recorder.hazards().is_empty(), "{:?}", fx.recorder.hazards());
        let vertices: Vec<Vertex> = fx.recorder.read(BufferRole::Vertices);
        assert_eq!(vertices[0].position(), Vec3::new(-0.5, -0.5, 0.0));
        assert_eq!(vertices[4].position(), Vec3::new(-0.5, 1.5, 0.0));

        let first_skin = fx
            .recorder
            .ops()
            .iter()
            .position(|op| matches!(op, RecordedOp::Skin { .. }));
        let first_pass = fx
            .recorder
            .ops()
            .iter()
            .position(|op| matches!(op, RecordedOp::BeginPass(_)));
        assert!(first_skin < first_pass);
    }

    #[test]
    fn empty_scene_issues_no_indices() {
        let mut fx = Fixture::new(3);
        let summary = fx.frame();
        assert_eq!(summary.objects, 0);
        assert!(fx.recorder.hazards().is_empty(), "{:?}", fx.recorder.hazards());
        assert_eq!(fx.recorder.draws().len(), 4);
        for draw in fx.recorder.draws() {
            assert_eq!(draw.count, 0);
            assert_eq!(draw.index_total(), 0);
        }
        assert!(!fx
            .recorder
            .ops()
            .iter()
            .any(|op| matches!(op, RecordedOp::Cull { .. })));
    }

    #[test]
    fn hidden_objects_only_cast_shadows() {
        let mut fx = Fixture::new(1);
        let mesh = fx.scene.register_mesh(&quad()).unwrap();
        let node = fx
            .scene
            .add_mesh_node(None, "q", Transform::IDENTITY, MeshInstance::new(mesh, 0))
            .unwrap();
        fx.scene.set_flags(node, ObjectFlags::CASTS_SHADOW).unwrap();
        fx.frame();
        assert_eq!(fx.recorder.count(BucketSet::Main, 0), 0);
        assert_eq!(fx.recorder.count(BucketSet::Shadow, 0), 1);
    }

    #[test]
    fn geometry_sizes_follow_the_registry() {
        let mut registry = MeshRegistry::new();
        registry.register(&skinned_quad()).unwrap();
        let sizes = GeometrySizes::of(&registry);
        assert_eq!(sizes.vertices, 4 * 32);
        assert_eq!(sizes.indices, 6 * 4);
        assert_eq!(sizes.geometries, 16);
        assert_eq!(sizes.bind_pose, 4 * 32);
        assert_eq!(sizes.joints, 64);
        assert_eq!(sizes.by_role()[0], (BufferRole::Vertices, 128));
    }
}
