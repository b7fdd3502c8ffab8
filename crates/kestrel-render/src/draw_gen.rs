//! GPU-driven draw command generation.
//!
//! Each frame the culling shader walks the object table, tests every
//! object's bounding sphere against a frustum and appends an indexed
//! indirect draw to the bucket of the object's pipeline. A bucket is a fixed
//! slice of `max_draws` commands in the draw buffer plus one `u32` counter
//! in the count buffer. The main pass has one bucket per material pipeline,
//! the shadow pass a single bucket.
//!
//! Ordering within a frame:
//! 1. earlier reads of the count buffer finish, then it is zeroed
//! 2. transfer -> compute barrier on the counters
//! 3. the cull dispatch writes commands and bumps counters atomically
//! 4. compute -> indirect barriers on every bucket's command slice and
//!    counter, each over its exact byte range
//!
//! [`cull_objects`] runs the same algorithm on the CPU.

use crate::gpu_types::{CullParams, DrawCommand, GpuGeometry, GpuObject, ObjectFlags};
use crate::recorder::{
    BarrierKind, BucketSet, BufferRange, BufferRole, FrameRecorder, IndirectDraw, RangeBarrier,
};
use glam::Vec4;
use kestrel_core::constants::CULL_WORKGROUP_SIZE;
use kestrel_core::{BoundingSphere, Frustum};
use kestrel_gpu::error::{GpuError, Result};

const COUNTER_SIZE: u64 = std::mem::size_of::<u32>() as u64;

/// Byte layout of a set of draw buckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawBucketLayout {
    bucket_count: u32,
    max_draws: u32,
}

impl DrawBucketLayout {
    pub fn new(bucket_count: u32, max_draws: u32) -> Result<Self> {
        if bucket_count == 0 || max_draws == 0 {
            return Err(GpuError::InvalidUsage(format!(
                "draw buckets need at least one bucket and one draw (got {bucket_count} x {max_draws})"
            )));
        }
        Ok(Self {
            bucket_count,
            max_draws,
        })
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    pub fn max_draws(&self) -> u32 {
        self.max_draws
    }

    /// Commands of `bucket` in the draw buffer.
    pub fn command_range(&self, bucket: u32) -> BufferRange {
        debug_assert!(bucket < self.bucket_count);
        let slice = u64::from(self.max_draws) * u64::from(DrawCommand::STRIDE);
        BufferRange::new(u64::from(bucket) * slice, slice)
    }

    /// Counter of `bucket` in the count buffer.
    pub fn count_range(&self, bucket: u32) -> BufferRange {
        debug_assert!(bucket < self.bucket_count);
        BufferRange::new(u64::from(bucket) * COUNTER_SIZE, COUNTER_SIZE)
    }

    pub fn commands_size(&self) -> u64 {
        u64::from(self.bucket_count) * self.command_range(0).size
    }

    pub fn counts_size(&self) -> u64 {
        u64::from(self.bucket_count) * COUNTER_SIZE
    }

    /// Work groups covering `object_count` invocations.
    pub fn dispatch_groups(object_count: u32) -> u32 {
        object_count.div_ceil(CULL_WORKGROUP_SIZE)
    }

    /// Indirect-count draw of `bucket`.
    pub fn indirect_draw(&self, set: BucketSet, bucket: u32) -> IndirectDraw {
        IndirectDraw {
            set,
            bucket,
            commands: self.command_range(bucket),
            count: self.count_range(bucket),
            max_draws: self.max_draws,
        }
    }
}

/// CPU version of `cull.comp`.
///
/// `commands` holds `bucket_count * max_draws` entries and `counts` one
/// counter per bucket; both are expected to be zeroed by the caller, as on
/// the GPU. Counters keep counting past `max_draws` while no command is
/// written beyond the bucket's slice.
pub fn cull_objects(
    objects: &[GpuObject],
    geometries: &[GpuGeometry],
    params: &CullParams,
    commands: &mut [DrawCommand],
    counts: &mut [u32],
) {
    let frustum = Frustum {
        planes: params.planes.map(Vec4::from_array),
    };
    let required = params.required_flags;
    let object_count = (params.object_count as usize).min(objects.len());

    for (id, object) in objects.iter().enumerate().take(object_count) {
        if object.flags & required != required {
            continue;
        }
        let bucket = if params.single_bucket == 0 {
            object.pipeline
        } else {
            0
        };
        if bucket >= params.bucket_count {
            continue;
        }

        let local = BoundingSphere::new(
            glam::Vec3::new(object.bounds[0], object.bounds[1], object.bounds[2]),
            object.bounds[3],
        );
        if !frustum.test_sphere(&local.transformed(object.transform())) {
            continue;
        }

        let Some(counter) = counts.get_mut(bucket as usize) else {
            continue;
        };
        let slot = *counter;
        *counter += 1;
        if slot >= params.max_draws {
            continue;
        }

        let Some(geometry) = geometries.get(object.geometry as usize) else {
            continue;
        };
        let index = (bucket * params.max_draws + slot) as usize;
        if let Some(command) = commands.get_mut(index) {
            *command = DrawCommand {
                index_count: geometry.index_count,
                instance_count: 1,
                first_index: geometry.first_index,
                vertex_offset: geometry.vertex_offset,
                first_instance: id as u32,
            };
        }
    }
}

/// Records the culling pass of one bucket set.
#[derive(Clone, Debug)]
pub struct DrawGenerator {
    set: BucketSet,
    layout: DrawBucketLayout,
    required: ObjectFlags,
}

impl DrawGenerator {
    /// Main pass: one bucket per material pipeline, visible objects only.
    pub fn main(pipeline_count: u32, max_draws: u32) -> Result<Self> {
        Ok(Self {
            set: BucketSet::Main,
            layout: DrawBucketLayout::new(pipeline_count, max_draws)?,
            required: ObjectFlags::VISIBLE,
        })
    }

    /// Shadow pass: a single bucket of shadow casters.
    pub fn shadow(max_draws: u32) -> Result<Self> {
        Ok(Self {
            set: BucketSet::Shadow,
            layout: DrawBucketLayout::new(1, max_draws)?,
            required: ObjectFlags::CASTS_SHADOW,
        })
    }

    pub fn set(&self) -> BucketSet {
        self.set
    }

    pub fn layout(&self) -> &DrawBucketLayout {
        &self.layout
    }

    /// Push constants for culling `object_count` objects against `frustum`.
    pub fn params(&self, frustum: &Frustum, object_count: u32) -> CullParams {
        CullParams {
            planes: frustum.to_arrays(),
            object_count,
            max_draws: self.layout.max_draws,
            bucket_count: self.layout.bucket_count,
            required_flags: self.required.bits(),
            single_bucket: u32::from(self.set == BucketSet::Shadow),
            _pad: [0; 3],
        }
    }

    /// Record count reset, cull dispatch and the barriers around them.
    pub fn record(
        &self,
        recorder: &mut impl FrameRecorder,
        frustum: &Frustum,
        object_count: u32,
    ) -> Result<()> {
        let commands = BufferRole::DrawCommands(self.set);
        let counts = BufferRole::DrawCounts(self.set);
        let all_counts = BufferRange::new(0, self.layout.counts_size());
        let all_commands = BufferRange::new(0, self.layout.commands_size());

        recorder.barriers(&[
            RangeBarrier::new(counts, all_counts, BarrierKind::ReadsToTransfer),
            RangeBarrier::new(commands, all_commands, BarrierKind::ReadsToCompute),
        ]);
        recorder.fill(counts, all_counts, 0);
        recorder.barriers(&[RangeBarrier::new(
            counts,
            all_counts,
            BarrierKind::TransferToCompute,
        )]);

        if object_count > 0 {
            let params = self.params(frustum, object_count);
            recorder.dispatch_cull(
                self.set,
                &params,
                DrawBucketLayout::dispatch_groups(object_count),
            )?;
        }

        let mut barriers = Vec::with_capacity(self.layout.bucket_count as usize * 2);
        for bucket in 0..self.layout.bucket_count {
            barriers.push(RangeBarrier::new(
                commands,
                self.layout.command_range(bucket),
                BarrierKind::ComputeToIndirect,
            ));
            barriers.push(RangeBarrier::new(
                counts,
                self.layout.count_range(bucket),
                BarrierKind::ComputeToIndirect,
            ));
        }
        recorder.barriers(&barriers);

        tracing::trace!(set = ?self.set, object_count, "recorded draw generation");
        Ok(())
    }

    /// Record one indirect-count draw per bucket.
    pub fn record_draws(&self, recorder: &mut impl FrameRecorder) {
        for bucket in 0..self.layout.bucket_count {
            recorder.draw_indirect_count(&self.layout.indirect_draw(self.set, bucket));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};

    fn object(position: Vec3, pipeline: u32, flags: ObjectFlags) -> GpuObject {
        GpuObject {
            transform: Mat4::from_translation(position).to_cols_array_2d(),
            bounds: [0.0, 0.0, 0.0, 1.0],
            geometry: 0,
            pipeline,
            flags: flags.bits(),
            _pad: 0,
        }
    }

    fn geometry() -> Vec<GpuGeometry> {
        vec![GpuGeometry {
            index_count: 36,
            first_index: 6,
            vertex_offset: 24,
            _pad: 0,
        }]
    }

    fn run(
        generator: &DrawGenerator,
        frustum: &Frustum,
        objects: &[GpuObject],
    ) -> (Vec<DrawCommand>, Vec<u32>) {
        let layout = generator.layout();
        let mut commands =
            vec![DrawCommand::default(); (layout.bucket_count() * layout.max_draws()) as usize];
        let mut counts = vec![0; layout.bucket_count() as usize];
        let params = generator.params(frustum, objects.len() as u32);
        cull_objects(objects, &geometry(), &params, &mut commands, &mut counts);
        (commands, counts)
    }

    #[test]
    fn layout_ranges_are_disjoint_and_exact() {
        let layout = DrawBucketLayout::new(3, 100).unwrap();
        assert_eq!(layout.command_range(0), BufferRange::new(0, 2000));
        assert_eq!(layout.command_range(2), BufferRange::new(4000, 2000));
        assert_eq!(layout.count_range(1), BufferRange::new(4, 4));
        assert_eq!(layout.commands_size(), 6000);
        assert_eq!(layout.counts_size(), 12);
        assert!(!layout.command_range(0).overlaps(&layout.command_range(1)));
    }

    #[test]
    fn empty_layouts_are_rejected() {
        assert!(DrawBucketLayout::new(0, 10).is_err());
        assert!(DrawBucketLayout::new(2, 0).is_err());
    }

    #[test]
    fn dispatch_rounds_up_to_workgroups() {
        assert_eq!(DrawBucketLayout::dispatch_groups(0), 0);
        assert_eq!(DrawBucketLayout::dispatch_groups(1), 1);
        assert_eq!(DrawBucketLayout::dispatch_groups(32), 1);
        assert_eq!(DrawBucketLayout::dispatch_groups(33), 2);
    }

    #[test]
    fn empty_scene_produces_no_draws() {
        let generator = DrawGenerator::main(2, 8).unwrap();
        let (_, counts) = run(&generator, &Frustum::infinite(), &[]);
        assert_eq!(counts, vec![0, 0]);
    }

    #[test]
    fn objects_land_in_their_pipeline_bucket() {
        let generator = DrawGenerator::main(2, 8).unwrap();
        let objects: Vec<_> = (0..5)
            .map(|i| object(Vec3::new(i as f32, 0.0, 0.0), 0, ObjectFlags::VISIBLE))
            .collect();

        let (commands, counts) = run(&generator, &Frustum::infinite(), &objects);
        assert_eq!(counts, vec![5, 0]);
        for (slot, command) in commands.iter().take(5).enumerate() {
            assert_eq!(command.index_count, 36);
            assert_eq!(command.instance_count, 1);
            assert_eq!(command.first_index, 6);
            assert_eq!(command.vertex_offset, 24);
            assert_eq!(command.first_instance, slot as u32);
        }
        assert_eq!(commands[8], DrawCommand::default());
    }

    #[test]
    fn frustum_rejects_objects_behind_the_camera() {
        let view_proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0)
            * Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let frustum = Frustum::from_view_projection(view_proj);
        let generator = DrawGenerator::main(1, 8).unwrap();
        let objects = [
            object(Vec3::new(0.0, 0.0, -10.0), 0, ObjectFlags::VISIBLE),
            object(Vec3::new(0.0, 0.0, 10.0), 0, ObjectFlags::VISIBLE),
            // Center outside, sphere still touching the near plane.
            object(Vec3::new(0.0, 0.0, 0.5), 0, ObjectFlags::VISIBLE),
        ];

        let (commands, counts) = run(&generator, &frustum, &objects);
        assert_eq!(counts, vec![2]);
        assert_eq!(commands[0].first_instance, 0);
        assert_eq!(commands[1].first_instance, 2);
    }

    #[test]
    fn scaled_transforms_grow_the_sphere() {
        let frustum = Frustum::from_view_projection(Mat4::orthographic_rh(
            -1.0, 1.0, -1.0, 1.0, 0.0, 10.0,
        ));
        let mut far_out = object(Vec3::new(3.5, 0.0, -5.0), 0, ObjectFlags::VISIBLE);
        let generator = DrawGenerator::main(1, 4).unwrap();
        assert_eq!(run(&generator, &frustum, &[far_out]).1, vec![0]);

        far_out.transform = (Mat4::from_translation(Vec3::new(3.5, 0.0, -5.0))
            * Mat4::from_scale(Vec3::splat(3.0)))
        .to_cols_array_2d();
        assert_eq!(run(&generator, &frustum, &[far_out]).1, vec![1]);
    }

    #[test]
    fn shadow_bucket_collects_casters_from_every_pipeline() {
        let generator = DrawGenerator::shadow(8).unwrap();
        let objects = [
            object(Vec3::ZERO, 0, ObjectFlags::VISIBLE | ObjectFlags::CASTS_SHADOW),
            object(Vec3::ZERO, 1, ObjectFlags::CASTS_SHADOW),
            object(Vec3::ZERO, 1, ObjectFlags::VISIBLE),
        ];
        let (commands, counts) = run(&generator, &Frustum::infinite(), &objects);
        assert_eq!(counts, vec![2]);
        assert_eq!(commands[1].first_instance, 1);
    }

    #[test]
    fn unknown_pipelines_are_skipped() {
        let generator = DrawGenerator::main(1, 4).unwrap();
        let objects = [object(Vec3::ZERO, 3, ObjectFlags::VISIBLE)];
        assert_eq!(run(&generator, &Frustum::infinite(), &objects).1, vec![0]);
    }

    #[test]
    fn overflow_counts_past_capacity_without_writing() {
        let generator = DrawGenerator::main(2, 2).unwrap();
        let objects: Vec<_> = (0..5)
            .map(|_| object(Vec3::ZERO, 0, ObjectFlags::VISIBLE))
            .collect();
        let (commands, counts) = run(&generator, &Frustum::infinite(), &objects);
        assert_eq!(counts, vec![5, 0]);
        // Bucket 1's slice is untouched.
        assert_eq!(commands[2], DrawCommand::default());
        assert_eq!(commands[3], DrawCommand::default());
    }

    #[test]
    fn params_reflect_bucket_set() {
        let frustum = Frustum::infinite();
        let main = DrawGenerator::main(3, 64).unwrap().params(&frustum, 10);
        assert_eq!(main.bucket_count, 3);
        assert_eq!(main.single_bucket, 0);
        assert_eq!(main.required_flags, ObjectFlags::VISIBLE.bits());

        let shadow = DrawGenerator::shadow(64).unwrap().params(&frustum, 10);
        assert_eq!(shadow.bucket_count, 1);
        assert_eq!(shadow.single_bucket, 1);
        assert_eq!(shadow.required_flags, ObjectFlags::CASTS_SHADOW.bits());
    }
}
