//! CPU execution of recorded frames.
//!
//! [`ReferenceRecorder`] runs uploads, fills, culling and skinning on host
//! memory and keeps, per logical buffer, the accesses no barrier has ordered
//! yet. Every read or write is checked against them:
//!
//! - a read at stage `S` needs each overlapping earlier write to be visible
//!   to `S`
//! - a write additionally needs each overlapping earlier read ordered before
//!   `S`
//!
//! Barriers only affect the bytes they cover, and chain through stages an
//! earlier barrier already made an access visible to, as execution
//! dependencies do on the device. Violations are collected as [`Hazard`]s.

use crate::draw_gen::cull_objects;
use crate::gpu_types::{
    CullParams, DrawCommand, GpuGeometry, GpuObject, SkinInfluence, SkinParams, Vertex,
};
use crate::recorder::{
    BarrierKind, BucketSet, BufferRange, BufferRole, FrameRecorder, IndirectDraw, PassKind,
    RangeBarrier,
};
use crate::skinning::{skin_vertices, skinned_range};
use bitflags::bitflags;
use glam::Mat4;
use kestrel_gpu::error::{GpuError, Result};
use std::collections::HashMap;

bitflags! {
    /// Pipeline stages the reference tracks.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct StageMask: u8 {
        const TRANSFER = 1 << 0;
        const COMPUTE = 1 << 1;
        /// Vertex attribute and index fetch.
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 4;
        const INDIRECT = 1 << 5;
    }
}

impl BarrierKind {
    /// Source and destination stages of the barrier.
    pub fn stages(self) -> (StageMask, StageMask) {
        match self {
            Self::ReadsToTransfer => (StageMask::all(), StageMask::TRANSFER),
            Self::ReadsToCompute => (StageMask::all(), StageMask::COMPUTE),
            Self::TransferToCompute => (StageMask::TRANSFER, StageMask::COMPUTE),
            Self::TransferToShaderRead => (
                StageMask::TRANSFER,
                StageMask::COMPUTE | StageMask::VERTEX_SHADER | StageMask::FRAGMENT_SHADER,
            ),
            Self::TransferToVertexInput => (
                StageMask::TRANSFER,
                StageMask::VERTEX_INPUT | StageMask::COMPUTE,
            ),
            Self::ComputeToIndirect => (StageMask::COMPUTE, StageMask::INDIRECT),
            Self::ComputeToVertex => (
                StageMask::COMPUTE,
                StageMask::VERTEX_INPUT | StageMask::VERTEX_SHADER,
            ),
        }
    }
}

/// How an access conflicted with earlier work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HazardKind {
    ReadAfterWrite,
    WriteAfterWrite,
    WriteAfterRead,
    /// Compute or transfer work recorded inside a render pass.
    WorkInsidePass,
    /// A draw recorded outside a render pass.
    DrawOutsidePass,
}

/// An access that no barrier ordered after a conflicting earlier access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hazard {
    pub kind: HazardKind,
    pub role: Option<BufferRole>,
    pub range: BufferRange,
    pub stage: StageMask,
}

#[derive(Clone, Copy, Debug)]
struct Access {
    range: BufferRange,
    stage: StageMask,
    write: bool,
    /// Stages ordered after this access by barriers so far.
    visible_to: StageMask,
}

/// A draw the reference executed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutedDraw {
    pub pass: PassKind,
    pub set: BucketSet,
    pub bucket: u32,
    /// Counter value as written by culling, before clamping.
    pub count: u32,
    /// Commands the draw consumed, clamped to `max_draws`.
    pub commands: Vec<DrawCommand>,
}

impl ExecutedDraw {
    /// Indices the draw would have fetched.
    pub fn index_total(&self) -> u64 {
        self.commands
            .iter()
            .map(|c| u64::from(c.index_count) * u64::from(c.instance_count))
            .sum()
    }
}

/// One recorded operation, kept for inspection.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedOp {
    Upload { role: BufferRole, range: BufferRange },
    Fill { role: BufferRole, range: BufferRange, value: u32 },
    Barriers(Vec<RangeBarrier>),
    Cull { set: BucketSet, groups: u32, counts_after: Vec<u32> },
    Skin { params: SkinParams, groups: u32 },
    BeginPass(PassKind),
    Draw { set: BucketSet, bucket: u32 },
    EndPass,
}

/// [`FrameRecorder`] executing on the CPU with hazard checking.
#[derive(Default)]
pub struct ReferenceRecorder {
    buffers: HashMap<BufferRole, Vec<u8>>,
    accesses: HashMap<BufferRole, Vec<Access>>,
    hazards: Vec<Hazard>,
    ops: Vec<RecordedOp>,
    draws: Vec<ExecutedDraw>,
    pass: Option<PassKind>,
}

impl ReferenceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of a buffer; bytes never written read as zero.
    pub fn buffer(&self, role: BufferRole) -> &[u8] {
        self.buffers.get(&role).map_or(&[], Vec::as_slice)
    }

    /// Whole elements of `T` stored in `role`.
    pub fn read<T: bytemuck::Pod>(&self, role: BufferRole) -> Vec<T> {
        let bytes = self.buffer(role);
        bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    /// Counter of one bucket.
    pub fn count(&self, set: BucketSet, bucket: u32) -> u32 {
        let counts: Vec<u32> = self.read(BufferRole::DrawCounts(set));
        counts.get(bucket as usize).copied().unwrap_or(0)
    }

    pub fn hazards(&self) -> &[Hazard] {
        &self.hazards
    }

    pub fn ops(&self) -> &[RecordedOp] {
        &self.ops
    }

    pub fn draws(&self) -> &[ExecutedDraw] {
        &self.draws
    }

    /// Forget recorded operations and draws, keeping buffers and access state.
    ///
    /// Access state persists because consecutive frames are not ordered
    /// with respect to each other without barriers.
    pub fn begin_frame(&mut self) {
        self.ops.clear();
        self.draws.clear();
    }

    fn bytes_mut(&mut self, role: BufferRole, end: u64) -> &mut Vec<u8> {
        let bytes = self.buffers.entry(role).or_default();
        if (bytes.len() as u64) < end {
            bytes.resize(end as usize, 0);
        }
        bytes
    }

    fn outside_pass(&mut self, stage: StageMask) {
        if self.pass.is_some() {
            self.hazards.push(Hazard {
                kind: HazardKind::WorkInsidePass,
                role: None,
                range: BufferRange::default(),
                stage,
            });
        }
    }

    /// Split accesses of `role` so each lies entirely inside or outside `range`.
    fn carve(&mut self, role: BufferRole, range: BufferRange) -> &mut Vec<Access> {
        let accesses = self.accesses.entry(role).or_default();
        let mut carved = Vec::with_capacity(accesses.len());
        for access in accesses.drain(..) {
            if !access.range.overlaps(&range) || range.contains(&access.range) {
                carved.push(access);
                continue;
            }
            let start = access.range.offset.max(range.offset);
            let end = access.range.end().min(range.end());
            let pieces = [
                (access.range.offset, start),
                (start, end),
                (end, access.range.end()),
            ];
            for (from, to) in pieces {
                if to > from {
                    carved.push(Access {
                        range: BufferRange::new(from, to - from),
                        ..access
                    });
                }
            }
        }
        *accesses = carved;
        accesses
    }

    fn access(&mut self, role: BufferRole, range: BufferRange, stage: StageMask, write: bool) {
        if range.is_empty() {
            return;
        }

        let mut found = Vec::new();
        let accesses = self.carve(role, range);
        for earlier in accesses.iter().filter(|a| range.contains(&a.range)) {
            if earlier.visible_to.contains(stage) {
                continue;
            }
            let kind = match (earlier.write, write) {
                (true, false) => HazardKind::ReadAfterWrite,
                (true, true) => HazardKind::WriteAfterWrite,
                (false, true) => HazardKind::WriteAfterRead,
                (false, false) => continue,
            };
            found.push(Hazard {
                kind,
                role: Some(role),
                range: earlier.range,
                stage,
            });
        }

        if write {
            // Everything inside the range is now ordered before this write.
            accesses.retain(|a| !range.contains(&a.range));
        } else {
            accesses.retain(|a| a.write || a.stage != stage || !range.contains(&a.range));
        }
        accesses.push(Access {
            range,
            stage,
            write,
            visible_to: StageMask::empty(),
        });

        if !found.is_empty() {
            tracing::warn!(?role, hazards = found.len(), "unsynchronized buffer access");
            self.hazards.extend(found);
        }
    }

    fn apply_barrier(&mut self, barrier: &RangeBarrier) {
        let (src, dst) = barrier.kind.stages();
        let range = barrier.range;
        for access in self
            .carve(barrier.role, range)
            .iter_mut()
            .filter(|a| range.contains(&a.range))
        {
            if src.contains(access.stage) || access.visible_to.intersects(src) {
                access.visible_to |= dst;
            }
        }
    }

    fn run_cull(&mut self, set: BucketSet, params: &CullParams) {
        let objects: Vec<GpuObject> = self.read(BufferRole::Objects);
        let geometries: Vec<GpuGeometry> = self.read(BufferRole::Geometries);
        let command_count = (params.bucket_count * params.max_draws) as usize;

        let mut commands: Vec<DrawCommand> = self.read(BufferRole::DrawCommands(set));
        commands.resize(command_count.max(commands.len()), DrawCommand::default());
        let mut counts: Vec<u32> = self.read(BufferRole::DrawCounts(set));
        counts.resize((params.bucket_count as usize).max(counts.len()), 0);

        cull_objects(&objects, &geometries, params, &mut commands, &mut counts);

        let command_bytes: &[u8] = bytemuck::cast_slice(&commands);
        self.bytes_mut(BufferRole::DrawCommands(set), command_bytes.len() as u64)
            .copy_from_slice(command_bytes);
        let count_bytes: &[u8] = bytemuck::cast_slice(&counts);
        self.bytes_mut(BufferRole::DrawCounts(set), count_bytes.len() as u64)
            .copy_from_slice(count_bytes);
    }

    fn run_skin(&mut self, params: &SkinParams) {
        let bind_pose: Vec<Vertex> = self.read(BufferRole::BindPose);
        let influences: Vec<SkinInfluence> = self.read(BufferRole::Influences);
        let joints: Vec<Mat4> = self.read(BufferRole::Joints);
        let mut vertices: Vec<Vertex> = self.read(BufferRole::Vertices);

        skin_vertices(&bind_pose, &influences, &joints, params, &mut vertices);

        let bytes: &[u8] = bytemuck::cast_slice(&vertices);
        self.bytes_mut(BufferRole::Vertices, bytes.len() as u64)
            .copy_from_slice(bytes);
    }
}

impl FrameRecorder for ReferenceRecorder {
    fn upload(&mut self, role: BufferRole, offset: u64, data: &[u8]) -> Result<()> {
        if offset % 4 != 0 {
            return Err(GpuError::InvalidUsage(format!(
                "upload offset {offset} is not 4-byte aligned"
            )));
        }
        self.outside_pass(StageMask::TRANSFER);
        let range = BufferRange::new(offset, data.len() as u64);
        self.access(role, range, StageMask::TRANSFER, true);
        self.bytes_mut(role, range.end())[offset as usize..range.end() as usize]
            .copy_from_slice(data);
        self.ops.push(RecordedOp::Upload { role, range });
        Ok(())
    }

    fn fill(&mut self, role: BufferRole, range: BufferRange, value: u32) {
        self.outside_pass(StageMask::TRANSFER);
        self.access(role, range, StageMask::TRANSFER, true);
        let word = value.to_ne_bytes();
        let bytes = self.bytes_mut(role, range.end());
        for chunk in bytes[range.offset as usize..range.end() as usize].chunks_mut(4) {
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        self.ops.push(RecordedOp::Fill { role, range, value });
    }

    fn barriers(&mut self, barriers: &[RangeBarrier]) {
        for barrier in barriers {
            self.apply_barrier(barrier);
        }
        if !barriers.is_empty() {
            self.ops.push(RecordedOp::Barriers(barriers.to_vec()));
        }
    }

    fn dispatch_cull(&mut self, set: BucketSet, params: &CullParams, groups: u32) -> Result<()> {
        self.outside_pass(StageMask::COMPUTE);
        let objects = BufferRange::new(
            0,
            u64::from(params.object_count) * std::mem::size_of::<GpuObject>() as u64,
        );
        let geometries = BufferRange::new(0, self.buffer(BufferRole::Geometries).len() as u64);
        let commands = BufferRange::new(
            0,
            u64::from(params.bucket_count)
                * u64::from(params.max_draws)
                * u64::from(DrawCommand::STRIDE),
        );
        let counts = BufferRange::new(0, u64::from(params.bucket_count) * 4);

        self.access(BufferRole::Objects, objects, StageMask::COMPUTE, false);
        self.access(BufferRole::Geometries, geometries, StageMask::COMPUTE, false);
        self.access(BufferRole::DrawCommands(set), commands, StageMask::COMPUTE, true);
        self.access(BufferRole::DrawCounts(set), counts, StageMask::COMPUTE, true);

        self.run_cull(set, params);
        let counts_after = self.read(BufferRole::DrawCounts(set));
        self.ops.push(RecordedOp::Cull {
            set,
            groups,
            counts_after,
        });
        Ok(())
    }

    fn dispatch_skin(&mut self, params: &SkinParams, groups: u32) -> Result<()> {
        self.outside_pass(StageMask::COMPUTE);
        let source = BufferRange::new(
            u64::from(params.src_offset) * u64::from(Vertex::STRIDE),
            u64::from(params.vertex_count) * u64::from(Vertex::STRIDE),
        );
        let influences = BufferRange::new(
            u64::from(params.src_offset) * std::mem::size_of::<SkinInfluence>() as u64,
            u64::from(params.vertex_count) * std::mem::size_of::<SkinInfluence>() as u64,
        );
        let joints = BufferRange::new(0, self.buffer(BufferRole::Joints).len() as u64);

        self.access(BufferRole::BindPose, source, StageMask::COMPUTE, false);
        self.access(BufferRole::Influences, influences, StageMask::COMPUTE, false);
        self.access(BufferRole::Joints, joints, StageMask::COMPUTE, false);
        self.access(BufferRole::Vertices, skinned_range(params), StageMask::COMPUTE, true);

        self.run_skin(params);
        self.ops.push(RecordedOp::Skin {
            params: *params,
            groups,
        });
        Ok(())
    }

    fn begin_pass(&mut self, pass: PassKind) -> Result<()> {
        if let Some(open) = self.pass {
            return Err(GpuError::InvalidState(format!(
                "{pass:?} pass begun inside {open:?} pass"
            )));
        }
        self.pass = Some(pass);
        self.ops.push(RecordedOp::BeginPass(pass));
        Ok(())
    }

    fn draw_indirect_count(&mut self, draw: &IndirectDraw) {
        let Some(pass) = self.pass else {
            self.hazards.push(Hazard {
                kind: HazardKind::DrawOutsidePass,
                role: Some(BufferRole::DrawCommands(draw.set)),
                range: draw.commands,
                stage: StageMask::INDIRECT,
            });
            return;
        };

        let commands_role = BufferRole::DrawCommands(draw.set);
        let counts_role = BufferRole::DrawCounts(draw.set);
        self.access(counts_role, draw.count, StageMask::INDIRECT, false);

        let count_bytes = self.bytes_mut(counts_role, draw.count.end());
        let start = draw.count.offset as usize;
        let count = u32::from_ne_bytes([
            count_bytes[start],
            count_bytes[start + 1],
            count_bytes[start + 2],
            count_bytes[start + 3],
        ]);
        let issued = count.min(draw.max_draws);
        let consumed = BufferRange::new(
            draw.commands.offset,
            u64::from(issued) * u64::from(DrawCommand::STRIDE),
        );
        self.access(commands_role, consumed, StageMask::INDIRECT, false);

        let command_bytes = self.bytes_mut(commands_role, consumed.end());
        let commands: Vec<DrawCommand> = command_bytes
            [consumed.offset as usize..consumed.end() as usize]
            .chunks_exact(DrawCommand::STRIDE as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect();

        if issued > 0 {
            let vertices = BufferRange::new(0, self.buffer(BufferRole::Vertices).len() as u64);
            let indices = BufferRange::new(0, self.buffer(BufferRole::Indices).len() as u64);
            let objects = BufferRange::new(0, self.buffer(BufferRole::Objects).len() as u64);
            self.access(BufferRole::Vertices, vertices, StageMask::VERTEX_INPUT, false);
            self.access(BufferRole::Indices, indices, StageMask::VERTEX_INPUT, false);
            self.access(BufferRole::Objects, objects, StageMask::VERTEX_SHADER, false);
        }

        self.ops.push(RecordedOp::Draw {
            set: draw.set,
            bucket: draw.bucket,
        });
        self.draws.push(ExecutedDraw {
            pass,
            set: draw.set,
            bucket: draw.bucket,
            count,
            commands,
        });
    }

    fn end_pass(&mut self) {
        self.pass = None;
        self.ops.push(RecordedOp::EndPass);
    }
}
