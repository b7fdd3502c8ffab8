//! The seam between frame planning and command recording.
//!
//! Passes describe their work as calls on a [`FrameRecorder`]: uploads,
//! fills, barriers over exact byte ranges, dispatches and indirect draws.
//! The Vulkan recorder turns them into commands on the frame slot's command
//! buffer; the reference recorder executes them on the CPU and checks that
//! every cross-stage dependency is covered by a barrier.

use crate::gpu_types::{CullParams, SkinParams};
use kestrel_gpu::error::Result;

/// Which of the two draw bucket sets a buffer or dispatch belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketSet {
    /// One bucket per material pipeline.
    Main,
    /// A single bucket drawn into the shadow map.
    Shadow,
}

/// Logical device buffers the passes read and write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Objects,
    Geometries,
    Vertices,
    Indices,
    BindPose,
    Influences,
    Joints,
    DrawCommands(BucketSet),
    DrawCounts(BucketSet),
}

/// Half-open byte range `[offset, offset + size)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferRange {
    pub offset: u64,
    pub size: u64,
}

impl BufferRange {
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    pub const fn contains(&self, other: &Self) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }
}

/// Producer/consumer pair of a buffer barrier.
///
/// Each kind maps onto one of the `BufferBarrier` presets in kestrel-gpu.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierKind {
    /// Earlier reads finish before a copy or fill overwrites the range.
    ReadsToTransfer,
    /// Earlier reads finish before a compute shader overwrites the range.
    ReadsToCompute,
    TransferToCompute,
    /// Uploaded storage data read by compute, vertex or fragment shaders.
    TransferToShaderRead,
    /// Uploaded vertices or indices read by the input assembler.
    TransferToVertexInput,
    /// Draw commands and counts written by culling, read by indirect draws.
    ComputeToIndirect,
    /// Skinned vertices read by vertex fetch.
    ComputeToVertex,
}

/// A barrier over one byte range of a logical buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeBarrier {
    pub role: BufferRole,
    pub range: BufferRange,
    pub kind: BarrierKind,
}

impl RangeBarrier {
    pub const fn new(role: BufferRole, range: BufferRange, kind: BarrierKind) -> Self {
        Self { role, range, kind }
    }
}

/// Render pass the following draws belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    Shadow,
    Main,
}

/// Arguments of one `draw-indexed-indirect-count` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectDraw {
    pub set: BucketSet,
    pub bucket: u32,
    pub commands: BufferRange,
    pub count: BufferRange,
    pub max_draws: u32,
}

/// Sink for one frame's GPU work.
pub trait FrameRecorder {
    /// Copy `data` into `role` at `offset` through the frame's staging memory.
    fn upload(&mut self, role: BufferRole, offset: u64, data: &[u8]) -> Result<()>;

    /// Fill `range` of `role` with the 32-bit `value`.
    fn fill(&mut self, role: BufferRole, range: BufferRange, value: u32);

    /// Record `barriers` as one dependency.
    fn barriers(&mut self, barriers: &[RangeBarrier]);

    /// Run the culling shader over the object table into `set`'s buffers.
    fn dispatch_cull(&mut self, set: BucketSet, params: &CullParams, groups: u32) -> Result<()>;

    /// Run the skinning shader for one mesh.
    fn dispatch_skin(&mut self, params: &SkinParams, groups: u32) -> Result<()>;

    fn begin_pass(&mut self, pass: PassKind) -> Result<()>;

    /// Draw the commands of one bucket, clamped to its count.
    fn draw_indirect_count(&mut self, draw: &IndirectDraw);

    fn end_pass(&mut self);
}
