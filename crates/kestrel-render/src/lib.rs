//! Scene graph and GPU-driven rendering for the Kestrel engine.
//!
//! This crate provides:
//! - The scene graph (`Node` / `MeshNode`) and mesh registry
//! - GPU-driven draw command generation with per-pipeline and shadow buckets
//! - Compute skinning
//! - The frame plan, recorded either into Vulkan command buffers or onto a
//!   CPU reference recorder that checks barrier coverage
//! - Cross-frame device resources with deferred release
//! - The [`Renderer`] context driving `initialize / frame_begin / render /
//!   frame_end / shutdown`

pub mod buffers;
pub mod camera;
pub mod config;
pub mod draw_gen;
pub mod gpu_types;
pub mod mesh;
pub mod pipelines;
pub mod plan;
pub mod recorder;
pub mod reference;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod skinning;
pub mod stats;
pub mod vulkan_recorder;

pub use camera::{Camera, DirectionalLight};
pub use config::{MaterialPipeline, RendererConfig};
pub use draw_gen::{cull_objects, DrawBucketLayout, DrawGenerator};
pub use gpu_types::{
    CullParams, DrawCommand, FrameUniforms, GpuGeometry, GpuObject, MaterialPush, ObjectFlags,
    SkinInfluence, SkinParams, Vertex,
};
pub use mesh::{MeshData, MeshId, MeshRecord, MeshRegistry, SkinData};
pub use plan::{FrameInputs, GeometrySizes, PlanSummary, RenderPlan};
pub use recorder::{
    BarrierKind, BucketSet, BufferRange, BufferRole, FrameRecorder, IndirectDraw, PassKind,
    RangeBarrier,
};
pub use reference::{ExecutedDraw, Hazard, HazardKind, RecordedOp, ReferenceRecorder, StageMask};
pub use renderer::Renderer;
pub use resources::{
    shut_down_frame_loop, DeviceAllocator, FrameResources, ImageRole, ResourceAllocator,
    ResourceLayout,
};
pub use scene::{MeshInstance, Node, NodeId, Scene, SceneNode, Transform};
pub use skinning::{skin_vertices, skinned_range, SkinningPass};
pub use stats::FrameStats;
