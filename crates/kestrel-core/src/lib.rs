//! Core containers, allocation accounting, and math for the Kestrel engine.
//!
//! This crate provides the foundational pieces used throughout the engine:
//! - [`GrowableArray`], the header-prefixed growable sequence behind most dynamic collections
//! - Allocation-tag accounting ([`MemoryTag`], [`MemoryTracker`])
//! - Culling math (frustum planes, bounding spheres)
//! - Common error types

pub mod error;
pub mod growable_array;
pub mod math;
pub mod memory;

pub use error::{Error, Result};
pub use growable_array::GrowableArray;
pub use math::{BoundingSphere, Frustum};
pub use memory::{MemoryTag, MemoryTracker, TagUsage};

/// Engine-wide constants
pub mod constants {
    /// Default number of frames the GPU may work on while the CPU records the next one.
    pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 3;
    /// Compute work-group size of the draw command generation pass.
    pub const CULL_WORKGROUP_SIZE: u32 = 32;
    /// Compute work-group size of the skinning pass.
    pub const SKIN_WORKGROUP_SIZE: u32 = 64;
}
