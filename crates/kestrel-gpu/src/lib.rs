//! Vulkan abstraction layer for the Kestrel engine.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - GPU capability detection
//! - Memory allocation via gpu-allocator, with allocation-tag accounting
//! - Buffer/image wrappers and synchronization2 barrier helpers
//! - A growable descriptor-set allocator
//! - Command buffer management and swapchain handling
//! - The frame pipeline: per-slot fences, semaphores, command buffers and
//!   staging memory driven through acquire / record / submit / present

pub mod barrier;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptor_allocator;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod frame_slot;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod staging;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use barrier::{record_barriers, BufferBarrier, ImageBarrier};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder};
pub use deferred::DeferredDeletionQueue;
pub use descriptor_allocator::{
    DescriptorAllocator, DescriptorAllocatorConfig, DescriptorBackend, PoolRatio,
    VulkanDescriptorBackend,
};
pub use descriptors::{DescriptorSetLayoutBuilder, DescriptorWriter};
pub use error::{GpuError, Result, Severity};
pub use frame::{AcquireOutcome, FenceWait, FrameBackend, FramePipeline, PresentOutcome, SlotState};
pub use frame_slot::{FrameSlot, VulkanFrameBackend};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use pipeline::{ComputePipeline, DepthBias, GraphicsPipeline, GraphicsPipelineConfig};
pub use staging::{StagingCursor, StagingRing};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::Swapchain;
pub use sync::{create_fence, create_semaphore};
