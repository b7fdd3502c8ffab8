//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// The presentation surface no longer matches the swapchain.
    #[error("Surface is out of date or suboptimal")]
    SurfaceStale,

    /// A frame fence did not signal within the allowed time.
    #[error("Fence for frame slot {slot} not signaled after {timeout_ns} ns")]
    FenceTimeout { slot: usize, timeout_ns: u64 },

    /// A descriptor set could not be allocated even from a fresh pool.
    #[error("Descriptor pool exhausted after retry ({sets_per_pool} sets per pool): {source}")]
    DescriptorPoolExhausted {
        sets_per_pool: u32,
        source: vk::Result,
    },

    /// Shader loading failed.
    #[error("Shader loading failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid arguments passed to a resource helper.
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Core container error.
    #[error(transparent)]
    Core(#[from] kestrel_core::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// How an error must be handled by the frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Continuing risks corrupting GPU state; log and abort.
    Fatal,
    /// The swap surface must be rebuilt and the frame skipped.
    SurfaceStale,
    /// Bad arguments; the call had no effect.
    CallerError,
}

impl GpuError {
    /// Classify this error.
    pub fn severity(&self) -> Severity {
        match self {
            Self::SurfaceStale
            | Self::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR) => {
                Severity::SurfaceStale
            }
            Self::InvalidUsage(_) | Self::Core(_) => Severity::CallerError,
            _ => Severity::Fatal,
        }
    }

    /// Whether this error must abort the process.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
