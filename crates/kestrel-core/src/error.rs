//! Error types for the engine core.

use thiserror::Error;

/// Engine-wide error type.
///
/// These are caller-error reports: the operation that produced them had no effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Index outside the valid range of a sequence.
    #[error("Index {index} out of range for length {length}")]
    IndexOutOfRange { index: usize, length: usize },

    /// Invalid argument passed to a core API.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
