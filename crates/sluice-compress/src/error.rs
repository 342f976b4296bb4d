use sluice_types::DataType;

/// Crate-local error type for codec operations.
///
/// Every variant indicates a desynchronization between the partition layout
/// and the compressor state (or a corrupt payload); none are retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompressError {
    #[error("shape mismatch: expected {expected} elements, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("byte length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("partition {index} out of range ({count} partitions)")]
    PartitionOutOfRange { index: usize, count: usize },

    #[error("unsupported dtype for lossy codec: {0}")]
    UnsupportedDtype(DataType),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, CompressError>;
