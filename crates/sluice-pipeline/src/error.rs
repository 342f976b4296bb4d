use sluice_compress::CompressError;
use sluice_types::{ConfigError, ContributorId, PartitionId, Stage};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    // ── Registration / configuration ──────────────────────────────────────

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown tensor: {0}")]
    UnknownTensor(String),

    #[error("{contributor} already contributed to step {generation} of tensor {tensor}")]
    DuplicateContribution {
        tensor: String,
        contributor: ContributorId,
        generation: u64,
    },

    // ── Per-partition failures ────────────────────────────────────────────

    #[error("transport error on partition {partition} at {stage}: {reason}")]
    Transport {
        partition: PartitionId,
        stage: Stage,
        reason: String,
    },

    #[error("compression error on tensor {tensor}: {source}")]
    Compression {
        tensor: String,
        #[source]
        source: CompressError,
    },

    // ── Tensor outcomes ───────────────────────────────────────────────────

    #[error("tensor {tensor} failed: partition {partition} at {stage}: {reason}")]
    TensorFailed {
        tensor: String,
        partition: PartitionId,
        stage: Stage,
        reason: String,
    },

    #[error("tensor {tensor} aborted")]
    Aborted { tensor: String },

    // ── Engine-wide ───────────────────────────────────────────────────────

    #[error("scheduling invariant violated on partition {partition} at {stage}: {detail}")]
    SchedulingInvariant {
        partition: PartitionId,
        stage: Stage,
        detail: String,
    },

    #[error("engine shut down")]
    ShutDown,
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

/// Failure reported by an external collaborator (reducer, transport, shared
/// memory).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("reduction error: {0}")]
    Reduction(String),

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("timed out waiting for partition {0}")]
    Timeout(PartitionId),

    #[error("backend closed")]
    Closed,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, EngineError>;
