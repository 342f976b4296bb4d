use sluice_compress::CompressError;
use sluice_pipeline::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("message too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("payload error: {0}")]
    Payload(#[from] CompressError),

    #[error("shared memory error: {0}")]
    SharedMemory(String),
}

impl From<NetError> for BackendError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::SharedMemory(msg) => BackendError::SharedMemory(msg),
            other => BackendError::Transport(other.to_string()),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, NetError>;
