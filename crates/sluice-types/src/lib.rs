pub mod config;
pub mod error;
pub mod stage;
pub mod tensor;

pub use config::{CodecConfig, CodecKind, DitherNorm, DitherPartition, EngineConfig};
pub use error::ConfigError;
pub use stage::Stage;
pub use tensor::{
    ContributorId, DataType, Partition, PartitionId, TensorRole, TensorSpec,
    MAX_PARTITIONS_PER_TENSOR,
};
