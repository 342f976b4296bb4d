// Tensor and partition vocabulary shared by every sluice crate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::CodecConfig;

// ── Element type ─────────────────────────────────────────────────────────────

/// Element type of a tensor's backing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Float32 = 0,
    Float16 = 1,
    Float64 = 2,
    Int32   = 3,
    Int64   = 4,
    UInt8   = 5,
}

impl DataType {
    /// Bytes per element for this dtype.
    pub fn element_bytes(&self) -> usize {
        match self {
            Self::UInt8 => 1,
            Self::Float16 => 2,
            Self::Float32 | Self::Int32 => 4,
            Self::Float64 | Self::Int64 => 8,
        }
    }

    /// Whether lossy codecs may be applied to buffers of this type.
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float16 | Self::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::Float64 => "float64",
            Self::Int32   => "int32",
            Self::Int64   => "int64",
            Self::UInt8   => "uint8",
        };
        f.write_str(name)
    }
}

// ── Tensor declaration ───────────────────────────────────────────────────────

/// Direction a tensor travels through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorRole {
    /// Pushed by every local device, aggregated, pulled back (push-pull path).
    Gradient,
    /// Pulled from the servers only.
    Parameter,
}

/// Everything the binding layer supplies when declaring a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub key: String,
    pub num_bytes: usize,
    pub dtype: DataType,
    pub role: TensorRole,
    /// Explicit scheduling priority. Defaults to the declaration index.
    pub priority: Option<i64>,
    /// Codec override for this tensor only.
    pub codec: Option<CodecConfig>,
}

impl TensorSpec {
    pub fn gradient(key: impl Into<String>, num_bytes: usize, dtype: DataType) -> Self {
        Self {
            key: key.into(),
            num_bytes,
            dtype,
            role: TensorRole::Gradient,
            priority: None,
            codec: None,
        }
    }

    pub fn parameter(key: impl Into<String>, num_bytes: usize, dtype: DataType) -> Self {
        Self {
            role: TensorRole::Parameter,
            ..Self::gradient(key, num_bytes, dtype)
        }
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }
}

// ── Partitions ───────────────────────────────────────────────────────────────

/// Maximum number of partitions a single tensor may be split into.
pub const MAX_PARTITIONS_PER_TENSOR: usize = 1 << 16;

/// Stable identifier of one partition: `declared_index << 16 | partition_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(u64);

impl PartitionId {
    pub fn new(tensor_index: u32, partition_index: u32) -> Self {
        debug_assert!((partition_index as usize) < MAX_PARTITIONS_PER_TENSOR);
        Self(((tensor_index as u64) << 16) | partition_index as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Declaration index of the owning tensor.
    pub fn tensor_index(&self) -> u32 {
        (self.0 >> 16) as u32
    }

    /// Position of this partition within its tensor.
    pub fn partition_index(&self) -> u32 {
        (self.0 & 0xFFFF) as u32
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tensor_index(), self.partition_index())
    }
}

/// A contiguous byte range of one tensor; the unit of scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub tensor_key: String,
    pub offset: usize,
    pub length: usize,
}

impl Partition {
    /// Exclusive end offset.
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.end()
    }
}

// ── Contributors ─────────────────────────────────────────────────────────────

/// A device or process announcing readiness for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContributorId(pub u32);

impl ContributorId {
    /// The pipeline driver itself, announcing completion of its own work.
    pub const DRIVER: ContributorId = ContributorId(u32::MAX);
}

impl fmt::Display for ContributorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::DRIVER {
            f.write_str("driver")
        } else {
            write!(f, "device-{}", self.0)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
