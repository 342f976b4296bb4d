//! `sluice-pipeline`: scheduling core of the engine.
//!
//! Every declared tensor is split into partitions by the
//! [`PartitionRegistry`]. Each partition walks a fixed stage sequence:
//!
//! ```text
//! gradient:  INIT → LOCAL_REDUCE_WAIT → COMPRESS → TRANSMIT → SERVER_AGGREGATE
//!                 → DECOMPRESS → BROADCAST_WAIT → DONE
//! parameter: INIT → TRANSMIT → DECOMPRESS → DONE
//! ```
//!
//! The [`ReadyTable`] gates each transition, the [`TaskQueue`] orders the
//! resulting work by tensor priority, and a fixed [`WorkerPool`] executes it
//! against the external [`backend`] traits. [`Engine`] ties it together.

pub mod backend;
pub mod driver;
pub mod engine;
pub mod error;
pub mod pool;
pub mod queue;
pub mod ready_table;
pub mod registry;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use backend::{
    Ack, Backends, BufferView, CpuReducer, DeviceBuffer, ReductionBackend, SharedMemory,
    Transport,
};
pub use driver::{
    Completion, CompletionHook, EngineStats, PartitionFailure, PipelineDriver, TensorOutcome,
    TensorStatus,
};
pub use engine::Engine;
pub use error::{BackendError, EngineError, Result};
pub use pool::WorkerPool;
pub use queue::{Task, TaskQueue};
pub use ready_table::ReadyTable;
pub use registry::PartitionRegistry;
