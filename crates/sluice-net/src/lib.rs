//! `sluice-net`: concrete transport and shared-memory backends.
//!
//! - [`wire`]: length-prefixed bincode framing of worker ↔ server messages.
//! - [`loopback`]: an in-process aggregation server and the worker-side
//!   [`Transport`](sluice_pipeline::Transport) bound to it.
//! - [`shm`]: memory-mapped regions for the intra-node broadcast hand-off.

pub mod error;
pub mod loopback;
pub mod shm;
pub mod wire;

pub use error::{NetError, Result};
pub use loopback::{LoopbackServer, LoopbackTransport};
pub use shm::MmapSharedMemory;
pub use wire::{PartitionRequest, PartitionResponse, MAX_FRAME_BYTES};
