//! Boundaries to the external collaborators: local reduction, the
//! worker-to-server transport and intra-node shared memory.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytemuck::Pod;
use half::f16;
use sluice_types::{ContributorId, DataType, Partition, PartitionId};

use crate::error::BackendError;

// ── Reduction ─────────────────────────────────────────────────────────────────

/// One device's bytes for one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBuffer {
    pub contributor: ContributorId,
    pub bytes: Vec<u8>,
}

pub trait ReductionBackend: Send + Sync {
    /// Combine the per-device buffers of `partition` into one buffer of the
    /// partition's length.
    fn reduce_local(
        &self,
        tensor_key: &str,
        partition: &Partition,
        dtype: DataType,
        inputs: &[DeviceBuffer],
    ) -> Result<Vec<u8>, BackendError>;
}

/// Element-wise sum on the host. Integers wrap; half precision is summed
/// through `half::f16`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuReducer;

impl ReductionBackend for CpuReducer {
    fn reduce_local(
        &self,
        tensor_key: &str,
        partition: &Partition,
        dtype: DataType,
        inputs: &[DeviceBuffer],
    ) -> Result<Vec<u8>, BackendError> {
        let buffers: Vec<&[u8]> = inputs.iter().map(|d| d.bytes.as_slice()).collect();
        sum_buffers(dtype, &buffers).map_err(|e| {
            BackendError::Reduction(format!("{tensor_key} partition {}: {e}", partition.id))
        })
    }
}

/// Sum equally sized native-endian buffers of `dtype`.
pub fn sum_buffers(dtype: DataType, buffers: &[&[u8]]) -> Result<Vec<u8>, String> {
    let Some((first, rest)) = buffers.split_first() else {
        return Err("no inputs".into());
    };
    if let Some(bad) = rest.iter().find(|b| b.len() != first.len()) {
        return Err(format!("length {} differs from {}", bad.len(), first.len()));
    }
    if first.len() % dtype.element_bytes() != 0 {
        return Err(format!("{} bytes is not a whole number of {dtype}", first.len()));
    }

    let mut acc = first.to_vec();
    for input in rest {
        match dtype {
            DataType::Float32 => add_into::<f32>(&mut acc, input, |a, b| a + b),
            DataType::Float64 => add_into::<f64>(&mut acc, input, |a, b| a + b),
            DataType::Float16 => add_into::<f16>(&mut acc, input, |a, b| a + b),
            DataType::Int32 => add_into::<i32>(&mut acc, input, i32::wrapping_add),
            DataType::Int64 => add_into::<i64>(&mut acc, input, i64::wrapping_add),
            DataType::UInt8 => add_into::<u8>(&mut acc, input, u8::wrapping_add),
        }
    }
    Ok(acc)
}

fn add_into<T: Pod>(acc: &mut [u8], input: &[u8], add: impl Fn(T, T) -> T) {
    let mut sum: Vec<T> = bytemuck::pod_collect_to_vec::<u8, T>(acc);
    let other: Vec<T> = bytemuck::pod_collect_to_vec::<u8, T>(input);
    for (a, b) in sum.iter_mut().zip(other) {
        *a = add(*a, b);
    }
    acc.copy_from_slice(bytemuck::cast_slice(&sum));
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Acknowledgement of a delivered push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: PartitionId,
    pub destination: usize,
}

/// Worker-to-server exchange. Responses are matched by `PartitionId`;
/// `receive` blocks the calling worker until the aggregate is available.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        partition: PartitionId,
        payload: Vec<u8>,
        destination: usize,
    ) -> Result<Ack, BackendError>;

    fn receive(&self, partition: PartitionId) -> Result<Vec<u8>, BackendError>;

    /// Release any caller blocked in `receive`. Called on engine shutdown.
    fn close(&self) {}
}

// ── Shared memory ─────────────────────────────────────────────────────────────

/// Read-only view of a published buffer.
#[derive(Clone)]
pub struct BufferView(Arc<dyn AsRef<[u8]> + Send + Sync>);

impl BufferView {
    pub fn new<T>(inner: T) -> Self
    where
        T: AsRef<[u8]> + Send + Sync + 'static,
    {
        Self(Arc::new(inner))
    }
}

impl Deref for BufferView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        (*self.0).as_ref()
    }
}

impl fmt::Debug for BufferView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferView").field("len", &self.len()).finish()
    }
}

/// Intra-node hand-off of finished partitions to sibling processes.
pub trait SharedMemory: Send + Sync {
    fn publish(&self, partition: PartitionId, data: &[u8]) -> Result<(), BackendError>;

    fn acquire(&self, partition: PartitionId) -> Option<BufferView>;
}

// ── Bundle ────────────────────────────────────────────────────────────────────

/// Collaborators handed to `Engine::init`.
#[derive(Clone)]
pub struct Backends {
    pub reducer: Arc<dyn ReductionBackend>,
    pub transport: Arc<dyn Transport>,
    pub shm: Option<Arc<dyn SharedMemory>>,
}

impl Backends {
    /// `transport` with the host reducer and no shared memory.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            reducer: Arc::new(CpuReducer),
            transport,
            shm: None,
        }
    }

    pub fn with_reducer(mut self, reducer: Arc<dyn ReductionBackend>) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn with_shared_memory(mut self, shm: Arc<dyn SharedMemory>) -> Self {
        self.shm = Some(shm);
        self
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
