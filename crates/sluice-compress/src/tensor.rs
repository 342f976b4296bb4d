//! Byte-level compressor handle for one registered tensor.
//!
//! Holds one compressor stack per partition behind a single per-tensor mutex.
//! Partitions that cannot take a lossy codec (integer dtypes, tiny
//! partitions, the `none` codec) travel as raw payloads. Parameter tensors
//! only ever decode what the server holds, so their stacks carry no error
//! feedback or momentum.

use parking_lot::Mutex;
use sluice_types::{CodecConfig, CodecKind, DataType, Partition, PartitionId, TensorRole};
use tracing::debug;

use crate::codec::{self, Compressor};
use crate::elements;
use crate::error::{CompressError, Result};
use crate::payload::Payload;

struct Slot {
    length: usize,
    /// `None` means pass-through.
    stack: Option<Box<dyn Compressor>>,
}

pub struct TensorCompressor {
    key: String,
    dtype: DataType,
    codec: CodecKind,
    slots: Mutex<Vec<Slot>>,
}

impl TensorCompressor {
    /// Build the per-partition stacks. `partitions` must be the tensor's full
    /// partition list in index order.
    pub fn new(
        key: impl Into<String>,
        dtype: DataType,
        role: TensorRole,
        partitions: &[Partition],
        config: &CodecConfig,
        min_compress_bytes: usize,
    ) -> Self {
        let key = key.into();
        let config = match role {
            TensorRole::Gradient => config.clone(),
            TensorRole::Parameter => CodecConfig {
                error_feedback: false,
                momentum: None,
                ..config.clone()
            },
        };
        let config = &config;
        let lossy = config.kind.is_lossy() && dtype.is_float();

        let slots: Vec<Slot> = partitions
            .iter()
            .map(|p| Slot {
                length: p.length,
                stack: if lossy && p.length >= min_compress_bytes {
                    codec::build(config, p.id)
                } else {
                    None
                },
            })
            .collect();

        let compressed = slots.iter().filter(|s| s.stack.is_some()).count();
        debug!(
            tensor = %key,
            ?role,
            codec = config.kind.name(),
            partitions = slots.len(),
            compressed,
            "compressor stacks built"
        );

        Self {
            key,
            dtype,
            codec: if compressed > 0 { config.kind } else { CodecKind::None },
            slots: Mutex::new(slots),
        }
    }

    /// Codec in effect for at least one partition (`None` if all pass through).
    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    /// Encode one partition's native bytes into wire bytes.
    pub fn encode(&self, partition: PartitionId, input: &[u8]) -> Result<Vec<u8>> {
        let mut slots = self.slots.lock();
        let slot = slot_mut(&mut slots, partition)?;
        if input.len() != slot.length {
            return Err(CompressError::LengthMismatch {
                expected: slot.length,
                actual: input.len(),
            });
        }

        let payload = match slot.stack.as_mut() {
            None => Payload::raw(self.dtype, input.to_vec()),
            Some(stack) => {
                let values = elements::to_f32(self.dtype, input)?;
                let mut payload = stack.compress(&values)?;
                payload.dtype = self.dtype;
                payload
            }
        };
        payload.to_bytes()
    }

    /// Decode wire bytes into the partition's native layout. The result is
    /// always exactly the partition length.
    pub fn decode(&self, partition: PartitionId, encoded: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload::from_bytes(encoded)?;

        let mut slots = self.slots.lock();
        let slot = slot_mut(&mut slots, partition)?;
        let elements = slot.length / self.dtype.element_bytes();
        if payload.num_elements() != elements {
            return Err(CompressError::ShapeMismatch {
                expected: elements,
                actual: payload.num_elements(),
            });
        }

        let bytes = match slot.stack.as_mut() {
            None => payload.decode_bytes()?,
            Some(stack) => {
                let mut values = vec![0.0f32; elements];
                stack.decompress(&payload, &mut values)?;
                elements::from_f32(self.dtype, &values)?
            }
        };

        if bytes.len() != slot.length {
            return Err(CompressError::LengthMismatch {
                expected: slot.length,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Drop every partition's residual, momentum and counters.
    pub fn reset(&self) {
        debug!(tensor = %self.key, "compressor state reset");
        for slot in self.slots.lock().iter_mut() {
            if let Some(stack) = slot.stack.as_mut() {
                stack.reset();
            }
        }
    }
}

fn slot_mut(slots: &mut [Slot], partition: PartitionId) -> Result<&mut Slot> {
    let count = slots.len();
    let index = partition.partition_index() as usize;
    slots
        .get_mut(index)
        .ok_or(CompressError::PartitionOutOfRange { index, count })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
