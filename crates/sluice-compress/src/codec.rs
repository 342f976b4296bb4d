//! The codec capability set and the factory that composes a codec with its
//! decorators.

use sluice_types::{CodecConfig, CodecKind, PartitionId};

use crate::dithering::Dithering;
use crate::error::Result;
use crate::feedback::ErrorFeedback;
use crate::momentum::Momentum;
use crate::onebit::OneBit;
use crate::payload::Payload;
use crate::randomk::RandomK;
use crate::topk::TopK;

/// A stateful encode/decode codec working on `f32` values.
///
/// One instance serves exactly one partition for the lifetime of its tensor,
/// so implementations may keep per-partition state (counters, residuals,
/// momentum) without synchronization of their own.
pub trait Compressor: Send {
    fn kind(&self) -> CodecKind;

    fn compress(&mut self, input: &[f32]) -> Result<Payload>;

    /// Reconstruct `payload` into `output`. Decoding is stateless for plain
    /// codecs; decorators override it to apply their own corrections.
    fn decompress(&mut self, payload: &Payload, output: &mut [f32]) -> Result<()> {
        payload.decode_into(output)
    }

    /// Drop all carried state (residuals, momentum, counters).
    fn reset(&mut self) {}
}

/// Build the compressor stack for one partition:
/// `Momentum(ErrorFeedback(codec))`, each layer present only when enabled.
///
/// Returns `None` for the pass-through codec; callers move raw bytes instead.
pub fn build(config: &CodecConfig, partition: PartitionId) -> Option<Box<dyn Compressor>> {
    let seed = partition_seed(config.seed, partition);

    let mut stack: Box<dyn Compressor> = match config.kind {
        CodecKind::None => return None,
        CodecKind::OneBit => Box::new(OneBit::new(config.scaling)),
        CodecKind::RandomK => Box::new(RandomK::new(config.clone(), seed)),
        CodecKind::TopK => Box::new(TopK::new(config.clone())),
        CodecKind::Dithering => Box::new(Dithering::new(
            config.levels,
            config.partition,
            config.normalize,
            seed,
        )),
    };

    if config.error_feedback {
        stack = Box::new(ErrorFeedback::new(stack));
    }
    if let Some(mu) = config.momentum {
        stack = Box::new(Momentum::new(stack, mu));
    }
    Some(stack)
}

/// Mix the configured base seed with the partition id so partitions never
/// share a random stream.
fn partition_seed(base: u64, partition: PartitionId) -> u64 {
    base ^ partition.as_u64().wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
