//! Random-k sparsification.
//!
//! Coordinates are drawn without replacement from a ChaCha8 stream seeded
//! with `base_seed + call_counter`. Only the sampled values travel; the
//! receiver regenerates the indices from the seed carried in the payload.

use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sluice_types::{CodecConfig, CodecKind};

use crate::codec::Compressor;
use crate::error::{CompressError, Result};
use crate::payload::Payload;

pub struct RandomK {
    config: CodecConfig,
    seed: u64,
    counter: u64,
}

impl RandomK {
    pub fn new(config: CodecConfig, seed: u64) -> Self {
        Self {
            config,
            seed,
            counter: 0,
        }
    }
}

fn sample(seed: u64, n: usize, k: usize) -> Vec<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    index::sample(&mut rng, n, k).into_vec()
}

impl Compressor for RandomK {
    fn kind(&self) -> CodecKind {
        CodecKind::RandomK
    }

    fn compress(&mut self, input: &[f32]) -> Result<Payload> {
        let mut payload = Payload::lossy(CodecKind::RandomK, input.len());
        if input.is_empty() {
            return Ok(payload);
        }

        let seed = self.seed.wrapping_add(self.counter);
        self.counter += 1;

        let k = self.config.k_for(input.len());
        let values: Vec<f32> = sample(seed, input.len(), k)
            .into_iter()
            .map(|i| input[i])
            .collect();

        payload.seed = seed;
        payload.body = bytemuck::cast_slice(&values).to_vec();
        Ok(payload)
    }

    fn reset(&mut self) {
        self.counter = 0;
    }
}

pub(crate) fn decode(payload: &Payload, output: &mut [f32]) -> Result<()> {
    output.fill(0.0);
    if output.is_empty() {
        return Ok(());
    }
    if payload.body.len() % 4 != 0 || payload.body.len() / 4 > output.len() {
        return Err(CompressError::Malformed(format!(
            "random-k body of {} bytes does not fit {} elements",
            payload.body.len(),
            output.len()
        )));
    }
    let values: Vec<f32> = bytemuck::pod_collect_to_vec::<u8, f32>(&payload.body);
    let indices = sample(payload.seed, output.len(), values.len());
    for (i, v) in indices.into_iter().zip(values) {
        output[i] = v;
    }
    Ok(())
}
