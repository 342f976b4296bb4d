//! Stochastic multi-level quantization.
//!
//! Each value is normalized by the partition norm, snapped stochastically to
//! one of `s` levels (unbiased in expectation), and sent as a signed byte.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sluice_types::{CodecKind, DitherNorm, DitherPartition};

use crate::codec::Compressor;
use crate::error::{CompressError, Result};
use crate::payload::Payload;

/// Payload `seed` high bit marks the natural partition so decode needs no config.
const NATURAL_FLAG: u64 = 1 << 63;

pub struct Dithering {
    levels: u8,
    partition: DitherPartition,
    normalize: DitherNorm,
    seed: u64,
    counter: u64,
}

impl Dithering {
    pub fn new(levels: u8, partition: DitherPartition, normalize: DitherNorm, seed: u64) -> Self {
        Self {
            levels: levels.clamp(1, 127),
            partition,
            normalize,
            seed: seed & !NATURAL_FLAG,
            counter: 0,
        }
    }

    fn norm(&self, input: &[f32]) -> f32 {
        match self.normalize {
            DitherNorm::Max => input.iter().fold(0.0f32, |m, v| m.max(v.abs())),
            DitherNorm::L2 => input.iter().map(|v| v * v).sum::<f32>().sqrt(),
        }
    }
}

impl Compressor for Dithering {
    fn kind(&self) -> CodecKind {
        CodecKind::Dithering
    }

    fn compress(&mut self, input: &[f32]) -> Result<Payload> {
        let mut payload = Payload::lossy(CodecKind::Dithering, input.len());
        let seed = self.seed.wrapping_add(self.counter) & !NATURAL_FLAG;
        self.counter += 1;

        let norm = self.norm(input);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let s = self.levels;

        let body: Vec<u8> = input
            .iter()
            .map(|&v| {
                let a = if norm > 0.0 { (v.abs() / norm).min(1.0) } else { 0.0 };
                let level = match self.partition {
                    DitherPartition::Linear => linear_level(a, s, &mut rng),
                    DitherPartition::Natural => natural_level(a, s, &mut rng),
                };
                let signed = if v < 0.0 { -level } else { level };
                signed as u8
            })
            .collect();

        payload.scale = norm;
        payload.seed = match self.partition {
            DitherPartition::Linear => seed,
            DitherPartition::Natural => seed | NATURAL_FLAG,
        };
        // First body byte carries `s`.
        payload.body = Vec::with_capacity(body.len() + 1);
        payload.body.push(s);
        payload.body.extend_from_slice(&body);
        Ok(payload)
    }

    fn reset(&mut self) {
        self.counter = 0;
    }
}

fn linear_level(a: f32, s: u8, rng: &mut ChaCha8Rng) -> i8 {
    let scaled = a * s as f32;
    let floor = scaled.floor();
    let up = rng.gen::<f32>() < scaled - floor;
    (floor as i32 + up as i32).min(s as i32) as i8
}

/// Levels are `0` and `2^(min_exp + i - 1)` for `i` in `1..=s`, where
/// `min_exp = -(s - 1)`.
fn natural_level(a: f32, s: u8, rng: &mut ChaCha8Rng) -> i8 {
    if a <= 0.0 {
        return 0;
    }
    let s = s as i32;
    let min_exp = -(s - 1);
    let e = a.log2().floor() as i32;
    if e >= 0 {
        return s as i8;
    }
    let (lo_idx, lo, hi) = if e < min_exp {
        (0, 0.0, 2f32.powi(min_exp))
    } else {
        (e - min_exp + 1, 2f32.powi(e), 2f32.powi(e + 1))
    };
    let p = (a - lo) / (hi - lo);
    let idx = if rng.gen::<f32>() < p { lo_idx + 1 } else { lo_idx };
    idx.min(s) as i8
}

fn level_value(level: i8, s: u8, natural: bool) -> f32 {
    let mag = level.unsigned_abs() as i32;
    let v = if mag == 0 {
        0.0
    } else if natural {
        let min_exp = -(s as i32 - 1);
        2f32.powi(min_exp + mag - 1)
    } else {
        mag as f32 / s as f32
    };
    if level < 0 { -v } else { v }
}

pub(crate) fn decode(payload: &Payload, output: &mut [f32]) -> Result<()> {
    let Some((&s, levels)) = payload.body.split_first() else {
        return Err(CompressError::Malformed("empty dithering body".into()));
    };
    if s == 0 || s > 127 || levels.len() != output.len() {
        return Err(CompressError::Malformed(format!(
            "dithering body: s={s}, {} levels for {} elements",
            levels.len(),
            output.len()
        )));
    }
    let natural = payload.seed & NATURAL_FLAG != 0;
    for (out, &raw) in output.iter_mut().zip(levels) {
        let level = raw as i8;
        if level.unsigned_abs() > s {
            return Err(CompressError::Malformed(format!("level {level} exceeds s={s}")));
        }
        *out = payload.scale * level_value(level, s, natural);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(codec: &mut Dithering, input: &[f32]) -> Vec<f32> {
        let payload = codec.compress(input).unwrap();
        let mut out = vec![0.0; input.len()];
        codec.decompress(&payload, &mut out).unwrap();
        out
    }

    #[test]
    fn exact_levels_are_lossless() {
        // With max-norm 1.0 and s = 4 every input already sits on a level.
        let input = [1.0f32, -0.5, 0.25, 0.0, -0.75];
        let mut codec = Dithering::new(4, DitherPartition::Linear, DitherNorm::Max, 1);
        assert_eq!(round_trip(&mut codec, &input), input);
    }

    #[test]
    fn natural_levels_are_powers_of_two() {
        let input = [1.0f32, -0.5, 0.25, 0.125];
        let mut codec = Dithering::new(4, DitherPartition::Natural, DitherNorm::Max, 1);
        assert_eq!(round_trip(&mut codec, &input), input);
    }

    #[test]
    fn unbiased_on_average() {
        let input = [0.3f32, -0.7, 0.05, 1.0];
        let mut codec = Dithering::new(2, DitherPartition::Linear, DitherNorm::Max, 9);
        let trials = 4000;
        let mut sum = vec![0.0f32; input.len()];
        for _ in 0..trials {
            for (acc, v) in sum.iter_mut().zip(round_trip(&mut codec, &input)) {
                *acc += v;
            }
        }
        for (acc, x) in sum.iter().zip(&input) {
            let mean = acc / trials as f32;
            assert!((mean - x).abs() < 0.05, "mean {mean} vs {x}");
        }
    }

    #[test]
    fn zero_input_decodes_to_zero() {
        let input = [0.0f32; 8];
        let mut codec = Dithering::new(8, DitherPartition::Linear, DitherNorm::L2, 0);
        assert_eq!(round_trip(&mut codec, &input), input);
    }
}
