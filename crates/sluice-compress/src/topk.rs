//! Top-k sparsification: the k largest-magnitude coordinates, sent as
//! `(u32 index, f32 value)` pairs (all indices first, then all values).

use sluice_types::{CodecConfig, CodecKind};

use crate::codec::Compressor;
use crate::error::{CompressError, Result};
use crate::payload::Payload;

pub struct TopK {
    config: CodecConfig,
}

impl TopK {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }
}

impl Compressor for TopK {
    fn kind(&self) -> CodecKind {
        CodecKind::TopK
    }

    fn compress(&mut self, input: &[f32]) -> Result<Payload> {
        let mut payload = Payload::lossy(CodecKind::TopK, input.len());
        if input.is_empty() {
            return Ok(payload);
        }

        let k = self.config.k_for(input.len());
        let mut order: Vec<u32> = (0..input.len() as u32).collect();
        if k < order.len() {
            order.select_nth_unstable_by(k - 1, |a, b| {
                input[*b as usize]
                    .abs()
                    .total_cmp(&input[*a as usize].abs())
            });
            order.truncate(k);
        }
        order.sort_unstable();

        let values: Vec<f32> = order.iter().map(|&i| input[i as usize]).collect();
        let mut body = Vec::with_capacity(k * 8);
        body.extend_from_slice(bytemuck::cast_slice(&order));
        body.extend_from_slice(bytemuck::cast_slice(&values));
        payload.body = body;
        Ok(payload)
    }
}

pub(crate) fn decode(payload: &Payload, output: &mut [f32]) -> Result<()> {
    output.fill(0.0);
    if payload.body.len() % 8 != 0 {
        return Err(CompressError::Malformed(format!(
            "top-k body of {} bytes is not a whole number of pairs",
            payload.body.len()
        )));
    }
    let k = payload.body.len() / 8;
    let (idx_bytes, val_bytes) = payload.body.split_at(k * 4);
    let indices: Vec<u32> = bytemuck::pod_collect_to_vec(idx_bytes);
    let values: Vec<f32> = bytemuck::pod_collect_to_vec(val_bytes);

    for (i, v) in indices.into_iter().zip(values) {
        let slot = output.get_mut(i as usize).ok_or_else(|| {
            CompressError::Malformed(format!("top-k index {i} out of range"))
        })?;
        *slot = v;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_largest_magnitudes() {
        let input = [0.1f32, -5.0, 0.2, 3.0, -0.3, 4.0];
        let mut codec = TopK::new(CodecConfig::new(CodecKind::TopK).with_k(3.0));
        let payload = codec.compress(&input).unwrap();
        assert_eq!(payload.body.len(), 24);

        let mut out = vec![0.0; 6];
        codec.decompress(&payload, &mut out).unwrap();
        assert_eq!(out, vec![0.0, -5.0, 0.0, 3.0, 0.0, 4.0]);
    }

    #[test]
    fn k_larger_than_input_is_lossless() {
        let input = [1.0f32, -2.0];
        let mut codec = TopK::new(CodecConfig::new(CodecKind::TopK).with_k(10.0));
        let payload = codec.compress(&input).unwrap();
        let mut out = vec![0.0; 2];
        codec.decompress(&payload, &mut out).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn rejects_out_of_range_index() {
        let mut payload = Payload::lossy(CodecKind::TopK, 2);
        payload.body.extend_from_slice(&9u32.to_ne_bytes());
        payload.body.extend_from_slice(&1.0f32.to_ne_bytes());
        let mut out = vec![0.0; 2];
        assert!(decode(&payload, &mut out).is_err());
    }
}
