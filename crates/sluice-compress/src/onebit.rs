//! Sign quantization: one bit per element plus a single scale.

use sluice_types::CodecKind;

use crate::codec::Compressor;
use crate::error::{CompressError, Result};
use crate::payload::Payload;

pub struct OneBit {
    scaling: bool,
}

impl OneBit {
    pub fn new(scaling: bool) -> Self {
        Self { scaling }
    }
}

impl Compressor for OneBit {
    fn kind(&self) -> CodecKind {
        CodecKind::OneBit
    }

    fn compress(&mut self, input: &[f32]) -> Result<Payload> {
        let mut payload = Payload::lossy(CodecKind::OneBit, input.len());

        payload.scale = if self.scaling && !input.is_empty() {
            input.iter().map(|v| v.abs()).sum::<f32>() / input.len() as f32
        } else {
            1.0
        };

        // Bit set = non-negative.
        let mut bits = vec![0u8; input.len().div_ceil(8)];
        for (i, v) in input.iter().enumerate() {
            if *v >= 0.0 {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        payload.body = bits;
        Ok(payload)
    }
}

pub(crate) fn decode(payload: &Payload, output: &mut [f32]) -> Result<()> {
    let expected = output.len().div_ceil(8);
    if payload.body.len() != expected {
        return Err(CompressError::Malformed(format!(
            "one-bit body is {} bytes, expected {expected}",
            payload.body.len()
        )));
    }
    for (i, out) in output.iter_mut().enumerate() {
        let positive = payload.body[i / 8] & (1 << (i % 8)) != 0;
        *out = if positive { payload.scale } else { -payload.scale };
    }
    Ok(())
}
