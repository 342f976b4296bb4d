//! Self-describing encoded form of one partition.
//!
//! Serialized with bincode (standard config). A payload carries everything a
//! peer needs to reconstruct the values, including the seed of the stochastic
//! codecs, so servers can decode and re-encode without any codec state.

use serde::{Deserialize, Serialize};
use sluice_types::{CodecKind, DataType};

use crate::error::{CompressError, Result};
use crate::{dithering, elements, onebit, randomk, topk};

/// Reject any single payload claiming more elements than this.
const MAX_ELEMENTS: u32 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub codec: CodecKind,
    /// Native dtype of the decoded partition.
    pub dtype: DataType,
    pub num_elements: u32,
    /// Generator seed used at encode time (random-k, dithering).
    pub seed: u64,
    /// Codec scale (one-bit magnitude, dithering norm).
    pub scale: f32,
    pub body: Vec<u8>,
}

impl Payload {
    /// Uncompressed payload carrying `bytes` verbatim.
    pub fn raw(dtype: DataType, bytes: Vec<u8>) -> Self {
        Self {
            codec: CodecKind::None,
            dtype,
            num_elements: (bytes.len() / dtype.element_bytes()) as u32,
            seed: 0,
            scale: 1.0,
            body: bytes,
        }
    }

    /// Lossy payload skeleton; codecs fill in `seed`, `scale` and `body`.
    pub(crate) fn lossy(codec: CodecKind, num_elements: usize) -> Self {
        Self {
            codec,
            dtype: DataType::Float32,
            num_elements: num_elements as u32,
            seed: 0,
            scale: 1.0,
            body: Vec::new(),
        }
    }

    pub fn num_elements(&self) -> usize {
        self.num_elements as usize
    }

    /// Byte length of the decoded partition.
    pub fn decoded_len(&self) -> usize {
        self.num_elements() * self.dtype.element_bytes()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CompressError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (payload, _): (Payload, usize) =
            bincode::serde::decode_from_slice(data, bincode::config::standard())
                .map_err(|e| CompressError::Serialization(e.to_string()))?;
        if payload.num_elements > MAX_ELEMENTS {
            return Err(CompressError::Malformed(format!(
                "payload claims {} elements (max {MAX_ELEMENTS})",
                payload.num_elements
            )));
        }
        Ok(payload)
    }

    /// Reconstruct the values into `output`, which must hold exactly
    /// `num_elements` values.
    pub fn decode_into(&self, output: &mut [f32]) -> Result<()> {
        if output.len() != self.num_elements() {
            return Err(CompressError::ShapeMismatch {
                expected: self.num_elements(),
                actual: output.len(),
            });
        }
        match self.codec {
            CodecKind::None => {
                let values = elements::to_f32(self.dtype, &self.body)?;
                if values.len() != output.len() {
                    return Err(CompressError::Malformed(format!(
                        "raw body holds {} elements, header says {}",
                        values.len(),
                        output.len()
                    )));
                }
                output.copy_from_slice(&values);
                Ok(())
            }
            CodecKind::OneBit => onebit::decode(self, output),
            CodecKind::RandomK => randomk::decode(self, output),
            CodecKind::TopK => topk::decode(self, output),
            CodecKind::Dithering => dithering::decode(self, output),
        }
    }

    /// Reconstruct the partition in its native byte layout.
    pub fn decode_bytes(&self) -> Result<Vec<u8>> {
        if self.codec == CodecKind::None {
            if self.body.len() != self.decoded_len() {
                return Err(CompressError::LengthMismatch {
                    expected: self.decoded_len(),
                    actual: self.body.len(),
                });
            }
            return Ok(self.body.clone());
        }
        let mut values = vec![0.0f32; self.num_elements()];
        self.decode_into(&mut values)?;
        elements::from_f32(self.dtype, &values)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_payload_keeps_integer_bytes() {
        let bytes: Vec<u8> = (0u8..16).collect();
        let payload = Payload::raw(DataType::Int32, bytes.clone());
        assert_eq!(payload.num_elements(), 4);

        let wire = payload.to_bytes().unwrap();
        let decoded = Payload::from_bytes(&wire).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.decode_bytes().unwrap(), bytes);
    }

    #[test]
    fn decode_into_checks_length() {
        let payload = Payload::raw(DataType::Float32, vec![0u8; 16]);
        let mut short = vec![0.0f32; 3];
        assert!(matches!(
            payload.decode_into(&mut short),
            Err(CompressError::ShapeMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Payload::from_bytes(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
