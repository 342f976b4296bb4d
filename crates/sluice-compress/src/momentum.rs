//! Nesterov momentum applied to the aggregated values on the way out.
//!
//! Encoding passes straight through to the wrapped codec. After decoding,
//! `v = mu * v + g` and the caller receives `g + mu * v`.

use sluice_types::CodecKind;

use crate::codec::Compressor;
use crate::error::{CompressError, Result};
use crate::payload::Payload;

pub struct Momentum {
    inner: Box<dyn Compressor>,
    mu: f32,
    velocity: Vec<f32>,
}

impl Momentum {
    pub fn new(inner: Box<dyn Compressor>, mu: f32) -> Self {
        Self {
            inner,
            mu,
            velocity: Vec::new(),
        }
    }

    pub fn velocity(&self) -> &[f32] {
        &self.velocity
    }
}

impl Compressor for Momentum {
    fn kind(&self) -> CodecKind {
        self.inner.kind()
    }

    fn compress(&mut self, input: &[f32]) -> Result<Payload> {
        self.inner.compress(input)
    }

    fn decompress(&mut self, payload: &Payload, output: &mut [f32]) -> Result<()> {
        self.inner.decompress(payload, output)?;

        if self.velocity.is_empty() {
            self.velocity = vec![0.0; output.len()];
        } else if self.velocity.len() != output.len() {
            return Err(CompressError::ShapeMismatch {
                expected: self.velocity.len(),
                actual: output.len(),
            });
        }

        let mu = self.mu;
        for (v, g) in self.velocity.iter_mut().zip(output.iter_mut()) {
            *v = mu * *v + *g;
            *g += mu * *v;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.velocity.clear();
        self.inner.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topk::TopK;
    use sluice_types::CodecConfig;

    fn lossless() -> Box<dyn Compressor> {
        // k above the element count keeps every value.
        Box::new(TopK::new(CodecConfig::new(CodecKind::TopK).with_k(64.0)))
    }

    #[test]
    fn nesterov_update() {
        let mut m = Momentum::new(lossless(), 0.5);
        let g = [2.0f32, -4.0];
        let mut out = [0.0f32; 2];

        let p = m.compress(&g).unwrap();
        m.decompress(&p, &mut out).unwrap();
        // v = g, out = g + 0.5 g
        assert_eq!(m.velocity(), &[2.0, -4.0]);
        assert_eq!(out, [3.0, -6.0]);

        let p = m.compress(&g).unwrap();
        m.decompress(&p, &mut out).unwrap();
        // v = 0.5 * g + g = 1.5 g, out = g + 0.75 g
        assert_eq!(m.velocity(), &[3.0, -6.0]);
        assert_eq!(out, [3.5, -7.0]);
    }

    #[test]
    fn reset_forgets_velocity() {
        let mut m = Momentum::new(lossless(), 0.9);
        let mut out = [0.0f32; 3];
        let p = m.compress(&[1.0, 1.0, 1.0]).unwrap();
        m.decompress(&p, &mut out).unwrap();
        m.reset();
        assert!(m.velocity().is_empty());

        let mut short = [0.0f32; 2];
        let p = m.compress(&[1.0, 1.0]).unwrap();
        assert!(m.decompress(&p, &mut short).is_ok());
    }
}
