//! Error feedback.
//!
//! Before encoding, the residual left by the previous call is added to the
//! new input; after encoding, `corrected - reconstructed` becomes the new
//! residual. The sum of everything transmitted therefore trails the sum of
//! everything submitted by exactly the current residual, which keeps the
//! cumulative compression error bounded instead of compounding.

use sluice_types::CodecKind;

use crate::codec::Compressor;
use crate::error::{CompressError, Result};
use crate::payload::Payload;

pub struct ErrorFeedback {
    inner: Box<dyn Compressor>,
    residual: Vec<f32>,
}

impl ErrorFeedback {
    pub fn new(inner: Box<dyn Compressor>) -> Self {
        Self {
            inner,
            residual: Vec::new(),
        }
    }

    pub fn residual(&self) -> &[f32] {
        &self.residual
    }
}

impl Compressor for ErrorFeedback {
    fn kind(&self) -> CodecKind {
        self.inner.kind()
    }

    fn compress(&mut self, input: &[f32]) -> Result<Payload> {
        if self.residual.is_empty() {
            self.residual = vec![0.0; input.len()];
        } else if self.residual.len() != input.len() {
            return Err(CompressError::ShapeMismatch {
                expected: self.residual.len(),
                actual: input.len(),
            });
        }

        let corrected: Vec<f32> = input
            .iter()
            .zip(&self.residual)
            .map(|(g, e)| g + e)
            .collect();

        let payload = self.inner.compress(&corrected)?;

        let mut reconstructed = vec![0.0f32; corrected.len()];
        self.inner.decompress(&payload, &mut reconstructed)?;
        for ((e, c), r) in self.residual.iter_mut().zip(&corrected).zip(&reconstructed) {
            *e = c - r;
        }

        Ok(payload)
    }

    fn decompress(&mut self, payload: &Payload, output: &mut [f32]) -> Result<()> {
        self.inner.decompress(payload, output)
    }

    fn reset(&mut self) {
        self.residual.clear();
        self.inner.reset();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::randomk::RandomK;
    use crate::topk::TopK;
    use sluice_types::CodecConfig;

    const STEPS: usize = 1000;

    fn gradient(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i * 37 % 17) as f32 - 8.0) / 8.0).collect()
    }

    /// Largest `|N·g − Σ reconstructed|` over every prefix of `STEPS` rounds.
    fn worst_cumulative_error(codec: &mut dyn Compressor, input: &[f32]) -> (f32, f32) {
        let mut sent = vec![0.0f64; input.len()];
        let mut out = vec![0.0f32; input.len()];
        let mut worst = 0.0f32;
        let mut last = 0.0f32;
        for step in 1..=STEPS {
            let payload = codec.compress(input).unwrap();
            codec.decompress(&payload, &mut out).unwrap();
            for (acc, v) in sent.iter_mut().zip(&out) {
                *acc += *v as f64;
            }
            last = input
                .iter()
                .zip(&sent)
                .map(|(g, s)| (step as f64 * *g as f64 - s).abs() as f32)
                .fold(0.0, f32::max);
            worst = worst.max(last);
        }
        (worst, last)
    }

    #[test]
    fn topk_error_stays_bounded() {
        let input = gradient(64);
        let max_g = input.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let cfg = CodecConfig::new(CodecKind::TopK).with_k(8.0);

        let mut with_ef = ErrorFeedback::new(Box::new(TopK::new(cfg.clone())));
        let (worst, _) = worst_cumulative_error(&mut with_ef, &input);
        // Any coordinate is sent at least once every n/k rounds.
        assert!(worst <= 64.0 * max_g, "worst cumulative error {worst}");

        let mut without_ef = TopK::new(cfg);
        let (_, last) = worst_cumulative_error(&mut without_ef, &input);
        assert!(last > 10.0 * worst, "plain top-k drifted only {last}");
    }

    #[test]
    fn randomk_error_stays_bounded() {
        let input = gradient(64);
        let max_g = input.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let cfg = CodecConfig::new(CodecKind::RandomK).with_k(16.0);

        let mut with_ef = ErrorFeedback::new(Box::new(RandomK::new(cfg, 11)));
        let (worst, last) = worst_cumulative_error(&mut with_ef, &input);
        assert!(worst <= 96.0 * max_g, "worst cumulative error {worst}");
        // The error at the end is no larger than anywhere along the way.
        assert!(last <= worst);
    }

    #[test]
    fn residual_shape_is_enforced() {
        let cfg = CodecConfig::new(CodecKind::TopK).with_k(1.0);
        let mut ef = ErrorFeedback::new(Box::new(TopK::new(cfg)));
        ef.compress(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(ef.residual(), &[1.0, 2.0, 0.0]);

        let err = ef.compress(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, CompressError::ShapeMismatch { expected: 3, actual: 2 }));

        ef.reset();
        assert!(ef.compress(&[1.0, 2.0]).is_ok());
    }
}
