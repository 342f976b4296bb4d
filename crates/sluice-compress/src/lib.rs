//! Pluggable gradient codecs.
//!
//! A [`Compressor`] turns `f32` values into a self-describing [`Payload`] and
//! back. Codecs are composed with the [`ErrorFeedback`] and [`Momentum`]
//! decorators by [`codec::build`], and wrapped per tensor by
//! [`TensorCompressor`], which exposes the byte-level encode/decode used by
//! the pipeline.

pub mod codec;
pub mod dithering;
pub mod elements;
pub mod error;
pub mod feedback;
pub mod momentum;
pub mod onebit;
pub mod payload;
pub mod randomk;
pub mod tensor;
pub mod topk;

pub use codec::Compressor;
pub use dithering::Dithering;
pub use error::{CompressError, Result};
pub use feedback::ErrorFeedback;
pub use momentum::Momentum;
pub use onebit::OneBit;
pub use payload::Payload;
pub use randomk::RandomK;
pub use tensor::TensorCompressor;
pub use topk::TopK;
