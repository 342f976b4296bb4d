//! Conversions between a tensor's native byte layout and the `f32` working
//! representation the lossy codecs operate on.

use half::f16;
use sluice_types::DataType;

use crate::error::{CompressError, Result};

/// Decode native-endian `bytes` of `dtype` into `f32` values.
pub fn to_f32(dtype: DataType, bytes: &[u8]) -> Result<Vec<f32>> {
    let width = dtype.element_bytes();
    if bytes.len() % width != 0 {
        return Err(CompressError::Malformed(format!(
            "{} bytes is not a whole number of {dtype} elements",
            bytes.len()
        )));
    }
    match dtype {
        DataType::Float32 => Ok(bytemuck::pod_collect_to_vec::<u8, f32>(bytes)),
        DataType::Float16 => Ok(bytemuck::pod_collect_to_vec::<u8, f16>(bytes)
            .into_iter()
            .map(f16::to_f32)
            .collect()),
        DataType::Float64 => Ok(bytemuck::pod_collect_to_vec::<u8, f64>(bytes)
            .into_iter()
            .map(|v| v as f32)
            .collect()),
        other => Err(CompressError::UnsupportedDtype(other)),
    }
}

/// Encode `values` as native-endian bytes of `dtype`.
pub fn from_f32(dtype: DataType, values: &[f32]) -> Result<Vec<u8>> {
    match dtype {
        DataType::Float32 => Ok(bytemuck::cast_slice(values).to_vec()),
        DataType::Float16 => {
            let halves: Vec<f16> = values.iter().copied().map(f16::from_f32).collect();
            Ok(bytemuck::cast_slice(&halves).to_vec())
        }
        DataType::Float64 => {
            let wide: Vec<f64> = values.iter().map(|&v| v as f64).collect();
            Ok(bytemuck::cast_slice(&wide).to_vec())
        }
        other => Err(CompressError::UnsupportedDtype(other)),
    }
}
