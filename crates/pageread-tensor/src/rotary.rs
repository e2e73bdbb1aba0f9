//! Rotary position embedding primitives shared by the recognizer's
//! vision tower (per-patch 2D rotary) and language model (M-RoPE).

use candle_core::{DType, Device, Tensor};

use crate::Result;

/// `theta^(-2i/dim)` for `i in 0..dim/2`, the standard RoPE inverse
/// frequency table.
pub fn inverse_frequencies(dim: usize, theta: f32, device: &Device) -> Result<Tensor> {
    let half = dim / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| 1.0 / theta.powf((2 * i) as f32 / dim as f32))
        .collect();
    Ok(Tensor::from_vec(freqs, half, device)?)
}

/// Splits the last dimension in half and returns `(-x2, x1)` concatenated,
/// the standard "rotate half" used by every RoPE variant in this crate.
pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last_dim = x.dim(candle_core::D::Minus1)?;
    let half = last_dim / 2;
    let x1 = x.narrow(candle_core::D::Minus1, 0, half)?;
    let x2 = x.narrow(candle_core::D::Minus1, half, last_dim - half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], candle_core::D::Minus1)?)
}

/// Applies rotary position embedding given precomputed `cos`/`sin`
/// tensors broadcastable to `x`'s shape: `x * cos + rotate_half(x) * sin`.
pub fn apply_rotary_emb(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let rotated = rotate_half(x)?;
    Ok((x.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?)?)
}

/// Builds `cos`/`sin` tables of shape `[positions.len(), dim]` from a
/// flat inverse-frequency table and a position sequence, duplicating the
/// `dim/2` frequency columns to fill the full rotary width (the
/// "2-way interleave" construction used for both per-patch and M-RoPE
/// position embeddings).
pub fn cos_sin_tables(inv_freq: &Tensor, positions: &[f32], device: &Device) -> Result<(Tensor, Tensor)> {
    let positions = Tensor::from_vec(positions.to_vec(), positions.len(), device)?.to_dtype(DType::F32)?;
    let freqs = positions
        .unsqueeze(1)?
        .broadcast_mul(&inv_freq.unsqueeze(0)?)?;
    let emb = Tensor::cat(&[&freqs, &freqs], candle_core::D::Minus1)?;
    Ok((emb.cos()?, emb.sin()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_half_negates_and_swaps_halves() {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![1f32, 2., 3., 4.], (1, 4), &device).unwrap();
        let rotated = rotate_half(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(rotated, vec![-3., -4., 1., 2.]);
    }

    #[test]
    fn apply_rotary_emb_identity_when_cos_one_sin_zero() {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![1f32, 2., 3., 4.], (1, 4), &device).unwrap();
        let cos = Tensor::ones((1, 4), DType::F32, &device).unwrap();
        let sin = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let out = apply_rotary_emb(&x, &cos, &sin).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(out, vec![1., 2., 3., 4.]);
    }

    #[test]
    fn cos_sin_tables_has_expected_shape() {
        let device = Device::Cpu;
        let inv_freq = inverse_frequencies(8, 10000.0, &device).unwrap();
        let (cos, sin) = cos_sin_tables(&inv_freq, &[0.0, 1.0, 2.0], &device).unwrap();
        assert_eq!(cos.dims(), &[3, 8]);
        assert_eq!(sin.dims(), &[3, 8]);
    }
}
