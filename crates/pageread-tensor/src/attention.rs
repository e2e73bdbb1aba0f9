//! Scaled dot-product attention and grouped-query attention helpers.

use candle_core::Tensor;
use candle_nn::ops::softmax;

use crate::Result;

/// `softmax(q @ k^T * scale + mask) @ v`. `q`/`k`/`v` are
/// `[..., seq, head_dim]`; `mask`, when present, is additive and
/// broadcastable against the `[..., seq_q, seq_k]` score tensor.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    scale: f64,
) -> Result<Tensor> {
    let scores = (q.matmul(&k.transpose(candle_core::D::Minus1, candle_core::D::Minus2)?)? * scale)?;
    let scores = match mask {
        Some(mask) => scores.broadcast_add(mask)?,
        None => scores,
    };
    let probs = softmax(&scores, candle_core::D::Minus1)?;
    Ok(probs.matmul(v)?)
}

/// Repeats each of `n_kv_heads` key/value heads `n_rep` times along the
/// head axis so grouped-query attention can run as ordinary
/// multi-head attention, mirroring the standard `repeat_kv` used across
/// Llama-family decoders. `x` is `[batch, n_kv_heads, seq, head_dim]`.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (b, n_kv_heads, seq, head_dim) = x.dims4()?;
    let x = x
        .unsqueeze(2)?
        .expand((b, n_kv_heads, n_rep, seq, head_dim))?
        .reshape((b, n_kv_heads * n_rep, seq, head_dim))?;
    Ok(x)
}

/// Builds an additive causal mask of shape `[seq_q, seq_k]` allowing
/// position `i` (query) to attend to `j <= i + offset` (key), the
/// general form covering both zero-offset prefill and cached-decode
/// masks.
pub fn causal_mask(seq_q: usize, seq_k: usize, offset: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mut data = vec![0f32; seq_q * seq_k];
    for i in 0..seq_q {
        for j in 0..seq_k {
            if j > i + offset {
                data[i * seq_k + j] = f32::NEG_INFINITY;
            }
        }
    }
    Ok(Tensor::from_vec(data, (seq_q, seq_k), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn repeat_kv_is_identity_for_n_rep_one() {
        let device = Device::Cpu;
        let x = Tensor::zeros((1, 2, 3, 4), DType::F32, &device).unwrap();
        let y = repeat_kv(&x, 1).unwrap();
        assert_eq!(y.dims(), x.dims());
    }

    #[test]
    fn repeat_kv_expands_head_axis() {
        let device = Device::Cpu;
        let x = Tensor::zeros((1, 2, 3, 4), DType::F32, &device).unwrap();
        let y = repeat_kv(&x, 3).unwrap();
        assert_eq!(y.dims(), &[1, 6, 3, 4]);
    }

    #[test]
    fn causal_mask_allows_only_past_and_present() {
        let device = Device::Cpu;
        let mask = causal_mask(2, 2, 0, &device).unwrap();
        let data = mask.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(data[0], 0.0);
        assert_eq!(data[1], f32::NEG_INFINITY);
        assert_eq!(data[2], 0.0);
        assert_eq!(data[3], 0.0);
    }

    #[test]
    fn causal_mask_with_offset_allows_full_past() {
        let device = Device::Cpu;
        let mask = causal_mask(1, 3, 2, &device).unwrap();
        let data = mask.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(data.iter().all(|v| *v == 0.0));
    }
}
