//! Normalization layers used by both inference subsystems.

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use crate::Result;

/// Root-mean-square layer norm: `x / rms(x) * weight`, computed in f32
/// regardless of the input dtype for numerical stability. Used
/// throughout the recognizer's vision tower and language model.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(size, "weight")?;
        Ok(Self { weight, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let in_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let normalized = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let weight = self.weight.to_dtype(DType::F32)?;
        Ok(normalized.broadcast_mul(&weight)?.to_dtype(in_dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn rms_norm_preserves_shape() {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = RmsNorm::new(8, 1e-6, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 4, 8), &device).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dims(), x.dims());
    }

    #[test]
    fn rms_norm_of_zero_is_zero() {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = RmsNorm::new(4, 1e-6, vb).unwrap();
        let x = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let y = norm.forward(&x).unwrap();
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() < 1e-6));
    }
}
