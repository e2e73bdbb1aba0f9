//! Tensor primitives shared by the layout detector and recognizer:
//! convolution helpers, normalization layers, attention building blocks,
//! rotary position embeddings, padding, and interpolation, all built on
//! `candle_core`/`candle_nn`.

pub mod attention;
pub mod error;
pub mod interpolate;
pub mod norm;
pub mod rotary;

pub use error::{Error, Result};

use candle_core::{Device, Tensor};

/// One-time tensor runtime initialization, gated behind a `OnceCell`.
/// `candle` has no global init step analogous to libtorch's, but the
/// device probe is itself fallible and worth caching: repeated
/// CPU/Metal/CUDA probing on every model load would be wasteful.
static DEVICE: once_cell::sync::OnceCell<Device> = once_cell::sync::OnceCell::new();

/// Returns the process-wide inference device, probing for an accelerator
/// once and falling back to CPU.
pub fn runtime_device() -> &'static Device {
    DEVICE.get_or_init(|| {
        #[cfg(feature = "metal")]
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
        #[cfg(feature = "cuda")]
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
        Device::Cpu
    })
}

/// Pads the last dimension of `tensor` on the right with zeros so its
/// length becomes a multiple of `multiple`. Used by the KV cache's
/// fixed-size block growth.
pub fn pad_to_multiple(tensor: &Tensor, dim: usize, multiple: usize) -> Result<Tensor> {
    let len = tensor.dim(dim)?;
    let padded_len = len.div_ceil(multiple) * multiple;
    if padded_len == len {
        return Ok(tensor.clone());
    }
    Ok(tensor.pad_with_zeros(dim, 0, padded_len - len)?)
}

/// Channel-first `[1,3,H,W]` -> normalized `[0,1]` tensor from an RGB
/// byte buffer, the shared entry point for both the layout 800x800
/// preprocessing and the recognizer's smart-resize preprocessing.
pub fn rgb_bytes_to_chw_tensor(
    rgb: &[u8],
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    if rgb.len() != width * height * 3 {
        return Err(Error::ShapeMismatch(format!(
            "expected {} RGB bytes for {width}x{height}, got {}",
            width * height * 3,
            rgb.len()
        )));
    }
    let hwc = Tensor::from_vec(rgb.to_vec(), (height, width, 3), device)?.to_dtype(candle_core::DType::F32)?;
    let chw = (hwc / 255.0)?.permute((2, 0, 1))?;
    Ok(chw.unsqueeze(0)?)
}

/// Per-channel normalize: `(x - mean) / std`, mean/std broadcast over a
/// `[1,C,H,W]` tensor.
pub fn normalize_channels(tensor: &Tensor, mean: &[f32], std: &[f32]) -> Result<Tensor> {
    let device = tensor.device();
    let c = mean.len();
    let mean = Tensor::from_vec(mean.to_vec(), (1, c, 1, 1), device)?;
    let std = Tensor::from_vec(std.to_vec(), (1, c, 1, 1), device)?;
    Ok(tensor.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_to_multiple_is_noop_when_already_aligned() {
        let device = Device::Cpu;
        let tensor = Tensor::zeros((2, 256), candle_core::DType::F32, &device).unwrap();
        let padded = pad_to_multiple(&tensor, 1, 256).unwrap();
        assert_eq!(padded.dim(1).unwrap(), 256);
    }

    #[test]
    fn pad_to_multiple_rounds_up() {
        let device = Device::Cpu;
        let tensor = Tensor::zeros((2, 10), candle_core::DType::F32, &device).unwrap();
        let padded = pad_to_multiple(&tensor, 1, 256).unwrap();
        assert_eq!(padded.dim(1).unwrap(), 256);
    }

    #[test]
    fn rgb_bytes_to_chw_tensor_rejects_wrong_length() {
        let device = Device::Cpu;
        let err = rgb_bytes_to_chw_tensor(&[0u8; 10], 4, 4, &device);
        assert!(err.is_err());
    }

    #[test]
    fn rgb_bytes_to_chw_tensor_has_expected_shape() {
        let device = Device::Cpu;
        let rgb = vec![128u8; 4 * 4 * 3];
        let tensor = rgb_bytes_to_chw_tensor(&rgb, 4, 4, &device).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 4, 4]);
    }
}
