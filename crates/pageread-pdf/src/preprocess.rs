//! Source decode -> target-size resize -> channel-first normalized
//! tensor. The layout detector and
//! recognizer each call this with their own target size and
//! normalization constants; the resize/patchify-specific logic each
//! stage layers on top lives in `pageread-layout`/`pageread-recognizer`.

use candle_core::Device;
use pageread_core::Page;
use pageread_tensor::{normalize_channels, rgb_bytes_to_chw_tensor};

use crate::error::Result;

/// Standard ImageNet-style per-channel mean/std, used as the default
/// normalization for both inference subsystems unless a model config
/// overrides it.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Resizes `page` to exactly `(target_w, target_h)` with bilinear
/// interpolation and returns a normalized `[1,3,target_h,target_w]`
/// tensor.
pub fn preprocess_to_fixed_size(
    page: &Page,
    target_w: usize,
    target_h: usize,
    mean: &[f32],
    std: &[f32],
    device: &Device,
) -> Result<candle_core::Tensor> {
    let chw = rgb_bytes_to_chw_tensor(page.rgb(), page.width() as usize, page.height() as usize, device)?;
    let resized = pageread_tensor::interpolate::resize_bilinear(&chw, target_h, target_w)?;
    Ok(normalize_channels(&resized, mean, std)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_produces_exact_target_shape() {
        let device = Device::Cpu;
        let page = Page::new(16, 16, vec![200u8; 16 * 16 * 3]);
        let tensor = preprocess_to_fixed_size(&page, 8, 8, &IMAGENET_MEAN, &IMAGENET_STD, &device).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 8, 8]);
    }
}
