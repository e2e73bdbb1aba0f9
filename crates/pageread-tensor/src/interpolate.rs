//! Resize/sampling primitives: high-quality resize for page
//! preprocessing, and the single-point bilinear sampling used by
//! deformable attention.

use candle_core::{IndexOp, Tensor};

use crate::Result;

/// Bilinear-resizes a `[1,C,H,W]` tensor to `(out_h, out_w)`. `candle`
/// only ships nearest-neighbor upsampling, so this walks the tensor on
/// CPU with the same per-point sampler used by deformable attention.
/// Used for the layout detector's 800x800 input preprocessing and the
/// recognizer's smart-resize step.
pub fn resize_bilinear(x: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (batch, channels, in_h, in_w) = x.dims4()?;
    let device = x.device().clone();
    let dtype = x.dtype();
    let hwc = x
        .to_dtype(candle_core::DType::F32)?
        .permute((0, 2, 3, 1))?
        .reshape((batch, in_h * in_w * channels))?;
    let mut out = vec![0f32; batch * out_h * out_w * channels];
    for b in 0..batch {
        let plane = hwc.i(b)?.to_vec1::<f32>()?;
        for y in 0..out_h {
            let sy = (y as f32 + 0.5) * in_h as f32 / out_h as f32 - 0.5;
            for x_ in 0..out_w {
                let sx = (x_ as f32 + 0.5) * in_w as f32 / out_w as f32 - 0.5;
                let sample = bilinear_sample_point(&plane, in_h, in_w, channels, sx, sy);
                let base = ((b * out_h + y) * out_w + x_) * channels;
                out[base..base + channels].copy_from_slice(&sample);
            }
        }
    }
    let resized = Tensor::from_vec(out, (batch, out_h, out_w, channels), &device)?
        .permute((0, 3, 1, 2))?
        .to_dtype(dtype)?;
    Ok(resized)
}

/// Samples `value` (shape `[H, W, C]`) at a single continuous
/// coordinate `(x, y)` in pixel space via bilinear interpolation,
/// returning zeros when the point falls fully outside the grid. This is
/// the per-point primitive multi-scale deformable attention calls once
/// per (query, head, level, point).
pub fn bilinear_sample_point(value: &[f32], h: usize, w: usize, c: usize, x: f32, y: f32) -> Vec<f32> {
    if x <= -1.0 || x >= w as f32 || y <= -1.0 || y >= h as f32 {
        return vec![0.0; c];
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let x1 = x0 + 1.0;
    let y1 = y0 + 1.0;
    let wx1 = x - x0;
    let wx0 = 1.0 - wx1;
    let wy1 = y - y0;
    let wy0 = 1.0 - wy1;

    let fetch = |xi: f32, yi: f32, channel: usize| -> f32 {
        if xi < 0.0 || xi >= w as f32 || yi < 0.0 || yi >= h as f32 {
            0.0
        } else {
            value[(yi as usize * w + xi as usize) * c + channel]
        }
    };

    (0..c)
        .map(|channel| {
            wy0 * (wx0 * fetch(x0, y0, channel) + wx1 * fetch(x1, y0, channel))
                + wy1 * (wx0 * fetch(x0, y1, channel) + wx1 * fetch(x1, y1, channel))
        })
        .collect()
}

/// Nearest-neighbor resize of a single-channel mask stored row-major,
/// used when rescaling a query's predicted mask to its detection box
/// size before contour extraction.
pub fn resize_nearest_mask(mask: &[f32], src_h: usize, src_w: usize, dst_h: usize, dst_w: usize) -> Vec<f32> {
    let mut out = vec![0f32; dst_h * dst_w];
    for y in 0..dst_h {
        let sy = ((y as f32 + 0.5) * src_h as f32 / dst_h as f32).floor() as usize;
        let sy = sy.min(src_h.saturating_sub(1));
        for x in 0..dst_w {
            let sx = ((x as f32 + 0.5) * src_w as f32 / dst_w as f32).floor() as usize;
            let sx = sx.min(src_w.saturating_sub(1));
            out[y * dst_w + x] = mask[sy * src_w + sx];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilinear_sample_point_out_of_bounds_is_zero() {
        let value = vec![1.0; 4 * 4];
        let sample = bilinear_sample_point(&value, 4, 4, 1, -5.0, -5.0);
        assert_eq!(sample, vec![0.0]);
    }

    #[test]
    fn bilinear_sample_point_at_grid_corner_matches_value() {
        let mut value = vec![0.0; 4 * 4];
        value[0] = 7.0;
        let sample = bilinear_sample_point(&value, 4, 4, 1, 0.0, 0.0);
        assert_eq!(sample, vec![7.0]);
    }

    #[test]
    fn resize_nearest_mask_preserves_uniform_values() {
        let mask = vec![1.0; 4 * 4];
        let resized = resize_nearest_mask(&mask, 4, 4, 8, 8);
        assert!(resized.iter().all(|v| *v == 1.0));
        assert_eq!(resized.len(), 64);
    }

    #[test]
    fn resize_bilinear_preserves_uniform_tensor_and_shape() {
        let device = candle_core::Device::Cpu;
        let x = Tensor::ones((1, 3, 4, 4), candle_core::DType::F32, &device).unwrap();
        let resized = resize_bilinear(&x, 8, 8).unwrap();
        assert_eq!(resized.dims(), &[1, 3, 8, 8]);
        let values = resized.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 1.0).abs() < 1e-5));
    }
}
