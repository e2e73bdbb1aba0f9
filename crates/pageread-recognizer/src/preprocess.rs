//! Chat-prompt templating, smart resize, and patchify.

use candle_core::Device;
use tokenizers::Tokenizer;

use crate::config::{RecognizerModelConfig, CHAT_TEMPLATE, PIXEL_MEAN, PIXEL_STD};
use crate::error::{Error, Result};

/// Everything one call to the language model needs to embed an image
/// and its prompt.
pub struct PreparedInput {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
    pub pixel_values: Vec<f32>,
    pub image_grid_thw: Vec<(usize, usize, usize)>,
    pub image_token_id: u32,
}

fn round_by_factor(x: f64, factor: f64) -> f64 {
    (x / factor).round() * factor
}

fn floor_by_factor(x: f64, factor: f64) -> f64 {
    (x / factor).floor() * factor
}

fn ceil_by_factor(x: f64, factor: f64) -> f64 {
    (x / factor).ceil() * factor
}

/// Enforces the aspect-ratio bound, rounds to a multiple of
/// `patch_size * merge_size`, then rescales by a uniform factor so the
/// total pixel count lies within `[min_pixels, max_pixels]`.
pub fn smart_resize(height: u32, width: u32, config: &RecognizerModelConfig) -> Result<(u32, u32)> {
    let patch = config.vision.patch_size;
    let merge = config.vision.spatial_merge_size;
    let factor = (patch * merge) as f64;
    let ratio = height.max(width) as f64 / height.min(width) as f64;
    if ratio > config.resize.max_aspect_ratio {
        return Err(Error::Config(format!(
            "aspect ratio {ratio:.2} exceeds the smart-resize limit of {}",
            config.resize.max_aspect_ratio
        )));
    }
    let mut h_bar = round_by_factor(height as f64, factor).max(factor);
    let mut w_bar = round_by_factor(width as f64, factor).max(factor);
    let pixels = h_bar * w_bar;
    if pixels > config.resize.max_pixels as f64 {
        let beta = ((height as f64 * width as f64) / config.resize.max_pixels as f64).sqrt();
        h_bar = floor_by_factor(height as f64 / beta, factor).max(factor);
        w_bar = floor_by_factor(width as f64 / beta, factor).max(factor);
    } else if pixels < config.resize.min_pixels as f64 {
        let beta = (config.resize.min_pixels as f64 / (height as f64 * width as f64)).sqrt();
        h_bar = ceil_by_factor(height as f64 * beta, factor);
        w_bar = ceil_by_factor(width as f64 * beta, factor);
    }
    Ok((h_bar as u32, w_bar as u32))
}

/// Splits a normalized `[C,H,W]` pixel plane into the flat
/// `(gridT*gridH*gridW) x (C*temporal_patch*patch^2)` patch matrix. A
/// single image frame is tiled `temporal_patch_size` times, so `gridT ==
/// 1`. Patches are grouped by `spatial_merge_size x spatial_merge_size`
/// block first, matching the contiguous grouping the vision tower's
/// patch merger expects.
pub fn patchify(frame: &[f32], channels: usize, height: usize, width: usize, config: &RecognizerModelConfig) -> Result<(Vec<f32>, usize, usize, usize)> {
    let patch = config.vision.patch_size;
    let temporal = config.vision.temporal_patch_size;
    let merge = config.vision.spatial_merge_size;
    if height % (patch * merge) != 0 || width % (patch * merge) != 0 {
        return Err(Error::ShapeMismatch(format!(
            "smart-resized dimensions {height}x{width} are not a multiple of patch*merge ({})",
            patch * merge
        )));
    }
    if frame.len() != channels * height * width {
        return Err(Error::ShapeMismatch(format!(
            "expected {} pixels for {channels}x{height}x{width}, got {}",
            channels * height * width,
            frame.len()
        )));
    }
    let grid_h = height / patch;
    let grid_w = width / patch;
    let grid_t = 1;
    let feature_len = config.vision.patch_feature_len();
    let merge_blocks_h = grid_h / merge;
    let merge_blocks_w = grid_w / merge;
    let mut out = vec![0f32; grid_t * grid_h * grid_w * feature_len];

    let mut row = 0usize;
    for bh in 0..merge_blocks_h {
        for bw in 0..merge_blocks_w {
            for mh in 0..merge {
                for mw in 0..merge {
                    let gh = bh * merge + mh;
                    let gw = bw * merge + mw;
                    let mut col = 0usize;
                    for c in 0..channels {
                        for _t in 0..temporal {
                            for py in 0..patch {
                                for px in 0..patch {
                                    let y = gh * patch + py;
                                    let x = gw * patch + px;
                                    out[row * feature_len + col] = frame[c * height * width + y * width + x];
                                    col += 1;
                                }
                            }
                        }
                    }
                    row += 1;
                }
            }
        }
    }
    Ok((out, grid_t, grid_h, grid_w))
}

/// `max(1, t*h*w / merge_size^2)`, the number of image-placeholder token
/// copies for one image.
pub fn image_placeholder_count(grid: (usize, usize, usize), merge_size: usize) -> usize {
    let (t, h, w) = grid;
    ((t * h * w) / (merge_size * merge_size)).max(1)
}

/// Renders the chat template with `prompt` substituted in place of
/// `{prompt}`.
pub fn render_prompt(prompt: &str) -> String {
    CHAT_TEMPLATE.replace("{prompt}", prompt)
}

/// Decode + resize + normalize + patchify one RGB image, tokenize the
/// rendered prompt, and expand the image-placeholder token to match the
/// patch grid, producing one ready-to-embed `PreparedInput`.
pub fn prepare_input(
    rgb: &[u8],
    width: u32,
    height: u32,
    prompt: &str,
    tokenizer: &Tokenizer,
    config: &RecognizerModelConfig,
) -> Result<PreparedInput> {
    let device = Device::Cpu;
    let chw = pageread_tensor::rgb_bytes_to_chw_tensor(rgb, width as usize, height as usize, &device)?;
    let (resize_h, resize_w) = smart_resize(height, width, config)?;
    let resized = pageread_tensor::interpolate::resize_bilinear(&chw, resize_h as usize, resize_w as usize)?;
    let normalized = pageread_tensor::normalize_channels(&resized, &PIXEL_MEAN, &PIXEL_STD)?;
    let frame = normalized.squeeze(0)?.flatten_all()?.to_vec1::<f32>()?;

    let (pixel_values, grid_t, grid_h, grid_w) = patchify(&frame, config.vision.in_channels, resize_h as usize, resize_w as usize, config)?;
    let grid = (grid_t, grid_h, grid_w);
    let copies = image_placeholder_count(grid, config.vision.spatial_merge_size);

    let rendered = render_prompt(prompt);
    let encoding = tokenizer.encode(rendered, false).map_err(|e| Error::Tokenizer(e.to_string()))?;
    let base_ids = encoding.get_ids();

    let image_token_id = config.tokens.image_token_id;
    let mut input_ids = Vec::with_capacity(base_ids.len() + copies);
    for &id in base_ids {
        if id == image_token_id {
            input_ids.extend(std::iter::repeat(image_token_id).take(copies));
        } else {
            input_ids.push(id);
        }
    }
    let attention_mask = vec![1u8; input_ids.len()];

    Ok(PreparedInput {
        input_ids,
        attention_mask,
        pixel_values,
        image_grid_thw: vec![grid],
        image_token_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RecognizerModelConfig {
        let mut config = RecognizerModelConfig::default();
        config.resize.min_pixels = 28 * 28;
        config.resize.max_pixels = 28 * 28 * 64;
        config
    }

    #[test]
    fn smart_resize_rounds_to_patch_merge_multiple() {
        let config = test_config();
        let (h, w) = smart_resize(100, 100, &config).unwrap();
        let factor = (config.vision.patch_size * config.vision.spatial_merge_size) as u32;
        assert_eq!(h % factor, 0);
        assert_eq!(w % factor, 0);
    }

    #[test]
    fn smart_resize_rejects_extreme_aspect_ratio() {
        let config = test_config();
        assert!(smart_resize(10, 5000, &config).is_err());
    }

    #[test]
    fn patchify_produces_expected_row_count_and_width() {
        let config = test_config();
        let h = 56usize;
        let w = 56usize;
        let frame = vec![0.5f32; 3 * h * w];
        let (patches, grid_t, grid_h, grid_w) = patchify(&frame, 3, h, w, &config).unwrap();
        assert_eq!(grid_t, 1);
        assert_eq!(grid_h, h / config.vision.patch_size);
        assert_eq!(grid_w, w / config.vision.patch_size);
        assert_eq!(patches.len(), grid_t * grid_h * grid_w * config.vision.patch_feature_len());
    }

    #[test]
    fn image_placeholder_count_floors_at_one() {
        assert_eq!(image_placeholder_count((1, 2, 2), 4), 1);
        assert_eq!(image_placeholder_count((1, 4, 4), 2), 4);
    }

    #[test]
    fn render_prompt_substitutes_placeholder() {
        let rendered = render_prompt("Recognize the text.");
        assert!(rendered.contains("Recognize the text."));
        assert!(rendered.starts_with("[gMASK]<sop>"));
    }
}
