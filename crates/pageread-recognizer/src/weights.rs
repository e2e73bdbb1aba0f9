//! Weight name sanitization: rewrites the shipped checkpoint's key names
//! to the ones `VisionTower`/`LanguageModel`'s `VarBuilder` trees expect,
//! and reshapes the two conv-style weights that
//! [`crate::vision::VisionTower`] represents as dense `Linear` layers.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{Error, Result};

/// Rewrites one safetensors key, or `None` if the key should be dropped.
fn rewrite_key(key: &str, num_hidden_layers: usize) -> Result<Option<String>> {
    if key.contains("position_ids") {
        return Ok(None);
    }
    if let Some(rest) = key.strip_prefix("model.language_model.") {
        return Ok(Some(format!("language_model.model.{rest}")));
    }
    if key == "lm_head.weight" {
        return Ok(Some("language_model.lm_head.weight".to_string()));
    }
    let stripped = key.strip_prefix("model.").unwrap_or(key);
    if stripped.contains("visual") && !stripped.contains("vision_tower") {
        let renamed = stripped.replacen("visual", "vision_tower", 1);
        if let Some(layer) = layer_index(&renamed, "blocks.") {
            if layer >= num_hidden_layers {
                return Ok(None);
            }
        }
        return Ok(Some(renamed));
    }
    if let Some(layer) = layer_index(stripped, "layers.") {
        if layer >= num_hidden_layers {
            return Ok(None);
        }
    }
    Ok(Some(stripped.to_string()))
}

fn layer_index(key: &str, marker: &str) -> Option<usize> {
    let pos = key.find(marker)?;
    let rest = &key[pos + marker.len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Flattens a 5D patch-embed conv weight `[out, in, kt, kh, kw]` into the
/// `[out, in*kt*kh*kw]` dense matrix [`crate::vision::VisionTower`]
/// expects. `patchify`'s row layout is channel-major (`c, t, py, px`),
/// the same order the conv weight's trailing dims are already in, so no
/// permutation is needed — only a reshape.
fn flatten_patch_embed_weight(weight: &Tensor) -> Result<Tensor> {
    let dims = weight.dims();
    if dims.len() != 5 {
        return Err(Error::ShapeMismatch(format!("expected a 5D patch-embed conv weight, got shape {dims:?}")));
    }
    let out = dims[0];
    let flat = dims[1] * dims[2] * dims[3] * dims[4];
    Ok(weight.reshape((out, flat))?)
}

/// Flattens a 4D downsample conv weight `[out, in, kh, kw]` into the
/// `[out, kh*kw*in]` dense matrix the downsample `Linear` expects. The
/// grouped input `VisionTower::forward` builds concatenates whole
/// per-position hidden vectors (position-major), the opposite of the
/// conv weight's channel-major layout, so the `in`/`(kh,kw)` axes are
/// permuted before flattening.
fn flatten_downsample_weight(weight: &Tensor) -> Result<Tensor> {
    let dims = weight.dims();
    if dims.len() != 4 {
        return Err(Error::ShapeMismatch(format!("expected a 4D downsample conv weight, got shape {dims:?}")));
    }
    let (out, inp, kh, kw) = (dims[0], dims[1], dims[2], dims[3]);
    let permuted = weight.permute((0, 2, 3, 1))?.contiguous()?;
    Ok(permuted.reshape((out, kh * kw * inp))?)
}

/// Applies [`rewrite_key`] to every entry of `raw` and reshapes the
/// patch-embed/downsample conv weights it recognizes by shape.
pub fn sanitize_weights(raw: HashMap<String, Tensor>, num_hidden_layers: usize) -> Result<HashMap<String, Tensor>> {
    let mut out = HashMap::with_capacity(raw.len());
    for (key, tensor) in raw {
        let Some(renamed) = rewrite_key(&key, num_hidden_layers)? else { continue };
        let tensor = if renamed.ends_with("patch_embed.proj.weight") && tensor.dims().len() == 5 {
            flatten_patch_embed_weight(&tensor)?
        } else if renamed.ends_with("downsample.weight") && tensor.dims().len() == 4 {
            flatten_downsample_weight(&tensor)?
        } else {
            tensor
        };
        out.insert(renamed, tensor);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn strips_model_prefix_and_renames_visual() {
        let renamed = rewrite_key("model.visual.patch_embed.proj.weight", 16).unwrap().unwrap();
        assert_eq!(renamed, "vision_tower.patch_embed.proj.weight");
    }

    #[test]
    fn rewrites_language_model_prefix() {
        let renamed = rewrite_key("model.language_model.embed_tokens.weight", 16).unwrap().unwrap();
        assert_eq!(renamed, "language_model.model.embed_tokens.weight");
    }

    #[test]
    fn rewrites_bare_lm_head() {
        let renamed = rewrite_key("lm_head.weight", 16).unwrap().unwrap();
        assert_eq!(renamed, "language_model.lm_head.weight");
    }

    #[test]
    fn drops_layers_beyond_configured_depth() {
        assert!(rewrite_key("model.layers.16.input_layernorm.weight", 16).unwrap().is_none());
        assert!(rewrite_key("model.layers.15.input_layernorm.weight", 16).unwrap().is_some());
    }

    #[test]
    fn drops_position_ids() {
        assert!(rewrite_key("model.visual.position_ids", 16).unwrap().is_none());
    }

    #[test]
    fn flattens_patch_embed_weight_by_reshape() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((8, 3, 2, 4, 4), DType::F32, &device).unwrap();
        let flat = flatten_patch_embed_weight(&weight).unwrap();
        assert_eq!(flat.dims(), &[8, 3 * 2 * 4 * 4]);
    }

    #[test]
    fn flattens_downsample_weight_with_permute() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((16, 4, 2, 2), DType::F32, &device).unwrap();
        let flat = flatten_downsample_weight(&weight).unwrap();
        assert_eq!(flat.dims(), &[16, 2 * 2 * 4]);
    }
}
