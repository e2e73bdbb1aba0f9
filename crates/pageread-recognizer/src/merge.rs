//! Multimodal embedding merge: splice vision-tower patch features into
//! the text embedding rows that carry the image (or video) placeholder
//! token, in order.

use candle_core::Tensor;

use crate::config::RecognizerTokens;
use crate::error::{Error, Result};

/// Replaces every `input_ids[i] == image_token_id` (falling back to
/// `video_token_id` when no image placeholders are present) row of
/// `text_embeds` with the next unconsumed row of `vision_features`, in
/// order. Errors if the placeholder count and feature count disagree,
/// since a silent mismatch would misalign every later token.
pub fn merge_multimodal_embeddings(
    input_ids: &[u32],
    text_embeds: &Tensor,
    vision_features: &Tensor,
    tokens: &RecognizerTokens,
) -> Result<Tensor> {
    let image_positions: Vec<usize> = input_ids
        .iter()
        .enumerate()
        .filter(|(_, &id)| id == tokens.image_token_id)
        .map(|(i, _)| i)
        .collect();
    let positions = if image_positions.is_empty() {
        input_ids
            .iter()
            .enumerate()
            .filter(|(_, &id)| id == tokens.video_token_id)
            .map(|(i, _)| i)
            .collect()
    } else {
        image_positions
    };

    let feature_count = vision_features.dim(0)?;
    if positions.len() != feature_count {
        return Err(Error::ShapeMismatch(format!(
            "{} image/video placeholder tokens but {feature_count} vision features",
            positions.len()
        )));
    }
    if positions.is_empty() {
        return Ok(text_embeds.clone());
    }

    let mut rows = Vec::with_capacity(text_embeds.dim(0)?);
    let mut feature_idx = 0usize;
    let mut is_placeholder = vec![false; input_ids.len()];
    for &p in &positions {
        is_placeholder[p] = true;
    }
    for i in 0..input_ids.len() {
        if is_placeholder[i] {
            rows.push(vision_features.narrow(0, feature_idx, 1)?);
            feature_idx += 1;
        } else {
            rows.push(text_embeds.narrow(0, i, 1)?);
        }
    }
    Ok(Tensor::cat(&rows, 0)?)
}
