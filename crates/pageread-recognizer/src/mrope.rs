//! Multimodal rotary position indexing: `get_rope_index` and the M-RoPE
//! `cos`/`sin` table builder consumed by the language model's attention.

use candle_core::{Device, Tensor};

use pageread_tensor::rotary::inverse_frequencies;

use crate::config::RecognizerTokens;
use crate::error::Result;

/// Splits the rotary half-width into three near-equal contiguous chunks,
/// one per `(t, h, w)` axis; any remainder goes to the earliest axes.
pub fn mrope_sections(half: usize) -> [usize; 3] {
    let base = half / 3;
    let remainder = half - base * 3;
    let mut sections = [base; 3];
    for section in sections.iter_mut().take(remainder) {
        *section += 1;
    }
    sections
}

/// Walks `input_ids`, assigning one `[t,h,w]` position triple per token:
/// plain text advances all three axes together, an image/video
/// placeholder run is replaced by the 3D grid position for its
/// `(t, h/merge, w/merge)` span. Returns the position
/// triples and `rope_deltas = max(position) + 1 - len(input_ids)`, the
/// offset subsequent decode steps must add to `cache_offset + (0..L)`.
pub fn get_rope_index(
    input_ids: &[u32],
    image_grid_thw: &[(usize, usize, usize)],
    video_grid_thw: &[(usize, usize, usize)],
    tokens: &RecognizerTokens,
    merge_size: usize,
) -> (Vec<[i64; 3]>, i64) {
    let n = input_ids.len();
    if image_grid_thw.is_empty() && video_grid_thw.is_empty() {
        let positions: Vec<[i64; 3]> = (0..n).map(|i| [i as i64; 3]).collect();
        return (positions, 0);
    }

    let mut positions = Vec::with_capacity(n);
    let mut image_iter = image_grid_thw.iter();
    let mut video_iter = video_grid_thw.iter();
    let mut cursor = 0usize;
    let mut next_start: i64 = 0;

    while cursor < n {
        let id = input_ids[cursor];
        let is_image = id == tokens.image_token_id;
        let is_video = id == tokens.video_token_id;
        if !is_image && !is_video {
            positions.push([next_start; 3]);
            next_start += 1;
            cursor += 1;
            continue;
        }
        let grid = if is_image { image_iter.next() } else { video_iter.next() };
        let &(t, h, w) = grid.expect("image_grid_thw/video_grid_thw exhausted before placeholder run ended");
        let gh = h / merge_size;
        let gw = w / merge_size;
        let span_start = next_start;
        for ti in 0..t {
            for hi in 0..gh {
                for wi in 0..gw {
                    positions.push([span_start + ti as i64, span_start + hi as i64, span_start + wi as i64]);
                }
            }
        }
        next_start = span_start + t.max(gh).max(gw) as i64;
        cursor += t * gh * gw;
    }

    let max_pos = positions.iter().flat_map(|p| p.iter()).copied().max().unwrap_or(-1);
    let rope_delta = max_pos + 1 - n as i64;
    (positions, rope_delta)
}

/// Builds `[seq, head_dim]` `cos`/`sin` tables from per-token `[t,h,w]`
/// position triples, assembling each token's rotary frequency vector
/// from three axis-specific contiguous chunks of the inverse-frequency
/// table before duplicating it to fill the full head width.
pub fn build_mrope_cos_sin(positions: &[[i64; 3]], head_dim: usize, theta: f32, device: &Device) -> Result<(Tensor, Tensor)> {
    let half = head_dim / 2;
    let inv_freq = inverse_frequencies(head_dim, theta, device)?.to_vec1::<f32>()?;
    let sections = mrope_sections(half);
    let mut emb = Vec::with_capacity(positions.len() * head_dim);
    for pos in positions {
        let mut freqs = Vec::with_capacity(half);
        let mut offset = 0usize;
        for (axis, &len) in sections.iter().enumerate() {
            let p = pos[axis] as f32;
            for j in 0..len {
                freqs.push(p * inv_freq[offset + j]);
            }
            offset += len;
        }
        emb.extend_from_slice(&freqs);
        emb.extend_from_slice(&freqs);
    }
    let emb = Tensor::from_vec(emb, (positions.len(), head_dim), device)?;
    Ok((emb.cos()?, emb.sin()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_vision_inputs_gives_identity_positions() {
        let tokens = RecognizerTokens::default();
        let ids = vec![10u32, 11, 12];
        let (positions, delta) = get_rope_index(&ids, &[], &[], &tokens, 2);
        assert_eq!(positions, vec![[0, 0, 0], [1, 1, 1], [2, 2, 2]]);
        assert_eq!(delta, 0);
    }

    #[test]
    fn vision_span_emits_grid_positions_after_text() {
        let tokens = RecognizerTokens { image_token_id: 99, ..RecognizerTokens::default() };
        // 1 text token, then a 1x2x2 grid (merge=1 -> 4 placeholder tokens), then 1 text token.
        let ids = vec![1u32, 99, 99, 99, 99, 2];
        let (positions, _delta) = get_rope_index(&ids, &[(1, 2, 2)], &[], &tokens, 1);
        assert_eq!(positions[0], [0, 0, 0]);
        assert_eq!(positions[1], [1, 1, 1]);
        assert_eq!(positions[2], [1, 1, 2]);
        assert_eq!(positions[3], [1, 2, 1]);
        assert_eq!(positions[4], [1, 2, 2]);
        assert_eq!(positions[5], [3, 3, 3]);
    }

    #[test]
    fn mrope_sections_sum_to_half() {
        let sections = mrope_sections(17);
        assert_eq!(sections.iter().sum::<usize>(), 17);
    }

    #[test]
    fn mrope_cos_sin_has_expected_shape() {
        let device = Device::Cpu;
        let positions = vec![[0i64, 0, 0], [1, 1, 1]];
        let (cos, sin) = build_mrope_cos_sin(&positions, 8, 10000.0, &device).unwrap();
        assert_eq!(cos.dims(), &[2, 8]);
        assert_eq!(sin.dims(), &[2, 8]);
    }
}
