//! Multi-scale deformable cross-attention.

use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};
use pageread_tensor::interpolate::bilinear_sample_point;

use crate::Result;

pub struct DeformableAttention {
    sampling_offsets: Linear,
    attention_weights: Linear,
    value_proj: Linear,
    output_proj: Linear,
    num_heads: usize,
    num_levels: usize,
    num_points: usize,
    head_dim: usize,
}

impl DeformableAttention {
    pub fn new(vb: VarBuilder, d_model: usize, num_heads: usize, num_levels: usize, num_points: usize) -> Result<Self> {
        let head_dim = d_model / num_heads;
        Ok(Self {
            sampling_offsets: linear(d_model, num_heads * num_levels * num_points * 2, vb.pp("sampling_offsets"))?,
            attention_weights: linear(d_model, num_heads * num_levels * num_points, vb.pp("attention_weights"))?,
            value_proj: linear(d_model, d_model, vb.pp("value_proj"))?,
            output_proj: linear(d_model, d_model, vb.pp("output_proj"))?,
            num_heads,
            num_levels,
            num_points,
            head_dim,
        })
    }

    /// `query`: `[1, Q, d_model]`, `reference_points`: `[1, Q, 4]`
    /// normalized `(cx, cy, w, h)`, `encoder_features`: one `[1, d_model,
    /// H_l, W_l]` tensor per level (finest to coarsest, matching
    /// `num_levels`).
    pub fn forward(&self, query: &Tensor, reference_points: &Tensor, encoder_features: &[Tensor]) -> Result<Tensor> {
        let (_, num_queries, d_model) = query.dims3()?;
        let device = query.device();

        let offsets = self
            .sampling_offsets
            .forward(query)?
            .reshape((num_queries, self.num_heads, self.num_levels, self.num_points, 2))?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let attn_logits = self
            .attention_weights
            .forward(query)?
            .reshape((num_queries, self.num_heads, self.num_levels * self.num_points))?;
        let attn_weights = candle_nn::ops::softmax(&attn_logits, candle_core::D::Minus1)?
            .reshape((num_queries, self.num_heads, self.num_levels, self.num_points))?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let reference = reference_points.reshape((num_queries, 4))?.to_vec2::<f32>()?;

        // Project each level's encoder feature to head-split value planes
        // and pull them into flat `[H, W, num_heads*head_dim]` buffers for
        // the per-point sampler.
        let mut level_planes = Vec::with_capacity(encoder_features.len());
        let mut level_sizes = Vec::with_capacity(encoder_features.len());
        for feat in encoder_features {
            let (_, c, h, w) = feat.dims4()?;
            let projected = self.value_proj.forward(&feat.flatten_from(2)?.transpose(1, 2)?)?; // [1, h*w, d_model]
            let plane = projected.reshape((h * w, c))?.to_vec2::<f32>()?.concat();
            level_planes.push(plane);
            level_sizes.push((h, w));
        }

        let mut output = vec![0f32; num_queries * d_model];
        for q in 0..num_queries {
            let (cx, cy, w_box, h_box) = (reference[q][0], reference[q][1], reference[q][2], reference[q][3]);
            for head in 0..self.num_heads {
                let mut accum = vec![0f32; self.head_dim];
                for level in 0..self.num_levels {
                    let (lh, lw) = level_sizes[level];
                    for point in 0..self.num_points {
                        let flat_index = (((q * self.num_heads + head) * self.num_levels + level) * self.num_points + point) * 2;
                        let offset_x = offsets[flat_index];
                        let offset_y = offsets[flat_index + 1];
                        // num_coordinates == 4 scales offsets by 0.5*w/num_points (and h).
                        let sample_x = (cx + offset_x * 0.5 * w_box / self.num_points as f32) * lw as f32 - 0.5;
                        let sample_y = (cy + offset_y * 0.5 * h_box / self.num_points as f32) * lh as f32 - 0.5;
                        let sampled = bilinear_sample_point(&level_planes[level], lh, lw, d_model, sample_x, sample_y);
                        let weight_index = ((q * self.num_heads + head) * self.num_levels + level) * self.num_points + point;
                        let weight = attn_weights[weight_index];
                        for d in 0..self.head_dim {
                            accum[d] += weight * sampled[head * self.head_dim + d];
                        }
                    }
                }
                let out_base = q * d_model + head * self.head_dim;
                output[out_base..out_base + self.head_dim].copy_from_slice(&accum);
            }
        }

        let output = Tensor::from_vec(output, (1, num_queries, d_model), device)?;
        Ok(self.output_proj.forward(&output)?)
    }
}
