//! Anchor generation, decoder layers with iterative box refinement, and
//! the order-pointer head.

use candle_core::{DType, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};

use pageread_tensor::attention::scaled_dot_product_attention;

use crate::deformable::DeformableAttention;
use crate::Result;

fn inverse_sigmoid(x: f32) -> f32 {
    let x = x.clamp(1e-6, 1.0 - 1e-6);
    (x / (1.0 - x)).ln()
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Flat anchor box `(cx, cy, w, h)` plus whether it passed the validity
/// test.
#[derive(Debug, Clone, Copy)]
pub struct Anchor {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub valid: bool,
}

/// Generates anchors for each spatial level using `grid_size * 2^level`,
/// masking out anchors outside `(0.01, 0.99)` or with invalid width/height.
pub fn generate_anchors(level_sizes: &[(usize, usize)], grid_size: f32) -> Vec<Anchor> {
    let mut anchors = Vec::new();
    for (level, &(h, w)) in level_sizes.iter().enumerate() {
        let stride = grid_size * 2f32.powi(level as i32);
        for y in 0..h {
            for x in 0..w {
                let cx = (x as f32 + 0.5) / w as f32;
                let cy = (y as f32 + 0.5) / h as f32;
                let wh = stride / w.max(h) as f32;
                let valid = (0.01..0.99).contains(&cx) && (0.01..0.99).contains(&cy) && wh > 0.0;
                anchors.push(Anchor { cx, cy, w: wh, h: wh, valid });
            }
        }
    }
    anchors
}

struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    fn new(vb: VarBuilder, dims: &[usize]) -> Result<Self> {
        let mut layers = Vec::with_capacity(dims.len() - 1);
        for i in 0..dims.len() - 1 {
            layers.push(linear(dims[i], dims[i + 1], vb.pp(format!("layer{i}")))?);
        }
        Ok(Self { layers })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i != last {
                x = x.relu()?;
            }
        }
        Ok(x)
    }
}

struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
}

impl SelfAttention {
    fn new(vb: VarBuilder, d_model: usize, num_heads: usize) -> Result<Self> {
        Ok(Self {
            q_proj: linear(d_model, d_model, vb.pp("q_proj"))?,
            k_proj: linear(d_model, d_model, vb.pp("k_proj"))?,
            v_proj: linear(d_model, d_model, vb.pp("v_proj"))?,
            out_proj: linear(d_model, d_model, vb.pp("out_proj"))?,
            num_heads,
        })
    }

    fn forward(&self, query: &Tensor, pos: &Tensor) -> Result<Tensor> {
        let (b, l, d) = query.dims3()?;
        let head_dim = d / self.num_heads;
        let with_pos = (query + pos)?;
        let split = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((b, l, self.num_heads, head_dim))?.transpose(1, 2)
        };
        let q = split(self.q_proj.forward(&with_pos)?)?;
        let k = split(self.k_proj.forward(&with_pos)?)?;
        let v = split(self.v_proj.forward(query)?)?;
        let attn = scaled_dot_product_attention(&q, &k, &v, None, 1.0 / (head_dim as f64).sqrt())?;
        let attn = attn.transpose(1, 2)?.reshape((b, l, d))?;
        Ok(self.out_proj.forward(&attn)?)
    }
}

struct DecoderLayer {
    self_attn: SelfAttention,
    norm1: LayerNorm,
    cross_attn: DeformableAttention,
    norm2: LayerNorm,
    ffn1: Linear,
    ffn2: Linear,
    norm3: LayerNorm,
    pos_embed: Mlp,
    bbox_head: Mlp,
    class_head: Linear,
    mask_head: Option<Mlp>,
    order_proj: Linear,
}

impl DecoderLayer {
    fn new(vb: VarBuilder, d_model: usize, num_heads: usize, num_levels: usize, num_points: usize, ffn_dim: usize, num_classes: usize, global_pointer_head_size: usize, mask_enhanced: bool, mask_feature_dim: usize) -> Result<Self> {
        Ok(Self {
            self_attn: SelfAttention::new(vb.pp("self_attn"), d_model, num_heads)?,
            norm1: layer_norm(d_model, 1e-5, vb.pp("norm1"))?,
            cross_attn: DeformableAttention::new(vb.pp("cross_attn"), d_model, num_heads, num_levels, num_points)?,
            norm2: layer_norm(d_model, 1e-5, vb.pp("norm2"))?,
            ffn1: linear(d_model, ffn_dim, vb.pp("ffn1"))?,
            ffn2: linear(ffn_dim, d_model, vb.pp("ffn2"))?,
            norm3: layer_norm(d_model, 1e-5, vb.pp("norm3"))?,
            pos_embed: Mlp::new(vb.pp("pos_embed"), &[4, d_model, d_model])?,
            bbox_head: Mlp::new(vb.pp("bbox_head"), &[d_model, d_model, d_model, 4])?,
            class_head: linear(d_model, num_classes, vb.pp("class_head"))?,
            mask_head: if mask_enhanced { Some(Mlp::new(vb.pp("mask_head"), &[d_model, d_model, mask_feature_dim])?) } else { None },
            order_proj: linear(d_model, 2 * global_pointer_head_size, vb.pp("order_proj"))?,
        })
    }
}

pub struct DecoderStepOutput {
    pub class_logits: Tensor,
    pub reference_points: Tensor,
    pub order_logits: Tensor,
    pub mask_logits: Option<Tensor>,
}

pub struct Decoder {
    layers: Vec<DecoderLayer>,
    output_proj: Linear,
    output_norm: LayerNorm,
    global_pointer_head_size: usize,
}

impl Decoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vb: VarBuilder,
        num_layers: usize,
        d_model: usize,
        num_heads: usize,
        num_levels: usize,
        num_points: usize,
        ffn_dim: usize,
        num_classes: usize,
        global_pointer_head_size: usize,
        mask_enhanced: bool,
        mask_feature_dim: usize,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            layers.push(DecoderLayer::new(
                vb.pp(format!("layer{i}")),
                d_model,
                num_heads,
                num_levels,
                num_points,
                ffn_dim,
                num_classes,
                global_pointer_head_size,
                mask_enhanced,
                mask_feature_dim,
            )?);
        }
        Ok(Self {
            layers,
            output_proj: linear(d_model, d_model, vb.pp("output_proj"))?,
            output_norm: layer_norm(d_model, 1e-5, vb.pp("output_norm"))?,
            global_pointer_head_size,
        })
    }

    /// Runs all decoder layers in sequence, refining `reference_points`
    /// after each. Returns the final-layer outputs only;
    /// callers needing intermediate supervision can extend this to
    /// collect every layer's `DecoderStepOutput`.
    pub fn forward(
        &self,
        target: &Tensor,
        reference_points_unact: &Tensor,
        encoder_features: &[Tensor],
        mask_features: &Tensor,
    ) -> Result<DecoderStepOutput> {
        let mut query = self.output_norm.forward(&self.output_proj.forward(target)?)?;
        let mut reference_unact = reference_points_unact.clone();
        let mut last = None;

        for layer in &self.layers {
            let reference_sigmoid = candle_nn::ops::sigmoid(&reference_unact)?;
            let pos = layer.pos_embed.forward(&reference_sigmoid)?;

            let self_attn_out = layer.self_attn.forward(&query, &pos)?;
            query = layer.norm1.forward(&(&query + self_attn_out)?)?;

            let cross_attn_out = layer.cross_attn.forward(&query, &reference_sigmoid, encoder_features)?;
            query = layer.norm2.forward(&(&query + cross_attn_out)?)?;

            let ffn_out = layer.ffn2.forward(&layer.ffn1.forward(&query)?.relu()?)?;
            query = layer.norm3.forward(&(&query + ffn_out)?)?;

            let bbox_delta = layer.bbox_head.forward(&query)?;
            reference_unact = (reference_unact + bbox_delta)?;
            let class_logits = layer.class_head.forward(&query)?;

            let order_raw = layer.order_proj.forward(&query)?;
            let order_logits = order_pointer_logits(&order_raw, self.global_pointer_head_size)?;

            let mask_logits = match &layer.mask_head {
                Some(mask_head) => {
                    let mask_query = mask_head.forward(&query)?; // [1, Q, mask_feature_dim]
                    Some(mask_logits_from_query(&mask_query, mask_features)?)
                }
                None => None,
            };

            last = Some(DecoderStepOutput {
                class_logits,
                reference_points: candle_nn::ops::sigmoid(&reference_unact)?,
                order_logits,
                mask_logits,
            });
        }

        last.ok_or_else(|| crate::Error::Config("decoder has no layers".to_string()))
    }
}

/// `B x L x (2H)` split into queries/keys, pairwise `q.k^T / sqrt(H)`,
/// lower-triangular positions replaced by `-10000`.
fn order_pointer_logits(raw: &Tensor, head_size: usize) -> Result<Tensor> {
    let (b, l, _) = raw.dims3()?;
    let queries = raw.narrow(2, 0, head_size)?;
    let keys = raw.narrow(2, head_size, head_size)?;
    let scores = (queries.matmul(&keys.transpose(1, 2)?)? / (head_size as f64).sqrt())?;
    let mut mask_data = vec![0f32; l * l];
    for i in 0..l {
        for j in 0..l {
            if j < i {
                mask_data[i * l + j] = -10_000.0;
            }
        }
    }
    let mask = Tensor::from_vec(mask_data, (1, l, l), raw.device())?.broadcast_as((b, l, l))?;
    Ok((scores + mask)?)
}

/// Dot each query's mask embedding with the flattened mask-feature map
/// to produce per-query mask logits at `mask_h x mask_w`.
fn mask_logits_from_query(mask_query: &Tensor, mask_features: &Tensor) -> Result<Tensor> {
    let (_, mask_dim, mh, mw) = mask_features.dims4()?;
    let flat_features = mask_features.reshape((mask_dim, mh * mw))?;
    let logits = mask_query.squeeze(0)?.matmul(&flat_features)?; // [Q, mh*mw]
    Ok(logits.reshape((1, logits.dim(0)?, mh, mw))?.to_dtype(DType::F32)?)
}

/// Tight bounding box of the positive region of a binarized mask, in
/// normalized `(cx, cy, w, h)`, falling back to a tiny centered box when
/// the mask has no positive pixels.
pub fn mask_to_reference_box(mask: &[f32], h: usize, w: usize, threshold: f32) -> (f32, f32, f32, f32) {
    let mut min_x = usize::MAX;
    let mut max_x = 0usize;
    let mut min_y = usize::MAX;
    let mut max_y = 0usize;
    let mut found = false;
    for y in 0..h {
        for x in 0..w {
            if mask[y * w + x] > threshold {
                found = true;
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);
            }
        }
    }
    if !found {
        return (0.5, 0.5, 1.0 / w as f32, 1.0 / h as f32);
    }
    let x1 = min_x as f32 / w as f32;
    let x2 = (max_x + 1) as f32 / w as f32;
    let y1 = min_y as f32 / h as f32;
    let y2 = (max_y + 1) as f32 / h as f32;
    ((x1 + x2) / 2.0, (y1 + y2) / 2.0, x2 - x1, y2 - y1)
}

pub fn box_to_unact(cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
    [inverse_sigmoid(cx), inverse_sigmoid(cy), inverse_sigmoid(w), inverse_sigmoid(h)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_anchors_produces_one_per_spatial_position() {
        let anchors = generate_anchors(&[(2, 2), (1, 1)], 0.1);
        assert_eq!(anchors.len(), 4 + 1);
    }

    #[test]
    fn anchors_outside_center_band_are_invalid() {
        let anchors = generate_anchors(&[(100, 100)], 0.1);
        assert!(anchors.iter().any(|a| !a.valid));
        assert!(anchors.iter().any(|a| a.valid));
    }

    #[test]
    fn mask_to_reference_box_falls_back_when_empty() {
        let mask = vec![0f32; 16];
        let (cx, cy, w, h) = mask_to_reference_box(&mask, 4, 4, 0.5);
        assert!((cx - 0.5).abs() < 1e-6);
        assert!((cy - 0.5).abs() < 1e-6);
        assert!(w > 0.0 && h > 0.0);
    }

    #[test]
    fn mask_to_reference_box_tightly_bounds_positive_region() {
        let mut mask = vec![0f32; 16];
        mask[1 * 4 + 1] = 1.0;
        mask[2 * 4 + 2] = 1.0;
        let (cx, cy, w, h) = mask_to_reference_box(&mask, 4, 4, 0.5);
        assert!(cx > 0.4 && cx < 0.8);
        assert!(cy > 0.4 && cy < 0.8);
        assert!(w > 0.0 && h > 0.0);
    }

    #[test]
    fn inverse_sigmoid_roundtrips_through_sigmoid() {
        let x = 0.3;
        let back = sigmoid(inverse_sigmoid(x));
        assert!((back - x).abs() < 1e-4);
    }
}
