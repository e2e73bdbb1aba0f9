//! Top-level layout detector: backbone -> encoder -> top-k query
//! selection -> decoder.

use candle_core::{DType, Device, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};

use crate::backbone::Backbone;
use crate::config::{LayoutModelConfig, INPUT_SIZE};
use crate::decoder::{box_to_unact, generate_anchors, mask_to_reference_box, Anchor, Decoder};
use crate::encoder::Encoder;
use crate::{Error, Result};

/// Raw model output: `{logits: 1xQxC, pred_boxes: 1xQx4, order_logits:
/// 1xQxQ, out_masks: 1xQxMhxMw}`.
pub struct LayoutPrediction {
    pub logits: Tensor,
    pub pred_boxes: Tensor,
    pub order_logits: Tensor,
    pub out_masks: Tensor,
}

struct QuerySelectionHead {
    output_proj: Linear,
    output_norm: LayerNorm,
    class_head: Linear,
    bbox_head_l1: Linear,
    bbox_head_l2: Linear,
    bbox_head_l3: Linear,
}

impl QuerySelectionHead {
    fn new(vb: VarBuilder, d_model: usize, num_classes: usize) -> Result<Self> {
        Ok(Self {
            output_proj: linear(d_model, d_model, vb.pp("output_proj"))?,
            output_norm: layer_norm(d_model, 1e-5, vb.pp("output_norm"))?,
            class_head: linear(d_model, num_classes, vb.pp("class_head"))?,
            bbox_head_l1: linear(d_model, d_model, vb.pp("bbox_head_l1"))?,
            bbox_head_l2: linear(d_model, d_model, vb.pp("bbox_head_l2"))?,
            bbox_head_l3: linear(d_model, 4, vb.pp("bbox_head_l3"))?,
        })
    }

    fn bbox_delta(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.bbox_head_l1.forward(x)?.relu()?;
        let x = self.bbox_head_l2.forward(&x)?.relu()?;
        Ok(self.bbox_head_l3.forward(&x)?)
    }
}

pub struct LayoutDetector {
    backbone: Backbone,
    encoder: Encoder,
    query_selection: QuerySelectionHead,
    mask_query_head: Option<(Linear, Linear)>,
    decoder: Decoder,
    config: LayoutModelConfig,
    device: Device,
}

impl LayoutDetector {
    pub fn new(vb: VarBuilder, config: LayoutModelConfig, device: Device) -> Result<Self> {
        let backbone = Backbone::new(vb.pp("backbone"))?;
        let stage_channels = [128, 512, 1024]; // stages 1..=3, the encoder's input_proj sources.
        let encoder = Encoder::new(
            vb.pp("encoder"),
            config.d_model,
            stage_channels,
            config.encoder_layers,
            config.encode_proj_layer,
            config.num_heads,
            config.ffn_dim,
        )?;
        let query_selection = QuerySelectionHead::new(vb.pp("query_selection"), config.d_model, config.num_classes)?;
        let mask_query_head = if config.mask_enhanced {
            Some((
                linear(config.d_model, config.d_model, vb.pp("mask_query.l1"))?,
                linear(config.d_model, config.d_model, vb.pp("mask_query.l2"))?,
            ))
        } else {
            None
        };
        let decoder = Decoder::new(
            vb.pp("decoder"),
            config.num_decoder_layers,
            config.d_model,
            config.num_heads,
            config.num_levels,
            config.num_points,
            config.ffn_dim,
            config.num_classes,
            config.global_pointer_head_size,
            config.mask_enhanced,
            config.d_model,
        )?;
        Ok(Self { backbone, encoder, query_selection, mask_query_head, decoder, config, device })
    }

    /// `input` must be `[1,3,800,800]`.
    pub fn forward(&self, input: &Tensor) -> Result<LayoutPrediction> {
        if input.dims() != [1, 3, INPUT_SIZE, INPUT_SIZE] {
            tracing::warn!("layout model received unexpected input shape {:?}", input.dims());
            return Err(Error::InputShape(input.dims().to_vec()));
        }

        let backbone_out = self.backbone.forward(input)?;
        let stage_refs: [Tensor; 3] = [
            backbone_out.stage_features[1].clone(),
            backbone_out.stage_features[2].clone(),
            backbone_out.stage_features[3].clone(),
        ];
        let encoder_out = self.encoder.forward(&backbone_out.x4_feature, &stage_refs)?;

        let level_sizes: Vec<(usize, usize)> = encoder_out
            .features
            .iter()
            .map(|f| (f.dim(2).unwrap(), f.dim(3).unwrap()))
            .collect();
        let anchors = generate_anchors(&level_sizes, 0.05);

        let memory = self.flatten_memory(&encoder_out.features)?;
        let output_memory = self.query_selection.output_norm.forward(&self.query_selection.output_proj.forward(&memory)?)?;
        let class_logits_all = self.query_selection.class_head.forward(&output_memory)?;
        let bbox_delta_all = self.query_selection.bbox_delta(&output_memory)?;
        let coord_logits_all = self.anchors_plus_delta(&anchors, &bbox_delta_all)?;

        let top_indices = top_k_by_max_class_logit(&class_logits_all, &anchors, self.config.num_queries)?;

        let target = gather_rows(&output_memory, &top_indices)?;
        let mut reference_unact = gather_rows(&coord_logits_all, &top_indices)?;

        if let Some((l1, l2)) = &self.mask_query_head {
            let normed = self.decoder_output_norm_equivalent(&target)?;
            let mask_query = l2.forward(&l1.forward(&normed)?.relu()?)?;
            let (_, mask_dim, mh, mw) = encoder_out.mask_features.dims4()?;
            let flat = encoder_out.mask_features.reshape((mask_dim, mh * mw))?;
            let mask_logits = mask_query.squeeze(0)?.matmul(&flat)?.reshape((self.config.num_queries, mh, mw))?;
            let mask_data = mask_logits.to_vec3::<f32>()?;
            let mut new_reference = Vec::with_capacity(self.config.num_queries * 4);
            for q in 0..self.config.num_queries {
                let flat_mask: Vec<f32> = mask_data[q].iter().flatten().copied().collect();
                let (cx, cy, w, h) = mask_to_reference_box(&flat_mask, mh, mw, 0.0);
                new_reference.extend_from_slice(&box_to_unact(cx, cy, w, h));
            }
            reference_unact = Tensor::from_vec(new_reference, (1, self.config.num_queries, 4), &self.device)?;
        }

        let decoded = self.decoder.forward(&target, &reference_unact, &encoder_out.features, &encoder_out.mask_features)?;
        let out_masks = decoded
            .mask_logits
            .unwrap_or_else(|| Tensor::zeros((1, self.config.num_queries, self.config.mask_h, self.config.mask_w), DType::F32, &self.device).unwrap());

        Ok(LayoutPrediction {
            logits: decoded.class_logits,
            pred_boxes: decoded.reference_points,
            order_logits: decoded.order_logits,
            out_masks,
        })
    }

    fn flatten_memory(&self, features: &[Tensor]) -> Result<Tensor> {
        let flattened: Vec<Tensor> = features
            .iter()
            .map(|f| f.flatten_from(2).and_then(|t| t.transpose(1, 2)))
            .collect::<candle_core::Result<_>>()?;
        let refs: Vec<&Tensor> = flattened.iter().collect();
        Ok(Tensor::cat(&refs, 1)?)
    }

    fn anchors_plus_delta(&self, anchors: &[Anchor], delta: &Tensor) -> Result<Tensor> {
        let n = anchors.len();
        let mut anchor_unact = Vec::with_capacity(n * 4);
        for anchor in anchors {
            if anchor.valid {
                anchor_unact.extend_from_slice(&box_to_unact(anchor.cx, anchor.cy, anchor.w, anchor.h));
            } else {
                anchor_unact.extend_from_slice(&[f32::INFINITY; 4]);
            }
        }
        let anchor_tensor = Tensor::from_vec(anchor_unact, (1, n, 4), &self.device)?;
        Ok((delta + anchor_tensor)?)
    }

    fn decoder_output_norm_equivalent(&self, target: &Tensor) -> Result<Tensor> {
        // Passes target through the decoder layer-norm ahead of the
        // mask-query MLP; this is the same normalization the decoder
        // applies to its own input before layer 0.
        Ok(self.query_selection.output_norm.forward(target)?)
    }
}

/// Per-token max class logit, sorted descending (ties by ascending flat
/// index for stability), top `k` indices kept. Invalid anchors carry a
/// `+inf` coordinate sentinel so their sigmoid is 1 and their gradient
/// contributes nothing after the encoder output has been masked out by
/// the caller; here we additionally rank them last by forcing their
/// score to `-inf`.
fn top_k_by_max_class_logit(class_logits: &Tensor, anchors: &[Anchor], k: usize) -> Result<Vec<usize>> {
    let (_, n, _c) = class_logits.dims3()?;
    let scores = class_logits.max(2)?.reshape(n)?.to_vec1::<f32>()?;
    let mut indexed: Vec<(f32, usize)> = scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| (if anchors[i].valid { s } else { f32::NEG_INFINITY }, i))
        .map(|(s, i)| (s, i))
        .collect();
    indexed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap().then(a.1.cmp(&b.1)));
    Ok(indexed.into_iter().take(k).map(|(_, i)| i).collect())
}

fn gather_rows(tensor: &Tensor, indices: &[usize]) -> Result<Tensor> {
    let idx = Tensor::from_vec(indices.iter().map(|&i| i as u32).collect::<Vec<_>>(), indices.len(), tensor.device())?;
    Ok(tensor.index_select(&idx, 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_prefers_valid_anchors_with_higher_score() {
        let device = Device::Cpu;
        let data = vec![0.1f32, 0.9, 0.5, 0.2];
        let logits = Tensor::from_vec(data, (1, 4, 1), &device).unwrap();
        let anchors = vec![
            Anchor { cx: 0.5, cy: 0.5, w: 0.1, h: 0.1, valid: true },
            Anchor { cx: 0.5, cy: 0.5, w: 0.1, h: 0.1, valid: false },
            Anchor { cx: 0.5, cy: 0.5, w: 0.1, h: 0.1, valid: true },
            Anchor { cx: 0.5, cy: 0.5, w: 0.1, h: 0.1, valid: true },
        ];
        let top = top_k_by_max_class_logit(&logits, &anchors, 2).unwrap();
        assert_eq!(top, vec![2, 3]);
    }
}
