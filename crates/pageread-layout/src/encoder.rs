//! AIFI self-attention, FPN/PAN feature fusion, and the mask-feature
//! head.

use candle_core::{DType, Tensor};
use candle_nn::{batch_norm, conv2d, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, LayerNorm, Linear, Module, ModuleT, VarBuilder};

use pageread_tensor::attention::scaled_dot_product_attention;
use pageread_tensor::interpolate::resize_bilinear;

use crate::Result;

fn conv_bn_silu(vb: VarBuilder, in_c: usize, out_c: usize, kernel: usize, stride: usize) -> Result<(Conv2d, BatchNorm)> {
    let cfg = Conv2dConfig { padding: kernel / 2, stride, dilation: 1, groups: 1 };
    let conv = conv2d_no_bias(in_c, out_c, kernel, cfg, vb.pp("conv"))?;
    let bn = batch_norm(out_c, 1e-5, vb.pp("bn"))?;
    Ok((conv, bn))
}

fn apply_conv_bn_silu(conv: &Conv2d, bn: &BatchNorm, x: &Tensor) -> Result<Tensor> {
    let x = conv.forward(x)?;
    let x = bn.forward_t(&x, false)?;
    Ok(candle_nn::ops::silu(&x)?)
}

/// One reparameterizable conv: a 3x3 branch and a 1x1 branch summed
/// before activation (spec's "RepVGG-style" block, inference form).
struct RepVggBlock {
    conv3: (Conv2d, BatchNorm),
    conv1: (Conv2d, BatchNorm),
}

impl RepVggBlock {
    fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        Ok(Self {
            conv3: conv_bn_silu(vb.pp("conv3"), channels, channels, 3, 1)?,
            conv1: conv_bn_silu(vb.pp("conv1"), channels, channels, 1, 1)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let a = self.conv3.0.forward(x)?;
        let a = self.conv3.1.forward_t(&a, false)?;
        let b = self.conv1.0.forward(x)?;
        let b = self.conv1.1.forward_t(&b, false)?;
        Ok(candle_nn::ops::silu(&(a + b)?)?)
    }
}

/// A CSP-Rep block: three stacked `RepVggBlock`s in one branch, summed
/// with a parallel 1x1-conv branch.
struct CspRepBlock {
    reps: Vec<RepVggBlock>,
    branch: (Conv2d, BatchNorm),
    out_conv: (Conv2d, BatchNorm),
}

impl CspRepBlock {
    fn new(vb: VarBuilder, in_c: usize, out_c: usize) -> Result<Self> {
        let mut reps = Vec::with_capacity(3);
        for i in 0..3 {
            reps.push(RepVggBlock::new(vb.pp(format!("rep{i}")), in_c)?);
        }
        let branch = conv_bn_silu(vb.pp("branch"), in_c, in_c, 1, 1)?;
        let out_conv = conv_bn_silu(vb.pp("out"), in_c, out_c, 1, 1)?;
        Ok(Self { reps, branch, out_conv })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut main = x.clone();
        for rep in &self.reps {
            main = rep.forward(&main)?;
        }
        let branch = apply_conv_bn_silu(&self.branch.0, &self.branch.1, x)?;
        apply_conv_bn_silu(&self.out_conv.0, &self.out_conv.1, &(main + branch)?)
    }
}

/// Sine-cosine 2D position embedding for AIFI, one row per spatial
/// position, `d_model` columns (half sine-x/cos-x, half sine-y/cos-y).
fn sine_cosine_position_embedding(h: usize, w: usize, d_model: usize, device: &candle_core::Device) -> Result<Tensor> {
    let quarter = d_model / 4;
    let temperature = 10000f32;
    let mut data = vec![0f32; h * w * d_model];
    for y in 0..h {
        for x in 0..w {
            let base = (y * w + x) * d_model;
            for i in 0..quarter {
                let freq = 1.0 / temperature.powf(i as f32 / quarter as f32);
                data[base + i] = (x as f32 * freq).sin();
                data[base + quarter + i] = (x as f32 * freq).cos();
                data[base + 2 * quarter + i] = (y as f32 * freq).sin();
                data[base + 3 * quarter + i] = (y as f32 * freq).cos();
            }
        }
    }
    Ok(Tensor::from_vec(data, (1, h * w, d_model), device)?)
}

/// A single pre-norm transformer encoder layer (self-attention + FFN).
struct AifiLayer {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    norm1: LayerNorm,
    ffn1: Linear,
    ffn2: Linear,
    norm2: LayerNorm,
    num_heads: usize,
}

impl AifiLayer {
    fn new(vb: VarBuilder, d_model: usize, num_heads: usize, ffn_dim: usize) -> Result<Self> {
        Ok(Self {
            q_proj: candle_nn::linear(d_model, d_model, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(d_model, d_model, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(d_model, d_model, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(d_model, d_model, vb.pp("out_proj"))?,
            norm1: candle_nn::layer_norm(d_model, 1e-5, vb.pp("norm1"))?,
            ffn1: candle_nn::linear(d_model, ffn_dim, vb.pp("ffn1"))?,
            ffn2: candle_nn::linear(ffn_dim, d_model, vb.pp("ffn2"))?,
            norm2: candle_nn::layer_norm(d_model, 1e-5, vb.pp("norm2"))?,
            num_heads,
        })
    }

    fn forward(&self, x: &Tensor, pos: &Tensor) -> Result<Tensor> {
        let (b, l, d) = x.dims3()?;
        let head_dim = d / self.num_heads;
        let with_pos = (x + pos)?;
        let split_heads = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((b, l, self.num_heads, head_dim))?.transpose(1, 2)
        };
        let q = split_heads(self.q_proj.forward(&with_pos)?)?;
        let k = split_heads(self.k_proj.forward(&with_pos)?)?;
        let v = split_heads(self.v_proj.forward(x)?)?;
        let attn = scaled_dot_product_attention(&q, &k, &v, None, 1.0 / (head_dim as f64).sqrt())?;
        let attn = attn.transpose(1, 2)?.reshape((b, l, d))?;
        let attn = self.out_proj.forward(&attn)?;
        let x = self.norm1.forward(&(x + attn)?)?;
        let ffn = self.ffn2.forward(&self.ffn1.forward(&x)?.relu()?)?;
        Ok(self.norm2.forward(&(&x + ffn)?)?)
    }
}

/// Input projection + AIFI + FPN + PAN + mask-feature head.
pub struct Encoder {
    input_proj: Vec<(Conv2d, BatchNorm)>,
    aifi_layers: Vec<AifiLayer>,
    fpn_laterals: Vec<(Conv2d, BatchNorm)>,
    fpn_blocks: Vec<CspRepBlock>,
    pan_downsamples: Vec<(Conv2d, BatchNorm)>,
    pan_blocks: Vec<CspRepBlock>,
    scale_heads: Vec<(Conv2d, BatchNorm)>,
    mask_output_conv: (Conv2d, BatchNorm),
    x4_lateral: (Conv2d, BatchNorm),
    mask_base_conv: Conv2d,
    encode_proj_layer: usize,
    d_model: usize,
}

pub struct EncoderOutput {
    /// Three fused feature maps (FPN+PAN), finest to coarsest.
    pub features: Vec<Tensor>,
    /// `[1, d_model, mask_h, mask_w]` dense mask features.
    pub mask_features: Tensor,
}

impl Encoder {
    pub fn new(vb: VarBuilder, d_model: usize, stage_channels: [usize; 3], encoder_layers: usize, encode_proj_layer: usize, num_heads: usize, ffn_dim: usize) -> Result<Self> {
        let mut input_proj = Vec::with_capacity(3);
        for (i, &c) in stage_channels.iter().enumerate() {
            let cfg = Conv2dConfig { padding: 0, stride: 1, dilation: 1, groups: 1 };
            let conv = conv2d_no_bias(c, d_model, 1, cfg, vb.pp(format!("input_proj{i}.conv")))?;
            let bn = batch_norm(d_model, 1e-5, vb.pp(format!("input_proj{i}.bn")))?;
            input_proj.push((conv, bn));
        }

        let mut aifi_layers = Vec::with_capacity(encoder_layers);
        for i in 0..encoder_layers {
            aifi_layers.push(AifiLayer::new(vb.pp(format!("aifi{i}")), d_model, num_heads, ffn_dim)?);
        }

        let mut fpn_laterals = Vec::with_capacity(2);
        let mut fpn_blocks = Vec::with_capacity(2);
        for i in 0..2 {
            fpn_laterals.push(conv_bn_silu(vb.pp(format!("fpn_lateral{i}")), d_model, d_model, 1, 1)?);
            fpn_blocks.push(CspRepBlock::new(vb.pp(format!("fpn_block{i}")), d_model * 2, d_model)?);
        }

        let mut pan_downsamples = Vec::with_capacity(2);
        let mut pan_blocks = Vec::with_capacity(2);
        for i in 0..2 {
            pan_downsamples.push(conv_bn_silu(vb.pp(format!("pan_down{i}")), d_model, d_model, 3, 2)?);
            pan_blocks.push(CspRepBlock::new(vb.pp(format!("pan_block{i}")), d_model * 2, d_model)?);
        }

        let mut scale_heads = Vec::with_capacity(3);
        for i in 0..3 {
            scale_heads.push(conv_bn_silu(vb.pp(format!("scale_head{i}")), d_model, d_model, 3, 1)?);
        }
        let mask_output_conv = conv_bn_silu(vb.pp("mask_output"), d_model, d_model, 3, 1)?;
        let x4_lateral = conv_bn_silu(vb.pp("x4_lateral"), stage_channels[0], d_model, 1, 1)?;
        let mask_base_conv = conv2d(d_model, d_model, 1, Conv2dConfig::default(), vb.pp("mask_base"))?;

        Ok(Self {
            input_proj,
            aifi_layers,
            fpn_laterals,
            fpn_blocks,
            pan_downsamples,
            pan_blocks,
            scale_heads,
            mask_output_conv,
            x4_lateral,
            mask_base_conv,
            encode_proj_layer,
            d_model,
        })
    }

    pub fn forward(&self, x4_feature: &Tensor, stage_features: &[Tensor; 3]) -> Result<EncoderOutput> {
        let mut projected: Vec<Tensor> = stage_features
            .iter()
            .zip(self.input_proj.iter())
            .map(|(feat, (conv, bn))| apply_conv_bn_silu(conv, bn, feat))
            .collect::<Result<_>>()?;

        // AIFI at the configured (coarsest) level only.
        let level = self.encode_proj_layer.min(projected.len() - 1);
        let target = &projected[level];
        let (_, _, h, w) = target.dims4()?;
        let flat = target.flatten_from(2)?.transpose(1, 2)?; // [1, h*w, d_model]
        let pos = sine_cosine_position_embedding(h, w, self.d_model, target.device())?;
        let mut encoded = flat;
        for layer in &self.aifi_layers {
            encoded = layer.forward(&encoded, &pos)?;
        }
        projected[level] = encoded.transpose(1, 2)?.reshape((1, self.d_model, h, w))?;

        // FPN top-down: coarsest -> finest.
        let mut fpn_outputs = vec![projected[2].clone()];
        for i in 0..2 {
            let higher = fpn_outputs.last().unwrap().clone();
            let (lateral_conv, lateral_bn) = &self.fpn_laterals[i];
            let lateral = apply_conv_bn_silu(lateral_conv, lateral_bn, &higher)?;
            let (_, _, lh, lw) = lateral.dims4()?;
            let upsampled = resize_bilinear(&lateral, lh * 2, lw * 2)?;
            let next_level = &projected[1 - i];
            let concatenated = Tensor::cat(&[&upsampled, next_level], 1)?;
            fpn_outputs.push(self.fpn_blocks[i].forward(&concatenated)?);
        }
        fpn_outputs.reverse(); // finest -> coarsest

        // PAN bottom-up: finest -> coarsest.
        let mut pan_outputs = vec![fpn_outputs[0].clone()];
        for i in 0..2 {
            let lower = pan_outputs.last().unwrap().clone();
            let (down_conv, down_bn) = &self.pan_downsamples[i];
            let downsampled = apply_conv_bn_silu(down_conv, down_bn, &lower)?;
            let concatenated = Tensor::cat(&[&downsampled, &fpn_outputs[i + 1]], 1)?;
            pan_outputs.push(self.pan_blocks[i].forward(&concatenated)?);
        }

        let mask_features = self.mask_feature_head(&pan_outputs, x4_feature)?;
        Ok(EncoderOutput { features: pan_outputs, mask_features })
    }

    /// Sort PAN features by stride ascending (finest first, already the
    /// case), run per-scale heads with repeated 2x upsample to the base
    /// stride, sum, output conv, 2x upsample, add x4 lateral, base conv.
    fn mask_feature_head(&self, pan_features: &[Tensor], x4_feature: &Tensor) -> Result<Tensor> {
        let (_, _, base_h, base_w) = pan_features[0].dims4()?;
        let mut summed: Option<Tensor> = None;
        for (i, feat) in pan_features.iter().enumerate() {
            let (conv, bn) = &self.scale_heads[i];
            let mut head_out = apply_conv_bn_silu(conv, bn, feat)?;
            for _ in 0..i {
                let (_, _, h, w) = head_out.dims4()?;
                head_out = resize_bilinear(&head_out, h * 2, w * 2)?;
            }
            let (_, _, h, w) = head_out.dims4()?;
            if (h, w) != (base_h, base_w) {
                head_out = resize_bilinear(&head_out, base_h, base_w)?;
            }
            summed = Some(match summed {
                Some(acc) => (acc + head_out)?,
                None => head_out,
            });
        }
        let summed = summed.expect("at least one PAN feature");
        let output = apply_conv_bn_silu(&self.mask_output_conv.0, &self.mask_output_conv.1, &summed)?;
        let (_, _, h, w) = output.dims4()?;
        let upsampled = resize_bilinear(&output, h * 2, w * 2)?;
        let (_, _, uh, uw) = upsampled.dims4()?;
        let x4_lateral = apply_conv_bn_silu(&self.x4_lateral.0, &self.x4_lateral.1, x4_feature)?;
        let (_, _, xh, xw) = x4_lateral.dims4()?;
        let x4_lateral = if (xh, xw) != (uh, uw) { resize_bilinear(&x4_lateral, uh, uw)? } else { x4_lateral };
        let fused = (upsampled + x4_lateral)?;
        Ok(self.mask_base_conv.forward(&fused)?.to_dtype(DType::F32)?)
    }
}
