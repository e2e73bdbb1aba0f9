//! HGNet-style 4-stage backbone.

use candle_core::Tensor;
use candle_nn::{batch_norm, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder};

use crate::config::{StageConfig, BACKBONE_STAGES};
use crate::Result;

/// Conv2d + BatchNorm + SiLU, the backbone's universal building block.
struct ConvBnAct {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBnAct {
    fn new(vb: VarBuilder, in_c: usize, out_c: usize, kernel: usize, stride: usize, groups: usize) -> Result<Self> {
        let padding = kernel / 2;
        let cfg = Conv2dConfig { padding, stride, dilation: 1, groups, ..Default::default() };
        let conv = conv2d_no_bias(in_c, out_c, kernel, cfg, vb.pp("conv"))?;
        let bn = batch_norm(out_c, 1e-5, vb.pp("bn"))?;
        Ok(Self { conv, bn })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = self.bn.forward_t(&x, false)?;
        Ok(candle_nn::ops::silu(&x)?)
    }
}

/// A single layer inside an HG block: for light blocks, a 1x1
/// point-wise conv followed by a depthwise `k x k`; for non-light
/// blocks, a single `k x k` conv.
struct HgLayer {
    pointwise: Option<ConvBnAct>,
    spatial: ConvBnAct,
}

impl HgLayer {
    fn new(vb: VarBuilder, in_c: usize, out_c: usize, kernel: usize, light: bool) -> Result<Self> {
        if light {
            let pointwise = ConvBnAct::new(vb.pp("pw"), in_c, out_c, 1, 1, 1)?;
            let spatial = ConvBnAct::new(vb.pp("dw"), out_c, out_c, kernel, 1, out_c)?;
            Ok(Self { pointwise: Some(pointwise), spatial })
        } else {
            let spatial = ConvBnAct::new(vb.pp("conv"), in_c, out_c, kernel, 1, 1)?;
            Ok(Self { pointwise: None, spatial })
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = match &self.pointwise {
            Some(pw) => pw.forward(x)?,
            None => x.clone(),
        };
        self.spatial.forward(&x)
    }
}

/// One HG block: concatenates the block input with every per-layer
/// output, runs two 1x1 aggregation convs, and adds a residual on
/// blocks with index > 0.
struct HgBlock {
    layers: Vec<HgLayer>,
    agg1: ConvBnAct,
    agg2: ConvBnAct,
    has_residual: bool,
}

impl HgBlock {
    fn new(vb: VarBuilder, stage: StageConfig, block_index: usize) -> Result<Self> {
        let mut layers = Vec::with_capacity(stage.num_layers);
        let mut in_c = if block_index == 0 { stage.in_channels } else { stage.out_channels };
        for i in 0..stage.num_layers {
            layers.push(HgLayer::new(vb.pp(format!("layer{i}")), in_c, stage.mid_channels, stage.kernel, stage.light_block)?);
            in_c = stage.mid_channels;
        }
        let concat_channels = if block_index == 0 { stage.in_channels } else { stage.out_channels } + stage.mid_channels * stage.num_layers;
        let agg1 = ConvBnAct::new(vb.pp("agg1"), concat_channels, stage.out_channels, 1, 1, 1)?;
        let agg2 = ConvBnAct::new(vb.pp("agg2"), stage.out_channels, stage.out_channels, 1, 1, 1)?;
        Ok(Self { layers, agg1, agg2, has_residual: block_index > 0 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut outputs = vec![x.clone()];
        let mut current = x.clone();
        for layer in &self.layers {
            current = layer.forward(&current)?;
            outputs.push(current.clone());
        }
        let refs: Vec<&Tensor> = outputs.iter().collect();
        let concatenated = Tensor::cat(&refs, 1)?;
        let aggregated = self.agg2.forward(&self.agg1.forward(&concatenated)?)?;
        if self.has_residual {
            Ok((aggregated + x)?)
        } else {
            Ok(aggregated)
        }
    }
}

struct HgStage {
    downsample: Option<ConvBnAct>,
    blocks: Vec<HgBlock>,
}

impl HgStage {
    fn new(vb: VarBuilder, stage: StageConfig) -> Result<Self> {
        let downsample = if stage.downsample {
            Some(ConvBnAct::new(vb.pp("downsample"), stage.in_channels, stage.in_channels, 3, 2, stage.in_channels)?)
        } else {
            None
        };
        let mut blocks = Vec::with_capacity(stage.num_blocks);
        for i in 0..stage.num_blocks {
            blocks.push(HgBlock::new(vb.pp(format!("block{i}")), stage, i)?);
        }
        Ok(Self { downsample, blocks })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = match &self.downsample {
            Some(ds) => ds.forward(x)?,
            None => x.clone(),
        };
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(x)
    }
}

/// The stem: two stacked 3x3 convs before the first stage.
struct Stem {
    conv1: ConvBnAct,
    conv2: ConvBnAct,
}

impl Stem {
    fn new(vb: VarBuilder) -> Result<Self> {
        let conv1 = ConvBnAct::new(vb.pp("conv1"), 3, 32, 3, 2, 1)?;
        let conv2 = ConvBnAct::new(vb.pp("conv2"), 32, BACKBONE_STAGES[0].in_channels, 3, 1, 1)?;
        Ok(Self { conv1, conv2 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.conv2.forward(&self.conv1.forward(x)?)
    }
}

/// Output of a full backbone pass: `x4_feature` (the first stage's
/// output, at 1/4 input resolution) plus all four stage features.
pub struct BackboneOutput {
    pub x4_feature: Tensor,
    pub stage_features: Vec<Tensor>,
}

pub struct Backbone {
    stem: Stem,
    stages: Vec<HgStage>,
}

impl Backbone {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let stem = Stem::new(vb.pp("stem"))?;
        let mut stages = Vec::with_capacity(BACKBONE_STAGES.len());
        for (i, stage_cfg) in BACKBONE_STAGES.iter().enumerate() {
            stages.push(HgStage::new(vb.pp(format!("stage{i}")), *stage_cfg)?);
        }
        Ok(Self { stem, stages })
    }

    pub fn forward(&self, x: &Tensor) -> Result<BackboneOutput> {
        let mut x = self.stem.forward(x)?;
        let mut stage_features = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            x = stage.forward(&x)?;
            stage_features.push(x.clone());
        }
        let x4_feature = stage_features[0].clone();
        Ok(BackboneOutput { x4_feature, stage_features })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn backbone_produces_four_stage_features_at_decreasing_resolution() {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let backbone = Backbone::new(vb).unwrap();
        let input = Tensor::zeros((1, 3, 32, 32), DType::F32, &device).unwrap();
        let out = backbone.forward(&input).unwrap();
        assert_eq!(out.stage_features.len(), 4);
        let h0 = out.stage_features[0].dim(2).unwrap();
        let h3 = out.stage_features[3].dim(2).unwrap();
        assert!(h3 < h0);
    }
}
