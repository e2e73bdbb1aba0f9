//! Vision tower: patch embedding, per-patch rotary, windowed
//! self-attention, gated-MLP blocks, spatial downsample, patch merger.

use candle_core::{Device, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};

use pageread_tensor::attention::scaled_dot_product_attention;
use pageread_tensor::norm::RmsNorm;
use pageread_tensor::rotary::{apply_rotary_emb, inverse_frequencies};

use crate::config::VisionConfig;
use crate::error::Result;

/// Sequence positions in patchify's own emission order: grouped by
/// `spatial_merge_size x spatial_merge_size` block, matching the
/// contiguous grouping the downsample step below consumes directly.
pub fn patch_positions(grid_h: usize, grid_w: usize, merge: usize) -> Vec<(u32, u32)> {
    let mut positions = Vec::with_capacity(grid_h * grid_w);
    for bh in 0..grid_h / merge {
        for bw in 0..grid_w / merge {
            for mh in 0..merge {
                for mw in 0..merge {
                    positions.push(((bh * merge + mh) as u32, (bw * merge + mw) as u32));
                }
            }
        }
    }
    positions
}

/// Cumulative sequence length boundaries: one boundary per temporal
/// frame, `t` copies of `h*w` per image, so attention never crosses an
/// image (or frame) boundary.
pub fn cu_seqlens(grids: &[(usize, usize, usize)]) -> Vec<usize> {
    let mut bounds = vec![0usize];
    let mut total = 0usize;
    for &(t, h, w) in grids {
        for _ in 0..t {
            total += h * w;
            bounds.push(total);
        }
    }
    bounds
}

/// Builds the per-patch rotary `cos`/`sin` tables from a 2-way (h,w)
/// interleave: half the rotary width encodes row position, half encodes
/// column position.
fn rotary_tables(positions: &[(u32, u32)], head_dim: usize, theta: f32, device: &Device) -> Result<(Tensor, Tensor)> {
    let half = head_dim / 2;
    let inv_freq = inverse_frequencies(half, theta, device)?;
    let inv_freq = inv_freq.to_vec1::<f32>()?;
    let quarter = inv_freq.len();
    let mut emb = Vec::with_capacity(positions.len() * head_dim);
    for &(h, w) in positions {
        let mut freqs = Vec::with_capacity(half);
        for &f in &inv_freq {
            freqs.push(h as f32 * f);
        }
        for &f in &inv_freq {
            freqs.push(w as f32 * f);
        }
        // freqs now has length 2*quarter == half; duplicate to fill head_dim.
        emb.extend_from_slice(&freqs);
        emb.extend_from_slice(&freqs);
    }
    let _ = quarter;
    let emb = Tensor::from_vec(emb, (positions.len(), head_dim), device)?;
    Ok((emb.cos()?, emb.sin()?))
}

struct VisionBlock {
    norm1: RmsNorm,
    norm2: RmsNorm,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    out_proj: Linear,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl VisionBlock {
    fn new(vb: VarBuilder, config: &VisionConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        Ok(Self {
            norm1: RmsNorm::new(hidden, config.rms_norm_eps, vb.pp("norm1"))?,
            norm2: RmsNorm::new(hidden, config.rms_norm_eps, vb.pp("norm2"))?,
            q_proj: linear(hidden, hidden, vb.pp("attn.q_proj"))?,
            k_proj: linear(hidden, hidden, vb.pp("attn.k_proj"))?,
            v_proj: linear(hidden, hidden, vb.pp("attn.v_proj"))?,
            q_norm: RmsNorm::new(head_dim, config.rms_norm_eps, vb.pp("attn.q_norm"))?,
            k_norm: RmsNorm::new(head_dim, config.rms_norm_eps, vb.pp("attn.k_norm"))?,
            out_proj: linear(hidden, hidden, vb.pp("attn.out_proj"))?,
            gate_proj: linear(hidden, config.intermediate_size, vb.pp("mlp.gate_proj"))?,
            up_proj: linear(hidden, config.intermediate_size, vb.pp("mlp.up_proj"))?,
            down_proj: linear(config.intermediate_size, hidden, vb.pp("mlp.down_proj"))?,
            num_heads: config.num_heads,
            head_dim,
        })
    }

    /// `x` is `[seq, hidden]`. `cos`/`sin` are `[seq, head_dim]`.
    /// Attention runs windowed per `cu_seqlens` boundary (no cross-image
    /// attention).
    fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, cu_seqlens: &[usize]) -> Result<Tensor> {
        let seq = x.dim(0)?;
        let residual = x.clone();
        let normed = self.norm1.forward(x)?;

        let q = self.q_proj.forward(&normed)?.reshape((seq, self.num_heads, self.head_dim))?;
        let k = self.k_proj.forward(&normed)?.reshape((seq, self.num_heads, self.head_dim))?;
        let v = self.v_proj.forward(&normed)?.reshape((seq, self.num_heads, self.head_dim))?;

        let q = self.q_norm.forward(&q)?;
        let k = self.k_norm.forward(&k)?;

        let cos_b = cos.unsqueeze(1)?;
        let sin_b = sin.unsqueeze(1)?;
        let q = apply_rotary_emb(&q, &cos_b, &sin_b)?;
        let k = apply_rotary_emb(&k, &cos_b, &sin_b)?;

        let q = q.transpose(0, 1)?.contiguous()?; // [heads, seq, head_dim]
        let k = k.transpose(0, 1)?.contiguous()?;
        let v = v.transpose(0, 1)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut windows = Vec::with_capacity(cu_seqlens.len().saturating_sub(1));
        for pair in cu_seqlens.windows(2) {
            let (start, end) = (pair[0], pair[1]);
            let len = end - start;
            if len == 0 {
                continue;
            }
            let qw = q.narrow(1, start, len)?;
            let kw = k.narrow(1, start, len)?;
            let vw = v.narrow(1, start, len)?;
            windows.push(scaled_dot_product_attention(&qw, &kw, &vw, None, scale)?);
        }
        let attn = Tensor::cat(&windows, 1)?; // [heads, seq, head_dim]
        let attn = attn.transpose(0, 1)?.reshape((seq, self.num_heads * self.head_dim))?;
        let attn = self.out_proj.forward(&attn)?;
        let x = (residual + attn)?;

        let residual = x.clone();
        let normed = self.norm2.forward(&x)?;
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(&normed)?)?;
        let up = self.up_proj.forward(&normed)?;
        let mlp = self.down_proj.forward(&(gate * up)?)?;
        Ok((residual + mlp)?)
    }
}

struct PatchMerger {
    proj: Linear,
    norm: LayerNorm,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl PatchMerger {
    fn new(vb: VarBuilder, config: &VisionConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            proj: linear(hidden, hidden, vb.pp("proj"))?,
            norm: layer_norm(hidden, config.rms_norm_eps, vb.pp("post_projection_norm"))?,
            gate_proj: linear(hidden, config.intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear(hidden, config.intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear(config.intermediate_size, config.out_hidden_size, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let activation = self.norm.forward(&self.proj.forward(x)?)?.gelu()?;
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(&activation)?)?;
        let up = self.up_proj.forward(&activation)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

pub struct VisionTower {
    patch_embed: Linear,
    blocks: Vec<VisionBlock>,
    post_norm: RmsNorm,
    downsample: Linear,
    merger: PatchMerger,
    config: VisionConfig,
}

impl VisionTower {
    pub fn new(vb: VarBuilder, config: VisionConfig) -> Result<Self> {
        let patch_embed = linear(config.patch_feature_len(), config.hidden_size, vb.pp("patch_embed.proj"))?;
        let mut blocks = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            blocks.push(VisionBlock::new(vb.pp(format!("blocks.{i}")), &config)?);
        }
        let post_norm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, vb.pp("post_layernorm"))?;
        let merge2 = config.spatial_merge_size * config.spatial_merge_size;
        let downsample = linear(config.hidden_size * merge2, config.hidden_size, vb.pp("downsample"))?;
        let merger = PatchMerger::new(vb.pp("merger"), &config)?;
        Ok(Self { patch_embed, blocks, post_norm, downsample, merger, config })
    }

    /// `patches` is the flat `(n_patches, feature_len)` matrix from
    /// `preprocess::patchify`; `grids` lists one `(t,h,w)` per image in
    /// the same concatenation order. Returns the merged feature sequence
    /// `[n_patches / merge^2, out_hidden_size]`.
    pub fn forward(&self, patches: &Tensor, grids: &[(usize, usize, usize)], device: &Device) -> Result<Tensor> {
        let mut positions = Vec::new();
        for &(t, h, w) in grids {
            let per_frame = patch_positions(h, w, self.config.spatial_merge_size);
            for _ in 0..t {
                positions.extend(per_frame.iter().copied());
            }
        }
        let head_dim = self.config.head_dim();
        let (cos, sin) = rotary_tables(&positions, head_dim, self.config.rope_theta, device)?;
        let bounds = cu_seqlens(grids);

        let mut x = self.patch_embed.forward(patches)?;
        for block in &self.blocks {
            x = block.forward(&x, &cos, &sin, &bounds)?;
        }
        x = self.post_norm.forward(&x)?;

        let merge2 = self.config.spatial_merge_size * self.config.spatial_merge_size;
        let seq = x.dim(0)?;
        let grouped = x.reshape((seq / merge2, merge2 * self.config.hidden_size))?;
        let downsampled = self.downsample.forward(&grouped)?;
        self.merger.forward(&downsampled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn tiny_config() -> VisionConfig {
        VisionConfig {
            hidden_size: 16,
            depth: 2,
            num_heads: 4,
            patch_size: 4,
            temporal_patch_size: 1,
            spatial_merge_size: 2,
            in_channels: 3,
            intermediate_size: 32,
            rms_norm_eps: 1e-6,
            rope_theta: 10000.0,
            out_hidden_size: 24,
        }
    }

    #[test]
    fn patch_positions_groups_by_merge_block() {
        let positions = patch_positions(4, 4, 2);
        assert_eq!(positions.len(), 16);
        assert_eq!(positions[0], (0, 0));
        assert_eq!(positions[1], (0, 1));
        assert_eq!(positions[2], (1, 0));
        assert_eq!(positions[3], (1, 1));
    }

    #[test]
    fn cu_seqlens_accumulates_per_frame() {
        let bounds = cu_seqlens(&[(1, 2, 2), (2, 1, 1)]);
        assert_eq!(bounds, vec![0, 4, 5, 6]);
    }

    #[test]
    fn vision_tower_forward_shape() {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config();
        let tower = VisionTower::new(vb, config.clone()).unwrap();
        let grid_h = 4;
        let grid_w = 4;
        let n_patches = grid_h * grid_w;
        let patches = Tensor::zeros((n_patches, config.patch_feature_len()), DType::F32, &device).unwrap();
        let out = tower.forward(&patches, &[(1, grid_h, grid_w)], &device).unwrap();
        let merge2 = config.spatial_merge_size * config.spatial_merge_size;
        assert_eq!(out.dims(), &[n_patches / merge2, config.out_hidden_size]);
    }
}
