//! Causal language model: grouped-query attention, M-RoPE, sandwich
//! RMSNorm, gated MLP.

use candle_core::{DType, Device, Tensor};
use candle_nn::{embedding, linear, linear_no_bias, Embedding, Linear, Module, VarBuilder};

use pageread_tensor::attention::{causal_mask, repeat_kv, scaled_dot_product_attention};
use pageread_tensor::norm::RmsNorm;
use pageread_tensor::rotary::apply_rotary_emb;

use crate::config::TextConfig;
use crate::error::Result;
use crate::kv_cache::KvCacheStack;

struct DecoderLayer {
    input_layernorm: RmsNorm,
    post_self_attn_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
    post_mlp_layernorm: RmsNorm,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    gate_up_proj: Linear,
    down_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    intermediate_size: usize,
}

impl DecoderLayer {
    fn new(vb: VarBuilder, config: &TextConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        Ok(Self {
            input_layernorm: RmsNorm::new(hidden, config.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_self_attn_layernorm: RmsNorm::new(hidden, config.rms_norm_eps, vb.pp("post_self_attn_layernorm"))?,
            post_attention_layernorm: RmsNorm::new(hidden, config.rms_norm_eps, vb.pp("post_attention_layernorm"))?,
            post_mlp_layernorm: RmsNorm::new(hidden, config.rms_norm_eps, vb.pp("post_mlp_layernorm"))?,
            q_proj: linear_no_bias(hidden, config.num_attention_heads * head_dim, vb.pp("self_attn.q_proj"))?,
            k_proj: linear_no_bias(hidden, config.num_key_value_heads * head_dim, vb.pp("self_attn.k_proj"))?,
            v_proj: linear_no_bias(hidden, config.num_key_value_heads * head_dim, vb.pp("self_attn.v_proj"))?,
            o_proj: linear_no_bias(config.num_attention_heads * head_dim, hidden, vb.pp("self_attn.o_proj"))?,
            gate_up_proj: linear_no_bias(hidden, config.intermediate_size * 2, vb.pp("mlp.gate_up_proj"))?,
            down_proj: linear_no_bias(config.intermediate_size, hidden, vb.pp("mlp.down_proj"))?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
            intermediate_size: config.intermediate_size,
        })
    }

    fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, mask: Option<&Tensor>, cache: &mut crate::kv_cache::KvCache) -> Result<Tensor> {
        let seq = x.dim(0)?;
        let residual = x.clone();
        let h = self.input_layernorm.forward(x)?;

        let q = self.q_proj.forward(&h)?.reshape((seq, self.num_heads, self.head_dim))?;
        let k = self.k_proj.forward(&h)?.reshape((seq, self.num_kv_heads, self.head_dim))?;
        let v = self.v_proj.forward(&h)?.reshape((seq, self.num_kv_heads, self.head_dim))?;

        let cos_b = cos.unsqueeze(1)?;
        let sin_b = sin.unsqueeze(1)?;
        let q = apply_rotary_emb(&q, &cos_b, &sin_b)?;
        let k = apply_rotary_emb(&k, &cos_b, &sin_b)?;

        let q = q.transpose(0, 1)?.contiguous()?; // [heads, seq, head_dim]
        let k = k.transpose(0, 1)?.contiguous()?; // [kv_heads, seq, head_dim]
        let v = v.transpose(0, 1)?.contiguous()?;

        let (k_full, v_full) = cache.append(&k, &v)?;
        let n_rep = self.num_heads / self.num_kv_heads;
        // repeat_kv expects an explicit batch axis; the cache omits it
        // since one cache always belongs to exactly one stream.
        let k_rep = repeat_kv(&k_full.unsqueeze(0)?, n_rep)?.squeeze(0)?;
        let v_rep = repeat_kv(&v_full.unsqueeze(0)?, n_rep)?.squeeze(0)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn = scaled_dot_product_attention(&q, &k_rep, &v_rep, mask, scale)?;
        let attn = attn.transpose(0, 1)?.reshape((seq, self.num_heads * self.head_dim))?;
        let attn = self.o_proj.forward(&attn)?;
        let attn = self.post_self_attn_layernorm.forward(&attn)?;
        let x = (residual + attn)?;

        let residual = x.clone();
        let h = self.post_attention_layernorm.forward(&x)?;
        let gate_up = self.gate_up_proj.forward(&h)?;
        let gate = gate_up.narrow(1, 0, self.intermediate_size)?;
        let up = gate_up.narrow(1, self.intermediate_size, self.intermediate_size)?;
        let mlp = self.down_proj.forward(&(candle_nn::ops::silu(&gate)? * up)?)?;
        let mlp = self.post_mlp_layernorm.forward(&mlp)?;
        Ok((residual + mlp)?)
    }
}

pub struct LanguageModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    final_norm: RmsNorm,
    lm_head: Linear,
    config: TextConfig,
}

impl LanguageModel {
    pub fn new(vb: VarBuilder, config: TextConfig) -> Result<Self> {
        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb.pp("model.embed_tokens"))?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::new(vb.pp(format!("model.layers.{i}")), &config)?);
        }
        let final_norm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, vb.pp("model.norm"))?;
        let lm_head = linear(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?;
        Ok(Self { embed_tokens, layers, final_norm, lm_head, config })
    }

    pub fn embed_tokens(&self, ids: &Tensor) -> Result<Tensor> {
        Ok(self.embed_tokens.forward(ids)?)
    }

    pub fn device(&self) -> &Device {
        self.lm_head.weight().device()
    }

    /// Runs `embeds` (`[seq, hidden]`) through every decoder layer and
    /// returns logits (`[seq, vocab]`). `positions` supplies one
    /// `[t,h,w]` M-RoPE triple per row of `embeds`.
    pub fn forward(&self, embeds: &Tensor, positions: &[[i64; 3]], cache: &mut KvCacheStack) -> Result<Tensor> {
        let seq = embeds.dim(0)?;
        let offset = cache.offset();
        let (cos, sin) = crate::mrope::build_mrope_cos_sin(positions, self.config.head_dim(), self.config.rope_theta, embeds.device())?;
        let mask = causal_mask(seq, offset + seq, offset, embeds.device())?;
        let mask = if seq == 1 { None } else { Some(&mask) };

        let mut x = embeds.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x, &cos, &sin, mask, cache.layer(i))?;
        }
        let x = self.final_norm.forward(&x)?;
        Ok(self.lm_head.forward(&x)?.to_dtype(DType::F32)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tiny_config() -> TextConfig {
        TextConfig {
            vocab_size: 32,
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            intermediate_size: 20,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            max_position_embeddings: 128,
        }
    }

    #[test]
    fn forward_prefill_then_decode_grows_cache() {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config();
        let model = LanguageModel::new(vb, config.clone()).unwrap();
        let mut cache = KvCacheStack::new(
            config.num_hidden_layers,
            config.num_key_value_heads,
            config.head_dim(),
            &device,
            DType::F32,
        )
        .unwrap();

        let prefill = Tensor::zeros((3, config.hidden_size), DType::F32, &device).unwrap();
        let prefill_positions = vec![[0i64, 0, 0], [1, 1, 1], [2, 2, 2]];
        let logits = model.forward(&prefill, &prefill_positions, &mut cache).unwrap();
        assert_eq!(logits.dims(), &[3, config.vocab_size]);
        assert_eq!(cache.offset(), 3);

        let decode = Tensor::zeros((1, config.hidden_size), DType::F32, &device).unwrap();
        let decode_positions = vec![[3i64, 3, 3]];
        let logits = model.forward(&decode, &decode_positions, &mut cache).unwrap();
        assert_eq!(logits.dims(), &[1, config.vocab_size]);
        assert_eq!(cache.offset(), 4);
    }
}
