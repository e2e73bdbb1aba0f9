//! Top-level recognizer: wires the vision tower and language model
//! together and drives the generation loop.

use candle_core::{DType, Tensor};
use rand::Rng;
use tokenizers::Tokenizer;

use pageread_core::config::RecognitionOptions;

use crate::config::RecognizerModelConfig;
use crate::error::Result;
use crate::kv_cache::KvCacheStack;
use crate::merge::merge_multimodal_embeddings;
use crate::mrope::get_rope_index;
use crate::preprocess::prepare_input;
use crate::sampler::{sample, SamplingParams};
use crate::text::LanguageModel;
use crate::vision::VisionTower;

pub struct RecognizerModel {
    vision: VisionTower,
    language: LanguageModel,
    tokenizer: Tokenizer,
    config: RecognizerModelConfig,
}

impl RecognizerModel {
    pub fn new(vb: candle_nn::VarBuilder, tokenizer: Tokenizer, config: RecognizerModelConfig) -> Result<Self> {
        let vision = VisionTower::new(vb.pp("vision_tower"), config.vision.clone())?;
        let language = LanguageModel::new(vb.pp("language_model"), config.text.clone())?;
        Ok(Self { vision, language, tokenizer, config })
    }

    /// Runs recognition on one RGB image crop, returning the decoded
    /// text with outer whitespace trimmed.
    pub fn generate(&self, rgb: &[u8], width: u32, height: u32, prompt: &str, options: &RecognitionOptions, rng: &mut impl Rng) -> Result<String> {
        let prepared = prepare_input(rgb, width, height, prompt, &self.tokenizer, &self.config)?;
        let device = self.language.device();

        let pixel_values = Tensor::from_vec(
            prepared.pixel_values.clone(),
            (prepared.pixel_values.len() / self.config.vision.patch_feature_len(), self.config.vision.patch_feature_len()),
            device,
        )?;
        let vision_features = self.vision.forward(&pixel_values, &prepared.image_grid_thw, device)?;

        let ids_tensor = Tensor::from_vec(prepared.input_ids.clone(), prepared.input_ids.len(), device)?;
        let text_embeds = self.language.embed_tokens(&ids_tensor)?;
        let embeds = merge_multimodal_embeddings(&prepared.input_ids, &text_embeds, &vision_features, &self.config.tokens)?;

        let (positions, _rope_delta) = get_rope_index(
            &prepared.input_ids,
            &prepared.image_grid_thw,
            &[],
            &self.config.tokens,
            self.config.vision.spatial_merge_size,
        );

        let mut cache = KvCacheStack::new(
            self.config.text.num_hidden_layers,
            self.config.text.num_key_value_heads,
            self.config.text.head_dim(),
            device,
            DType::F32,
        )?;

        let total = embeds.dim(0)?;
        let step = options.prefill_step_size;
        let mut logits = if total > step && total > 1 {
            // Chunk every token but the last through the cache, then feed
            // the final prompt token on its own so the loop below always
            // starts from a fresh single-row decode step.
            let prefill_len = total - 1;
            let mut start = 0usize;
            while start < prefill_len {
                let chunk_len = step.min(prefill_len - start);
                let chunk = embeds.narrow(0, start, chunk_len)?;
                let chunk_positions = &positions[start..start + chunk_len];
                self.language.forward(&chunk, chunk_positions, &mut cache)?;
                start += chunk_len;
            }
            let tail = embeds.narrow(0, prefill_len, 1)?;
            let tail_positions = &positions[prefill_len..prefill_len + 1];
            self.language.forward(&tail, tail_positions, &mut cache)?
        } else {
            self.language.forward(&embeds, &positions, &mut cache)?
        };

        let params = SamplingParams {
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            repetition_penalty: options.repetition_penalty,
        };

        let mut generated: Vec<u32> = Vec::with_capacity(options.max_tokens);
        let mut next_position = positions.last().map(|p| p[0] + 1).unwrap_or(0);
        for _ in 0..options.max_tokens {
            let last_row = logits.dim(0)? - 1;
            let row = logits.narrow(0, last_row, 1)?.flatten_all()?.to_vec1::<f32>()?;
            let token = sample(&row, &generated, &params, rng);
            if self.config.tokens.eos_token_ids.contains(&token) {
                break;
            }
            generated.push(token);

            let token_tensor = Tensor::from_vec(vec![token], 1, device)?;
            let token_embed = self.language.embed_tokens(&token_tensor)?;
            let token_position = vec![[next_position; 3]];
            next_position += 1;
            logits = self.language.forward(&token_embed, &token_position, &mut cache)?;
        }

        let decoded = self
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| crate::error::Error::Tokenizer(e.to_string()))?;
        Ok(decoded.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tiny_config() -> RecognizerModelConfig {
        let mut config = RecognizerModelConfig::default();
        config.vision.hidden_size = 16;
        config.vision.depth = 1;
        config.vision.num_heads = 4;
        config.vision.patch_size = 4;
        config.vision.temporal_patch_size = 1;
        config.vision.spatial_merge_size = 2;
        config.vision.intermediate_size = 24;
        config.vision.out_hidden_size = 8;
        config.text.vocab_size = 64;
        config.text.hidden_size = 8;
        config.text.num_hidden_layers = 1;
        config.text.num_attention_heads = 2;
        config.text.num_key_value_heads = 1;
        config.text.intermediate_size = 12;
        config.tokens.image_token_id = 5;
        config.tokens.eos_token_ids = vec![2];
        config.resize.min_pixels = 16 * 16;
        config.resize.max_pixels = 16 * 16 * 4;
        config
    }

    #[test]
    fn tiny_vision_and_language_towers_construct_and_run() {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config();

        let vision = VisionTower::new(vb.pp("vision_tower"), config.vision.clone()).unwrap();
        let grid_h = 4;
        let grid_w = 4;
        let patches = Tensor::zeros((grid_h * grid_w, config.vision.patch_feature_len()), DType::F32, &device).unwrap();
        let features = vision.forward(&patches, &[(1, grid_h, grid_w)], &device).unwrap();
        let merge2 = config.vision.spatial_merge_size * config.vision.spatial_merge_size;
        assert_eq!(features.dims(), &[grid_h * grid_w / merge2, config.vision.out_hidden_size]);

        let language = LanguageModel::new(vb.pp("language_model"), config.text.clone()).unwrap();
        let mut cache = KvCacheStack::new(
            config.text.num_hidden_layers,
            config.text.num_key_value_heads,
            config.text.head_dim(),
            &device,
            DType::F32,
        )
        .unwrap();
        let embeds = Tensor::zeros((2, config.text.hidden_size), DType::F32, &device).unwrap();
        let positions = vec![[0i64, 0, 0], [1, 1, 1]];
        let logits = language.forward(&embeds, &positions, &mut cache).unwrap();
        assert_eq!(logits.dims(), &[2, config.text.vocab_size]);
    }
}
