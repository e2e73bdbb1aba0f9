//! Recognizer model hyperparameters. Values mirror the
//! shipped `mlx-community/GLM-OCR-bf16` config; callers load an override
//! from the snapshot's `config.json` in a full deployment, but the
//! defaults here are what test fixtures and the CLI fall back to.

/// Vision tower hyperparameters.
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub hidden_size: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub patch_size: usize,
    pub temporal_patch_size: usize,
    pub spatial_merge_size: usize,
    pub in_channels: usize,
    pub intermediate_size: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f32,
    pub out_hidden_size: usize,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            hidden_size: 1536,
            depth: 24,
            num_heads: 12,
            patch_size: 14,
            temporal_patch_size: 2,
            spatial_merge_size: 2,
            in_channels: 3,
            intermediate_size: 4224,
            rms_norm_eps: 1e-6,
            rope_theta: 10000.0,
            out_hidden_size: 4096,
        }
    }
}

impl VisionConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Flattened per-patch feature width `C * temporal_patch * patch^2`,
    /// the row width of the patchified input.
    pub fn patch_feature_len(&self) -> usize {
        self.in_channels * self.temporal_patch_size * self.patch_size * self.patch_size
    }
}

/// Causal language model hyperparameters.
#[derive(Debug, Clone)]
pub struct TextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub intermediate_size: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f32,
    pub max_position_embeddings: usize,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            vocab_size: 151552,
            hidden_size: 4096,
            num_hidden_layers: 16,
            num_attention_heads: 32,
            num_key_value_heads: 2,
            intermediate_size: 13696,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            max_position_embeddings: 32768,
        }
    }
}

impl TextConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Token ids and smart-resize bounds shared by preprocessing, multimodal
/// merge, and M-RoPE indexing.
#[derive(Debug, Clone)]
pub struct RecognizerTokens {
    pub image_token_id: u32,
    pub video_token_id: u32,
    pub image_start_token_id: u32,
    pub eos_token_ids: Vec<u32>,
}

impl Default for RecognizerTokens {
    fn default() -> Self {
        Self {
            image_token_id: 151343,
            video_token_id: 151344,
            image_start_token_id: 151339,
            eos_token_ids: vec![151329, 151336, 151338],
        }
    }
}

/// Smart-resize bounds.
#[derive(Debug, Clone)]
pub struct ResizeConfig {
    pub min_pixels: usize,
    pub max_pixels: usize,
    pub max_aspect_ratio: f64,
    pub temporal_patch_size: usize,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            min_pixels: 56 * 56,
            max_pixels: 14 * 14 * 4 * 1280,
            max_aspect_ratio: 200.0,
            temporal_patch_size: 2,
        }
    }
}

/// Chat prompt template with an `{prompt}` substitution point.
pub const CHAT_TEMPLATE: &str = "[gMASK]<sop><|user|>\n<|begin_of_image|><|image|><|end_of_image|>{prompt}<|assistant|>\n";

/// Per-channel normalization constants (ImageNet-style, matching the
/// checkpoint's Siglip preprocessing).
pub const PIXEL_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const PIXEL_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Top-level recognizer model configuration.
#[derive(Debug, Clone, Default)]
pub struct RecognizerModelConfig {
    pub vision: VisionConfig,
    pub text: TextConfig,
    pub tokens: RecognizerTokens,
    pub resize: ResizeConfig,
}
