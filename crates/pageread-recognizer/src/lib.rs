//! Multimodal VLM recognizer: vision tower, M-RoPE causal language model,
//! multimodal embedding merge, sampling, and the top-level generation
//! loop.

pub mod config;
pub mod error;
pub mod kv_cache;
pub mod merge;
pub mod model;
pub mod mrope;
pub mod preprocess;
pub mod sampler;
pub mod text;
pub mod vision;
pub mod weights;

pub use config::RecognizerModelConfig;
pub use error::{Error, Result};
pub use model::RecognizerModel;
pub use preprocess::PreparedInput;
pub use sampler::SamplingParams;
