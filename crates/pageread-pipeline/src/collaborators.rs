//! Trait-bounded collaborators: the orchestrator depends on
//! `LayoutDetector`/`Recognizer` trait objects rather than concrete
//! model types, so tests can substitute in-memory fakes. Model loading
//! is memoized behind a single-flight future so concurrent callers
//! await one load instead of racing to construct it twice.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::Device;
use rand::SeedableRng;
use tokio::sync::OnceCell;
use tokenizers::Tokenizer;

use pageread_core::config::RecognitionOptions;
use pageread_core::model::{LayoutRegion, Page};
use pageread_core::{Error, Result};
use pageread_layout::{LayoutDetector as CandleLayoutModel, LayoutModelConfig};
use pageread_pdf::preprocess::{preprocess_to_fixed_size, IMAGENET_MEAN, IMAGENET_STD};
use pageread_recognizer::{RecognizerModel, RecognizerModelConfig};

/// Runs layout detection for one page, returning ordered, labeled
/// regions already postprocessed into page pixel space.
#[async_trait]
pub trait LayoutDetector: Send + Sync {
    async fn detect(&self, page: &Page, layout_config: &pageread_core::config::LayoutConfig) -> Result<Vec<LayoutRegion>>;
}

/// Runs text/table/formula recognition on one cropped region.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, rgb: &[u8], width: u32, height: u32, prompt: &str, options: &RecognitionOptions) -> Result<String>;
}

fn load_safetensors_var_builder(path: &PathBuf, device: &Device) -> Result<candle_nn::VarBuilder<'static>> {
    let tensors = candle_core::safetensors::load(path, device)
        .map_err(|e| Error::InvalidConfiguration(format!("failed to load {}: {e}", path.display())))?;
    Ok(candle_nn::VarBuilder::from_tensors(tensors, candle_core::DType::F32, device))
}

/// Candle-backed layout detector, loaded once from `model_dir` on first
/// use, guarded under a single-flight task so concurrent callers never
/// race to construct it twice.
pub struct CandleLayoutDetector {
    model_dir: PathBuf,
    device: Device,
    model: OnceCell<CandleLayoutModel>,
}

impl CandleLayoutDetector {
    pub fn new(model_dir: PathBuf, device: Device) -> Self {
        Self { model_dir, device, model: OnceCell::new() }
    }

    async fn model(&self) -> Result<&CandleLayoutModel> {
        self.model
            .get_or_try_init(|| async {
                let weights_path = self.model_dir.join("model.safetensors");
                let vb = load_safetensors_var_builder(&weights_path, &self.device)?;
                let config = LayoutModelConfig::default();
                CandleLayoutModel::new(vb, config, self.device.clone())
                    .map_err(|e| Error::InvalidConfiguration(format!("layout model load failed: {e}")))
            })
            .await
    }
}

#[async_trait]
impl LayoutDetector for CandleLayoutDetector {
    async fn detect(&self, page: &Page, layout_config: &pageread_core::config::LayoutConfig) -> Result<Vec<LayoutRegion>> {
        let model = self.model().await?;
        let input = preprocess_to_fixed_size(page, pageread_layout::INPUT_SIZE, pageread_layout::INPUT_SIZE, &IMAGENET_MEAN, &IMAGENET_STD, &self.device)
            .map_err(pageread_core::Error::from)?;
        let prediction = model.forward(&input).map_err(|e| Error::InvalidConfiguration(format!("layout forward failed: {e}")))?;
        let regions = pageread_layout::postprocess(&prediction, page.width(), page.height(), layout_config)
            .map_err(|e| Error::InvalidConfiguration(format!("layout postprocess failed: {e}")))?;
        Ok(regions)
    }
}

/// Candle-backed GLM-OCR-style recognizer, loaded once from `model_dir`.
pub struct CandleRecognizer {
    model_dir: PathBuf,
    device: Device,
    model: OnceCell<RecognizerModel>,
}

impl CandleRecognizer {
    pub fn new(model_dir: PathBuf, device: Device) -> Self {
        Self { model_dir, device, model: OnceCell::new() }
    }

    async fn model(&self) -> Result<&RecognizerModel> {
        self.model
            .get_or_try_init(|| async {
                let weights_path = self.model_dir.join("model.safetensors");
                let tokenizer_path = self.model_dir.join("tokenizer.json");
                let raw = candle_core::safetensors::load(&weights_path, &self.device)
                    .map_err(|e| Error::InvalidConfiguration(format!("failed to load {}: {e}", weights_path.display())))?;
                let config = RecognizerModelConfig::default();
                let sanitized = pageread_recognizer::weights::sanitize_weights(raw, config.text.num_hidden_layers)
                    .map_err(|e| Error::InvalidConfiguration(format!("weight sanitization failed: {e}")))?;
                let vb = candle_nn::VarBuilder::from_tensors(sanitized, candle_core::DType::F32, &self.device);
                let tokenizer = Tokenizer::from_file(&tokenizer_path)
                    .map_err(|e| Error::InvalidConfiguration(format!("failed to load {}: {e}", tokenizer_path.display())))?;
                RecognizerModel::new(vb, tokenizer, config)
                    .map_err(|e| Error::InvalidConfiguration(format!("recognizer model load failed: {e}")))
            })
            .await
    }
}

#[async_trait]
impl Recognizer for CandleRecognizer {
    async fn recognize(&self, rgb: &[u8], width: u32, height: u32, prompt: &str, options: &RecognitionOptions) -> Result<String> {
        let model = self.model().await?;
        let mut rng = rand::rngs::StdRng::from_os_rng();
        model
            .generate(rgb, width, height, prompt, options, &mut rng)
            .map_err(|e| Error::InvalidConfiguration(format!("recognition failed: {e}")))
    }
}

/// Allows `Arc<dyn LayoutDetector>`/`Arc<dyn Recognizer>` to be shared
/// across concurrently-dispatched recognition jobs.
pub type SharedLayoutDetector = Arc<dyn LayoutDetector>;
pub type SharedRecognizer = Arc<dyn Recognizer>;

/// A fixed-answer stand-in used by orchestrator tests so page loading,
/// cropping, and assembly can be exercised without a real tensor
/// backend.
#[cfg(test)]
pub struct FakeLayoutDetector {
    pub regions: Vec<LayoutRegion>,
}

#[cfg(test)]
#[async_trait]
impl LayoutDetector for FakeLayoutDetector {
    async fn detect(&self, _page: &Page, _layout_config: &pageread_core::config::LayoutConfig) -> Result<Vec<LayoutRegion>> {
        Ok(self.regions.clone())
    }
}

#[cfg(test)]
pub struct FakeRecognizer {
    pub text: String,
}

#[cfg(test)]
#[async_trait]
impl Recognizer for FakeRecognizer {
    async fn recognize(&self, _rgb: &[u8], _width: u32, _height: u32, _prompt: &str, _options: &RecognitionOptions) -> Result<String> {
        Ok(self.text.clone())
    }
}
