//! Public configuration and validation scaffolding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Options accepted by a single `parse` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseOptions {
    #[serde(default = "default_true")]
    pub include_markdown: bool,
    #[serde(default = "default_true")]
    pub include_diagnostics: bool,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            include_markdown: true,
            include_diagnostics: true,
            max_pages: None,
        }
    }
}

impl ParseOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(max_pages) = self.max_pages {
            if max_pages == 0 {
                return Err(Error::InvalidConfiguration(
                    "max_pages must be greater than zero when set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Sampling/decoding knobs forwarded to the recognizer's generation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub prefill_step_size: usize,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.0,
            prefill_step_size: 2048,
            top_p: 1.0,
            top_k: 1,
            repetition_penalty: 1.0,
        }
    }
}

impl RecognitionOptions {
    fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(Error::InvalidConfiguration(
                "recognition_options.max_tokens must be greater than zero".to_string(),
            ));
        }
        if self.prefill_step_size == 0 {
            return Err(Error::InvalidConfiguration(
                "recognition_options.prefill_step_size must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::InvalidConfiguration(
                "recognition_options.top_p must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Task-specific recognition prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptConfig {
    pub no_layout: String,
    pub text: String,
    pub table: String,
    pub formula: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            no_layout: "Recognize all text in the image.".to_string(),
            text: "Recognize the text in the image.".to_string(),
            table: "Recognize the table in the image as HTML.".to_string(),
            formula: "Recognize the formula in the image as LaTeX.".to_string(),
        }
    }
}

impl PromptConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("no_layout", &self.no_layout),
            ("text", &self.text),
            ("table", &self.table),
            ("formula", &self.formula),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfiguration(format!(
                    "prompts.{name} must be a non-empty string"
                )));
            }
        }
        Ok(())
    }

    /// Pure mapping from a recognition task to the prompt text that
    /// should be embedded in the chat template.
    pub fn for_task(&self, task: crate::model::PipelineTask) -> Option<&str> {
        use crate::model::PipelineTask::*;
        match task {
            Text => Some(&self.text),
            Table => Some(&self.table),
            Formula => Some(&self.formula),
            Skip | Abandon => None,
        }
    }
}

/// How detections of one label relate to another during the
/// containment filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    Large,
    Small,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRule {
    pub mode: MergeMode,
    pub labels: Vec<String>,
}

/// Layout postprocessing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutConfig {
    pub threshold: f32,
    #[serde(default)]
    pub threshold_by_class: BTreeMap<String, f32>,
    #[serde(default = "default_true")]
    pub layout_nms: bool,
    pub unclip_ratio: (f32, f32),
    #[serde(default)]
    pub merge_bboxes_mode: BTreeMap<String, MergeRule>,
    pub label_task_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub id2label: BTreeMap<u32, String>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        let mut label_task_mapping = BTreeMap::new();
        for label in ["table"] {
            label_task_mapping.insert(label.to_string(), "table".to_string());
        }
        for label in ["formula", "formula_number"] {
            label_task_mapping.insert(label.to_string(), "formula".to_string());
        }
        for label in ["abandon"] {
            label_task_mapping.insert(label.to_string(), "abandon".to_string());
        }
        Self {
            threshold: 0.3,
            threshold_by_class: BTreeMap::new(),
            layout_nms: true,
            unclip_ratio: (1.0, 1.0),
            merge_bboxes_mode: BTreeMap::new(),
            label_task_mapping,
            id2label: BTreeMap::new(),
        }
    }
}

impl LayoutConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::InvalidConfiguration(
                "layout.threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.unclip_ratio.0 < 1.0 || self.unclip_ratio.1 < 1.0 {
            return Err(Error::InvalidConfiguration(
                "layout.unclip_ratio components must each be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective score threshold for a class, falling back to the
    /// global default when no per-class override is set.
    pub fn threshold_for(&self, label: &str) -> f32 {
        self.threshold_by_class
            .get(label)
            .copied()
            .unwrap_or(self.threshold)
            .max(self.threshold)
    }

    pub fn task_for_label(&self, label: &str) -> crate::model::PipelineTask {
        use crate::model::PipelineTask;
        match self.label_task_mapping.get(label).map(String::as_str) {
            Some("table") => PipelineTask::Table,
            Some("formula") => PipelineTask::Formula,
            Some("skip") => PipelineTask::Skip,
            Some("abandon") => PipelineTask::Abandon,
            _ => PipelineTask::Text,
        }
    }
}

/// Top-level, immutable engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_recognizer_model_id")]
    pub recognizer_model_id: String,
    #[serde(default = "default_layout_model_id")]
    pub layout_model_id: String,
    #[serde(default = "default_max_concurrent_recognitions")]
    pub max_concurrent_recognitions: u32,
    #[serde(default = "default_true")]
    pub enable_layout: bool,
    #[serde(default)]
    pub recognition_options: RecognitionOptions,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default = "default_pdf_dpi")]
    pub pdf_dpi: u32,
    #[serde(default = "default_pdf_max_rendered_long_side")]
    pub pdf_max_rendered_long_side: u32,
    #[serde(default)]
    pub default_max_pages: Option<u32>,
}

fn default_recognizer_model_id() -> String {
    "mlx-community/GLM-OCR-bf16".to_string()
}

fn default_layout_model_id() -> String {
    "PaddlePaddle/PP-DocLayoutV3_safetensors".to_string()
}

fn default_max_concurrent_recognitions() -> u32 {
    1
}

fn default_pdf_dpi() -> u32 {
    200
}

fn default_pdf_max_rendered_long_side() -> u32 {
    3500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recognizer_model_id: default_recognizer_model_id(),
            layout_model_id: default_layout_model_id(),
            max_concurrent_recognitions: default_max_concurrent_recognitions(),
            enable_layout: true,
            recognition_options: RecognitionOptions::default(),
            prompts: PromptConfig::default(),
            layout: LayoutConfig::default(),
            pdf_dpi: default_pdf_dpi(),
            pdf_max_rendered_long_side: default_pdf_max_rendered_long_side(),
            default_max_pages: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_recognitions < 1 {
            return Err(Error::InvalidConfiguration(
                "max_concurrent_recognitions must be at least 1".to_string(),
            ));
        }
        if self.recognizer_model_id.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "recognizer_model_id must be a non-empty string".to_string(),
            ));
        }
        if self.layout_model_id.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "layout_model_id must be a non-empty string".to_string(),
            ));
        }
        if self.pdf_dpi == 0 {
            return Err(Error::InvalidConfiguration(
                "pdf_dpi must be greater than zero".to_string(),
            ));
        }
        if self.pdf_max_rendered_long_side == 0 {
            return Err(Error::InvalidConfiguration(
                "pdf_max_rendered_long_side must be greater than zero".to_string(),
            ));
        }
        self.recognition_options.validate()?;
        self.prompts.validate()?;
        self.layout.validate()?;
        Ok(())
    }

    /// `min(options.max_pages, self.default_max_pages)`, preferring
    /// whichever is set.
    pub fn effective_max_pages(&self, options_max_pages: Option<u32>) -> Option<u32> {
        match (options_max_pages, self.default_max_pages) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PipelineTask;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_max_concurrent_recognitions_is_rejected() {
        let mut config = Config::default();
        config.max_concurrent_recognitions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_options_reject_zero_max_pages() {
        let options = ParseOptions {
            max_pages: Some(0),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn effective_max_pages_takes_the_minimum() {
        let mut config = Config::default();
        config.default_max_pages = Some(2);
        assert_eq!(config.effective_max_pages(Some(5)), Some(2));
        assert_eq!(config.effective_max_pages(None), Some(2));
        config.default_max_pages = None;
        assert_eq!(config.effective_max_pages(Some(5)), Some(5));
        assert_eq!(config.effective_max_pages(None), None);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.recognizer_model_id, config.recognizer_model_id);
        assert_eq!(back.layout.unclip_ratio, config.layout.unclip_ratio);
    }

    #[test]
    fn threshold_for_class_never_goes_below_global() {
        let mut layout = LayoutConfig::default();
        layout.threshold = 0.3;
        layout.threshold_by_class.insert("table".to_string(), 0.1);
        assert_eq!(layout.threshold_for("table"), 0.3);
        layout.threshold_by_class.insert("table".to_string(), 0.5);
        assert_eq!(layout.threshold_for("table"), 0.5);
    }

    #[test]
    fn task_for_label_defaults_to_text() {
        let layout = LayoutConfig::default();
        assert_eq!(layout.task_for_label("doc_title"), PipelineTask::Text);
        assert_eq!(layout.task_for_label("table"), PipelineTask::Table);
        assert_eq!(layout.task_for_label("abandon"), PipelineTask::Abandon);
    }

    #[test]
    fn prompt_for_task_is_none_for_skip_and_abandon() {
        let prompts = PromptConfig::default();
        assert!(prompts.for_task(PipelineTask::Skip).is_none());
        assert!(prompts.for_task(PipelineTask::Abandon).is_none());
        assert!(prompts.for_task(PipelineTask::Table).is_some());
    }
}
