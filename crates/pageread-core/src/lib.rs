//! Shared data model, configuration, and error taxonomy for the
//! pageread document-understanding engine.

pub mod config;
pub mod error;
pub mod model;

pub use config::{Config, LayoutConfig, MergeMode, MergeRule, ParseOptions, PromptConfig, RecognitionOptions};
pub use error::{Error, Result};
pub use model::{
    BBox, DiagnosticBundle, LayoutRegion, ModelDeliveryState, ModelFileRecord,
    ModelSnapshotRecord, OCRDocumentResult, Page, PageResult, Point, PipelineTask,
    RecognitionJobKey, RegionRecord, truncated_sha256_hex16,
};
