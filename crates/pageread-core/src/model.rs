//! Core data model shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An RGB bitmap produced by the page loader. Immutable once constructed,
/// owned by the orchestrator for the duration of one `parse` call.
#[derive(Debug, Clone)]
pub struct Page {
    width: u32,
    height: u32,
    /// Tightly packed RGB8 rows, `width * height * 3` bytes.
    rgb: Vec<u8>,
}

impl Page {
    pub fn new(width: u32, height: u32, rgb: Vec<u8>) -> Self {
        debug_assert_eq!(rgb.len(), width as usize * height as usize * 3);
        Self { width, height, rgb }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rgb(&self) -> &[u8] {
        &self.rgb
    }

    pub fn is_landscape(&self) -> bool {
        self.width > self.height
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// The pipeline task a recognized region is routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineTask {
    Text,
    Table,
    Formula,
    Skip,
    Abandon,
}

impl PipelineTask {
    /// Returns `None` for tasks that never reach the recognizer
    /// (`skip`/`abandon`).
    pub fn ocr_task(self) -> Option<PipelineTask> {
        match self {
            PipelineTask::Skip | PipelineTask::Abandon => None,
            other => Some(other),
        }
    }
}

/// A 2D point in a polygon, normalized or absolute per context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// An axis-aligned box `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        (self.width().max(0.0)) * (self.height().max(0.0))
    }

    pub fn is_degenerate(&self) -> bool {
        self.x1 >= self.x2 || self.y1 >= self.y2
    }

    /// Intersection-over-own-area, used by the containment filter.
    pub fn intersection_over_own_area(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let iw = (ix2 - ix1).max(0.0);
        let ih = (iy2 - iy1).max(0.0);
        let inter = iw * ih;
        let own = self.area();
        if own <= 0.0 {
            0.0
        } else {
            inter / own
        }
    }

    /// Inclusive-pixel IoU as used by the NMS step: areas are computed
    /// as `(w+1)(h+1)` over integer boxes.
    pub fn inclusive_iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let iw = (ix2 - ix1 + 1.0).max(0.0);
        let ih = (iy2 - iy1 + 1.0).max(0.0);
        let inter = iw * ih;
        let area_a = (self.width() + 1.0).max(0.0) * (self.height() + 1.0).max(0.0);
        let area_b = (other.width() + 1.0).max(0.0) * (other.height() + 1.0).max(0.0);
        let union = area_a + area_b - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// A region located and ordered by the layout detector, after
/// postprocessing. `index` is assigned in reading order; `order` is the
/// raw order-pointer rank that produced that reading order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutRegion {
    pub index: usize,
    pub label: String,
    pub task: PipelineTask,
    pub score: f32,
    /// Normalized to `[0, 1000]^4`.
    pub bbox: BBox,
    /// Absolute polygon points in page pixel space (unlike `bbox`, not
    /// normalized).
    pub polygon: Vec<Point>,
    pub order: usize,
}

/// Mutable carrier for a region as it moves through cropping and
/// recognition. `content` is `None` until filled; an empty string marks
/// a recognition failure (still `Some("")`).
#[derive(Debug, Clone)]
pub struct RegionRecord {
    pub index: usize,
    pub native_label: String,
    pub task: PipelineTask,
    pub bbox: BBox,
    pub content: Option<String>,
}

/// Stable identity used to merge task-group results deterministically,
/// independent of completion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecognitionJobKey {
    pub page_index: usize,
    pub region_position: usize,
}

/// Warnings, stage timings, and free-form metadata collected while
/// servicing one `parse` call. Warnings preserve insertion order and may
/// repeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticBundle {
    pub warnings: Vec<String>,
    pub timings_ms: BTreeMap<String, f64>,
    pub metadata: BTreeMap<String, String>,
}

impl DiagnosticBundle {
    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn set_timing(&mut self, stage: &str, ms: f64) {
        self.timings_ms.insert(stage.to_string(), ms);
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

/// One page's regions in pipeline (final, re-numbered) order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub regions: Vec<LayoutRegion>,
}

/// The top-level result of a `parse` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OCRDocumentResult {
    pub pages: Vec<PageResult>,
    pub markdown: String,
    pub diagnostics: DiagnosticBundle,
}

/// One delivered file's integrity record within a model snapshot.
/// `etag` holds either the hub's normalized ETag (when it was a 64-hex
/// SHA-256) or the locally computed SHA-256 (when the hub's ETag was
/// some other digest or unavailable) — either way it is the value
/// `verify_offline_readiness` recomputes and compares against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFileRecord {
    pub relative_path: String,
    pub etag: String,
    pub commit_hash: Option<String>,
}

/// Persisted delivery record for one resolved model snapshot. `files` is
/// kept sorted by `relative_path` for reproducible serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSnapshotRecord {
    pub revision: String,
    pub snapshot_path: String,
    pub updated_at_utc: String,
    pub files: Vec<ModelFileRecord>,
}

/// The full persisted state file: `model_id -> snapshot record`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDeliveryState {
    #[serde(flatten)]
    pub models: BTreeMap<String, ModelSnapshotRecord>,
}

/// First 16 hex characters of SHA-256(text), used for the prompt-hash
/// metadata field without ever logging the prompt itself.
pub fn truncated_sha256_hex16(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let full = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    full[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_inclusive_iou_identical_boxes_is_one() {
        let a = BBox { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 };
        assert!((a.inclusive_iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bbox_disjoint_iou_is_zero() {
        let a = BBox { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 };
        let b = BBox { x1: 100.0, y1: 100.0, x2: 110.0, y2: 110.0 };
        assert_eq!(a.inclusive_iou(&b), 0.0);
    }

    #[test]
    fn containment_ratio_is_own_area_based() {
        let outer = BBox { x1: 0.0, y1: 0.0, x2: 100.0, y2: 100.0 };
        let inner = BBox { x1: 10.0, y1: 10.0, x2: 20.0, y2: 20.0 };
        assert!((inner.intersection_over_own_area(&outer) - 1.0).abs() < 1e-6);
        assert!(outer.intersection_over_own_area(&inner) < 0.02);
    }

    #[test]
    fn ocr_task_excludes_skip_and_abandon() {
        assert_eq!(PipelineTask::Skip.ocr_task(), None);
        assert_eq!(PipelineTask::Abandon.ocr_task(), None);
        assert_eq!(PipelineTask::Text.ocr_task(), Some(PipelineTask::Text));
    }

    #[test]
    fn prompt_hash_is_sixteen_hex_chars() {
        let h = truncated_sha256_hex16("Recognize:");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn diagnostic_bundle_serializes_roundtrip() {
        let mut bundle = DiagnosticBundle::default();
        bundle.push_warning("page[0] region[1] recognition failed: x");
        bundle.set_timing("total", 12.5);
        bundle.set_metadata("pageCount", "1");
        let json = serde_json::to_string(&bundle).unwrap();
        let back: DiagnosticBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back.warnings, bundle.warnings);
        assert_eq!(back.timings_ms, bundle.timings_ms);
        assert_eq!(back.metadata, bundle.metadata);
    }
}
