//! Top-level orchestrator: loads pages, branches on
//! `enable_layout`, dispatches bounded-concurrency recognition jobs,
//! assembles Markdown, and reports per-stage timings and metadata.

use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;

use pageread_core::config::{Config, ParseOptions};
use pageread_core::model::{BBox, DiagnosticBundle, LayoutRegion, OCRDocumentResult, PageResult, RecognitionJobKey};
use pageread_core::{truncated_sha256_hex16, Error, PipelineTask, Result};
use pageread_pdf::loader::{InputDocument, PdfRuntime};

use crate::cancellation::CancellationToken;
use crate::collaborators::{CandleLayoutDetector, CandleRecognizer, SharedLayoutDetector, SharedRecognizer};
use crate::limiter::AsyncLimiter;

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// One page's worth of recognized regions, normalized bbox already
/// converted to page pixel space for cropping.
fn denormalize_bbox(bbox: &BBox, width: u32, height: u32) -> BBox {
    let sx = width as f32 / 1000.0;
    let sy = height as f32 / 1000.0;
    BBox {
        x1: bbox.x1 * sx,
        y1: bbox.y1 * sy,
        x2: bbox.x2 * sx,
        y2: bbox.y2 * sy,
    }
}

/// The implicit single region used when layout detection is disabled:
/// the whole page, routed through the no-layout prompt (one job per
/// page with no cropping).
fn whole_page_region() -> LayoutRegion {
    LayoutRegion {
        index: 0,
        label: "text".to_string(),
        task: PipelineTask::Text,
        score: 1.0,
        bbox: BBox { x1: 0.0, y1: 0.0, x2: 1000.0, y2: 1000.0 },
        polygon: Vec::new(),
        order: 0,
    }
}

/// Owns the shared model collaborators and drives `parse`. Constructed
/// once per configuration and reused across calls; model weights load
/// lazily and are shared read-only across concurrent recognition jobs.
pub struct Pipeline {
    config: Config,
    layout: SharedLayoutDetector,
    recognizer: SharedRecognizer,
    limiter: AsyncLimiter,
    pdf_runtime: OnceCell<PdfRuntime>,
}

impl Pipeline {
    /// Resolves model snapshots via `pageread-delivery`, then builds a
    /// pipeline backed by real candle models on the CPU device.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let recognizer_id = config.recognizer_model_id.clone();
        let layout_id = config.layout_model_id.clone();
        let paths = tokio::task::spawn_blocking(move || pageread_delivery::ensure_ready(&recognizer_id, &layout_id))
            .await
            .map_err(|e| Error::ModelDeliveryFailed(format!("model delivery task panicked: {e}")))?
            .map_err(|e| Error::ModelDeliveryFailed(e.to_string()))?;

        let layout: SharedLayoutDetector = Arc::new(CandleLayoutDetector::new(paths.layout_dir, Device::Cpu));
        let recognizer: SharedRecognizer = Arc::new(CandleRecognizer::new(paths.recognizer_dir, Device::Cpu));
        Ok(Self::with_collaborators(config, layout, recognizer))
    }

    /// Test/injection entry point: bypasses model delivery and candle
    /// model construction so tests can substitute in-memory fakes for
    /// the layout detector and recognizer.
    pub fn with_collaborators(config: Config, layout: SharedLayoutDetector, recognizer: SharedRecognizer) -> Self {
        let limiter = AsyncLimiter::new(config.max_concurrent_recognitions);
        Self { config, layout, recognizer, limiter, pdf_runtime: OnceCell::new() }
    }

    async fn pdf_runtime(&self) -> Result<&PdfRuntime> {
        self.pdf_runtime
            .get_or_try_init(|| async { PdfRuntime::new().map_err(pageread_core::Error::from) })
            .await
    }

    pub async fn parse(&self, input: InputDocument, options: ParseOptions, cancellation: &CancellationToken) -> Result<OCRDocumentResult> {
        options.validate()?;
        cancellation.check()?;

        let total_start = Instant::now();
        let mut diagnostics = DiagnosticBundle::default();

        let page_load_start = Instant::now();
        let effective_max_pages = self.config.effective_max_pages(options.max_pages);
        let runtime = self.pdf_runtime().await?;
        let pages = runtime
            .load_pages(input, self.config.pdf_dpi, self.config.pdf_max_rendered_long_side, effective_max_pages)
            .map_err(pageread_core::Error::from)?;
        diagnostics.set_timing("page_load", elapsed_ms(page_load_start));

        // The candle layout forward pass is one trait call; its internal
        // preprocess/inference/postprocess split isn't observable from
        // here, so the full measured time is attributed to inference and
        // the other two stages are reported as zero rather than widening
        // the `LayoutDetector` trait just to carry a timing breakdown.
        let mut layout_inference_ms = 0.0f64;
        let mut ocr_preprocess_ms = 0.0f64;
        let mut ocr_inference_ms = 0.0f64;
        let mut ocr_postprocess_ms = 0.0f64;

        let mut page_results = Vec::with_capacity(pages.len());
        let mut markdown_pages = Vec::with_capacity(pages.len());

        for (page_index, page) in pages.iter().enumerate() {
            cancellation.check()?;

            let regions = if self.config.enable_layout {
                cancellation.check()?;
                let start = Instant::now();
                let regions = self.layout.detect(page, &self.config.layout).await?;
                layout_inference_ms += elapsed_ms(start);
                regions
            } else {
                vec![whole_page_region()]
            };

            let mut contents: Vec<Option<String>> = vec![None; regions.len()];
            let mut join_set: JoinSet<(RecognitionJobKey, Result<String>, f64)> = JoinSet::new();

            for region in &regions {
                let Some(task) = region.task.ocr_task() else { continue };

                if let Err(err) = cancellation.check() {
                    join_set.abort_all();
                    return Err(err);
                }

                let prompt = if self.config.enable_layout {
                    self.config
                        .prompts
                        .for_task(task)
                        .expect("ocr_task() only yields tasks with a configured prompt")
                        .to_string()
                } else {
                    self.config.prompts.no_layout.clone()
                };

                let cropped = if self.config.enable_layout {
                    let start = Instant::now();
                    let pixel_bbox = denormalize_bbox(&region.bbox, page.width(), page.height());
                    let result = pageread_pdf::crop_region(page, &pixel_bbox, &region.polygon);
                    ocr_preprocess_ms += elapsed_ms(start);
                    result
                } else {
                    Ok(page.clone())
                };

                let cropped = match cropped {
                    Ok(cropped) => cropped,
                    Err(err) => {
                        diagnostics.push_warning(format!("page[{page_index}] region[{}] crop failed: {err}", region.index));
                        continue;
                    }
                };

                let limiter = self.limiter.clone();
                let recognizer = Arc::clone(&self.recognizer);
                let recognition_options = self.config.recognition_options.clone();
                let job_key = RecognitionJobKey { page_index, region_position: region.index };

                join_set.spawn(async move {
                    let _permit = limiter.acquire().await;
                    let start = Instant::now();
                    let outcome = recognizer
                        .recognize(cropped.rgb(), cropped.width(), cropped.height(), &prompt, &recognition_options)
                        .await;
                    (job_key, outcome, elapsed_ms(start))
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let (job_key, outcome, ms) = joined.map_err(|e| Error::InvalidConfiguration(format!("recognition task panicked: {e}")))?;
                ocr_inference_ms += ms;
                match outcome {
                    Ok(text) => contents[job_key.region_position] = Some(text),
                    Err(err) => {
                        diagnostics.push_warning(format!("page[{}] region[{}] recognition failed: {err}", job_key.page_index, job_key.region_position));
                        contents[job_key.region_position] = Some(String::new());
                    }
                }
            }

            let format_start = Instant::now();
            let (final_regions, page_markdown) = pageread_format::format_page(page_index, regions, contents);
            ocr_postprocess_ms += elapsed_ms(format_start);

            page_results.push(PageResult { regions: final_regions });
            markdown_pages.push(page_markdown);
        }

        if self.config.enable_layout {
            diagnostics.set_timing("layout_preprocess", 0.0);
            diagnostics.set_timing("layout_inference", layout_inference_ms);
            diagnostics.set_timing("layout_postprocess", 0.0);
            diagnostics.set_timing("ocr_preprocess", ocr_preprocess_ms);
        } else {
            diagnostics.set_timing("ocr_preprocess", 0.0);
        }
        diagnostics.set_timing("ocr_inference", ocr_inference_ms);
        diagnostics.set_timing("ocr_postprocess", ocr_postprocess_ms);
        diagnostics.set_timing("total", elapsed_ms(total_start));

        diagnostics.set_metadata("layoutEnabled", self.config.enable_layout.to_string());
        diagnostics.set_metadata("pageCount", page_results.len().to_string());
        diagnostics.set_metadata("maxConcurrentRecognitions", self.config.max_concurrent_recognitions.to_string());
        diagnostics.set_metadata("maxPagesOption", options.max_pages.map(|n| n.to_string()).unwrap_or_default());
        diagnostics.set_metadata("defaultMaxPages", self.config.default_max_pages.map(|n| n.to_string()).unwrap_or_default());
        diagnostics.set_metadata("effectiveMaxPages", effective_max_pages.map(|n| n.to_string()).unwrap_or_default());
        diagnostics.set_metadata("pdfDPI", self.config.pdf_dpi.to_string());
        diagnostics.set_metadata("pdfMaxRenderedLongSide", self.config.pdf_max_rendered_long_side.to_string());
        diagnostics.set_metadata("noLayoutPromptHash", truncated_sha256_hex16(&self.config.prompts.no_layout));
        diagnostics.set_metadata("textPromptHash", truncated_sha256_hex16(&self.config.prompts.text));
        diagnostics.set_metadata("tablePromptHash", truncated_sha256_hex16(&self.config.prompts.table));
        diagnostics.set_metadata("formulaPromptHash", truncated_sha256_hex16(&self.config.prompts.formula));

        let markdown = if options.include_markdown { markdown_pages.join("\n\n") } else { String::new() };
        let diagnostics = if options.include_diagnostics { diagnostics } else { DiagnosticBundle::default() };

        Ok(OCRDocumentResult { pages: page_results, markdown, diagnostics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FakeLayoutDetector, FakeRecognizer};
    use pageread_core::PipelineTask;

    fn region(index: usize, label: &str, task: PipelineTask) -> LayoutRegion {
        LayoutRegion {
            index,
            label: label.to_string(),
            task,
            score: 0.9,
            bbox: BBox { x1: 0.0, y1: 0.0, x2: 500.0, y2: 500.0 },
            polygon: vec![],
            order: index,
        }
    }

    fn pipeline_with(layout: SharedLayoutDetector, recognizer: SharedRecognizer, enable_layout: bool) -> Pipeline {
        let mut config = Config::default();
        config.enable_layout = enable_layout;
        config.max_concurrent_recognitions = 2;
        Pipeline::with_collaborators(config, layout, recognizer)
    }

    fn tiny_image() -> InputDocument {
        InputDocument::Image(image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(32, 32, image::Rgb([250, 250, 250]))))
    }

    /// `Pipeline::parse` always routes through `PdfRuntime`, which binds
    /// the native pdfium library even for plain-image input (mirroring
    /// `pageread_pdf::loader`'s own tests); skip if it isn't installed.
    fn pdfium_available() -> bool {
        PdfRuntime::new().is_ok()
    }

    #[tokio::test]
    async fn no_layout_image_yields_single_text_region() {
        if !pdfium_available() {
            return;
        }
        let layout: SharedLayoutDetector = Arc::new(FakeLayoutDetector { regions: vec![] });
        let recognizer: SharedRecognizer = Arc::new(FakeRecognizer { text: "hello world".to_string() });
        let pipeline = pipeline_with(layout, recognizer, false);

        let result = pipeline
            .parse(tiny_image(), ParseOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.pages.len(), 1);
        assert_eq!(result.pages[0].regions.len(), 1);
        assert_eq!(result.pages[0].regions[0].label, "text");
        assert!(result.markdown.contains("hello world"));
        assert_eq!(result.diagnostics.metadata.get("pageCount").map(String::as_str), Some("1"));
        assert_eq!(result.diagnostics.timings_ms.get("ocr_preprocess"), Some(&0.0));
    }

    #[tokio::test]
    async fn layout_enabled_skips_abandon_regions_but_keeps_them_in_output() {
        if !pdfium_available() {
            return;
        }
        let regions = vec![
            region(0, "text", PipelineTask::Text),
            region(1, "abandon", PipelineTask::Abandon),
        ];
        let layout: SharedLayoutDetector = Arc::new(FakeLayoutDetector { regions });
        let recognizer: SharedRecognizer = Arc::new(FakeRecognizer { text: "body text".to_string() });
        let pipeline = pipeline_with(layout, recognizer, true);

        let result = pipeline
            .parse(tiny_image(), ParseOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.pages[0].regions.len(), 2);
        assert!(result.markdown.contains("body text"));
        assert!(!result.markdown.to_lowercase().contains("abandon"));
    }

    #[tokio::test]
    async fn cancellation_before_parse_returns_cancelled_with_no_result() {
        // Cancellation is checked before page loading, so this holds
        // regardless of pdfium availability.
        let layout: SharedLayoutDetector = Arc::new(FakeLayoutDetector { regions: vec![] });
        let recognizer: SharedRecognizer = Arc::new(FakeRecognizer { text: String::new() });
        let pipeline = pipeline_with(layout, recognizer, false);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let result = pipeline.parse(tiny_image(), ParseOptions::default(), &cancellation).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn excluding_diagnostics_returns_an_empty_bundle() {
        if !pdfium_available() {
            return;
        }
        let layout: SharedLayoutDetector = Arc::new(FakeLayoutDetector { regions: vec![] });
        let recognizer: SharedRecognizer = Arc::new(FakeRecognizer { text: "x".to_string() });
        let pipeline = pipeline_with(layout, recognizer, false);
        let options = ParseOptions { include_diagnostics: false, ..Default::default() };

        let result = pipeline.parse(tiny_image(), options, &CancellationToken::new()).await.unwrap();
        assert!(result.diagnostics.timings_ms.is_empty());
        assert!(result.diagnostics.metadata.is_empty());
    }
}
