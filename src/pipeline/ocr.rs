//! OCR for rendered pages: local tesseract or remote vision model.
//!
//! ## Routing
//!
//! ```text
//! rendered page ──▶ classify ──▶ Digital ──▶ tesseract ──▶ ≥ local_min_chars? ──▶ OCR_LOCAL
//!                       │                        │ no / failed
//!                       └──▶ Handwritten ────────┴──────▶ remote vision ──▶ OCR_REMOTE
//! ```
//!
//! Every page is classified exactly once. Remote calls go through the retry
//! layer and a shared [`Pacer`]; a page whose remote call gives up is
//! reported with an inline marker and the run continues.

use crate::client::{RemoteModel, RemoteReply, RemoteRequest};
use crate::config::{LocalOcrConfig, PipelineConfig};
use crate::error::{PageError, Pdf2DeckError};
use crate::output::{EngineUsed, ExtractionResult};
use crate::pipeline::classify::{ImageClassifier, ImageKind};
use crate::pipeline::extract::{meaningful_len, Page, PageSource};
use crate::progress::ProgressCallback;
use crate::prompts::VISION_OCR_PROMPT;
use crate::retry::{call_with_retry, Attempted, Pacer, RetryError, RetryPolicy};
use crate::pipeline::encode::encode_png;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use imageproc::filter::gaussian_blur_f32;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Failure of the local OCR engine. Never retried; the page falls back to
/// the remote engine instead.
#[derive(Debug, Error)]
pub enum LocalOcrError {
    #[error("could not write temporary image: {0}")]
    TempFile(#[source] std::io::Error),

    #[error("could not prepare page image: {0}")]
    Preprocess(#[source] image::ImageError),

    #[error("could not start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// A local (offline) OCR engine.
#[async_trait]
pub trait LocalOcr: Send + Sync {
    fn name(&self) -> &str;

    /// Read the text of a PNG page image.
    async fn recognize(&self, png: &[u8]) -> Result<String, LocalOcrError>;
}

/// Blur sigma matching a 3×3 Gaussian kernel.
const PREPROCESS_BLUR_SIGMA: f32 = 0.8;

/// Binarise a printed page for tesseract: grayscale, light Gaussian blur,
/// then an Otsu threshold. Returns PNG bytes.
pub fn preprocess_for_tesseract(png: &[u8]) -> Result<Vec<u8>, LocalOcrError> {
    let gray = image::load_from_memory(png)
        .map_err(LocalOcrError::Preprocess)?
        .to_luma8();
    let blurred = gaussian_blur_f32(&gray, PREPROCESS_BLUR_SIGMA);
    let level = otsu_level(&blurred);
    let binary = threshold(&blurred, level, ThresholdType::Binary);
    debug!("Binarised {}x{} page at level {}", binary.width(), binary.height(), level);
    encode_png(&DynamicImage::ImageLuma8(binary)).map_err(LocalOcrError::Preprocess)
}

/// Runs the `tesseract` executable.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    config: LocalOcrConfig,
}

impl TesseractOcr {
    pub fn new(config: LocalOcrConfig) -> Self {
        Self { config }
    }

    fn args(&self, image_path: &str) -> Vec<String> {
        vec![
            image_path.to_string(),
            "stdout".to_string(),
            "-l".to_string(),
            self.config.language.clone(),
            "--psm".to_string(),
            self.config.psm.to_string(),
            "--oem".to_string(),
            self.config.oem.to_string(),
        ]
    }
}

#[async_trait]
impl LocalOcr for TesseractOcr {
    fn name(&self) -> &str {
        &self.config.command
    }

    async fn recognize(&self, png: &[u8]) -> Result<String, LocalOcrError> {
        let prepared = preprocess_for_tesseract(png)?;
        let mut tmp = tempfile::Builder::new()
            .prefix("pdf2deck-page-")
            .suffix(".png")
            .tempfile()
            .map_err(LocalOcrError::TempFile)?;
        tmp.write_all(&prepared).map_err(LocalOcrError::TempFile)?;
        tmp.flush().map_err(LocalOcrError::TempFile)?;
        let path = tmp.path().to_string_lossy().to_string();

        let output = Command::new(&self.config.command)
            .args(self.args(&path))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| LocalOcrError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(LocalOcrError::Failed {
                command: self.config.command.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// One OCR'd page plus the remote tokens it cost.
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub result: ExtractionResult,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl OcrOutcome {
    fn free(result: ExtractionResult) -> Self {
        Self {
            result,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// Routes rendered pages to an OCR engine.
pub struct OcrGateway {
    client: Arc<dyn RemoteModel>,
    local: Option<Arc<dyn LocalOcr>>,
    classifier: Arc<dyn ImageClassifier>,
    policy: RetryPolicy,
    pacer: Pacer,
    local_min_chars: usize,
    max_tokens: usize,
    concurrency: usize,
}

impl OcrGateway {
    pub fn new(
        client: Arc<dyn RemoteModel>,
        local: Option<Arc<dyn LocalOcr>>,
        classifier: Arc<dyn ImageClassifier>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            client,
            local,
            classifier,
            policy: config.retry_policy(),
            pacer: Pacer::new(Duration::from_millis(config.ocr_interval_ms)),
            local_min_chars: config.local_min_chars,
            max_tokens: config.max_tokens,
            concurrency: config.ocr_concurrency.max(1),
        }
    }

    /// Remote vision OCR with retry. Temperature is always 0.
    pub async fn recognize_remote(
        &self,
        page_num: usize,
        png: &[u8],
    ) -> Result<Attempted<RemoteReply>, RetryError> {
        let label = format!("Page {page_num} OCR");
        call_with_retry(&self.policy, &label, |_| {
            let request = RemoteRequest {
                system: None,
                prompt: VISION_OCR_PROMPT.to_string(),
                image: Some(png.to_vec()),
                temperature: 0.0,
                max_tokens: self.max_tokens,
                expect_json: false,
            };
            async move {
                self.pacer.wait().await;
                self.client.generate(request).await
            }
        })
        .await
    }

    async fn classify(&self, png: &[u8]) -> ImageKind {
        let classifier = Arc::clone(&self.classifier);
        let bytes = png.to_vec();
        match tokio::task::spawn_blocking(move || classifier.classify(&bytes)).await {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Classifier task failed ({e}); treating page as handwritten");
                ImageKind::Handwritten
            }
        }
    }

    /// OCR one rendered page. Never fails; errors become marker results.
    pub async fn recognize(&self, index: usize, png: &[u8]) -> OcrOutcome {
        let page_num = index + 1;
        let kind = self.classify(png).await;

        if kind == ImageKind::Digital {
            if let Some(ref local) = self.local {
                match local.recognize(png).await {
                    Ok(text) if meaningful_len(&text) >= self.local_min_chars => {
                        debug!("Page {}: {} read {} chars", page_num, local.name(), text.len());
                        return OcrOutcome::free(ExtractionResult::ok(
                            index,
                            text,
                            EngineUsed::OcrLocal,
                        ));
                    }
                    Ok(text) => info!(
                        "Page {}: local OCR found only {} chars; using remote vision",
                        page_num,
                        meaningful_len(&text)
                    ),
                    Err(e) => warn!(
                        "Page {}: local OCR failed ({}); using remote vision",
                        page_num, e
                    ),
                }
            }
        }

        match self.recognize_remote(page_num, png).await {
            Ok(Attempted { value, attempts }) => {
                debug!(
                    "Page {}: remote vision read {} chars in {} attempt(s)",
                    page_num,
                    value.text.len(),
                    attempts
                );
                OcrOutcome {
                    result: ExtractionResult::ok(
                        index,
                        value.text.trim().to_string(),
                        EngineUsed::OcrRemote,
                    ),
                    input_tokens: value.input_tokens,
                    output_tokens: value.output_tokens,
                }
            }
            Err(e) => OcrOutcome::free(ExtractionResult::failed(
                index,
                EngineUsed::OcrRemote,
                PageError::OcrFailed {
                    page: page_num,
                    engine: EngineUsed::OcrRemote,
                    attempts: e.attempts,
                    detail: e.last.message,
                },
            )),
        }
    }

    /// Turn extracted pages into ordered results.
    ///
    /// Digital pages pass straight through; rendered pages are OCR'd by an
    /// ordered pool of `ocr_concurrency` workers, so output order is page
    /// order regardless of completion order.
    pub async fn process_pages(
        &self,
        pages: Vec<Page>,
        progress: Option<&ProgressCallback>,
    ) -> Vec<OcrOutcome> {
        stream::iter(pages.into_iter().map(|page| async move {
            let page_num = page.index + 1;
            let outcome = match (page.source, page.digital_text, page.rendered_image) {
                (PageSource::Digital, Some(text), _) => {
                    OcrOutcome::free(ExtractionResult::ok(page.index, text, EngineUsed::Digital))
                }
                (_, _, Some(png)) => {
                    let outcome = self.recognize(page.index, &png).await;
                    if let (Some(cb), None) = (progress, &outcome.result.error) {
                        cb.on_page_ocr_complete(
                            page_num,
                            outcome.result.engine_used,
                            outcome.result.text.len(),
                        );
                    }
                    outcome
                }
                _ => OcrOutcome::free(ExtractionResult::failed(
                    page.index,
                    EngineUsed::OcrRemote,
                    PageError::RenderFailed {
                        page: page_num,
                        detail: page
                            .render_error
                            .unwrap_or_else(|| "no image produced".to_string()),
                    },
                )),
            };

            if let Some(ref err) = outcome.result.error {
                warn!("{}", err);
                if let Some(cb) = progress {
                    cb.on_page_error(page_num, &err.to_string());
                }
            }
            outcome
        }))
        .buffered(self.concurrency)
        .collect()
        .await
    }
}

/// Build the default local engine from config, if enabled.
pub fn local_engine(config: &PipelineConfig) -> Option<Arc<dyn LocalOcr>> {
    config
        .local_ocr
        .clone()
        .map(|c| Arc::new(TesseractOcr::new(c)) as Arc<dyn LocalOcr>)
}

/// `NoExtractableText` when every result failed or is blank.
pub fn ensure_some_text(results: &[ExtractionResult]) -> Result<(), Pdf2DeckError> {
    if results.iter().any(|r| !r.is_empty()) {
        return Ok(());
    }
    let first_error = results
        .iter()
        .find_map(|r| r.error.as_ref().map(ToString::to_string))
        .unwrap_or_else(|| "every page was blank".to_string());
    Err(Pdf2DeckError::NoExtractableText {
        total: results.len(),
        first_error,
    })
}
