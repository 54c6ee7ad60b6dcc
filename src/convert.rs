//! The document pipeline and the session it hands back.
//!
//! ```text
//! EXTRACTING ──▶ CLASSIFYING_OCR ──▶ CLEANING ──▶ STRUCTURING ──▶ READY ⇄ MUTATING
//!      │        (only if a page        │               │
//!      │         was rendered)         │               │
//!      └──────────────┴────────────────┴───────────────┴──▶ FAILED
//! ```
//!
//! A [`Pipeline`] runs once. Fatal problems (document cannot be opened, no
//! credential, no text on any page, every chunk failed) move it to
//! `Failed` and come back as `Err`. Everything else degrades per page or per
//! chunk and the run returns a [`DocumentSession`] in `Ready`, which then
//! owns the blueprint and accepts mutation instructions.

use crate::blueprint::{parse_blueprint, Blueprint, BlueprintStore};
use crate::client::{resolve_client, RemoteModel};
use crate::config::PipelineConfig;
use crate::error::{Pdf2DeckError, StructuringParseError};
use crate::output::{CleanedChunk, ExtractionResult, RunStats};
use crate::pipeline::classify::{EdgeDensityClassifier, ImageClassifier};
use crate::pipeline::clean::{ensure_not_all_failed, join_chunks, partition, ChunkedCleaner};
use crate::pipeline::extract::{page_from_image, Page, PageExtractor, PageSource, PdfiumExtractor};
use crate::pipeline::input::{resolve_input, InputKind};
use crate::pipeline::ocr::{ensure_some_text, local_engine, LocalOcr, OcrGateway};
use crate::progress::ProgressCallback;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Where a document is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Extracting,
    ClassifyingOcr,
    Cleaning,
    Structuring,
    Ready,
    Mutating,
    Failed,
}

impl PipelineState {
    /// Allowed edges of the state machine.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Extracting, ClassifyingOcr)
                | (Extracting, Cleaning)
                | (ClassifyingOcr, Cleaning)
                | (Cleaning, Structuring)
                | (Structuring, Ready)
                | (Ready, Mutating)
                | (Mutating, Ready)
                | (Extracting | ClassifyingOcr | Cleaning | Structuring, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == PipelineState::Failed
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::Extracting => "EXTRACTING",
            PipelineState::ClassifyingOcr => "CLASSIFYING_OCR",
            PipelineState::Cleaning => "CLEANING",
            PipelineState::Structuring => "STRUCTURING",
            PipelineState::Ready => "READY",
            PipelineState::Mutating => "MUTATING",
            PipelineState::Failed => "FAILED",
        })
    }
}

fn notify(progress: Option<&ProgressCallback>, state: PipelineState) {
    info!("→ {}", state);
    if let Some(cb) = progress {
        cb.on_state_change(state);
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Orchestrates extraction → OCR → cleaning → structuring for one document.
///
/// # Example
/// ```rust,no_run
/// use edgequake_pdf2deck::{Pipeline, PipelineConfig};
///
/// # async fn run() -> Result<(), edgequake_pdf2deck::Pdf2DeckError> {
/// let config = PipelineConfig::builder().provider_name("gemini").build()?;
/// let bytes = std::fs::read("lecture.pdf").unwrap();
///
/// let mut session = Pipeline::new(config).run(&bytes).await?;
/// session.mutate("Merge the two introduction slides").await?;
/// println!("{}", session.blueprint().unwrap().to_json_pretty()?);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    extractor: Arc<dyn PageExtractor>,
    classifier: Arc<dyn ImageClassifier>,
    local_ocr: Option<Arc<dyn LocalOcr>>,
    client: OnceCell<Arc<dyn RemoteModel>>,
    state: Option<PipelineState>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish()
    }
}

impl Pipeline {
    /// Pipeline with the default pdfium extractor, edge-density classifier
    /// and (if configured) tesseract.
    pub fn new(config: PipelineConfig) -> Self {
        let client = match config.client {
            Some(ref c) => OnceCell::with_value(Arc::clone(c)),
            None => OnceCell::new(),
        };
        Self {
            extractor: Arc::new(PdfiumExtractor::from_config(&config)),
            classifier: Arc::new(EdgeDensityClassifier::from_config(&config)),
            local_ocr: local_engine(&config),
            client,
            state: None,
            config,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PageExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ImageClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace (or with `None`, disable) the local OCR engine.
    pub fn with_local_ocr(mut self, local: Option<Arc<dyn LocalOcr>>) -> Self {
        self.local_ocr = local;
        self
    }

    pub fn with_client(mut self, client: Arc<dyn RemoteModel>) -> Self {
        self.client = OnceCell::with_value(client);
        self
    }

    /// `None` before the run starts.
    pub fn state(&self) -> Option<PipelineState> {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The shared remote handle, resolved on first use.
    fn client(&self) -> Result<Arc<dyn RemoteModel>, Pdf2DeckError> {
        self.client
            .get_or_try_init(|| resolve_client(&self.config))
            .map(Arc::clone)
    }

    fn transition(&mut self, next: PipelineState) -> Result<(), Pdf2DeckError> {
        let allowed = match self.state {
            None => matches!(next, PipelineState::Extracting | PipelineState::Failed),
            Some(current) => current.can_transition_to(next),
        };
        if !allowed {
            return Err(Pdf2DeckError::InvalidTransition {
                from: self
                    .state
                    .map_or_else(|| "NEW".to_string(), |s| s.to_string()),
                to: next.to_string(),
            });
        }
        self.state = Some(next);
        notify(self.config.progress_callback.as_ref(), next);
        Ok(())
    }

    fn fail(&mut self, err: Pdf2DeckError) -> Pdf2DeckError {
        error!("Pipeline failed: {}", err);
        if !matches!(self.state, Some(PipelineState::Failed)) {
            self.state = Some(PipelineState::Failed);
            notify(self.config.progress_callback.as_ref(), PipelineState::Failed);
        }
        err
    }

    fn start(&mut self) -> Result<(), Pdf2DeckError> {
        if self.state.is_some() {
            return Err(Pdf2DeckError::InvalidTransition {
                from: self
                    .state
                    .map_or_else(|| "NEW".to_string(), |s| s.to_string()),
                to: PipelineState::Extracting.to_string(),
            });
        }
        self.transition(PipelineState::Extracting)
    }

    /// Run the whole pipeline on PDF bytes.
    pub async fn run(&mut self, pdf: &[u8]) -> Result<DocumentSession, Pdf2DeckError> {
        let client = self.begin()?;
        self.run_pdf(client, pdf).await
    }

    /// Run the pipeline on a single PNG/JPEG image as a one-page document.
    pub async fn run_image(&mut self, image: &[u8]) -> Result<DocumentSession, Pdf2DeckError> {
        let client = self.begin()?;
        self.run_single_image(client, image).await
    }

    /// Resolve a path or URL, then run on the PDF or image it contains.
    ///
    /// The credential is checked before anything is read or downloaded.
    pub async fn run_input(&mut self, input: &str) -> Result<DocumentSession, Pdf2DeckError> {
        let client = self.begin()?;
        let doc = resolve_input(input, self.config.download_timeout_secs)
            .await
            .map_err(|e| self.fail(e))?;
        info!("Processing {} ({:?})", doc.origin, doc.kind);
        match doc.kind {
            InputKind::Pdf => self.run_pdf(client, &doc.bytes).await,
            InputKind::Image => self.run_single_image(client, &doc.bytes).await,
        }
    }

    /// Enter `EXTRACTING` and resolve the remote client.
    fn begin(&mut self) -> Result<Arc<dyn RemoteModel>, Pdf2DeckError> {
        self.start()?;
        self.client().map_err(|e| self.fail(e))
    }

    async fn run_pdf(
        &mut self,
        client: Arc<dyn RemoteModel>,
        pdf: &[u8],
    ) -> Result<DocumentSession, Pdf2DeckError> {
        let started = Instant::now();
        let extractor = Arc::clone(&self.extractor);
        let bytes = pdf.to_vec();
        let pages = tokio::task::spawn_blocking(move || extractor.extract(&bytes))
            .await
            .map_err(|e| Pdf2DeckError::Internal(format!("Extraction task panicked: {e}")))
            .and_then(|r| r)
            .map_err(|e| self.fail(e))?;

        self.process(client, pages, elapsed_ms(started)).await
    }

    async fn run_single_image(
        &mut self,
        client: Arc<dyn RemoteModel>,
        image: &[u8],
    ) -> Result<DocumentSession, Pdf2DeckError> {
        let started = Instant::now();
        let bytes = image.to_vec();
        let page = tokio::task::spawn_blocking(move || page_from_image(&bytes))
            .await
            .map_err(|e| Pdf2DeckError::Internal(format!("Image decode task panicked: {e}")))
            .and_then(|r| r)
            .map_err(|e| self.fail(e))?;

        self.process(client, vec![page], elapsed_ms(started)).await
    }

    async fn process(
        &mut self,
        client: Arc<dyn RemoteModel>,
        pages: Vec<Page>,
        extract_duration_ms: u64,
    ) -> Result<DocumentSession, Pdf2DeckError> {
        let progress = self.config.progress_callback.clone();
        let mut stats = RunStats {
            extract_duration_ms,
            ..Default::default()
        };

        let total = pages.len();
        let rendered = pages
            .iter()
            .filter(|p| p.source == PageSource::Rendered)
            .count();
        info!(
            "Extracted {} pages: {} digital, {} to OCR",
            total,
            total - rendered,
            rendered
        );
        if let Some(ref cb) = progress {
            cb.on_page_extracted(total, total - rendered, rendered);
        }
        if total == 0 {
            return Err(self.fail(Pdf2DeckError::NoExtractableText {
                total: 0,
                first_error: "document has no pages".into(),
            }));
        }

        // ── OCR (conditional) ────────────────────────────────────────────
        if rendered > 0 {
            self.transition(PipelineState::ClassifyingOcr)?;
        }
        let ocr_start = Instant::now();
        let gateway = OcrGateway::new(
            Arc::clone(&client),
            self.local_ocr.clone(),
            Arc::clone(&self.classifier),
            &self.config,
        );
        let outcomes = gateway.process_pages(pages, progress.as_ref()).await;
        stats.ocr_duration_ms = elapsed_ms(ocr_start);

        let mut results: Vec<ExtractionResult> = Vec::with_capacity(outcomes.len());
        for o in outcomes {
            stats.total_input_tokens += o.input_tokens;
            stats.total_output_tokens += o.output_tokens;
            results.push(o.result);
        }
        stats.record_pages(&results);
        ensure_some_text(&results).map_err(|e| self.fail(e))?;

        // ── Cleaning ─────────────────────────────────────────────────────
        self.transition(PipelineState::Cleaning)?;
        let clean_start = Instant::now();
        let chunks = partition(&results, self.config.chunk_size);
        let cleaner = ChunkedCleaner::new(Arc::clone(&client), &self.config);
        let cleaned = cleaner.clean(&chunks, progress.as_ref()).await;
        stats.clean_duration_ms = elapsed_ms(clean_start);
        stats.total_chunks = cleaned.chunks.len();
        stats.failed_chunks = cleaned.chunks.iter().filter(|c| c.error.is_some()).count();
        stats.total_input_tokens += cleaned.input_tokens;
        stats.total_output_tokens += cleaned.output_tokens;
        ensure_not_all_failed(&cleaned.chunks).map_err(|e| self.fail(e))?;
        let cleaned_markdown = join_chunks(&cleaned.chunks);

        // ── Structuring ──────────────────────────────────────────────────
        self.transition(PipelineState::Structuring)?;
        let structure_start = Instant::now();
        let store = BlueprintStore::new(client, &self.config);
        let structuring = match store.generate(&cleaned_markdown, store.style()).await {
            Ok(bp) => StructuringOutcome::Parsed(bp),
            Err(Pdf2DeckError::StructuringParse(e)) => StructuringOutcome::Unparsed(e),
            Err(e) => StructuringOutcome::Unavailable {
                detail: e.to_string(),
            },
        };
        stats.structure_duration_ms = elapsed_ms(structure_start);

        self.transition(PipelineState::Ready)?;
        let base_tokens = (stats.total_input_tokens, stats.total_output_tokens);
        let (structure_in, structure_out) = store.usage();
        stats.total_input_tokens += structure_in;
        stats.total_output_tokens += structure_out;
        info!(
            "Run complete: {} pages ({} failed), {} chunks ({} failed), {} input / {} output tokens",
            stats.total_pages,
            stats.failed_pages,
            stats.total_chunks,
            stats.failed_chunks,
            stats.total_input_tokens,
            stats.total_output_tokens
        );

        Ok(DocumentSession {
            cleaned_markdown,
            pages: results,
            chunks: cleaned.chunks,
            stats,
            structuring,
            store,
            state: PipelineState::Ready,
            progress,
            base_tokens,
        })
    }
}

/// What structuring produced.
#[derive(Debug, Clone)]
pub enum StructuringOutcome {
    /// A valid blueprint.
    Parsed(Blueprint),
    /// The model replied, but not with a blueprint; raw text kept for repair.
    Unparsed(StructuringParseError),
    /// The structuring call itself gave up.
    Unavailable { detail: String },
}

/// A finished run: cleaned text, per-unit results, and the blueprint.
///
/// Owned by the caller. Mutation replaces the blueprint as a whole and
/// leaves it untouched when the model's answer is rejected.
pub struct DocumentSession {
    /// The stitched, cleaned Markdown.
    pub cleaned_markdown: String,
    /// One result per page, in page order.
    pub pages: Vec<ExtractionResult>,
    /// One result per chunk, in chunk order.
    pub chunks: Vec<CleanedChunk>,
    pub stats: RunStats,
    structuring: StructuringOutcome,
    store: BlueprintStore,
    state: PipelineState,
    progress: Option<ProgressCallback>,
    // OCR + cleaning tokens; the store's own usage is added on top
    base_tokens: (u64, u64),
}

impl fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentSession")
            .field("state", &self.state)
            .field("pages", &self.pages.len())
            .field("chunks", &self.chunks.len())
            .field("structuring", &self.structuring)
            .finish()
    }
}

impl DocumentSession {
    /// Session around an existing blueprint, for mutation without a run.
    pub fn from_blueprint(
        blueprint: Blueprint,
        config: &PipelineConfig,
    ) -> Result<Self, Pdf2DeckError> {
        let client = resolve_client(config)?;
        Ok(Self {
            cleaned_markdown: String::new(),
            pages: Vec::new(),
            chunks: Vec::new(),
            stats: RunStats::default(),
            structuring: StructuringOutcome::Parsed(blueprint),
            store: BlueprintStore::new(client, config),
            state: PipelineState::Ready,
            progress: config.progress_callback.clone(),
            base_tokens: (0, 0),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn structuring(&self) -> &StructuringOutcome {
        &self.structuring
    }

    /// The current blueprint, if structuring (or a repair) produced one.
    pub fn blueprint(&self) -> Option<&Blueprint> {
        match self.structuring {
            StructuringOutcome::Parsed(ref bp) => Some(bp),
            _ => None,
        }
    }

    /// The rejected reply, when structuring did not parse.
    pub fn parse_error(&self) -> Option<&StructuringParseError> {
        match self.structuring {
            StructuringOutcome::Unparsed(ref e) => Some(e),
            _ => None,
        }
    }

    /// Take the blueprint, or the reason there is none.
    pub fn into_blueprint(self) -> Result<Blueprint, Pdf2DeckError> {
        match self.structuring {
            StructuringOutcome::Parsed(bp) => Ok(bp),
            StructuringOutcome::Unparsed(e) => Err(Pdf2DeckError::StructuringParse(e)),
            StructuringOutcome::Unavailable { detail } => Err(Pdf2DeckError::NotReady(detail)),
        }
    }

    fn not_ready(&self) -> Pdf2DeckError {
        match self.structuring {
            StructuringOutcome::Parsed(_) => Pdf2DeckError::NotReady("blueprint present".into()),
            StructuringOutcome::Unparsed(ref e) => Pdf2DeckError::NotReady(format!(
                "structuring reply did not parse ({}); repair or regenerate first",
                e.detail
            )),
            StructuringOutcome::Unavailable { ref detail } => Pdf2DeckError::NotReady(format!(
                "structuring failed ({detail}); regenerate first"
            )),
        }
    }

    fn enter(&mut self, next: PipelineState) -> Result<(), Pdf2DeckError> {
        if !self.state.can_transition_to(next) {
            return Err(Pdf2DeckError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        notify(self.progress.as_ref(), next);
        Ok(())
    }

    fn sync_usage(&mut self) {
        let (input, output) = self.store.usage();
        self.stats.total_input_tokens = self.base_tokens.0 + input;
        self.stats.total_output_tokens = self.base_tokens.1 + output;
    }

    /// Apply a free-text instruction to the blueprint.
    ///
    /// On success the blueprint is replaced and returned. On any failure
    /// (call gave up, reply did not parse) the blueprint is unchanged and the
    /// error is returned. Either way the session ends back in `Ready`.
    pub async fn mutate(&mut self, instruction: &str) -> Result<&Blueprint, Pdf2DeckError> {
        let StructuringOutcome::Parsed(ref current) = self.structuring else {
            return Err(self.not_ready());
        };
        let current = current.clone();

        self.enter(PipelineState::Mutating)?;
        let result = self.store.mutate(&current, instruction).await;
        self.sync_usage();
        self.enter(PipelineState::Ready)?;

        self.structuring = StructuringOutcome::Parsed(result?);
        self.blueprint()
            .ok_or_else(|| Pdf2DeckError::Internal("blueprint vanished after mutation".into()))
    }

    /// Replace the blueprint with hand-edited JSON, parsed strictly.
    pub fn repair(&mut self, json: &str) -> Result<&Blueprint, Pdf2DeckError> {
        let blueprint = parse_blueprint(json, self.store.placeholder_title())?;
        self.structuring = StructuringOutcome::Parsed(blueprint);
        self.blueprint()
            .ok_or_else(|| Pdf2DeckError::Internal("blueprint vanished after repair".into()))
    }

    /// Structure the retained cleaned text again, optionally with a new style.
    ///
    /// Like [`mutate`](Self::mutate), a failed attempt leaves the current
    /// outcome as it was.
    pub async fn regenerate(&mut self, style: Option<&str>) -> Result<&Blueprint, Pdf2DeckError> {
        if self.cleaned_markdown.trim().is_empty() {
            return Err(Pdf2DeckError::NotReady("no cleaned text to structure".into()));
        }
        if let Some(s) = style {
            self.store.set_style(s);
        }

        self.enter(PipelineState::Mutating)?;
        let result = self
            .store
            .generate(&self.cleaned_markdown, self.store.style())
            .await;
        self.sync_usage();
        self.enter(PipelineState::Ready)?;

        self.structuring = StructuringOutcome::Parsed(result?);
        self.blueprint()
            .ok_or_else(|| Pdf2DeckError::Internal("blueprint vanished after regeneration".into()))
    }
}
