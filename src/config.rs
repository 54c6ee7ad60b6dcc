//! Configuration types for the extraction-and-structuring pipeline.
//!
//! Every threshold that decides a code path (digital vs. OCR, printed vs.
//! handwritten, chunk size, delays, retry budget) lives in
//! [`PipelineConfig`]. None of them has a universally right value, so they are
//! deployment settings rather than constants.
//!
//! Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].

use crate::client::RemoteModel;
use crate::error::Pdf2DeckError;
use crate::progress::ProgressCallback;
use crate::retry::RetryPolicy;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one document run.
///
/// # Example
/// ```rust
/// use edgequake_pdf2deck::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .dpi(300)
///     .chunk_size(4)
///     .digital_text_threshold(100)
///     .build()
///     .unwrap();
/// assert_eq!(config.chunk_size, 4);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Rendering DPI for pages that need OCR. Range: 72–600. Default: 200.
    pub dpi: u32,

    /// Longest-edge cap for rendered pages in pixels. Default: 2500.
    ///
    /// Independent of DPI: a poster-sized page at 200 DPI would otherwise
    /// allocate hundreds of megapixels.
    pub max_rendered_pixels: u32,

    /// Minimum count of non-whitespace characters in the embedded text layer
    /// for a page to be taken as DIGITAL. A page must *exceed* this value.
    /// Default: 250.
    pub digital_text_threshold: usize,

    /// Edge-pixel fraction above which a rendered page counts as printed.
    /// Default: 0.01.
    pub edge_density_threshold: f64,

    /// Canny low/high hysteresis thresholds. Default: 50 / 150.
    pub canny_low: f32,
    pub canny_high: f32,

    /// Local OCR engine settings; `None` routes every OCR page to the remote
    /// vision model. Default: tesseract, English.
    pub local_ocr: Option<LocalOcrConfig>,

    /// Local OCR output with fewer meaningful characters than this is
    /// re-read by the remote engine. Default: 20.
    pub local_min_chars: usize,

    /// OCR worker pool size. Output order is always page order. Default: 1.
    pub ocr_concurrency: usize,

    /// Minimum spacing between remote OCR call starts, in ms. Default: 1000.
    pub ocr_interval_ms: u64,

    /// Pages per cleaning chunk. Default: 5.
    pub chunk_size: usize,

    /// Pause between consecutive chunk cleaning calls, in ms. Default: 4000.
    pub inter_chunk_delay_ms: u64,

    /// Retries after the first attempt on a transient remote error.
    /// Default: 3 (four attempts in total).
    pub max_retries: u32,

    /// First backoff delay in ms; doubles on each retry. Default: 2000.
    pub retry_backoff_ms: u64,

    /// Upper bound for a single backoff delay in ms. Default: 60000.
    pub max_backoff_ms: u64,

    /// Per-attempt remote call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Sampling temperature for chunk cleaning. Default: 0.2.
    pub clean_temperature: f32,

    /// Sampling temperature for structuring and mutation. Default: 0.0.
    pub structure_temperature: f32,

    /// Maximum output tokens per remote call. Default: 8192.
    pub max_tokens: usize,

    /// System instruction describing the desired slide style.
    /// If None, uses [`crate::prompts::DEFAULT_STYLE_INSTRUCTION`].
    pub style_instruction: Option<String>,

    /// Title given to slides the model left untitled. Default: "Untitled Slide".
    pub placeholder_title: String,

    /// LLM model identifier, e.g. "gemini-2.0-flash". If None, uses the
    /// provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "gemini", "openai").
    pub provider_name: Option<String>,

    /// Pre-constructed edgequake-llm provider.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed remote client. Takes precedence over everything else.
    pub client: Option<Arc<dyn RemoteModel>>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Timeout for downloading URL inputs, in seconds. Default: 60.
    pub download_timeout_secs: u64,

    /// Optional progress event sink.
    pub progress_callback: Option<ProgressCallback>,
}

/// Settings for the local tesseract engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalOcrConfig {
    /// Executable name or path. Default: "tesseract".
    pub command: String,
    /// Tesseract language code. Default: "eng".
    pub language: String,
    /// Page segmentation mode. Default: 3 (fully automatic).
    pub psm: u8,
    /// OCR engine mode. Default: 3.
    pub oem: u8,
}

impl Default for LocalOcrConfig {
    fn default() -> Self {
        Self {
            command: "tesseract".to_string(),
            language: "eng".to_string(),
            psm: 3,
            oem: 3,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_rendered_pixels: 2500,
            digital_text_threshold: 250,
            edge_density_threshold: 0.01,
            canny_low: 50.0,
            canny_high: 150.0,
            local_ocr: Some(LocalOcrConfig::default()),
            local_min_chars: 20,
            ocr_concurrency: 1,
            ocr_interval_ms: 1000,
            chunk_size: 5,
            inter_chunk_delay_ms: 4000,
            max_retries: 3,
            retry_backoff_ms: 2000,
            max_backoff_ms: 60_000,
            api_timeout_secs: 120,
            clean_temperature: 0.2,
            structure_temperature: 0.0,
            max_tokens: 8192,
            style_instruction: None,
            placeholder_title: "Untitled Slide".to_string(),
            model: None,
            provider_name: None,
            provider: None,
            client: None,
            password: None,
            download_timeout_secs: 60,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("digital_text_threshold", &self.digital_text_threshold)
            .field("edge_density_threshold", &self.edge_density_threshold)
            .field("local_ocr", &self.local_ocr)
            .field("ocr_concurrency", &self.ocr_concurrency)
            .field("chunk_size", &self.chunk_size)
            .field("inter_chunk_delay_ms", &self.inter_chunk_delay_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("client", &self.client.as_ref().map(|c| c.name().to_string()))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Retry policy shared by every remote call of the run.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.saturating_add(1),
            base_delay: Duration::from_millis(self.retry_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms.max(self.retry_backoff_ms)),
            attempt_timeout: Some(Duration::from_secs(self.api_timeout_secs)),
        }
    }

    /// The effective structuring style instruction.
    pub fn style(&self) -> &str {
        self.style_instruction
            .as_deref()
            .unwrap_or(crate::prompts::DEFAULT_STYLE_INSTRUCTION)
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn digital_text_threshold(mut self, chars: usize) -> Self {
        self.config.digital_text_threshold = chars;
        self
    }

    pub fn edge_density_threshold(mut self, density: f64) -> Self {
        self.config.edge_density_threshold = density;
        self
    }

    pub fn canny_thresholds(mut self, low: f32, high: f32) -> Self {
        self.config.canny_low = low;
        self.config.canny_high = high;
        self
    }

    pub fn local_ocr(mut self, local: Option<LocalOcrConfig>) -> Self {
        self.config.local_ocr = local;
        self
    }

    pub fn local_min_chars(mut self, n: usize) -> Self {
        self.config.local_min_chars = n;
        self
    }

    pub fn ocr_concurrency(mut self, n: usize) -> Self {
        self.config.ocr_concurrency = n.max(1);
        self
    }

    pub fn ocr_interval_ms(mut self, ms: u64) -> Self {
        self.config.ocr_interval_ms = ms;
        self
    }

    pub fn chunk_size(mut self, pages: usize) -> Self {
        self.config.chunk_size = pages;
        self
    }

    pub fn inter_chunk_delay_ms(mut self, ms: u64) -> Self {
        self.config.inter_chunk_delay_ms = ms;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn clean_temperature(mut self, t: f32) -> Self {
        self.config.clean_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn structure_temperature(mut self, t: f32) -> Self {
        self.config.structure_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn style_instruction(mut self, style: impl Into<String>) -> Self {
        self.config.style_instruction = Some(style.into());
        self
    }

    pub fn placeholder_title(mut self, title: impl Into<String>) -> Self {
        self.config.placeholder_title = title.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn client(mut self, client: Arc<dyn RemoteModel>) -> Self {
        self.config.client = Some(client);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, Pdf2DeckError> {
        let c = &self.config;
        if c.chunk_size == 0 {
            return Err(Pdf2DeckError::InvalidConfig(
                "chunk size must be ≥ 1 page".into(),
            ));
        }
        if !(0.0..=1.0).contains(&c.edge_density_threshold) {
            return Err(Pdf2DeckError::InvalidConfig(format!(
                "edge density threshold must be within 0–1, got {}",
                c.edge_density_threshold
            )));
        }
        if c.canny_low < 0.0 || c.canny_low > c.canny_high {
            return Err(Pdf2DeckError::InvalidConfig(format!(
                "Canny thresholds must satisfy 0 ≤ low ≤ high, got {} / {}",
                c.canny_low, c.canny_high
            )));
        }
        if c.max_tokens == 0 {
            return Err(Pdf2DeckError::InvalidConfig("max tokens must be ≥ 1".into()));
        }
        if c.placeholder_title.trim().is_empty() {
            return Err(Pdf2DeckError::InvalidConfig(
                "placeholder title must not be blank".into(),
            ));
        }
        if let Some(ref local) = c.local_ocr {
            if local.command.trim().is_empty() {
                return Err(Pdf2DeckError::InvalidConfig(
                    "local OCR command must not be blank".into(),
                ));
            }
        }
        Ok(self.config)
    }
}
