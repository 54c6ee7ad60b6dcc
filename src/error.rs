//! Error types for the edgequake-pdf2deck library.
//!
//! Failures fall into three tiers, mirroring the unit of work they affect:
//!
//! * [`Pdf2DeckError`]: **Fatal**: the document cannot be processed at all
//!   (corrupt PDF, missing credential, nothing extractable, every chunk
//!   failed). Returned as `Err` from [`crate::convert::Pipeline`].
//!
//! * [`PageError`] / [`ChunkError`]: **Non-fatal**: one page or one chunk
//!   failed after retries. Stored on [`crate::output::ExtractionResult`] and
//!   [`crate::output::CleanedChunk`], and replaced by an inline marker in the
//!   document text so the rest of the run continues.
//!
//! * [`StructuringParseError`]: the model answered, but not with a valid
//!   blueprint. The raw reply is kept so the caller can repair it by hand.

use crate::output::EngineUsed;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2deck library.
#[derive(Debug, Error)]
pub enum Pdf2DeckError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The bytes are neither a PDF nor a supported raster image.
    #[error("Unsupported input format for '{origin}'\nFirst bytes: {magic:?}")]
    UnsupportedFormat { origin: String, magic: Vec<u8> },

    // ── Document errors ───────────────────────────────────────────────────
    /// The PDF (or image) could not be opened at all.
    #[error("Document could not be opened: {detail}\nTry repairing with: qpdf input.pdf output.pdf")]
    DocumentOpen { detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired,

    /// A password was provided but it is wrong.
    #[error("Wrong password for encrypted PDF")]
    WrongPassword,

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
If the auto-download failed, you can:\n\
  • Check your internet connection and try again.\n\
  • Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    /// Every page came back empty or failed; nothing to clean.
    #[error("No text could be extracted from any of the {total} pages.\nFirst error: {first_error}")]
    NoExtractableText { total: usize, first_error: String },

    // ── Remote-model errors ───────────────────────────────────────────────
    /// Missing or malformed API credential. Raised before any network call.
    #[error("Credential problem for provider '{provider}': {hint}")]
    Credential { provider: String, hint: String },

    /// Every cleaning chunk failed after retries.
    #[error("All {total} chunks failed during cleaning.\nFirst error: {first_error}")]
    AllChunksFailed { total: usize, first_error: String },

    /// A structuring or mutation call returned something that is not a blueprint.
    #[error(transparent)]
    StructuringParse(#[from] StructuringParseError),

    /// A single whole-document remote call (structure / mutate) gave up.
    #[error("{stage} call failed after {attempts} attempt(s): {detail}")]
    RemoteCallFailed {
        stage: &'static str,
        attempts: u32,
        detail: String,
    },

    // ── State-machine errors ──────────────────────────────────────────────
    /// An operation was requested from a state that does not allow it.
    #[error("Invalid pipeline transition {from} → {to}")]
    InvalidTransition { from: String, to: String },

    /// The session has no parsed blueprint yet (structuring failed).
    #[error("No blueprint available: {0}")]
    NotReady(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A structuring/mutation reply that failed strict blueprint parsing.
///
/// `raw` is the model text exactly as received (fences included) so that a
/// caller can show it to a user for manual repair.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("Blueprint reply is not valid JSON of the expected shape: {detail}")]
pub struct StructuringParseError {
    pub raw: String,
    pub detail: String,
}

/// A non-fatal error for a single page.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// OCR failed after the retry budget was spent (or on a permanent error).
    #[error("Page {page}: {engine} OCR failed after {attempts} attempt(s): {detail}")]
    OcrFailed {
        page: usize,
        engine: EngineUsed,
        attempts: u32,
        detail: String,
    },
}

impl PageError {
    /// Inline marker substituted for the page text.
    pub fn marker(&self) -> String {
        format!("[OCR ERROR] {self}")
    }
}

/// A non-fatal error for a single cleaning chunk.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ChunkError {
    /// Cleaning call failed after retries (or on a permanent error).
    #[error("Chunk {chunk}/{total}: cleaning failed after {attempts} attempt(s): {detail}")]
    CleaningFailed {
        chunk: usize,
        total: usize,
        attempts: u32,
        detail: String,
    },
}

impl ChunkError {
    /// Inline marker substituted for the chunk's cleaned text.
    pub fn marker(&self) -> String {
        match self {
            ChunkError::CleaningFailed { chunk, .. } => {
                format!("[Error cleaning Part {chunk}: {self}]")
            }
        }
    }
}
