//! Data produced by one pipeline run.
//!
//! These are plain values: the pipeline owns them while it runs and hands
//! them to the caller inside [`crate::convert::DocumentSession`].

use crate::error::{ChunkError, PageError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which engine produced a page's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineUsed {
    /// Embedded text layer, no OCR.
    Digital,
    /// Local OCR engine (tesseract).
    OcrLocal,
    /// Remote vision model.
    OcrRemote,
}

impl fmt::Display for EngineUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineUsed::Digital => "digital",
            EngineUsed::OcrLocal => "local",
            EngineUsed::OcrRemote => "remote",
        })
    }
}

/// Text for one page, in page order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// 0-based page index.
    pub page_index: usize,
    /// Page text, or an inline error marker when `error` is set.
    pub text: String,
    pub engine_used: EngineUsed,
    pub error: Option<PageError>,
}

impl ExtractionResult {
    pub fn ok(page_index: usize, text: String, engine_used: EngineUsed) -> Self {
        Self {
            page_index,
            text,
            engine_used,
            error: None,
        }
    }

    pub fn failed(page_index: usize, engine_used: EngineUsed, error: PageError) -> Self {
        Self {
            page_index,
            text: error.marker(),
            engine_used,
            error: Some(error),
        }
    }

    /// `true` when the page failed or yielded only whitespace.
    pub fn is_empty(&self) -> bool {
        self.error.is_some() || self.text.trim().is_empty()
    }
}

/// A contiguous run of pages cleaned in one remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based position.
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// 0-based page indices covered, strictly increasing.
    pub page_indices: Vec<usize>,
    /// Normalised raw text sent for cleaning.
    pub raw_text: String,
}

/// The cleaned Markdown for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanedChunk {
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Cleaned Markdown, or an inline error marker when `error` is set.
    pub markdown_text: String,
    pub attempts: u32,
    pub error: Option<ChunkError>,
}

/// Counters and timings for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub total_pages: usize,
    pub digital_pages: usize,
    pub local_ocr_pages: usize,
    pub remote_ocr_pages: usize,
    pub failed_pages: usize,
    pub total_chunks: usize,
    pub failed_chunks: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub extract_duration_ms: u64,
    pub ocr_duration_ms: u64,
    pub clean_duration_ms: u64,
    pub structure_duration_ms: u64,
}

impl RunStats {
    /// Fold per-page results into the page counters.
    pub fn record_pages(&mut self, pages: &[ExtractionResult]) {
        self.total_pages = pages.len();
        for page in pages {
            if page.error.is_some() {
                self.failed_pages += 1;
                continue;
            }
            match page.engine_used {
                EngineUsed::Digital => self.digital_pages += 1,
                EngineUsed::OcrLocal => self.local_ocr_pages += 1,
                EngineUsed::OcrRemote => self.remote_ocr_pages += 1,
            }
        }
    }
}
