//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to follow a
//! run stage by stage, page by page and chunk by chunk.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2deck::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct ChunkCounter {
//!     done: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for ChunkCounter {
//!     fn on_chunk_complete(&self, chunk_index: usize, total_chunks: usize, len: usize) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("Part {}/{} cleaned ({} bytes, {} so far)", chunk_index, total_chunks, len, n);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(ChunkCounter { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::convert::PipelineState;
use crate::output::EngineUsed;
use std::sync::Arc;

/// Called by the pipeline as it moves through a document.
///
/// Implementations must be `Send + Sync`: OCR pages may be processed by a
/// worker pool. Every method has a no-op default, so callers only override
/// what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// The pipeline entered a new state.
    fn on_state_change(&self, state: PipelineState) {
        let _ = state;
    }

    /// Extraction finished.
    ///
    /// # Arguments
    /// * `total_pages`: pages in the document
    /// * `digital_pages`: pages taken from the text layer
    /// * `rendered_pages`: pages queued for OCR
    fn on_page_extracted(&self, total_pages: usize, digital_pages: usize, rendered_pages: usize) {
        let _ = (total_pages, digital_pages, rendered_pages);
    }

    /// A rendered page was read by an OCR engine.
    ///
    /// `page_num` is 1-indexed.
    fn on_page_ocr_complete(&self, page_num: usize, engine: EngineUsed, text_len: usize) {
        let _ = (page_num, engine, text_len);
    }

    /// A page failed and was replaced by an error marker.
    fn on_page_error(&self, page_num: usize, error: &str) {
        let _ = (page_num, error);
    }

    /// A cleaning call is about to start. `chunk_index` is 1-based.
    fn on_chunk_start(&self, chunk_index: usize, total_chunks: usize) {
        let _ = (chunk_index, total_chunks);
    }

    /// A chunk was cleaned; `markdown_len` is the byte length of the result.
    fn on_chunk_complete(&self, chunk_index: usize, total_chunks: usize, markdown_len: usize) {
        let _ = (chunk_index, total_chunks, markdown_len);
    }

    /// A chunk failed after retries and was replaced by an error marker.
    fn on_chunk_error(&self, chunk_index: usize, total_chunks: usize, error: &str) {
        let _ = (chunk_index, total_chunks, error);
    }
}

/// A no-op implementation; used when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
