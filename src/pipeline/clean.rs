//! Chunked cleaning: pages → bounded chunks → one remote call each → stitched
//! Markdown.
//!
//! ```text
//! [p1..p5] [p6..p10] [p11 p12]        partition(chunk_size = 5)
//!    │         │         │
//!    ▼         ▼         ▼            sequential, inter_chunk_delay between calls
//!  Part 1    Part 2    Part 3         CleaningPrompt { chunk_index, total_chunks }
//!    └────── "\n\n" ─────┘            join_chunks
//! ```
//!
//! A chunk whose call gives up becomes an inline `[Error cleaning Part N ...]`
//! marker; only when every chunk failed is the run itself an error.

use crate::client::{RemoteModel, RemoteRequest};
use crate::config::PipelineConfig;
use crate::error::{ChunkError, Pdf2DeckError};
use crate::output::{Chunk, CleanedChunk, ExtractionResult};
use crate::pipeline::postprocess::clean_markdown;
use crate::progress::ProgressCallback;
use crate::prompts::CleaningPrompt;
use crate::retry::{call_with_retry, RetryPolicy};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Separator placed between pages inside one chunk.
pub const PAGE_SEPARATOR: &str = "\n\n---\n\n";

/// Separator placed between cleaned chunks in the final document.
pub const CHUNK_SEPARATOR: &str = "\n\n";

static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n\s*\n+").unwrap());

/// Tidy raw page text before it is sent for cleaning.
///
/// Runs of three or more line breaks (with any whitespace between them)
/// collapse to one blank line, every line is trimmed, and so is the result.
pub fn normalize_raw_text(text: &str) -> String {
    let collapsed = RE_BLANK_RUNS.replace_all(text, "\n\n");
    collapsed
        .split('\n')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Split page results into ordered chunks of at most `chunk_size` pages.
///
/// Every page lands in exactly one chunk, in page order. `chunk_size` is
/// treated as at least 1.
pub fn partition(results: &[ExtractionResult], chunk_size: usize) -> Vec<Chunk> {
    let size = chunk_size.max(1);
    let total = results.len().div_ceil(size);
    results
        .chunks(size)
        .enumerate()
        .map(|(i, pages)| {
            let raw = pages
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join(PAGE_SEPARATOR);
            Chunk {
                chunk_index: i + 1,
                total_chunks: total,
                page_indices: pages.iter().map(|p| p.page_index).collect(),
                raw_text: normalize_raw_text(&raw),
            }
        })
        .collect()
}

/// Concatenate cleaned chunks in chunk order.
pub fn join_chunks(chunks: &[CleanedChunk]) -> String {
    let mut ordered: Vec<&CleanedChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index);
    ordered
        .iter()
        .map(|c| c.markdown_text.as_str())
        .collect::<Vec<_>>()
        .join(CHUNK_SEPARATOR)
}

/// `AllChunksFailed` when there is at least one chunk and none succeeded.
pub fn ensure_not_all_failed(chunks: &[CleanedChunk]) -> Result<(), Pdf2DeckError> {
    if chunks.is_empty() || chunks.iter().any(|c| c.error.is_none()) {
        return Ok(());
    }
    let first_error = chunks
        .iter()
        .find_map(|c| c.error.as_ref().map(ToString::to_string))
        .unwrap_or_default();
    Err(Pdf2DeckError::AllChunksFailed {
        total: chunks.len(),
        first_error,
    })
}

/// Result of cleaning every chunk.
#[derive(Debug, Clone, Default)]
pub struct CleanOutcome {
    pub chunks: Vec<CleanedChunk>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Cleans chunks one after another through the remote text model.
pub struct ChunkedCleaner {
    client: Arc<dyn RemoteModel>,
    policy: RetryPolicy,
    temperature: f32,
    max_tokens: usize,
    inter_chunk_delay: Duration,
}

impl ChunkedCleaner {
    pub fn new(client: Arc<dyn RemoteModel>, config: &PipelineConfig) -> Self {
        Self {
            client,
            policy: config.retry_policy(),
            temperature: config.clean_temperature,
            max_tokens: config.max_tokens,
            inter_chunk_delay: Duration::from_millis(config.inter_chunk_delay_ms),
        }
    }

    /// Clean one chunk. Never fails; exhaustion yields a marker chunk.
    pub async fn clean_chunk(&self, chunk: &Chunk) -> (CleanedChunk, u64, u64) {
        let prompt =
            CleaningPrompt::new(chunk.chunk_index, chunk.total_chunks).render(&chunk.raw_text);
        let label = format!("Part {}/{}", chunk.chunk_index, chunk.total_chunks);

        let outcome = call_with_retry(&self.policy, &label, |_| {
            let request = RemoteRequest {
                system: None,
                prompt: prompt.clone(),
                image: None,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                expect_json: false,
            };
            self.client.generate(request)
        })
        .await;

        match outcome {
            Ok(done) => {
                let markdown = clean_markdown(&done.value.text);
                debug!("{}: {} chars after cleanup", label, markdown.len());
                (
                    CleanedChunk {
                        chunk_index: chunk.chunk_index,
                        total_chunks: chunk.total_chunks,
                        markdown_text: markdown,
                        attempts: done.attempts,
                        error: None,
                    },
                    done.value.input_tokens,
                    done.value.output_tokens,
                )
            }
            Err(e) => {
                let err = ChunkError::CleaningFailed {
                    chunk: chunk.chunk_index,
                    total: chunk.total_chunks,
                    attempts: e.attempts,
                    detail: e.last.message,
                };
                warn!("{}", err);
                (
                    CleanedChunk {
                        chunk_index: chunk.chunk_index,
                        total_chunks: chunk.total_chunks,
                        markdown_text: err.marker(),
                        attempts: e.attempts,
                        error: Some(err),
                    },
                    0,
                    0,
                )
            }
        }
    }

    /// Clean every chunk in order, pausing `inter_chunk_delay` between calls.
    pub async fn clean(
        &self,
        chunks: &[Chunk],
        progress: Option<&ProgressCallback>,
    ) -> CleanOutcome {
        info!("Cleaning {} chunk(s)", chunks.len());
        let mut out = CleanOutcome::default();

        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 && !self.inter_chunk_delay.is_zero() {
                tokio::time::sleep(self.inter_chunk_delay).await;
            }
            if let Some(cb) = progress {
                cb.on_chunk_start(chunk.chunk_index, chunk.total_chunks);
            }

            let (cleaned, input_tokens, output_tokens) = self.clean_chunk(chunk).await;
            out.input_tokens += input_tokens;
            out.output_tokens += output_tokens;

            if let Some(cb) = progress {
                match cleaned.error {
                    None => cb.on_chunk_complete(
                        cleaned.chunk_index,
                        cleaned.total_chunks,
                        cleaned.markdown_text.len(),
                    ),
                    Some(ref e) => {
                        cb.on_chunk_error(cleaned.chunk_index, cleaned.total_chunks, &e.to_string())
                    }
                }
            }
            out.chunks.push(cleaned);
        }

        out
    }
}
