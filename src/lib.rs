//! # edgequake-pdf2deck
//!
//! Turn a PDF (digital, scanned or handwritten) into a slide blueprint: an
//! ordered JSON array of `{ "title", "content": [...] }` objects that a deck
//! builder can consume, and that can be revised afterwards with free-text
//! instructions.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image / URL
//!  │
//!  ├─ 1. Extract   text layer per page; render pages without one (pdfium)
//!  ├─ 2. Classify  printed vs handwritten by Canny edge density
//!  ├─ 3. OCR       tesseract for printed pages, remote vision otherwise,
//!  │               retried with exponential backoff
//!  ├─ 4. Clean     pages grouped into chunks, each cleaned remotely in order
//!  ├─ 5. Structure cleaned Markdown → blueprint (strictly parsed)
//!  └─ 6. Mutate    instruction + current blueprint → replacement blueprint
//! ```
//!
//! Failures degrade where they can: an unreadable page becomes an
//! `[OCR ERROR]` marker, a chunk that keeps failing becomes an
//! `[Error cleaning Part N...]` marker, and a structuring reply that is not a
//! blueprint is kept raw for repair. Only an empty document, a missing
//! credential, or every chunk failing abort the run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2deck::{Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from GEMINI_API_KEY / OPENAI_API_KEY / …
//!     let config = PipelineConfig::default();
//!     let mut session = Pipeline::new(config).run_input("lecture.pdf").await?;
//!
//!     session.mutate("Split the longest slide in two").await?;
//!     if let Some(bp) = session.blueprint() {
//!         println!("{}", bp.to_json_pretty()?);
//!     }
//!     eprintln!("tokens: {} in / {} out",
//!         session.stats.total_input_tokens,
//!         session.stats.total_output_tokens);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2deck` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdf2deck = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod blueprint;
pub mod client;
pub mod config;
pub mod convert;
pub mod error;
pub mod export;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use blueprint::{parse_blueprint, Blueprint, BlueprintStore, Slide};
pub use client::{LlmModel, RemoteModel, RemoteReply, RemoteRequest};
pub use config::{LocalOcrConfig, PipelineConfig, PipelineConfigBuilder};
pub use convert::{DocumentSession, Pipeline, PipelineState, StructuringOutcome};
pub use error::{ChunkError, PageError, Pdf2DeckError, StructuringParseError};
pub use output::{Chunk, CleanedChunk, EngineUsed, ExtractionResult, RunStats};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use retry::{ErrorKind, RemoteError, RetryPolicy};
