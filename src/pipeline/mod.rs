//! Pipeline stages for PDF-to-blueprint conversion.
//!
//! Each submodule implements one transformation step and is testable on its
//! own; [`crate::convert::Pipeline`] wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──▶ classify ──▶ ocr ──▶ clean ──▶ (blueprint)
//! (path/URL) (pdfium)   (edges)    (local/   (chunks,
//!                                   remote)   postprocess)
//! ```
//!
//! 1. [`input`]: read a path or download a URL, sniff PDF vs image
//! 2. [`extract`]: text layer per page if long enough, else render
//! 3. [`classify`]: printed vs handwritten, by Canny edge density
//! 4. [`ocr`]: tesseract or remote vision, with fallback and retry
//! 5. [`clean`]: partition into chunks, clean each remotely, stitch
//! 6. [`postprocess`]: deterministic cleanup of model replies
//! 7. [`encode`]: PNG / base64 helpers shared by the stages above

pub mod classify;
pub mod clean;
pub mod encode;
pub mod extract;
pub mod input;
pub mod ocr;
pub mod postprocess;
