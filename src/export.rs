//! Serialisers for finished blueprints.
//!
//! These take a [`Blueprint`] (or cleaned Markdown) and produce bytes; they
//! hold no pipeline logic.

use crate::blueprint::Blueprint;
use crate::error::Pdf2DeckError;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Render a blueprint as a Markdown report.
///
/// ```rust
/// use edgequake_pdf2deck::{Blueprint, Slide, export::markdown_report};
///
/// let bp = Blueprint::new(vec![Slide::new("Intro", vec!["Hello".into()])]);
/// let md = markdown_report(&bp);
/// assert!(md.starts_with("# Presentation Content Report"));
/// assert!(md.contains("## Slide 1: Intro"));
/// ```
pub fn markdown_report(blueprint: &Blueprint) -> String {
    let mut out = String::from("# Presentation Content Report\n");
    for (i, slide) in blueprint.iter().enumerate() {
        out.push_str(&format!("\n## Slide {}: {}\n\n", i + 1, slide.title));
        if slide.content.is_empty() {
            out.push_str("*(No detailed content provided for this slide.)*\n");
        } else {
            for point in &slide.content {
                out.push_str(&format!("* {point}\n"));
            }
        }
        out.push_str("\n---\n");
    }
    out
}

/// Write `bytes` to `path` via a temporary file in the same directory and a
/// rename, so readers never observe a half-written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Pdf2DeckError> {
    let wrap = |source: std::io::Error| Pdf2DeckError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(wrap)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(wrap)?;
    tmp.write_all(bytes).map_err(wrap)?;
    tmp.flush().map_err(wrap)?;
    tmp.persist(path).map_err(|e| wrap(e.error))?;

    debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}
