//! Input resolution: turn a user-supplied path or URL into document bytes.
//!
//! The pipeline works on bytes (pdfium loads from a slice), so URLs are
//! downloaded straight into memory. The first bytes decide the document
//! kind; anything that is neither a PDF nor a PNG/JPEG image is rejected here
//! with a readable error instead of failing deep inside pdfium.

use crate::error::Pdf2DeckError;
use std::path::PathBuf;
use tracing::{debug, info};

/// What the input bytes contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pdf,
    /// A single raster page (PNG or JPEG).
    Image,
}

/// A resolved input document.
#[derive(Debug, Clone)]
pub struct InputDocument {
    pub bytes: Vec<u8>,
    pub kind: InputKind,
    /// Path or URL the bytes came from, for messages.
    pub origin: String,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Classify bytes by their magic signature.
pub fn sniff_kind(bytes: &[u8]) -> Option<InputKind> {
    if bytes.starts_with(b"%PDF") {
        Some(InputKind::Pdf)
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") || bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(InputKind::Image)
    } else {
        None
    }
}

fn classify(bytes: Vec<u8>, origin: String) -> Result<InputDocument, Pdf2DeckError> {
    match sniff_kind(&bytes) {
        Some(kind) => {
            debug!("Resolved {:?} input: {} ({} bytes)", kind, origin, bytes.len());
            Ok(InputDocument {
                bytes,
                kind,
                origin,
            })
        }
        None => Err(Pdf2DeckError::UnsupportedFormat {
            origin,
            magic: bytes.iter().take(8).copied().collect(),
        }),
    }
}

/// Resolve the input string to document bytes.
///
/// If the input is a URL, download it. If it is a local file, read it.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<InputDocument, Pdf2DeckError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input).await
    }
}

async fn resolve_local(path_str: &str) -> Result<InputDocument, Pdf2DeckError> {
    let path = PathBuf::from(path_str);

    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            Pdf2DeckError::PermissionDenied { path: path.clone() }
        }
        std::io::ErrorKind::NotFound => Pdf2DeckError::FileNotFound { path: path.clone() },
        _ if path.is_dir() => Pdf2DeckError::InvalidInput {
            input: path_str.to_string(),
        },
        _ => Pdf2DeckError::FileNotFound { path: path.clone() },
    })?;

    classify(bytes, path.display().to_string())
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<InputDocument, Pdf2DeckError> {
    info!("Downloading document from: {}", url);

    if reqwest::Url::parse(url).is_err() {
        return Err(Pdf2DeckError::InvalidInput {
            input: url.to_string(),
        });
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Pdf2DeckError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let download_error = |e: reqwest::Error| {
        if e.is_timeout() {
            Pdf2DeckError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            Pdf2DeckError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let response = client.get(url).send().await.map_err(download_error)?;

    if !response.status().is_success() {
        return Err(Pdf2DeckError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response.bytes().await.map_err(download_error)?;
    info!("Downloaded {} bytes", bytes.len());

    classify(bytes.to_vec(), url.to_string())
}
