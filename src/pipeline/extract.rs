//! Page extraction: embedded text layer or rendered raster, never both.
//!
//! For each page the embedded text is read first. When it holds more than
//! `digital_text_threshold` meaningful (non-whitespace) characters the page
//! is DIGITAL and is not rendered. Otherwise the page is rasterised and
//! handed to OCR.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state; [`PageExtractor`] is a
//! synchronous trait and the pipeline drives it from
//! `tokio::task::spawn_blocking` so rendering never stalls a runtime worker.

use crate::config::PipelineConfig;
use crate::error::Pdf2DeckError;
use crate::pipeline::encode::encode_png;
use pdfium_render::prelude::*;
use tracing::{debug, info, warn};

/// How a page's text will be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    /// Text layer was long enough; no rendering happened.
    Digital,
    /// Rendered for OCR.
    Rendered,
}

/// One page, as produced by a [`PageExtractor`].
#[derive(Debug, Clone)]
pub struct Page {
    /// 0-based.
    pub index: usize,
    /// Set iff `source == Digital`.
    pub digital_text: Option<String>,
    /// PNG bytes; set for rendered pages unless rendering failed.
    pub rendered_image: Option<Vec<u8>>,
    pub source: PageSource,
    /// Why rendering failed, when it did.
    pub render_error: Option<String>,
}

impl Page {
    pub fn digital(index: usize, text: String) -> Self {
        Self {
            index,
            digital_text: Some(text),
            rendered_image: None,
            source: PageSource::Digital,
            render_error: None,
        }
    }

    pub fn rendered(index: usize, png: Vec<u8>) -> Self {
        Self {
            index,
            digital_text: None,
            rendered_image: Some(png),
            source: PageSource::Rendered,
            render_error: None,
        }
    }

    pub fn render_failed(index: usize, detail: impl Into<String>) -> Self {
        Self {
            index,
            digital_text: None,
            rendered_image: None,
            source: PageSource::Rendered,
            render_error: Some(detail.into()),
        }
    }
}

/// Splits a PDF into [`Page`]s.
///
/// Failing to open the document is fatal; a page that cannot be rendered is
/// returned with `render_error` set so the rest of the document continues.
pub trait PageExtractor: Send + Sync {
    fn extract(&self, pdf: &[u8]) -> Result<Vec<Page>, Pdf2DeckError>;
}

/// Count of non-whitespace characters.
pub fn meaningful_len(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

/// `true` when the text layer is long enough to skip OCR.
pub fn is_digital_text(text: &str, threshold: usize) -> bool {
    meaningful_len(text) > threshold
}

/// Render width in pixels for a page `width_points` wide (1 pt = 1/72 in),
/// capped at `max_pixels`.
pub fn target_width(width_points: f32, dpi: u32, max_pixels: u32) -> i32 {
    let px = (width_points.max(1.0) / 72.0 * dpi as f32).round() as u32;
    px.clamp(1, max_pixels.max(1)) as i32
}

/// pdfium-backed [`PageExtractor`].
#[derive(Debug, Clone)]
pub struct PdfiumExtractor {
    pub dpi: u32,
    pub max_rendered_pixels: u32,
    pub digital_text_threshold: usize,
    pub password: Option<String>,
}

impl PdfiumExtractor {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_rendered_pixels: config.max_rendered_pixels,
            digital_text_threshold: config.digital_text_threshold,
            password: config.password.clone(),
        }
    }
}

/// Bind to the pdfium shared library, downloading it on first use.
pub fn bind_pdfium() -> Result<Pdfium, Pdf2DeckError> {
    let path = pdfium_auto::ensure_pdfium_library(None)
        .map_err(|e| Pdf2DeckError::PdfiumBindingFailed(e.to_string()))?;
    let bindings = Pdfium::bind_to_library(&path)
        .map_err(|e| Pdf2DeckError::PdfiumBindingFailed(format!("{}: {e}", path.display())))?;
    Ok(Pdfium::new(bindings))
}

fn open_error(err: PdfiumError, password: Option<&str>) -> Pdf2DeckError {
    let detail = format!("{err:?}");
    if detail.to_ascii_lowercase().contains("password") {
        if password.is_some() {
            Pdf2DeckError::WrongPassword
        } else {
            Pdf2DeckError::PasswordRequired
        }
    } else {
        Pdf2DeckError::DocumentOpen { detail }
    }
}

impl PageExtractor for PdfiumExtractor {
    fn extract(&self, pdf: &[u8]) -> Result<Vec<Page>, Pdf2DeckError> {
        let pdfium = bind_pdfium()?;
        let password = self.password.as_deref();
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, password)
            .map_err(|e| open_error(e, password))?;

        let pages = document.pages();
        let total = pages.len() as usize;
        info!("PDF loaded: {} pages", total);

        let mut out = Vec::with_capacity(total);
        for idx in 0..total {
            let page = match pages.get(idx as u16) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Page {}: cannot be loaded: {:?}", idx + 1, e);
                    out.push(Page::render_failed(idx, format!("{e:?}")));
                    continue;
                }
            };

            let text = match page.text() {
                Ok(t) => t.all(),
                Err(e) => {
                    debug!("Page {}: no text layer ({:?})", idx + 1, e);
                    String::new()
                }
            };

            if is_digital_text(&text, self.digital_text_threshold) {
                debug!("Page {}: digital ({} chars)", idx + 1, meaningful_len(&text));
                out.push(Page::digital(idx, text));
                continue;
            }

            let width = target_width(page.width().value, self.dpi, self.max_rendered_pixels);
            let render_config = PdfRenderConfig::new()
                .set_target_width(width)
                .set_maximum_height(self.max_rendered_pixels as i32);

            let rendered = page
                .render_with_config(&render_config)
                .map_err(|e| format!("{e:?}"))
                .and_then(|bitmap| {
                    let image = bitmap.as_image();
                    debug!(
                        "Page {}: rendered {}x{} px",
                        idx + 1,
                        image.width(),
                        image.height()
                    );
                    encode_png(&image).map_err(|e| e.to_string())
                });

            match rendered {
                Ok(png) => out.push(Page::rendered(idx, png)),
                Err(detail) => {
                    warn!("Page {}: rasterisation failed: {}", idx + 1, detail);
                    out.push(Page::render_failed(idx, detail));
                }
            }
        }

        Ok(out)
    }
}

/// Treat a single raster image as a one-page rendered document.
///
/// The image is decoded to validate it and re-encoded as PNG so that every
/// later stage sees the same format.
pub fn page_from_image(bytes: &[u8]) -> Result<Page, Pdf2DeckError> {
    let image = image::load_from_memory(bytes).map_err(|e| Pdf2DeckError::DocumentOpen {
        detail: format!("image could not be decoded: {e}"),
    })?;
    let png = encode_png(&image).map_err(|e| Pdf2DeckError::Internal(format!("PNG encode: {e}")))?;
    Ok(Page::rendered(0, png))
}
