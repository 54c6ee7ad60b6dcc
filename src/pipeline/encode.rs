//! Image encoding: `DynamicImage` → PNG bytes → base64 `ImageData`.
//!
//! Rendered pages travel through the pipeline as PNG bytes: the classifier
//! reads them as-is, tesseract gets a binarised copy, and the vision request
//! wraps them in a base64 [`ImageData`]. PNG is lossless, which keeps thin strokes of
//! handwriting intact for both OCR engines.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        "Encoded {}x{} page → {} bytes PNG",
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(buf)
}

/// Wrap PNG bytes for a vision request.
///
/// `detail: "high"` keeps providers that tile images from downscaling the
/// page to a single low-resolution tile.
pub fn png_to_image_data(png: &[u8]) -> ImageData {
    ImageData::new(STANDARD.encode(png), "image/png").with_detail("high")
}
