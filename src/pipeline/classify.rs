//! Printed-vs-handwritten classification of rendered pages.
//!
//! Printed text yields dense, sharp edges under a Canny detector; handwriting
//! and photographed pages yield fewer, fuzzier ones. The decision is a single
//! comparison against `edge_density_threshold`.

use crate::config::PipelineConfig;
use image::GrayImage;
use imageproc::edges::canny;
use tracing::{debug, warn};

/// Which OCR path a rendered page should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Printed/typeset; the local engine can read it.
    Digital,
    /// Handwriting or complex layout; needs the remote vision model.
    Handwritten,
}

/// Scores a rendered page image. Must not fail: any internal problem maps to
/// [`ImageKind::Handwritten`], the more robust path.
pub trait ImageClassifier: Send + Sync {
    fn classify(&self, image: &[u8]) -> ImageKind;
}

/// Canny edge-density classifier.
#[derive(Debug, Clone, Copy)]
pub struct EdgeDensityClassifier {
    pub threshold: f64,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Default for EdgeDensityClassifier {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            canny_low: 50.0,
            canny_high: 150.0,
        }
    }
}

impl EdgeDensityClassifier {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            threshold: config.edge_density_threshold,
            canny_low: config.canny_low,
            canny_high: config.canny_high,
        }
    }

    /// Fraction of pixels marked as edges.
    pub fn edge_density(&self, gray: &GrayImage) -> f64 {
        let total = gray.width() as u64 * gray.height() as u64;
        if total == 0 {
            return 0.0;
        }
        let edges = canny(gray, self.canny_low, self.canny_high);
        let on = edges.pixels().filter(|p| p.0[0] > 0).count() as u64;
        on as f64 / total as f64
    }
}

impl ImageClassifier for EdgeDensityClassifier {
    fn classify(&self, image: &[u8]) -> ImageKind {
        let gray = match image::load_from_memory(image) {
            Ok(img) => img.to_luma8(),
            Err(e) => {
                warn!("Classifier could not decode page image ({e}); treating as handwritten");
                return ImageKind::Handwritten;
            }
        };
        if gray.width() == 0 || gray.height() == 0 {
            warn!("Classifier got an empty image; treating as handwritten");
            return ImageKind::Handwritten;
        }

        let density = self.edge_density(&gray);
        let kind = if density > self.threshold {
            ImageKind::Digital
        } else {
            ImageKind::Handwritten
        };
        debug!(
            "Edge density {:.4} (threshold {:.4}) → {:?}",
            density, self.threshold, kind
        );
        kind
    }
}
