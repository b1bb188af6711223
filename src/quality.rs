//! Pre-inference image quality gate.
//!
//! Scores a decoded RGB field photo on sharpness, exposure, contrast and
//! subject coverage, and rejects degenerate inputs before any inference is
//! spent on them. Scoring is a pure function of the pixels; the score is
//! monotone non-decreasing in sharpness and brightness so that adding blur
//! or darkness can only lower it.

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::config::QualityConfig;

/// Reasons a photo was judged unusable for diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityDefect {
    TooBlurry,
    TooDark,
    TooBright,
    InsufficientSubject,
}

impl QualityDefect {
    /// Stable code used in API payloads and storage.
    pub fn as_str(self) -> &'static str {
        match self {
            QualityDefect::TooBlurry => "too_blurry",
            QualityDefect::TooDark => "too_dark",
            QualityDefect::TooBright => "too_bright",
            QualityDefect::InsufficientSubject => "insufficient_subject",
        }
    }

    /// User-facing advice for re-shooting the photo.
    pub fn recommendation(self) -> &'static str {
        match self {
            QualityDefect::TooBlurry => {
                "Image appears blurry. Hold the camera steady and refocus on the leaf."
            }
            QualityDefect::TooDark => "Image is too dark. Increase lighting or use flash.",
            QualityDefect::TooBright => {
                "Image is too bright. Reduce lighting or avoid direct sunlight."
            }
            QualityDefect::InsufficientSubject => {
                "The plant fills too little of the frame. Move closer to the affected leaf."
            }
        }
    }
}

/// Result of assessing one photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    /// Whether the photo may proceed to inference.
    pub pass: bool,
    /// Combined quality score in `[0, 100]`.
    pub score: f32,
    /// Defect codes explaining a rejection (may also flag a passing photo).
    pub defects: Vec<QualityDefect>,
    /// Laplacian variance of the luma plane.
    pub sharpness: f32,
    /// Mean luma in `[0, 255]`.
    pub brightness: f32,
    /// Luma standard deviation.
    pub contrast: f32,
    /// Fraction of pixels judged to belong to the plant subject.
    pub coverage: f32,
}

impl QualityReport {
    /// Advice strings for every flagged defect.
    pub fn recommendations(&self) -> Vec<&'static str> {
        self.defects
            .iter()
            .map(|defect| defect.recommendation())
            .collect()
    }
}

/// Weighted-heuristic quality gate.
#[derive(Debug, Clone)]
pub struct QualityGate {
    config: QualityConfig,
}

/// Sharpness value mapped to a full component score.
const SHARPNESS_FULL_SCALE: f32 = 1000.0;
/// Luma below this scores zero on the exposure component.
const EXPOSURE_FLOOR: f32 = 40.0;
/// Contrast value mapped to a full component score.
const CONTRAST_FULL_SCALE: f32 = 80.0;

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Score an image and decide whether it may proceed to inference.
    pub fn assess(&self, image: &RgbImage) -> QualityReport {
        let luma = luma_plane(image);
        let sharpness = laplacian_variance(&luma, image.width() as usize);
        let (brightness, contrast) = mean_and_stddev(&luma);
        let coverage = subject_coverage(image);

        let sharpness_norm = ramp(sharpness, 0.0, SHARPNESS_FULL_SCALE);
        let exposure_norm = ramp(brightness, EXPOSURE_FLOOR, 255.0);
        let contrast_norm = ramp(contrast, 0.0, CONTRAST_FULL_SCALE);
        let coverage_norm = ramp(coverage, 0.0, 0.5);

        let config = &self.config;
        let weight_sum = config.sharpness_weight
            + config.exposure_weight
            + config.contrast_weight
            + config.coverage_weight;
        let score = (sharpness_norm * config.sharpness_weight
            + exposure_norm * config.exposure_weight
            + contrast_norm * config.contrast_weight
            + coverage_norm * config.coverage_weight)
            / weight_sum;
        let score = score.clamp(0.0, 100.0);

        let mut defects = Vec::new();
        if sharpness < config.min_sharpness {
            defects.push(QualityDefect::TooBlurry);
        }
        if brightness < config.min_brightness {
            defects.push(QualityDefect::TooDark);
        }
        if brightness > config.max_brightness {
            defects.push(QualityDefect::TooBright);
        }
        if coverage < config.min_coverage {
            defects.push(QualityDefect::InsufficientSubject);
        }

        let pass = score >= config.pass_threshold;
        if !pass && defects.is_empty() {
            // Rejection must always carry a reason; blame the weakest component.
            defects.push(weakest_component(
                sharpness_norm,
                exposure_norm,
                coverage_norm,
            ));
        }

        QualityReport {
            pass,
            score,
            defects,
            sharpness,
            brightness,
            contrast,
            coverage,
        }
    }
}

/// Linear ramp from 0 at `floor` to 100 at `full`, clamped.
fn ramp(value: f32, floor: f32, full: f32) -> f32 {
    if full <= floor {
        return 0.0;
    }
    ((value - floor) / (full - floor) * 100.0).clamp(0.0, 100.0)
}

fn weakest_component(sharpness_norm: f32, exposure_norm: f32, coverage_norm: f32) -> QualityDefect {
    let mut weakest = (sharpness_norm, QualityDefect::TooBlurry);
    if exposure_norm < weakest.0 {
        weakest = (exposure_norm, QualityDefect::TooDark);
    }
    if coverage_norm < weakest.0 {
        weakest = (coverage_norm, QualityDefect::InsufficientSubject);
    }
    weakest.1
}

fn luma_plane(image: &RgbImage) -> Vec<f32> {
    image
        .pixels()
        .map(|pixel| {
            let [r, g, b] = pixel.0;
            0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
        })
        .collect()
}

fn mean_and_stddev(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, variance.sqrt())
}

/// Variance of the 4-neighbor Laplacian over interior pixels.
fn laplacian_variance(luma: &[f32], width: usize) -> f32 {
    if width < 3 || luma.len() < width * 3 {
        return 0.0;
    }
    let height = luma.len() / width;
    let mut responses = Vec::with_capacity((width - 2) * (height - 2));
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let idx = y * width + x;
            let response = 4.0 * luma[idx]
                - luma[idx - 1]
                - luma[idx + 1]
                - luma[idx - width]
                - luma[idx + width];
            responses.push(response);
        }
    }
    let (_, stddev) = mean_and_stddev(&responses);
    stddev * stddev
}

/// Fraction of pixels where green dominates both other channels.
///
/// A crude but effective proxy for how much of the frame is foliage.
fn subject_coverage(image: &RgbImage) -> f32 {
    let total = image.pixels().len();
    if total == 0 {
        return 0.0;
    }
    let green = image
        .pixels()
        .filter(|pixel| {
            let [r, g, b] = pixel.0;
            g > 40 && g as u16 * 10 > r as u16 * 11 && g as u16 * 10 > b as u16 * 11
        })
        .count();
    green as f32 / total as f32
}
