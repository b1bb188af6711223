//! Fixed-size feature vectors extracted from RGB photos.
//!
//! The bundled reference classifier operates on these vectors rather than
//! raw pixels. The layout is versioned; models record the version they
//! were trained against and refuse mismatched vectors.

use image::{RgbImage, imageops};

/// Feature layout version expected by trained models.
pub const FEAT_VERSION: i64 = 1;

/// Side length of the downsampled luma grid.
const GRID_SIDE: u32 = 8;

/// Number of `f32` values per feature vector: an 8x8 luma grid plus
/// per-channel mean and standard deviation.
pub const FEATURE_LEN: usize = (GRID_SIDE * GRID_SIDE) as usize + 6;

/// Extract the versioned feature vector for one image.
pub fn feature_vector(image: &RgbImage) -> Vec<f32> {
    let mut features = Vec::with_capacity(FEATURE_LEN);

    let small = imageops::resize(image, GRID_SIDE, GRID_SIDE, imageops::FilterType::Triangle);
    for pixel in small.pixels() {
        let [r, g, b] = pixel.0;
        let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        features.push(luma / 255.0);
    }

    // Accumulate in f64; a one-pass f32 E[x^2] - mean^2 cancels
    // catastrophically over large uniform images.
    let n = (image.width() as f64 * image.height() as f64).max(1.0);
    let mut sums = [0.0f64; 3];
    let mut squares = [0.0f64; 3];
    for pixel in image.pixels() {
        for channel in 0..3 {
            let v = pixel.0[channel] as f64 / 255.0;
            sums[channel] += v;
            squares[channel] += v * v;
        }
    }
    for channel in 0..3 {
        let mean = sums[channel] / n;
        features.push(mean as f32);
        let variance = (squares[channel] / n - mean * mean).max(0.0);
        features.push(variance.sqrt() as f32);
    }

    debug_assert_eq!(features.len(), FEATURE_LEN);
    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn feature_vector_has_fixed_length() {
        let image = RgbImage::from_pixel(64, 48, Rgb([10, 200, 30]));
        let features = feature_vector(&image);
        assert_eq!(features.len(), FEATURE_LEN);
    }

    #[test]
    fn uniform_image_has_zero_channel_stddev() {
        let image = RgbImage::from_pixel(128, 128, Rgb([100, 150, 50]));
        let features = feature_vector(&image);
        // Channel stats occupy the trailing six slots as (mean, std) pairs.
        let stats = &features[FEATURE_LEN - 6..];
        assert!((stats[0] - 100.0 / 255.0).abs() < 1e-3);
        assert!(stats[1].abs() < 1e-3);
        assert!(stats[5].abs() < 1e-3);
    }

    #[test]
    fn extraction_is_deterministic() {
        let image = RgbImage::from_fn(40, 40, |x, y| Rgb([x as u8, y as u8, 128]));
        assert_eq!(feature_vector(&image), feature_vector(&image));
    }
}
