//! Deterministic test-time augmentation views.
//!
//! Each quality-passed photo is expanded into a fixed list of transformed
//! views whose per-view predictions are averaged. The list depends only on
//! the options, never on randomness, so repeated inference on the same
//! image is identical.

use image::{RgbImage, imageops};

/// Largest number of center-crop views before the kept fraction would
/// drop to 0.2 of the frame.
const MAX_USABLE_CROPS: usize = 7;

/// Test-time augmentation options.
#[derive(Debug, Clone)]
pub struct TtaOptions {
    pub enabled: bool,
    /// Number of center-crop views (0.9, 0.8, ... of the frame).
    pub crop_variants: usize,
    /// Relative brightness offset applied in the jittered views.
    pub brightness_jitter: f32,
}

impl TtaOptions {
    /// Number of views `tta_views` will produce.
    pub fn view_count(&self) -> usize {
        if !self.enabled {
            return 1;
        }
        let jitter_views = if self.brightness_jitter > 0.0 { 2 } else { 0 };
        // Crop fractions stop above 0.2, capping the usable variants.
        2 + self.crop_variants.min(MAX_USABLE_CROPS) + jitter_views
    }
}

/// Expand an image into its deterministic view list.
///
/// The original view always comes first; with TTA disabled it is the only
/// entry.
pub fn tta_views(image: &RgbImage, options: &TtaOptions) -> Vec<RgbImage> {
    let mut views = vec![image.clone()];
    if !options.enabled {
        return views;
    }

    views.push(imageops::flip_horizontal(image));

    for variant in 0..options.crop_variants {
        let keep = 0.9 - 0.1 * variant as f32;
        if keep <= 0.2 {
            break;
        }
        views.push(center_crop(image, keep));
    }

    if options.brightness_jitter > 0.0 {
        views.push(scale_brightness(image, 1.0 + options.brightness_jitter));
        views.push(scale_brightness(image, 1.0 - options.brightness_jitter));
    }

    views
}

/// Crop the central `keep` fraction and resize back to the input size.
fn center_crop(image: &RgbImage, keep: f32) -> RgbImage {
    let width = image.width();
    let height = image.height();
    let crop_w = ((width as f32 * keep) as u32).max(1);
    let crop_h = ((height as f32 * keep) as u32).max(1);
    let x = (width - crop_w) / 2;
    let y = (height - crop_h) / 2;
    let cropped = imageops::crop_imm(image, x, y, crop_w, crop_h).to_image();
    imageops::resize(&cropped, width, height, imageops::FilterType::Triangle)
}

fn scale_brightness(image: &RgbImage, gain: f32) -> RgbImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        for channel in &mut pixel.0 {
            *channel = (*channel as f32 * gain).clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn photo() -> RgbImage {
        RgbImage::from_fn(50, 40, |x, y| Rgb([x as u8, y as u8, 77]))
    }

    fn options() -> TtaOptions {
        TtaOptions {
            enabled: true,
            crop_variants: 2,
            brightness_jitter: 0.08,
        }
    }

    #[test]
    fn disabled_tta_returns_only_the_original() {
        let views = tta_views(
            &photo(),
            &TtaOptions {
                enabled: false,
                crop_variants: 2,
                brightness_jitter: 0.08,
            },
        );
        assert_eq!(views.len(), 1);
        assert_eq!(views[0], photo());
    }

    #[test]
    fn view_count_matches_options() {
        let options = options();
        let views = tta_views(&photo(), &options);
        assert_eq!(views.len(), options.view_count());
        // identity + flip + 2 crops + 2 jitters
        assert_eq!(views.len(), 6);
    }

    #[test]
    fn views_keep_the_input_dimensions() {
        let image = photo();
        for view in tta_views(&image, &options()) {
            assert_eq!(view.dimensions(), image.dimensions());
        }
    }

    #[test]
    fn views_are_deterministic() {
        let image = photo();
        let options = options();
        assert_eq!(tta_views(&image, &options), tta_views(&image, &options));
    }

    #[test]
    fn brightness_jitter_clamps_at_channel_bounds() {
        let bright = RgbImage::from_pixel(8, 8, Rgb([250, 250, 250]));
        let scaled = scale_brightness(&bright, 1.2);
        assert!(scaled.pixels().all(|p| p.0 == [255, 255, 255]));
    }
}
