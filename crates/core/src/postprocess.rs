//! Unsharp-mask sharpening applied after upscaling.

use image::RgbaImage;

use crate::types::{UpscaleMode, UpscalePreset};

/// Sharpen boost applied on top of neural output, which is already crisp.
pub const NEURAL_SHARPEN_BOOST: f32 = 0.5;
/// Sharpen boost for the classical resample path.
pub const CLASSICAL_SHARPEN_BOOST: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharpenSettings {
    pub amount: f32,
    pub radius: u32,
}

impl SharpenSettings {
    pub fn for_options(mode: UpscaleMode, preset: UpscalePreset, fidelity: f32, boost: f32) -> Self {
        let base = match preset {
            UpscalePreset::High => 1.2,
            UpscalePreset::Fast => 0.6,
            UpscalePreset::Balanced => 0.9,
        };
        let mode_scale = match mode {
            UpscaleMode::Text => 0.6,
            UpscaleMode::Anime => 0.8,
            UpscaleMode::Photo => 1.0,
        };
        let fidelity = fidelity.clamp(0.0, 1.0);
        let amount = (base * (0.35 + fidelity * 0.65) * mode_scale * boost).clamp(0.0, 1.0);
        let radius = if mode == UpscaleMode::Text { 1 } else { 2 };
        Self { amount, radius }
    }
}

/// Sharpens RGB against a clamped-edge box average of side `2k+1`, `k = max(1, radius)`.
///
/// Alpha is copied through untouched. `amount <= 0` returns an identical copy.
pub fn unsharp_mask(image: &RgbaImage, amount: f32, radius: u32) -> RgbaImage {
    if amount <= 0.0 || !amount.is_finite() || image.width() == 0 || image.height() == 0 {
        return image.clone();
    }

    let width = image.width() as usize;
    let height = image.height() as usize;
    let k = radius.max(1) as isize;
    let window = (2 * k + 1) as u32;
    let src = image.as_raw();

    // Horizontal pass: per-pixel RGB sums over the row window.
    let mut row_sums = vec![0u32; width * height * 3];
    for y in 0..height {
        for x in 0..width {
            let mut acc = [0u32; 3];
            for dx in -k..=k {
                let sx = (x as isize + dx).clamp(0, width as isize - 1) as usize;
                let idx = (y * width + sx) * 4;
                acc[0] += src[idx] as u32;
                acc[1] += src[idx + 1] as u32;
                acc[2] += src[idx + 2] as u32;
            }
            let out = (y * width + x) * 3;
            row_sums[out..out + 3].copy_from_slice(&acc);
        }
    }

    let divisor = (window * window) as f32;
    let mut output = image.clone();
    let dst: &mut [u8] = &mut output;
    for y in 0..height {
        for x in 0..width {
            let mut acc = [0u32; 3];
            for dy in -k..=k {
                let sy = (y as isize + dy).clamp(0, height as isize - 1) as usize;
                let idx = (sy * width + x) * 3;
                acc[0] += row_sums[idx];
                acc[1] += row_sums[idx + 1];
                acc[2] += row_sums[idx + 2];
            }
            let idx = (y * width + x) * 4;
            for c in 0..3 {
                let original = src[idx + c] as f32;
                let average = acc[c] as f32 / divisor;
                let sharpened = original + (original - average) * amount;
                dst[idx + c] = sharpened.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([
                (x * 17 % 256) as u8,
                (y * 31 % 256) as u8,
                ((x + y) * 7 % 256) as u8,
                (x * 3 % 256) as u8,
            ])
        })
    }

    #[test]
    fn zero_amount_returns_input_unchanged() {
        let image = gradient(13, 9);
        for radius in [0, 1, 2, 5] {
            assert_eq!(unsharp_mask(&image, 0.0, radius), image);
            assert_eq!(unsharp_mask(&image, -0.4, radius), image);
        }
    }

    #[test]
    fn repeated_calls_are_byte_identical() {
        let image = gradient(21, 17);
        let first = unsharp_mask(&image, 0.7, 2);
        let second = unsharp_mask(&image, 0.7, 2);
        assert_eq!(first.as_raw(), second.as_raw());
    }

    #[test]
    fn alpha_passes_through() {
        let image = gradient(8, 8);
        let sharpened = unsharp_mask(&image, 1.0, 1);
        for (a, b) in image.pixels().zip(sharpened.pixels()) {
            assert_eq!(a[3], b[3]);
        }
    }

    #[test]
    fn flat_regions_are_untouched() {
        let image = RgbaImage::from_pixel(10, 10, Rgba([90, 120, 200, 255]));
        assert_eq!(unsharp_mask(&image, 1.0, 2), image);
    }

    #[test]
    fn edges_gain_contrast() {
        let image = RgbaImage::from_fn(6, 1, |x, _| {
            if x < 3 {
                Rgba([100, 100, 100, 255])
            } else {
                Rgba([200, 200, 200, 255])
            }
        });
        let sharpened = unsharp_mask(&image, 1.0, 1);
        assert!(sharpened.get_pixel(2, 0)[0] < 100);
        assert!(sharpened.get_pixel(3, 0)[0] > 200);
    }

    #[test]
    fn sharpen_settings_follow_mode_and_preset() {
        let photo = SharpenSettings::for_options(
            UpscaleMode::Photo,
            UpscalePreset::Balanced,
            1.0,
            CLASSICAL_SHARPEN_BOOST,
        );
        assert!((photo.amount - 0.9).abs() < 1e-6);
        assert_eq!(photo.radius, 2);

        let text = SharpenSettings::for_options(
            UpscaleMode::Text,
            UpscalePreset::High,
            0.0,
            NEURAL_SHARPEN_BOOST,
        );
        assert!((text.amount - 1.2 * 0.35 * 0.6 * 0.5).abs() < 1e-6);
        assert_eq!(text.radius, 1);

        let clamped =
            SharpenSettings::for_options(UpscaleMode::Photo, UpscalePreset::High, 1.0, 4.0);
        assert_eq!(clamped.amount, 1.0);
    }
}
