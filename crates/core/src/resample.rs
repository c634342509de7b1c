//! Classical resampling used for fallback upscales and exact-size fix-ups.

use std::sync::Arc;

use anyhow::{ensure, Result};
use image::imageops::{self, FilterType};
use image::RgbaImage;

#[cfg(feature = "gpu")]
pub mod gpu;

/// Resizes RGBA images to an exact size.
pub trait Resampler: Send + Sync {
    fn name(&self) -> &'static str;

    fn resize(&self, image: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage>;
}

/// Catmull-Rom bicubic on the CPU via `image::imageops`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuResampler;

impl Resampler for CpuResampler {
    fn name(&self) -> &'static str {
        "cpu-bicubic"
    }

    fn resize(&self, image: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage> {
        bicubic_resize(image, width, height)
    }
}

pub fn bicubic_resize(image: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage> {
    ensure!(
        width > 0 && height > 0,
        "resize target must be non-empty, got {width}x{height}"
    );
    ensure!(
        image.width() > 0 && image.height() > 0,
        "cannot resize an empty image"
    );
    if image.width() == width && image.height() == height {
        return Ok(image.clone());
    }
    Ok(imageops::resize(image, width, height, FilterType::CatmullRom))
}

/// GPU resampler for the accelerated classical path, when the `gpu` feature
/// is enabled and an adapter can be opened.
#[cfg(feature = "gpu")]
pub fn accelerated_resampler() -> Option<Arc<dyn Resampler>> {
    match gpu::GpuResampler::new() {
        Ok(resampler) => Some(Arc::new(resampler)),
        Err(error) => {
            tracing::warn!(error = %format!("{error:#}"), "GPU resampler unavailable");
            None
        }
    }
}

#[cfg(not(feature = "gpu"))]
pub fn accelerated_resampler() -> Option<Arc<dyn Resampler>> {
    None
}

/// Resamples only the alpha channel of `source` onto `target`.
pub fn restore_alpha(target: &mut RgbaImage, source: &RgbaImage) {
    if source.pixels().all(|p| p[3] == 255) {
        return;
    }
    let alpha = if source.dimensions() == target.dimensions() {
        source.clone()
    } else {
        imageops::resize(source, target.width(), target.height(), FilterType::Triangle)
    };
    for (dst, src) in target.pixels_mut().zip(alpha.pixels()) {
        dst[3] = src[3];
    }
}
