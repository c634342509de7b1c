//! BT.601 full-range YCbCr split/merge for luma-only models.

use image::RgbaImage;

/// Luma in `[0, 1]` (model input layout) and chroma in `[0, 255]`.
pub struct YCbCrPlanes {
    pub y: Vec<f32>,
    pub cb: Vec<f32>,
    pub cr: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl YCbCrPlanes {
    pub fn from_rgba(image: &RgbaImage) -> Self {
        let len = image.width() as usize * image.height() as usize;
        let mut y = Vec::with_capacity(len);
        let mut cb = Vec::with_capacity(len);
        let mut cr = Vec::with_capacity(len);

        for pixel in image.pixels() {
            let r = pixel[0] as f32;
            let g = pixel[1] as f32;
            let b = pixel[2] as f32;
            y.push((0.299 * r + 0.587 * g + 0.114 * b) / 255.0);
            cb.push(128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b);
            cr.push(128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b);
        }

        Self {
            y,
            cb,
            cr,
            width: image.width(),
            height: image.height(),
        }
    }

    /// Bilinearly resamples both chroma planes to `width x height`.
    pub fn upsample_chroma(&self, width: u32, height: u32) -> (Vec<f32>, Vec<f32>) {
        (
            bilinear_plane(&self.cb, self.width, self.height, width, height),
            bilinear_plane(&self.cr, self.width, self.height, width, height),
        )
    }
}

/// Rebuilds an opaque RGBA image from 8-bit luma and full-resolution chroma.
pub fn merge_luma(luma: &[u8], cb: &[f32], cr: &[f32], width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        let i = y as usize * width as usize + x as usize;
        let yv = luma.get(i).copied().unwrap_or(0) as f32;
        let cbv = cb.get(i).copied().unwrap_or(128.0) - 128.0;
        let crv = cr.get(i).copied().unwrap_or(128.0) - 128.0;
        let r = yv + 1.402 * crv;
        let g = yv - 0.344136 * cbv - 0.714136 * crv;
        let b = yv + 1.772 * cbv;
        image::Rgba([to_byte(r), to_byte(g), to_byte(b), 255])
    })
}

fn to_byte(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn bilinear_plane(src: &[f32], src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Vec<f32> {
    let mut out = vec![0.0f32; dst_w as usize * dst_h as usize];
    if src_w == 0 || src_h == 0 || src.is_empty() {
        return out;
    }
    let scale_x = dst_w as f32 / src_w as f32;
    let scale_y = dst_h as f32 / src_h as f32;
    let max_x = (src_w - 1) as f32;
    let max_y = (src_h - 1) as f32;
    let at = |x: usize, y: usize| src[y * src_w as usize + x];

    for oy in 0..dst_h {
        let sy = (oy as f32 / scale_y).min(max_y);
        let y0 = sy.floor() as usize;
        let y1 = (sy.ceil() as usize).min(src_h as usize - 1);
        let wy = sy - y0 as f32;
        for ox in 0..dst_w {
            let sx = (ox as f32 / scale_x).min(max_x);
            let x0 = sx.floor() as usize;
            let x1 = (sx.ceil() as usize).min(src_w as usize - 1);
            let wx = sx - x0 as f32;

            let top = at(x0, y0) * (1.0 - wx) + at(x1, y0) * wx;
            let bottom = at(x0, y1) * (1.0 - wx) + at(x1, y1) * wx;
            out[oy as usize * dst_w as usize + ox as usize] = top * (1.0 - wy) + bottom * wy;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn split_and_merge_preserves_colour() {
        let image = RgbaImage::from_fn(4, 3, |x, y| {
            Rgba([(x * 60) as u8, (y * 80) as u8, 200 - (x * 20) as u8, 255])
        });
        let planes = YCbCrPlanes::from_rgba(&image);
        let luma: Vec<u8> = planes.y.iter().map(|v| to_byte(v * 255.0)).collect();
        let merged = merge_luma(&luma, &planes.cb, &planes.cr, 4, 3);

        for (a, b) in image.pixels().zip(merged.pixels()) {
            for c in 0..3 {
                assert!((a[c] as i32 - b[c] as i32).abs() <= 2, "{a:?} vs {b:?}");
            }
            assert_eq!(b[3], 255);
        }
    }

    #[test]
    fn grey_has_neutral_chroma() {
        let image = RgbaImage::from_pixel(2, 2, Rgba([90, 90, 90, 255]));
        let planes = YCbCrPlanes::from_rgba(&image);
        assert!(planes.cb.iter().all(|v| (v - 128.0).abs() < 1e-3));
        assert!(planes.cr.iter().all(|v| (v - 128.0).abs() < 1e-3));
        assert!((planes.y[0] - 90.0 / 255.0).abs() < 1e-4);
    }

    #[test]
    fn chroma_upsample_interpolates_between_samples() {
        let plane = vec![0.0, 100.0];
        let out = bilinear_plane(&plane, 2, 1, 4, 1);
        assert_eq!(out, vec![0.0, 50.0, 100.0, 100.0]);
    }
}
