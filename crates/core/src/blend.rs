//! Output canvas that composites upscaled tiles with linear seam cross-fades.

use image::RgbaImage;

use crate::tiling::{EdgeFlags, TileRect};

/// Output buffer plus a per-pixel record of which pixels already hold tile data.
pub struct TileCanvas {
    image: RgbaImage,
    written: Vec<bool>,
}

impl TileCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
            written: vec![false; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_fully_written(&self) -> bool {
        self.written.iter().all(|&w| w)
    }

    /// Writes `tile` at `dest`, cross-fading the `overlap`-wide band of every
    /// side flagged in `edges` against pixels that are already present.
    ///
    /// Tiles must arrive in planned raster order. Pixels of `tile` outside the
    /// canvas are ignored.
    pub fn blend(&mut self, tile: &RgbaImage, dest: TileRect, overlap: u32, edges: EdgeFlags) {
        let width = dest.width.min(tile.width());
        let height = dest.height.min(tile.height());
        let canvas_w = self.image.width();
        let canvas_h = self.image.height();

        for ty in 0..height {
            let oy = dest.y + ty;
            if oy >= canvas_h {
                break;
            }
            for tx in 0..width {
                let ox = dest.x + tx;
                if ox >= canvas_w {
                    break;
                }
                let src = tile.get_pixel(tx, ty);
                let slot = oy as usize * canvas_w as usize + ox as usize;

                if !self.written[slot] {
                    self.image.put_pixel(ox, oy, *src);
                    self.written[slot] = true;
                    continue;
                }

                let weight = ramp_weight(tx, ty, width, height, overlap, edges);
                if weight >= 1.0 {
                    self.image.put_pixel(ox, oy, *src);
                    continue;
                }

                let dst = self.image.get_pixel_mut(ox, oy);
                for c in 0..4 {
                    let old = dst[c] as f32;
                    let new = src[c] as f32;
                    dst[c] = (old * (1.0 - weight) + new * weight)
                        .round()
                        .clamp(0.0, 255.0) as u8;
                }
            }
        }
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

/// Weight of the incoming tile at `(x, y)`: 0 on a seam edge rising linearly to
/// 1 at `overlap` pixels inside; sides without a neighbour do not ramp.
fn ramp_weight(x: u32, y: u32, width: u32, height: u32, overlap: u32, edges: EdgeFlags) -> f32 {
    if overlap == 0 {
        return 1.0;
    }
    let band = overlap as f32;
    let mut weight = 1.0f32;
    if edges.left && x < overlap {
        weight = weight.min(x as f32 / band);
    }
    if edges.right && width - 1 - x < overlap {
        weight = weight.min((width - 1 - x) as f32 / band);
    }
    if edges.top && y < overlap {
        weight = weight.min(y as f32 / band);
    }
    if edges.bottom && height - 1 - y < overlap {
        weight = weight.min((height - 1 - y) as f32 / band);
    }
    weight
}
