//! Tile planning: overlapping tile rectangles, edge flags and automatic tile sizing.
//!
//! Each tile owns a *core* rectangle; cores partition the image exactly. The
//! rectangle actually fed to inference is the core grown by `overlap` pixels on
//! every side that borders another tile, so image borders never carry a margin.

use serde::Serialize;

use crate::error::UpscaleError;

/// Default candidate tile side for 2x work.
pub const DEFAULT_TILE_SIZE: u32 = 512;
/// Default candidate tile side when the scale factor is 4 or more.
pub const LARGE_SCALE_TILE_SIZE: u32 = 384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }
}

/// Which sides of a tile border a neighbouring tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EdgeFlags {
    pub left: bool,
    pub right: bool,
    pub top: bool,
    pub bottom: bool,
}

impl EdgeFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn any(&self) -> bool {
        self.left || self.right || self.top || self.bottom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tile {
    pub index: usize,
    /// Region extracted from the source, overlap included.
    pub rect: TileRect,
    /// Region this tile is responsible for; cores never overlap.
    pub core: TileRect,
    pub edges: EdgeFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSizeLimits {
    pub min: u32,
    pub max: u32,
}

impl Default for TileSizeLimits {
    fn default() -> Self {
        Self { min: 64, max: 1024 }
    }
}

/// Overlap clamped so it never exceeds a quarter of the tile side.
pub fn effective_overlap(tile_size: u32, overlap: u32) -> u32 {
    overlap.min(tile_size / 4)
}

/// Plans tiles in row-major order.
///
/// Returns exactly one full-image tile when `tile_size >= max(width, height)`.
pub fn plan_tiles(
    width: u32,
    height: u32,
    tile_size: u32,
    overlap: u32,
) -> Result<Vec<Tile>, UpscaleError> {
    if width == 0 || height == 0 {
        return Err(UpscaleError::InvalidGeometry(format!(
            "image dimensions must be positive, got {width}x{height}"
        )));
    }
    if tile_size == 0 {
        return Err(UpscaleError::InvalidGeometry(
            "tile size must be positive".to_string(),
        ));
    }

    if tile_size >= width.max(height) {
        return Ok(vec![Tile {
            index: 0,
            rect: TileRect::full(width, height),
            core: TileRect::full(width, height),
            edges: EdgeFlags::none(),
        }]);
    }

    if overlap.saturating_mul(2) >= tile_size {
        return Err(UpscaleError::InvalidGeometry(format!(
            "overlap {overlap} leaves no core region in a {tile_size}px tile"
        )));
    }

    let stride = tile_size - 2 * overlap;
    let mut tiles = Vec::new();

    let mut cy = 0;
    while cy < height {
        let ch = stride.min(height - cy);
        let mut cx = 0;
        while cx < width {
            let cw = stride.min(width - cx);
            let core = TileRect::new(cx, cy, cw, ch);
            let edges = EdgeFlags {
                left: cx > 0,
                right: core.right() < width,
                top: cy > 0,
                bottom: core.bottom() < height,
            };
            let x0 = if edges.left { cx.saturating_sub(overlap) } else { cx };
            let y0 = if edges.top { cy.saturating_sub(overlap) } else { cy };
            let x1 = if edges.right {
                (core.right() + overlap).min(width)
            } else {
                core.right()
            };
            let y1 = if edges.bottom {
                (core.bottom() + overlap).min(height)
            } else {
                core.bottom()
            };

            tiles.push(Tile {
                index: tiles.len(),
                rect: TileRect::new(x0, y0, x1 - x0, y1 - y0),
                core,
                edges,
            });
            cx += cw;
        }
        cy += ch;
    }

    Ok(tiles)
}

/// Picks a tile side whose scaled output stays within `max_pixels`.
///
/// Pure: identical inputs always produce the same size.
pub fn resolve_tile_size(
    width: u32,
    height: u32,
    scale: f64,
    requested: Option<u32>,
    max_pixels: u64,
    limits: TileSizeLimits,
) -> u32 {
    let scale = if scale.is_finite() { scale.max(1.0) } else { 1.0 };
    let base = if scale >= 4.0 {
        LARGE_SCALE_TILE_SIZE
    } else {
        DEFAULT_TILE_SIZE
    };
    let candidate = requested.filter(|size| *size > 0).unwrap_or(base);

    let budget_side = ((max_pixels as f64).sqrt() / scale).floor();
    let budget_side = budget_side.clamp(0.0, u32::MAX as f64) as u32;

    candidate
        .min(limits.max)
        .min(budget_side)
        .min(width.max(height))
        .max(limits.min)
}

/// Maps a source rectangle into output space.
///
/// Start edges are floored and end edges are ceiled, so rectangles that touch in
/// the source still touch after scaling. The result always holds at least one
/// output pixel, even when rounding of the output size leaves a trailing source
/// row or column with nothing to map onto.
pub fn scale_rect(rect: TileRect, factor: f64, out_width: u32, out_height: u32) -> TileRect {
    let (x, width) = scale_span(rect.x, rect.right(), factor, out_width);
    let (y, height) = scale_span(rect.y, rect.bottom(), factor, out_height);
    TileRect::new(x, y, width, height)
}

fn scale_span(start: u32, end: u32, factor: f64, out_len: u32) -> (u32, u32) {
    let last = out_len.saturating_sub(1);
    let lo = ((start as f64 * factor).floor() as u32).min(last);
    let hi = ((end as f64 * factor).ceil() as u32).min(out_len).max(lo + 1);
    (lo, hi - lo)
}

pub fn scale_overlap(overlap: u32, factor: f64) -> u32 {
    (overlap as f64 * factor).round() as u32
}
