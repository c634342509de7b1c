//! Raw model output → 8-bit pixels.
//!
//! Models disagree on output range (`[-1, 1]`, `[0, 1]`, `[0, 255]`, or
//! unbounded), so the range is classified from the observed min/max and a
//! matching linear transform is applied.

use image::RgbaImage;

use crate::error::UpscaleError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputRange {
    NegOneToOne,
    ZeroToOne,
    ZeroTo255,
    /// Values above 255; rescaled so the observed maximum maps to 255.
    OutOfRange { max: f32 },
}

impl OutputRange {
    pub fn classify(min: f32, max: f32) -> Result<Self, UpscaleError> {
        if !min.is_finite() || !max.is_finite() {
            return Err(UpscaleError::InferenceInvalidOutput(format!(
                "non-finite output range [{min}, {max}]"
            )));
        }
        let range = if min < -0.05 && max <= 1.5 {
            Self::NegOneToOne
        } else if max <= 1.5 {
            Self::ZeroToOne
        } else if max <= 255.0 {
            Self::ZeroTo255
        } else {
            Self::OutOfRange { max }
        };
        Ok(range)
    }

    /// `(scale, offset)` such that `pixel = value * scale + offset`.
    pub fn transform(self) -> (f32, f32) {
        match self {
            Self::NegOneToOne => (127.5, 127.5),
            Self::ZeroToOne => (255.0, 0.0),
            Self::ZeroTo255 => (1.0, 0.0),
            Self::OutOfRange { max } => (255.0 / max, 0.0),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NegOneToOne => "neg1to1",
            Self::ZeroToOne => "0to1",
            Self::ZeroTo255 => "0to255",
            Self::OutOfRange { .. } => "auto",
        }
    }

    pub fn to_pixel(self, value: f32) -> u8 {
        let (scale, offset) = self.transform();
        (value * scale + offset).round().clamp(0.0, 255.0) as u8
    }
}

pub fn value_range(data: &[f32]) -> (f32, f32) {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &v in data {
        if v.is_nan() {
            return (f32::NAN, f32::NAN);
        }
        lo = lo.min(v);
        hi = hi.max(v);
    }
    (lo, hi)
}

/// Classifies `data` as a whole and maps every value to a byte.
pub fn normalize_values(data: &[f32]) -> Result<(Vec<u8>, OutputRange), UpscaleError> {
    if data.is_empty() {
        return Err(UpscaleError::InferenceInvalidOutput(
            "model returned an empty tensor".to_string(),
        ));
    }
    let (min, max) = value_range(data);
    let range = OutputRange::classify(min, max)?;
    Ok((data.iter().map(|&v| range.to_pixel(v)).collect(), range))
}

pub fn mean_intensity(values: &[u8]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: u64 = values.iter().map(|&v| v as u64).sum();
    sum as f32 / values.len() as f32
}

/// Interleaves three `height * width` planes into an opaque RGBA image.
pub fn planes_to_rgba(planes: &[u8], width: u32, height: u32) -> Result<RgbaImage, UpscaleError> {
    let hw = width as usize * height as usize;
    if planes.len() < hw * 3 {
        return Err(UpscaleError::InferenceInvalidOutput(format!(
            "expected {} planar values for {width}x{height}, got {}",
            hw * 3,
            planes.len()
        )));
    }
    let mut raw = Vec::with_capacity(hw * 4);
    for i in 0..hw {
        raw.extend_from_slice(&[planes[i], planes[hw + i], planes[2 * hw + i], 255]);
    }
    RgbaImage::from_raw(width, height, raw).ok_or_else(|| {
        UpscaleError::InferenceInvalidOutput("planar buffer size mismatch".to_string())
    })
}

/// Splits RGB into three `[0, 1]` planes, the layout models take as input.
pub fn rgba_to_unit_planes(image: &RgbaImage) -> Vec<f32> {
    let hw = image.width() as usize * image.height() as usize;
    let mut planes = vec![0.0f32; hw * 3];
    for (i, pixel) in image.pixels().enumerate() {
        planes[i] = pixel[0] as f32 / 255.0;
        planes[hw + i] = pixel[1] as f32 / 255.0;
        planes[2 * hw + i] = pixel[2] as f32 / 255.0;
    }
    planes
}
