//! Request options and the small enums shared across the engine.

use serde::{Deserialize, Serialize};

use crate::error::UpscaleError;

/// Content class of the input; steers model choice and sharpening strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpscaleMode {
    #[default]
    Photo,
    Anime,
    Text,
}

/// Speed/quality tradeoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpscalePreset {
    Fast,
    #[default]
    Balanced,
    High,
}

impl std::fmt::Display for UpscaleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Photo => write!(f, "photo"),
            Self::Anime => write!(f, "anime"),
            Self::Text => write!(f, "text"),
        }
    }
}

impl std::fmt::Display for UpscalePreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Balanced => write!(f, "balanced"),
            Self::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilePolicy {
    pub auto: bool,
    pub size: u32,
    pub overlap: u32,
    /// Upper bound on the output pixel count of one tile.
    pub max_pixels: u64,
}

impl Default for TilePolicy {
    fn default() -> Self {
        Self {
            auto: true,
            size: 512,
            overlap: 16,
            max_pixels: 2048 * 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    #[default]
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/webp")]
    Webp,
}

impl OutputFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }

    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    pub format: OutputFormat,
    /// 0..1; only JPEG honours it.
    pub quality: f32,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            quality: 0.92,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleOptions {
    pub mode: UpscaleMode,
    pub scale: u32,
    pub preset: UpscalePreset,
    pub fidelity: f32,
    pub use_acceleration: bool,
    /// Carried for host compatibility; no face model is registered so it has no effect.
    pub face_restore: bool,
    pub target_size: Option<TargetSize>,
    pub tile: TilePolicy,
    pub output: OutputOptions,
}

impl Default for UpscaleOptions {
    fn default() -> Self {
        Self {
            mode: UpscaleMode::Photo,
            scale: 2,
            preset: UpscalePreset::Balanced,
            fidelity: 0.5,
            use_acceleration: true,
            face_restore: false,
            target_size: None,
            tile: TilePolicy::default(),
            output: OutputOptions::default(),
        }
    }
}

impl UpscaleOptions {
    pub fn validate(&self) -> Result<(), UpscaleError> {
        if self.scale != 2 && self.scale != 4 {
            return Err(UpscaleError::InvalidOptions(format!(
                "scale must be 2 or 4, got {}",
                self.scale
            )));
        }
        if !(0.0..=1.0).contains(&self.fidelity) {
            return Err(UpscaleError::InvalidOptions(format!(
                "fidelity must be within 0..1, got {}",
                self.fidelity
            )));
        }
        if !(0.0..=1.0).contains(&self.output.quality) {
            return Err(UpscaleError::InvalidOptions(format!(
                "output quality must be within 0..1, got {}",
                self.output.quality
            )));
        }
        if let Some(target) = self.target_size {
            if target.width == 0 || target.height == 0 {
                return Err(UpscaleError::InvalidOptions(
                    "target size must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Uniform factor from the source size to the output size.
    pub fn scale_factor(&self, width: u32, height: u32) -> f64 {
        match self.target_size {
            Some(target) => (target.width as f64 / width as f64)
                .min(target.height as f64 / height as f64),
            None => self.scale as f64,
        }
    }

    pub fn output_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let factor = self.scale_factor(width, height);
        let out_w = (width as f64 * factor).round().max(1.0) as u32;
        let out_h = (height as f64 * factor).round().max(1.0) as u32;
        (out_w, out_h)
    }
}

/// One unit of work: encoded input bytes plus how to upscale them.
#[derive(Debug, Clone)]
pub struct UpscaleRequest {
    pub request_id: String,
    pub image: Vec<u8>,
    pub options: UpscaleOptions,
}
