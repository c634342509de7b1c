//! Request-level error taxonomy.
//!
//! Everything below the pipeline (downloads, session builds, runtime library
//! discovery) reports through `anyhow`; only failures that reach the host are
//! expressed as [`UpscaleError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("invalid tiling geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid upscale options: {0}")]
    InvalidOptions(String),

    #[error("failed to decode input image: {0}")]
    DecodeFailed(String),

    #[error(
        "requested output {width}x{height} exceeds the {max_pixels} pixel limit; \
         choose a smaller scale or a smaller image"
    )]
    ImageTooLarge {
        width: u32,
        height: u32,
        max_pixels: u64,
    },

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("model produced invalid output: {0}")]
    InferenceInvalidOutput(String),

    #[error("tile {index} failed: {reason}")]
    TileProcessingFailed { index: usize, reason: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("failed to encode output image: {0}")]
    EncodeFailed(String),
}

impl UpscaleError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_too_large_message_is_actionable() {
        let err = UpscaleError::ImageTooLarge {
            width: 8000,
            height: 6000,
            max_pixels: 20_000_000,
        };
        let message = err.to_string();
        assert!(message.contains("8000x6000"));
        assert!(message.contains("20000000"));
        assert!(message.contains("smaller scale"));
    }

    #[test]
    fn only_cancelled_reports_cancellation() {
        assert!(UpscaleError::Cancelled.is_cancelled());
        assert!(!UpscaleError::EncodeFailed("x".into()).is_cancelled());
    }
}
