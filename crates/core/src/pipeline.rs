//! Request orchestration: decode, plan, upscale tile by tile, blend, encode.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType, ImageFormat, RgbaImage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::blend::TileCanvas;
use crate::config::EngineConfig;
use crate::diagnostics::Diagnostics;
use crate::error::UpscaleError;
use crate::events::{EventSink, ProgressStage};
use crate::inference::InferenceRunner;
use crate::tiling::{
    effective_overlap, plan_tiles, resolve_tile_size, scale_overlap, scale_rect, Tile,
    TileSizeLimits,
};
use crate::types::{OutputFormat, OutputOptions, UpscaleOptions, UpscaleRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Decoding,
    Planning,
    Extracting,
    Inferring,
    Blending,
    Encoding,
    Done,
    Cancelled,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        if next == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, Decoding)
                | (Decoding, Planning)
                | (Decoding, Failed)
                | (Planning, Extracting)
                | (Planning, Inferring)
                | (Planning, Failed)
                | (Extracting, Inferring)
                | (Inferring, Blending)
                | (Inferring, Encoding)
                | (Inferring, Failed)
                | (Blending, Extracting)
                | (Blending, Encoding)
                | (Encoding, Done)
                | (Encoding, Failed)
        )
    }
}

/// Current state of one request. Illegal moves are logged and ignored.
struct StateTracker<'a> {
    request_id: &'a str,
    state: PipelineState,
}

impl<'a> StateTracker<'a> {
    fn new(request_id: &'a str) -> Self {
        Self {
            request_id,
            state: PipelineState::Idle,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        if self.state.can_transition_to(next) {
            trace!(request_id = %self.request_id, from = ?self.state, to = ?next, "Pipeline state");
            self.state = next;
        } else {
            error!(
                request_id = %self.request_id,
                from = ?self.state,
                to = ?next,
                "Rejected pipeline state transition"
            );
        }
    }

    /// Moves to `Cancelled` or `Failed` to match `err`, then hands it back.
    fn fail(&mut self, err: UpscaleError) -> UpscaleError {
        if err.is_cancelled() {
            self.advance(PipelineState::Cancelled);
        } else {
            self.advance(PipelineState::Failed);
        }
        err
    }
}

/// Encoded output of a finished request.
#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleOutput {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
}

pub struct UpscalePipeline {
    runner: Arc<InferenceRunner>,
    engine: EngineConfig,
}

impl UpscalePipeline {
    pub fn new(runner: Arc<InferenceRunner>, engine: EngineConfig) -> Self {
        Self { runner, engine }
    }

    pub fn runner(&self) -> &Arc<InferenceRunner> {
        &self.runner
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Runs one request to completion. Progress, status and the first
    /// diagnostics snapshot go to `sink`; the terminal event is left to the
    /// caller.
    pub fn run(
        &self,
        request: &UpscaleRequest,
        cancel: &CancellationToken,
        sink: &EventSink,
        diagnostics: &Diagnostics,
    ) -> Result<UpscaleOutput, UpscaleError> {
        let mut state = StateTracker::new(&request.request_id);
        self.run_stages(request, cancel, sink, diagnostics, &mut state)
            .map_err(|err| state.fail(err))
    }

    fn run_stages(
        &self,
        request: &UpscaleRequest,
        cancel: &CancellationToken,
        sink: &EventSink,
        diagnostics: &Diagnostics,
        state: &mut StateTracker<'_>,
    ) -> Result<UpscaleOutput, UpscaleError> {
        let started = Instant::now();
        let options = &request.options;

        state.advance(PipelineState::Decoding);
        options.validate()?;
        let source = decode_image(&request.image)?;
        sink.progress(0, 0, None, ProgressStage::Decode);

        let (src_w, src_h) = source.dimensions();
        let factor = options.scale_factor(src_w, src_h);
        let (out_w, out_h) = options.output_dimensions(src_w, src_h);
        let out_pixels = out_w as u64 * out_h as u64;
        if out_pixels > self.engine.max_output_pixels {
            return Err(UpscaleError::ImageTooLarge {
                width: out_w,
                height: out_h,
                max_pixels: self.engine.max_output_pixels,
            });
        }

        state.advance(PipelineState::Planning);
        let (tiles, overlap) = self.plan(src_w, src_h, factor, options)?;
        info!(
            request_id = %request.request_id,
            src_w,
            src_h,
            out_w,
            out_h,
            tiles = tiles.len(),
            "Upscale planned"
        );

        let image = if tiles.len() == 1 {
            if cancel.is_cancelled() {
                return Err(UpscaleError::Cancelled);
            }
            state.advance(PipelineState::Inferring);
            let upscaled = self
                .runner
                .infer(&source, out_w, out_h, options, diagnostics)
                .map_err(|err| tile_failure(0, err))?;
            sink.diagnostic(diagnostics.snapshot());
            sink.progress(1, 1, None, ProgressStage::Upscale);
            upscaled
        } else {
            self.upscale_tiles(
                &source,
                &tiles,
                scale_overlap(overlap, factor),
                factor,
                (out_w, out_h),
                options,
                cancel,
                sink,
                diagnostics,
                state,
            )?
        };

        if cancel.is_cancelled() {
            return Err(UpscaleError::Cancelled);
        }
        state.advance(PipelineState::Encoding);
        sink.progress(tiles.len(), tiles.len(), None, ProgressStage::Encode);
        let bytes = encode_image(image, &options.output)?;
        state.advance(PipelineState::Done);

        let elapsed_ms = started.elapsed().as_millis();
        sink.status(format!("completed in {elapsed_ms} ms"));
        info!(
            request_id = %request.request_id,
            elapsed_ms = elapsed_ms as u64,
            bytes = bytes.len(),
            "Upscale finished"
        );

        Ok(UpscaleOutput {
            bytes,
            width: out_w,
            height: out_h,
            format: options.output.format,
        })
    }

    fn plan(
        &self,
        width: u32,
        height: u32,
        factor: f64,
        options: &UpscaleOptions,
    ) -> Result<(Vec<Tile>, u32), UpscaleError> {
        if width.max(height) <= self.engine.whole_image_max_side {
            return Ok((plan_tiles(width, height, width.max(height), 0)?, 0));
        }

        let policy = &options.tile;
        let tile_size = if policy.auto {
            resolve_tile_size(
                width,
                height,
                factor,
                Some(policy.size),
                policy.max_pixels,
                TileSizeLimits {
                    min: self.engine.min_tile_size,
                    max: self.engine.max_tile_size,
                },
            )
        } else {
            policy.size
        };
        let overlap = effective_overlap(tile_size, policy.overlap);
        debug!(tile_size, overlap, "Tile geometry");
        Ok((plan_tiles(width, height, tile_size, overlap)?, overlap))
    }

    #[allow(clippy::too_many_arguments)]
    fn upscale_tiles(
        &self,
        source: &RgbaImage,
        tiles: &[Tile],
        scaled_overlap: u32,
        factor: f64,
        (out_w, out_h): (u32, u32),
        options: &UpscaleOptions,
        cancel: &CancellationToken,
        sink: &EventSink,
        diagnostics: &Diagnostics,
        state: &mut StateTracker<'_>,
    ) -> Result<RgbaImage, UpscaleError> {
        let total = tiles.len();
        let mut canvas = TileCanvas::new(out_w, out_h);
        let started = Instant::now();

        for (done, tile) in tiles.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(index = tile.index, "Cancelled before tile");
                return Err(UpscaleError::Cancelled);
            }

            state.advance(PipelineState::Extracting);
            let crop = image::imageops::crop_imm(
                source,
                tile.rect.x,
                tile.rect.y,
                tile.rect.width,
                tile.rect.height,
            )
            .to_image();
            let dest = scale_rect(tile.rect, factor, out_w, out_h);

            state.advance(PipelineState::Inferring);
            let upscaled = self
                .runner
                .infer(&crop, dest.width, dest.height, options, diagnostics)
                .map_err(|err| tile_failure(tile.index, err))?;
            if done == 0 {
                sink.diagnostic(diagnostics.snapshot());
            }

            state.advance(PipelineState::Blending);
            canvas.blend(&upscaled, dest, scaled_overlap, tile.edges);

            let done = done + 1;
            let remaining = total - done;
            let per_tile = started.elapsed().as_secs_f64() / done as f64;
            let eta = (per_tile * remaining as f64).round() as u64;
            debug!(index = tile.index, done, total, eta, "Tile upscaled");
            sink.progress(done, total, Some(eta), ProgressStage::Upscale);

            std::thread::yield_now();
        }

        if !canvas.is_fully_written() {
            warn!(total, "Tile canvas has unwritten pixels");
        }
        sink.progress(total, total, None, ProgressStage::Blend);
        Ok(canvas.into_image())
    }
}

fn tile_failure(index: usize, err: UpscaleError) -> UpscaleError {
    match err {
        UpscaleError::Cancelled | UpscaleError::TileProcessingFailed { .. } => err,
        other => UpscaleError::TileProcessingFailed {
            index,
            reason: other.to_string(),
        },
    }
}

fn decode_image(bytes: &[u8]) -> Result<RgbaImage, UpscaleError> {
    image::load_from_memory(bytes)
        .map(|decoded| decoded.to_rgba8())
        .map_err(|err| UpscaleError::DecodeFailed(err.to_string()))
}

/// Maps 0..1 quality onto the 1..100 scale the JPEG encoder expects.
pub fn jpeg_quality(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

/// PNG keeps alpha, JPEG drops it, WebP is written losslessly.
pub fn encode_image(image: RgbaImage, output: &OutputOptions) -> Result<Vec<u8>, UpscaleError> {
    let mut cursor = Cursor::new(Vec::new());
    let (width, height) = image.dimensions();
    let encoded = match output.format {
        OutputFormat::Png => image.write_to(&mut cursor, ImageFormat::Png),
        OutputFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
            JpegEncoder::new_with_quality(&mut cursor, jpeg_quality(output.quality))
                .encode_image(&rgb)
        }
        OutputFormat::Webp => WebPEncoder::new_lossless(&mut cursor).encode(
            image.as_raw(),
            width,
            height,
            ExtendedColorType::Rgba8,
        ),
    };
    encoded.map_err(|err| UpscaleError::EncodeFailed(err.to_string()))?;
    Ok(cursor.into_inner())
}
