//! Per-tile upscaling: neural strategies first, classical resampling last.
//!
//! The order in which strategies are tried is computed up front by
//! [`plan_strategies`]; [`InferenceRunner::infer`] walks the list and stops at
//! the first strategy that produces an image. Only the CPU classical resample
//! can fail the tile.

use std::sync::Arc;

use image::RgbaImage;
use ndarray::{Array4, ArrayD};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::color::{merge_luma, YCbCrPlanes};
use crate::diagnostics::{Diagnostics, DiagnosticsUpdate};
use crate::error::UpscaleError;
use crate::model_registry::{ModelDescriptor, ModelRegistry};
use crate::normalize::{mean_intensity, normalize_values, planes_to_rgba, rgba_to_unit_planes};
use crate::postprocess::{
    unsharp_mask, SharpenSettings, CLASSICAL_SHARPEN_BOOST, NEURAL_SHARPEN_BOOST,
};
use crate::resample::{bicubic_resize, restore_alpha, Resampler};
use crate::session::{ExecutionProvider, InferenceSession, SessionCache};
use crate::types::{UpscaleOptions, UpscalePreset};

/// Empirical tuning constants for strategy selection and output validation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceThresholds {
    /// Below this output/input ratio the tile is resampled classically.
    pub neural_min_ratio: f32,
    /// At or above this ratio the 4x model is tried first.
    pub direct_4x_ratio: f32,
    /// Mean 8-bit RGB value at or below which model output counts as black.
    pub near_black_mean: f32,
}

impl Default for InferenceThresholds {
    fn default() -> Self {
        Self {
            neural_min_ratio: 1.9,
            direct_4x_ratio: 3.5,
            near_black_mean: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One pass of the 4x model, resized to target if needed.
    Neural4x,
    /// Two passes of the 2x model.
    Neural2xChained,
    /// One pass of the 2x model, resized to target if needed.
    Neural2x,
    /// One pass of the 4x model, downscaled to target.
    Neural4xDownscale,
    ClassicalAccelerated,
    ClassicalCpu,
}

impl Strategy {
    pub fn is_neural(self) -> bool {
        !matches!(self, Self::ClassicalAccelerated | Self::ClassicalCpu)
    }
}

pub fn plan_strategies(
    ratio: f32,
    preset: UpscalePreset,
    use_acceleration: bool,
    thresholds: &InferenceThresholds,
) -> Vec<Strategy> {
    let mut plan = Vec::with_capacity(4);
    if ratio >= thresholds.neural_min_ratio {
        if ratio >= thresholds.direct_4x_ratio {
            plan.extend([Strategy::Neural4x, Strategy::Neural2xChained]);
        } else if preset == UpscalePreset::High {
            plan.extend([Strategy::Neural4x, Strategy::Neural2x]);
        } else {
            plan.extend([Strategy::Neural2x, Strategy::Neural4xDownscale]);
        }
    }
    if use_acceleration {
        plan.push(Strategy::ClassicalAccelerated);
    }
    plan.push(Strategy::ClassicalCpu);
    plan
}

/// Why a single model pass produced nothing usable.
enum RunFailure {
    /// Output decoded but is degenerate (near black, non-finite).
    Invalid(String),
    Failed(String),
}

pub struct InferenceRunner {
    registry: Arc<ModelRegistry>,
    sessions: Arc<SessionCache>,
    accelerated_resampler: Option<Arc<dyn Resampler>>,
    thresholds: InferenceThresholds,
}

impl InferenceRunner {
    pub fn new(
        registry: Arc<ModelRegistry>,
        sessions: Arc<SessionCache>,
        accelerated_resampler: Option<Arc<dyn Resampler>>,
        thresholds: InferenceThresholds,
    ) -> Self {
        Self {
            registry,
            sessions,
            accelerated_resampler,
            thresholds,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    pub fn thresholds(&self) -> &InferenceThresholds {
        &self.thresholds
    }

    /// Upscales `tile` to exactly `target_w x target_h`.
    pub fn infer(
        &self,
        tile: &RgbaImage,
        target_w: u32,
        target_h: u32,
        options: &UpscaleOptions,
        diagnostics: &Diagnostics,
    ) -> Result<RgbaImage, UpscaleError> {
        if tile.width() == 0 || tile.height() == 0 || target_w == 0 || target_h == 0 {
            return Err(UpscaleError::InvalidGeometry(format!(
                "cannot upscale {}x{} to {target_w}x{target_h}",
                tile.width(),
                tile.height()
            )));
        }

        let ratio = target_w as f32 / tile.width() as f32;
        let plan = plan_strategies(
            ratio,
            options.preset,
            options.use_acceleration,
            &self.thresholds,
        );
        debug!(ratio, ?plan, "Inference plan");

        for strategy in plan {
            let attempt = if strategy.is_neural() {
                self.run_neural(strategy, tile, target_w, target_h, options, diagnostics)
            } else {
                self.run_classical(strategy, tile, target_w, target_h, options, diagnostics)?
            };
            if let Some(image) = attempt {
                return Ok(image);
            }
        }

        Err(UpscaleError::ModelUnavailable(
            "no upscaling strategy produced an image".to_string(),
        ))
    }

    fn run_neural(
        &self,
        strategy: Strategy,
        tile: &RgbaImage,
        target_w: u32,
        target_h: u32,
        options: &UpscaleOptions,
        diagnostics: &Diagnostics,
    ) -> Option<RgbaImage> {
        let provider = ExecutionProvider::for_acceleration(options.use_acceleration);
        let runtime = |path: &str| {
            diagnostics.update(DiagnosticsUpdate {
                runtime: Some("onnx".to_string()),
                path: Some(path.to_string()),
                ..Default::default()
            })
        };

        let (output, resize_path) = match strategy {
            Strategy::Neural4x => {
                runtime("neural-4x-direct");
                (self.run_model(tile, options, 4, provider, diagnostics)?, "neural-4x-downscale")
            }
            Strategy::Neural2xChained => {
                runtime("neural-2x-step");
                let first = self.run_model(tile, options, 2, provider, diagnostics)?;
                runtime("neural-2x-step-2");
                (self.run_model(&first, options, 2, provider, diagnostics)?, "neural-4x-downscale")
            }
            Strategy::Neural2x => {
                runtime("neural-2x-direct");
                (self.run_model(tile, options, 2, provider, diagnostics)?, "neural-2x-resize")
            }
            Strategy::Neural4xDownscale => {
                runtime("neural-4x-downscale");
                (self.run_model(tile, options, 4, provider, diagnostics)?, "neural-4x-downscale")
            }
            Strategy::ClassicalAccelerated | Strategy::ClassicalCpu => return None,
        };

        let mut output = if output.dimensions() == (target_w, target_h) {
            output
        } else {
            diagnostics.set_path(resize_path);
            match bicubic_resize(&output, target_w, target_h) {
                Ok(resized) => resized,
                Err(error) => {
                    diagnostics.set_fallback_once("resize-failed", Some(&format!("{error:#}")));
                    return None;
                }
            }
        };
        restore_alpha(&mut output, tile);
        Some(output)
    }

    /// One pass of the `(mode, preset, scale)` model. Degenerate output on
    /// the accelerated provider is retried once on the CPU.
    fn run_model(
        &self,
        image: &RgbaImage,
        options: &UpscaleOptions,
        scale: u32,
        provider: ExecutionProvider,
        diagnostics: &Diagnostics,
    ) -> Option<RgbaImage> {
        let descriptor = self.registry.resolve(options.mode, options.preset, scale);
        let Some(session) = self.sessions.get_session(&descriptor, provider, diagnostics) else {
            diagnostics.set_fallback_once(
                "session-unavailable",
                Some(&format!("no inference session for {} on {provider}", descriptor.id)),
            );
            return None;
        };
        diagnostics.update(DiagnosticsUpdate {
            provider: Some(provider.to_string()),
            model_id: Some(descriptor.id.clone()),
            ..Default::default()
        });

        match self.evaluate(session.as_ref(), &descriptor, image, options) {
            Ok(output) => {
                debug!(
                    model = %descriptor.id,
                    %provider,
                    src_w = image.width(),
                    out_w = output.width(),
                    "Model pass finished"
                );
                Some(output)
            }
            Err(RunFailure::Invalid(reason)) if provider == ExecutionProvider::Accelerated => {
                warn!(model = %descriptor.id, %reason, "Accelerated output invalid; retrying on CPU");
                diagnostics.set_fallback_once(
                    "output-invalid",
                    Some(&format!("{reason}; retrying on cpu")),
                );
                diagnostics.update(DiagnosticsUpdate {
                    provider: Some(ExecutionProvider::Cpu.to_string()),
                    ..Default::default()
                });
                self.run_model(image, options, scale, ExecutionProvider::Cpu, diagnostics)
            }
            Err(RunFailure::Invalid(reason)) => {
                warn!(model = %descriptor.id, %reason, "Model output invalid");
                diagnostics.set_fallback_once("output-invalid", Some(&reason));
                None
            }
            Err(RunFailure::Failed(reason)) => {
                warn!(model = %descriptor.id, %provider, %reason, "Model inference failed");
                diagnostics.set_fallback_once("inference-failed", Some(&reason));
                None
            }
        }
    }

    fn evaluate(
        &self,
        session: &dyn InferenceSession,
        descriptor: &ModelDescriptor,
        image: &RgbaImage,
        options: &UpscaleOptions,
    ) -> Result<RgbaImage, RunFailure> {
        let (width, height) = image.dimensions();
        let (w, h) = (width as usize, height as usize);
        let input_scale = descriptor.input_range.scale();

        let (rgba, luma) = if session.channels() == 1 {
            let planes = YCbCrPlanes::from_rgba(image);
            let values: Vec<f32> = planes.y.iter().map(|v| v * input_scale).collect();
            let input = Array4::from_shape_vec((1, 1, h, w), values)
                .map_err(|e| RunFailure::Failed(e.to_string()))?;
            let output = session
                .run(input)
                .map_err(|e| RunFailure::Failed(format!("{e:#}")))?;
            let (out_w, out_h, values) = leading_planes(&output, 1)?;
            let (luma, _) = normalize_values(&values).map_err(|e| RunFailure::Invalid(e.to_string()))?;
            let (cb, cr) = planes.upsample_chroma(out_w, out_h);
            (merge_luma(&luma, &cb, &cr, out_w, out_h), true)
        } else {
            let values: Vec<f32> = rgba_to_unit_planes(image)
                .into_iter()
                .map(|v| v * input_scale)
                .collect();
            let input = Array4::from_shape_vec((1, 3, h, w), values)
                .map_err(|e| RunFailure::Failed(e.to_string()))?;
            let output = session
                .run(input)
                .map_err(|e| RunFailure::Failed(format!("{e:#}")))?;
            let (out_w, out_h, values) = leading_planes(&output, 3)?;
            let (bytes, range) =
                normalize_values(&values).map_err(|e| RunFailure::Invalid(e.to_string()))?;
            debug!(range = range.label(), "Classified model output range");
            let rgba = planes_to_rgba(&bytes, out_w, out_h)
                .map_err(|e| RunFailure::Failed(e.to_string()))?;
            (rgba, false)
        };

        let rgb: Vec<u8> = rgba
            .pixels()
            .flat_map(|p| [p[0], p[1], p[2]])
            .collect();
        let mean = mean_intensity(&rgb);
        if mean <= self.thresholds.near_black_mean {
            return Err(RunFailure::Invalid(format!(
                "output too dark (mean {mean:.2}, luma {luma})"
            )));
        }

        let sharpen = SharpenSettings::for_options(
            options.mode,
            options.preset,
            options.fidelity,
            NEURAL_SHARPEN_BOOST,
        );
        Ok(unsharp_mask(&rgba, sharpen.amount, sharpen.radius))
    }

    fn run_classical(
        &self,
        strategy: Strategy,
        tile: &RgbaImage,
        target_w: u32,
        target_h: u32,
        options: &UpscaleOptions,
        diagnostics: &Diagnostics,
    ) -> Result<Option<RgbaImage>, UpscaleError> {
        let sharpen = SharpenSettings::for_options(
            options.mode,
            options.preset,
            options.fidelity,
            CLASSICAL_SHARPEN_BOOST,
        );

        match strategy {
            Strategy::ClassicalAccelerated => {
                let Some(resampler) = self.accelerated_resampler.as_ref() else {
                    debug!("No accelerated resampler; using CPU resample");
                    return Ok(None);
                };
                match resampler.resize(tile, target_w, target_h) {
                    Ok(resized) => {
                        diagnostics.update(DiagnosticsUpdate {
                            runtime: Some("classical".to_string()),
                            provider: Some(resampler.name().to_string()),
                            path: Some("classical-accelerated".to_string()),
                            ..Default::default()
                        });
                        Ok(Some(unsharp_mask(&resized, sharpen.amount, sharpen.radius)))
                    }
                    Err(error) => {
                        let message = format!("{error:#}");
                        warn!(error = %message, "Accelerated resample failed; using CPU resample");
                        diagnostics.set_fallback_once("classical-accelerated-failed", Some(&message));
                        Ok(None)
                    }
                }
            }
            Strategy::ClassicalCpu => {
                diagnostics.update(DiagnosticsUpdate {
                    runtime: Some("classical".to_string()),
                    provider: Some(ExecutionProvider::Cpu.to_string()),
                    path: Some("classical-cpu".to_string()),
                    ..Default::default()
                });
                let resized = bicubic_resize(tile, target_w, target_h)
                    .map_err(|e| UpscaleError::ModelUnavailable(format!("classical resample failed: {e:#}")))?;
                Ok(Some(unsharp_mask(&resized, sharpen.amount, sharpen.radius)))
            }
            _ => Ok(None),
        }
    }
}

/// Takes the first `channels` planes of an NCHW output as a flat planar
/// buffer, returning `(width, height, values)`.
fn leading_planes(output: &ArrayD<f32>, channels: usize) -> Result<(u32, u32, Vec<f32>), RunFailure> {
    let shape = output.shape();
    if shape.len() != 4 || shape[0] < 1 || shape[1] < channels || shape[2] == 0 || shape[3] == 0 {
        return Err(RunFailure::Failed(format!(
            "unexpected model output shape {shape:?} for {channels} channel(s)"
        )));
    }
    let (out_h, out_w) = (shape[2], shape[3]);
    let values: Vec<f32> = output
        .slice(ndarray::s![0, ..channels, .., ..])
        .iter()
        .copied()
        .collect();
    Ok((out_w as u32, out_h as u32, values))
}
