//! Wiring of one engine context: registry, session cache, runner, pipeline.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::diagnostics::Diagnostics;
use crate::inference::InferenceRunner;
use crate::model_registry::ModelRegistry;
use crate::model_store::ModelStore;
use crate::pipeline::UpscalePipeline;
use crate::resample::{accelerated_resampler, Resampler};
use crate::session::{ExecutionProvider, OrtSessionFactory, SessionCache, SessionFactory};
use crate::types::{UpscaleMode, UpscalePreset};

/// Optional catalog merged into the builtin model table.
pub const MODEL_CATALOG_FILE_NAME: &str = "models.json";

/// Everything a worker needs. Cheap to clone; clones share the session cache.
#[derive(Clone)]
pub struct UpscaleEngine {
    registry: Arc<ModelRegistry>,
    sessions: Arc<SessionCache>,
    pipeline: Arc<UpscalePipeline>,
}

impl UpscaleEngine {
    /// Production wiring: models are downloaded into the configured models
    /// directory and run through ONNX Runtime.
    pub fn from_config(config: &AppConfig, data_dir: &Path) -> Result<Self> {
        let paths = config.resolved_paths(data_dir);
        let registry = load_registry(&data_dir.join(MODEL_CATALOG_FILE_NAME))?;
        let store = ModelStore::new(paths.models_dir.clone(), config.download);
        let factory = OrtSessionFactory::new(store, paths.trt_cache_dir.clone());
        info!(
            models_dir = %paths.models_dir.display(),
            models = registry.list().len(),
            "Upscale engine configured"
        );
        Ok(Self::with_factory(
            config,
            registry,
            Arc::new(factory),
            accelerated_resampler(),
        ))
    }

    pub fn with_factory(
        config: &AppConfig,
        registry: ModelRegistry,
        factory: Arc<dyn SessionFactory>,
        resampler: Option<Arc<dyn Resampler>>,
    ) -> Self {
        let registry = Arc::new(registry);
        let sessions = Arc::new(SessionCache::new(factory));
        let runner = InferenceRunner::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            resampler,
            config.inference,
        );
        let pipeline = UpscalePipeline::new(Arc::new(runner), config.engine);
        Self {
            registry,
            sessions,
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    pub fn pipeline(&self) -> &Arc<UpscalePipeline> {
        &self.pipeline
    }

    /// Builds the 2x session for `(mode, preset)` ahead of the first request.
    /// Returns whether a session is now cached.
    pub fn warm_up(
        &self,
        mode: UpscaleMode,
        preset: UpscalePreset,
        use_acceleration: bool,
        diagnostics: &Diagnostics,
    ) -> bool {
        let descriptor = self.registry.resolve(mode, preset, 2);
        let provider = ExecutionProvider::for_acceleration(use_acceleration);
        let ready = self
            .sessions
            .get_session(&descriptor, provider, diagnostics)
            .is_some();
        debug!(model = %descriptor.id, %provider, ready, "Warm-up finished");
        ready
    }
}

/// Builtin table plus the entries of `catalog_path`, when that file exists.
pub fn load_registry(catalog_path: &Path) -> Result<ModelRegistry> {
    let mut registry = ModelRegistry::builtin();
    if catalog_path.is_file() {
        let raw = fs::read_to_string(catalog_path).with_context(|| {
            format!("failed to read model catalog: {}", catalog_path.display())
        })?;
        registry
            .load_json(&raw)
            .with_context(|| format!("invalid model catalog: {}", catalog_path.display()))?;
    }
    Ok(registry)
}
