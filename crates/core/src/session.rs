//! Inference sessions and the per-context session cache.
//!
//! Sessions are keyed by `(model id, provider)`. A key whose construction
//! failed once is remembered and never retried for the lifetime of the cache,
//! so a broken provider costs one attempt rather than one per tile.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, ensure, Context, Result};
use dashmap::DashMap;
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4, ArrayD};
use ort::execution_providers::{
    CUDAExecutionProvider, ExecutionProvider as _, TensorRTExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::diagnostics::{Diagnostics, DiagnosticsUpdate};
use crate::logging::redact_sensitive_text;
use crate::model_registry::ModelDescriptor;
use crate::model_store::ModelStore;

/// Spatial dimensions are padded up to a multiple of this before inference.
pub const PAD_ALIGN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionProvider {
    Accelerated,
    Cpu,
}

impl ExecutionProvider {
    pub fn for_acceleration(use_acceleration: bool) -> Self {
        if use_acceleration {
            Self::Accelerated
        } else {
            Self::Cpu
        }
    }
}

impl fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accelerated => write!(f, "accelerated"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub model_id: String,
    pub provider: ExecutionProvider,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model_id, self.provider)
    }
}

/// A loaded model that maps an NCHW `f32` tensor to a raw output tensor.
pub trait InferenceSession: Send + Sync {
    /// Input channel count: 3 for RGB models, 1 for luma-only models.
    fn channels(&self) -> u32;

    fn run(&self, input: Array4<f32>) -> Result<ArrayD<f32>>;
}

pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        descriptor: &ModelDescriptor,
        provider: ExecutionProvider,
    ) -> Result<Arc<dyn InferenceSession>>;
}

pub struct SessionCache {
    factory: Arc<dyn SessionFactory>,
    sessions: DashMap<SessionKey, Arc<dyn InferenceSession>>,
    failed: DashMap<SessionKey, String>,
    build_locks: DashMap<SessionKey, Arc<Mutex<()>>>,
    attempts: AtomicUsize,
}

impl SessionCache {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            sessions: DashMap::new(),
            failed: DashMap::new(),
            build_locks: DashMap::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Returns the cached session for `descriptor` on `provider`, building it
    /// on first use. Classical descriptors, descriptors without a URL and
    /// keys that already failed yield `None`.
    pub fn get_session(
        &self,
        descriptor: &ModelDescriptor,
        provider: ExecutionProvider,
        diagnostics: &Diagnostics,
    ) -> Option<Arc<dyn InferenceSession>> {
        if !descriptor.is_neural() {
            return None;
        }

        let key = SessionKey {
            model_id: descriptor.id.clone(),
            provider,
        };
        if let Some(found) = self.lookup(&key) {
            return found;
        }

        let lock = Arc::clone(&self.build_locks.entry(key.clone()).or_default());
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(found) = self.lookup(&key) {
            return found;
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        diagnostics.update(DiagnosticsUpdate {
            runtime: Some("onnx".to_string()),
            provider: Some(provider.to_string()),
            model_id: Some(descriptor.id.clone()),
            model_url: descriptor.url.as_deref().map(redact_sensitive_text),
            ..Default::default()
        });

        let started = Instant::now();
        match self.factory.create(descriptor, provider) {
            Ok(session) => {
                info!(
                    key = %key,
                    channels = session.channels(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Inference session ready"
                );
                self.sessions.insert(key, Arc::clone(&session));
                Some(session)
            }
            Err(error) => {
                let message = redact_sensitive_text(&format!("{error:#}"));
                warn!(key = %key, error = %message, "Inference session construction failed");
                diagnostics.set_fallback_once("session-failed", Some(&message));
                self.failed.insert(key, message);
                None
            }
        }
    }

    /// `Some(None)` for a memoized failure, `Some(Some(_))` for a hit.
    fn lookup(&self, key: &SessionKey) -> Option<Option<Arc<dyn InferenceSession>>> {
        if self.failed.contains_key(key) {
            return Some(None);
        }
        self.sessions
            .get(key)
            .map(|entry| Some(Arc::clone(entry.value())))
    }

    pub fn has_failed(&self, model_id: &str, provider: ExecutionProvider) -> bool {
        self.failed.contains_key(&SessionKey {
            model_id: model_id.to_string(),
            provider,
        })
    }

    pub fn cached_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Number of times the factory was asked to build a session.
    pub fn construction_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Builds `ort` sessions from artifacts materialized through a [`ModelStore`].
pub struct OrtSessionFactory {
    store: ModelStore,
    trt_cache_dir: PathBuf,
}

impl OrtSessionFactory {
    pub fn new(store: ModelStore, trt_cache_dir: PathBuf) -> Self {
        Self {
            store,
            trt_cache_dir,
        }
    }
}

impl SessionFactory for OrtSessionFactory {
    fn create(
        &self,
        descriptor: &ModelDescriptor,
        provider: ExecutionProvider,
    ) -> Result<Arc<dyn InferenceSession>> {
        let model_path = self
            .store
            .materialize(descriptor)
            .with_context(|| format!("Failed to fetch model {}", descriptor.id))?;
        let session = build_session(&model_path, provider, &self.trt_cache_dir)?;
        let session = OrtSession::new(session, descriptor.expected_channels)?;
        Ok(Arc::new(session))
    }
}

/// Accelerated: TensorRT (engine cache, fp16) with CUDA behind it; CUDA must
/// register or the build fails, so a CPU-only host is reported as a session
/// failure instead of silently running on the CPU. Cpu: default provider.
pub fn build_session(
    model_path: &Path,
    provider: ExecutionProvider,
    trt_cache_dir: &Path,
) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    match provider {
        ExecutionProvider::Accelerated => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA execution provider is not available in this ONNX Runtime build");
            }
            if let Err(e) = std::fs::create_dir_all(trt_cache_dir) {
                warn!(dir = %trt_cache_dir.display(), error = %e, "Failed to create TensorRT cache directory");
            }

            debug!(
                model = %model_path.display(),
                cache_dir = %trt_cache_dir.display(),
                "Building accelerated session (TensorRT, CUDA)"
            );
            let cache_path = trt_cache_dir.to_string_lossy().to_string();
            let ticker = BuildTicker::start(model_path);
            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build().error_on_failure(),
                ])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()));
            ticker.stop();
            result
        }
        ExecutionProvider::Cpu => {
            debug!(model = %model_path.display(), "Building CPU session");
            builder
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))
        }
    }
}

/// Logs every 15 s while a TensorRT engine is being compiled, which can take
/// minutes on first use.
struct BuildTicker {
    stop_tx: std::sync::mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BuildTicker {
    fn start(model_path: &Path) -> Self {
        let (stop_tx, stop_rx) = channel::<()>();
        let model = model_path.display().to_string();
        let handle = thread::Builder::new()
            .name("trt-build-ticker".to_string())
            .spawn(move || {
                let tick = Duration::from_secs(15);
                let mut elapsed = 0u64;
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {
                            elapsed += tick.as_secs();
                            info!(elapsed_secs = elapsed, %model, "Accelerated session still building");
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .ok();
        Self { stop_tx, handle }
    }

    fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct OrtSession {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    channels: u32,
}

impl OrtSession {
    fn new(session: Session, fallback_channels: u32) -> Result<Self> {
        let input = session
            .inputs()
            .first()
            .ok_or_else(|| anyhow!("model declares no inputs"))?;
        let output = session
            .outputs()
            .first()
            .ok_or_else(|| anyhow!("model declares no outputs"))?;

        let (is_fp16, declared_channels) = match input.dtype() {
            ort::value::ValueType::Tensor { ty, shape, .. } => (
                *ty == ort::tensor::TensorElementType::Float16,
                shape.get(1).copied().filter(|c| *c > 0).map(|c| c as u32),
            ),
            _ => (false, None),
        };
        let channels = declared_channels.unwrap_or(fallback_channels);
        ensure!(
            channels == 1 || channels == 3,
            "unsupported model input with {channels} channels"
        );

        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        debug!(%input_name, %output_name, is_fp16, channels, "Detected model IO");

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16,
            channels,
        })
    }

    fn run_padded(&self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("inference session lock poisoned"))?;

        if self.is_fp16 {
            let shape = input.shape().to_vec();
            let values = input.as_standard_layout();
            let values = values
                .as_slice()
                .ok_or_else(|| anyhow!("input tensor is not contiguous"))?;
            let mut half_values = vec![f16::ZERO; values.len()];
            half_values.convert_from_f32_slice(values);

            let tensor = Tensor::from_array(ArrayD::from_shape_vec(shape, half_values)?)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &tensor])?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
            let view = view.as_standard_layout();
            let half_out = view
                .as_slice()
                .ok_or_else(|| anyhow!("output tensor is not contiguous"))?;
            let mut out = vec![0.0f32; half_out.len()];
            half_out.convert_to_f32_slice(&mut out);
            Ok(ArrayD::from_shape_vec(view.shape().to_vec(), out)?)
        } else {
            let tensor = Tensor::from_array(input)?;
            let outputs = session.run(ort::inputs![self.input_name.as_str() => &tensor])?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            Ok(view.to_owned())
        }
    }
}

impl InferenceSession for OrtSession {
    fn channels(&self) -> u32 {
        self.channels
    }

    fn run(&self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let (_, _, h, w) = input.dim();
        let padded = pad_to_alignment(input);
        let padded_h = padded.dim().2;
        let output = self.run_padded(padded)?;
        crop_to_source(output, padded_h, h, w)
    }
}

pub fn pad_amount(dim: usize) -> usize {
    (PAD_ALIGN - dim % PAD_ALIGN) % PAD_ALIGN
}

/// Mirror-pads H and W up to a multiple of [`PAD_ALIGN`], repeating the edge
/// row/column first (`…a b c | c b a`).
pub fn pad_to_alignment(input: Array4<f32>) -> Array4<f32> {
    let (n, c, h, w) = input.dim();
    let (pad_h, pad_w) = (pad_amount(h), pad_amount(w));
    if pad_h == 0 && pad_w == 0 {
        return input;
    }

    let mut padded = Array4::<f32>::zeros((n, c, h + pad_h, w + pad_w));
    padded.slice_mut(s![.., .., ..h, ..w]).assign(&input);

    for y in h..h + pad_h {
        let src = (h - 1).saturating_sub(y - h);
        let row = padded.slice(s![.., .., src, ..w]).to_owned();
        padded.slice_mut(s![.., .., y, ..w]).assign(&row);
    }
    for x in w..w + pad_w {
        let src = (w - 1).saturating_sub(x - w);
        let column = padded.slice(s![.., .., .., src]).to_owned();
        padded.slice_mut(s![.., .., .., x]).assign(&column);
    }
    padded
}

/// Drops the padded margin from a model output, inferring the model's native
/// scale from how much larger the output is than the padded input.
pub fn crop_to_source(
    output: ArrayD<f32>,
    padded_h: usize,
    src_h: usize,
    src_w: usize,
) -> Result<ArrayD<f32>> {
    ensure!(
        output.ndim() == 4,
        "expected a 4-D model output, got shape {:?}",
        output.shape()
    );
    let out_h = output.shape()[2];
    ensure!(
        padded_h > 0 && out_h >= padded_h && out_h % padded_h == 0,
        "model output height {out_h} is not a multiple of input height {padded_h}"
    );
    let scale = out_h / padded_h;
    let (crop_h, crop_w) = (src_h * scale, src_w * scale);
    ensure!(
        output.shape()[3] >= crop_w,
        "model output width {} is narrower than {crop_w}",
        output.shape()[3]
    );
    if out_h == crop_h && output.shape()[3] == crop_w {
        return Ok(output);
    }
    Ok(output
        .slice(s![.., .., ..crop_h, ..crop_w])
        .to_owned()
        .into_dyn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_registry::{ModelRegistry, ModelRuntime};
    use crate::types::{UpscaleMode, UpscalePreset};

    struct Identity;

    impl InferenceSession for Identity {
        fn channels(&self) -> u32 {
            3
        }

        fn run(&self, input: Array4<f32>) -> Result<ArrayD<f32>> {
            Ok(input.into_dyn())
        }
    }

    struct CountingFactory {
        fail_on: Option<ExecutionProvider>,
        delay: Duration,
    }

    impl SessionFactory for CountingFactory {
        fn create(
            &self,
            descriptor: &ModelDescriptor,
            provider: ExecutionProvider,
        ) -> Result<Arc<dyn InferenceSession>> {
            thread::sleep(self.delay);
            if self.fail_on == Some(provider) {
                anyhow::bail!("{} cannot run on {provider}", descriptor.id);
            }
            Ok(Arc::new(Identity))
        }
    }

    fn cache(fail_on: Option<ExecutionProvider>) -> SessionCache {
        SessionCache::new(Arc::new(CountingFactory {
            fail_on,
            delay: Duration::ZERO,
        }))
    }

    fn neural() -> ModelDescriptor {
        ModelRegistry::builtin().resolve(UpscaleMode::Photo, UpscalePreset::Balanced, 2)
    }

    #[test]
    fn sessions_are_built_once_and_reused() {
        let cache = cache(None);
        let diagnostics = Diagnostics::new();
        let model = neural();

        let first = cache.get_session(&model, ExecutionProvider::Cpu, &diagnostics);
        let second = cache.get_session(&model, ExecutionProvider::Cpu, &diagnostics);
        assert!(first.is_some() && second.is_some());
        assert_eq!(cache.construction_attempts(), 1);
        assert_eq!(cache.cached_sessions(), 1);

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.provider.as_deref(), Some("cpu"));
        assert_eq!(snapshot.model_id.as_deref(), Some(model.id.as_str()));
    }

    #[test]
    fn failures_are_memoized_per_key() {
        let cache = cache(Some(ExecutionProvider::Accelerated));
        let diagnostics = Diagnostics::new();
        let model = neural();

        for _ in 0..3 {
            assert!(cache
                .get_session(&model, ExecutionProvider::Accelerated, &diagnostics)
                .is_none());
        }
        assert_eq!(cache.construction_attempts(), 1);
        assert!(cache.has_failed(&model.id, ExecutionProvider::Accelerated));
        assert_eq!(
            diagnostics.snapshot().fallback.as_deref(),
            Some("session-failed")
        );

        assert!(cache
            .get_session(&model, ExecutionProvider::Cpu, &diagnostics)
            .is_some());
        assert_eq!(cache.construction_attempts(), 2);
    }

    #[test]
    fn classical_descriptors_never_reach_the_factory() {
        let cache = cache(None);
        let diagnostics = Diagnostics::new();
        let classical = ModelRegistry::builtin()
            .list()
            .iter()
            .find(|e| e.runtime == ModelRuntime::Classical)
            .cloned()
            .expect("classical entry");
        let mut no_url = neural();
        no_url.url = None;

        assert!(cache
            .get_session(&classical, ExecutionProvider::Cpu, &diagnostics)
            .is_none());
        assert!(cache
            .get_session(&no_url, ExecutionProvider::Cpu, &diagnostics)
            .is_none());
        assert_eq!(cache.construction_attempts(), 0);
    }

    #[test]
    fn concurrent_requests_share_one_construction() {
        let cache = Arc::new(SessionCache::new(Arc::new(CountingFactory {
            fail_on: None,
            delay: Duration::from_millis(50),
        })));
        let model = neural();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let model = model.clone();
                thread::spawn(move || {
                    cache
                        .get_session(&model, ExecutionProvider::Cpu, &Diagnostics::new())
                        .is_some()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().expect("thread"));
        }
        assert_eq!(cache.construction_attempts(), 1);
    }

    #[test]
    fn padding_mirrors_edges_to_alignment() {
        let input = Array4::from_shape_fn((1, 1, 2, 3), |(_, _, y, x)| (y * 10 + x) as f32);
        let padded = pad_to_alignment(input);
        assert_eq!(padded.dim(), (1, 1, 4, 4));
        assert_eq!(padded[[0, 0, 0, 3]], 2.0);
        assert_eq!(padded[[0, 0, 2, 0]], 10.0);
        assert_eq!(padded[[0, 0, 3, 1]], 1.0);
        assert_eq!(padded[[0, 0, 3, 3]], 2.0);

        let aligned = Array4::<f32>::ones((1, 3, 4, 8));
        assert_eq!(pad_to_alignment(aligned.clone()), aligned);
        assert_eq!(pad_amount(1), 3);
        assert_eq!(pad_amount(8), 0);
    }

    #[test]
    fn crop_uses_native_scale_of_output() {
        let output = ArrayD::<f32>::ones(ndarray::IxDyn(&[1, 3, 16, 16]));
        let cropped = crop_to_source(output, 4, 3, 2).expect("crop");
        assert_eq!(cropped.shape(), &[1, 3, 12, 8]);

        let bad = ArrayD::<f32>::ones(ndarray::IxDyn(&[1, 3, 10, 16]));
        assert!(crop_to_source(bad, 4, 3, 2).is_err());
    }

    #[test]
    #[ignore = "requires ONNX Runtime and network access to the model URL"]
    fn ort_factory_builds_cpu_session_for_builtin_model() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::new(temp.path().join("models"), Default::default());
        let factory = OrtSessionFactory::new(store, temp.path().join("trt"));
        let session = factory
            .create(&neural(), ExecutionProvider::Cpu)
            .expect("session");
        let output = session
            .run(Array4::<f32>::from_elem((1, 3, 10, 10), 0.5))
            .expect("run");
        assert_eq!(output.shape()[2] % 10, 0);
    }
}
