use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::{ImageFormat, Rgba, RgbaImage};
use ndarray::{Array4, ArrayD};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use tilescale_core::config::AppConfig;
use tilescale_core::engine::UpscaleEngine;
use tilescale_core::model_registry::{ModelDescriptor, ModelRegistry};
use tilescale_core::session::{ExecutionProvider, InferenceSession, SessionFactory};
use tilescale_core::types::{OutputFormat, UpscaleMode, UpscaleOptions, UpscalePreset};
use tilescale_core::worker::{UpscaleWorker, CANCELLED_STATUS};
use tilescale_core::{ProgressStage, UpscaleEvent, UpscaleRequest};

const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Nearest-neighbour stand-in for a model of the descriptor's scale.
struct Nearest {
    scale: usize,
}

impl InferenceSession for Nearest {
    fn channels(&self) -> u32 {
        3
    }

    fn run(&self, input: Array4<f32>) -> anyhow::Result<ArrayD<f32>> {
        let (n, c, h, w) = input.dim();
        let s = self.scale;
        Ok(
            Array4::from_shape_fn((n, c, h * s, w * s), |(b, ch, y, x)| {
                input[[b, ch, y / s, x / s]]
            })
            .into_dyn(),
        )
    }
}

struct NearestFactory {
    fail: bool,
    built: AtomicUsize,
}

impl NearestFactory {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            built: AtomicUsize::new(0),
        })
    }
}

impl SessionFactory for NearestFactory {
    fn create(
        &self,
        descriptor: &ModelDescriptor,
        _provider: ExecutionProvider,
    ) -> anyhow::Result<Arc<dyn InferenceSession>> {
        self.built.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("{} could not be downloaded", descriptor.id);
        }
        Ok(Arc::new(Nearest {
            scale: descriptor.scale as usize,
        }))
    }
}

/// Runs the first pass immediately; every later pass waits until the gate
/// sender is used or dropped.
struct GatedSession {
    inner: Nearest,
    runs: AtomicUsize,
    gate: Mutex<Receiver<()>>,
}

impl InferenceSession for GatedSession {
    fn channels(&self) -> u32 {
        3
    }

    fn run(&self, input: Array4<f32>) -> anyhow::Result<ArrayD<f32>> {
        if self.runs.fetch_add(1, Ordering::SeqCst) > 0 {
            let _ = self.gate.lock().expect("gate lock").recv();
        }
        self.inner.run(input)
    }
}

struct GatedFactory {
    session: Arc<GatedSession>,
}

impl GatedFactory {
    fn new() -> (Arc<Self>, Sender<()>) {
        let (release, gate) = channel();
        let session = Arc::new(GatedSession {
            inner: Nearest { scale: 2 },
            runs: AtomicUsize::new(0),
            gate: Mutex::new(gate),
        });
        (Arc::new(Self { session }), release)
    }
}

impl SessionFactory for GatedFactory {
    fn create(
        &self,
        _descriptor: &ModelDescriptor,
        _provider: ExecutionProvider,
    ) -> anyhow::Result<Arc<dyn InferenceSession>> {
        Ok(self.session.clone())
    }
}

fn engine(config: &AppConfig, factory: Arc<dyn SessionFactory>) -> UpscaleEngine {
    UpscaleEngine::with_factory(config, ModelRegistry::builtin(), factory, None)
}

fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba(color));
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageFormat::Png)
        .expect("encode fixture");
    cursor.into_inner()
}

fn cpu_options() -> UpscaleOptions {
    UpscaleOptions {
        use_acceleration: false,
        ..UpscaleOptions::default()
    }
}

fn request(id: &str, image: Vec<u8>, options: UpscaleOptions) -> UpscaleRequest {
    UpscaleRequest {
        request_id: id.to_string(),
        image,
        options,
    }
}

fn next_event(rx: &mut UnboundedReceiver<UpscaleEvent>) -> UpscaleEvent {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        match rx.try_recv() {
            Ok(event) => return event,
            Err(tokio::sync::mpsc::error::TryRecvError::Empty) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(err) => panic!("no event within {EVENT_TIMEOUT:?}: {err}"),
        }
    }
}

/// Collects events up to and including the first one `stop` accepts.
fn events_until(
    rx: &mut UnboundedReceiver<UpscaleEvent>,
    stop: impl Fn(&UpscaleEvent) -> bool,
) -> Vec<UpscaleEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx);
        let done = stop(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

fn diagnostics_of(events: &[UpscaleEvent]) -> Vec<&tilescale_core::diagnostics::DiagnosticsSnapshot> {
    events
        .iter()
        .filter_map(|event| match event {
            UpscaleEvent::Diagnostic { diagnostics, .. } => Some(diagnostics),
            _ => None,
        })
        .collect()
}

#[test]
fn small_image_upscales_in_one_neural_pass() {
    let factory = NearestFactory::new(false);
    let config = AppConfig::default();
    let (tx, mut rx) = unbounded_channel();
    let worker = UpscaleWorker::spawn(engine(&config, factory.clone()), tx).expect("spawn");

    worker
        .submit(request("e2e", png(512, 512, [120, 80, 40, 255]), cpu_options()))
        .expect("submit");
    let events = events_until(&mut rx, UpscaleEvent::is_terminal);

    let Some(UpscaleEvent::Result {
        request_id,
        image,
        width,
        height,
        format,
    }) = events.last()
    else {
        panic!("expected a result, got {events:?}");
    };
    assert_eq!(request_id, "e2e");
    assert_eq!((*width, *height), (1024, 1024));
    assert_eq!(*format, OutputFormat::Png);
    let decoded = image::load_from_memory(image).expect("decode result").to_rgba8();
    assert_eq!(decoded.dimensions(), (1024, 1024));
    assert_eq!(*decoded.get_pixel(700, 300), Rgba([120, 80, 40, 255]));

    assert!(events.iter().any(|event| matches!(
        event,
        UpscaleEvent::Progress {
            done_tiles: 1,
            total_tiles: 1,
            stage: ProgressStage::Upscale,
            ..
        }
    )));
    let diagnostics = diagnostics_of(&events);
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].path.as_deref(), Some("neural-2x-direct"));
    assert_eq!(diagnostics[0].fallback, None);
    assert!(!worker.is_active("e2e"));
    assert_eq!(factory.built.load(Ordering::SeqCst), 1);

    worker.shutdown().expect("shutdown");
}

#[test]
fn missing_models_fall_back_to_classical_and_still_succeed() {
    let factory = NearestFactory::new(true);
    let config = AppConfig::default();
    let (tx, mut rx) = unbounded_channel();
    let worker = UpscaleWorker::spawn(engine(&config, factory.clone()), tx).expect("spawn");

    worker
        .submit(request("fallback", png(64, 48, [30, 60, 90, 255]), cpu_options()))
        .expect("submit");
    let events = events_until(&mut rx, UpscaleEvent::is_terminal);

    assert!(matches!(
        events.last(),
        Some(UpscaleEvent::Result {
            width: 128,
            height: 96,
            ..
        })
    ));
    let diagnostics = diagnostics_of(&events);
    assert_eq!(diagnostics[0].fallback.as_deref(), Some("session-failed"));
    assert_eq!(diagnostics[0].path.as_deref(), Some("classical-cpu"));
    assert!(diagnostics[0]
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("could not be downloaded")));

    worker.shutdown().expect("shutdown");
}

#[test]
fn oversized_output_fails_without_touching_sessions() {
    let factory = NearestFactory::new(false);
    let mut config = AppConfig::default();
    config.engine.max_output_pixels = 10_000;
    let engine = engine(&config, factory.clone());
    let sessions = engine.sessions().clone();
    let (tx, mut rx) = unbounded_channel();
    let worker = UpscaleWorker::spawn(engine, tx).expect("spawn");

    worker
        .submit(request("big", png(100, 100, [1, 2, 3, 255]), cpu_options()))
        .expect("submit");
    let mut events = events_until(&mut rx, UpscaleEvent::is_terminal);
    events.push(next_event(&mut rx));

    let error = events
        .iter()
        .find_map(|event| match event {
            UpscaleEvent::Error { message, .. } => Some(message.clone()),
            _ => None,
        })
        .expect("error event");
    assert!(error.contains("200x200"));
    assert!(matches!(events.last(), Some(UpscaleEvent::Diagnostic { .. })));
    assert_eq!(sessions.construction_attempts(), 0);
    assert_eq!(factory.built.load(Ordering::SeqCst), 0);
    assert_eq!(worker.active_requests(), 0);

    worker.shutdown().expect("shutdown");
}

#[test]
fn cancellation_stops_after_the_in_flight_tile() {
    let (factory, release) = GatedFactory::new();
    let mut config = AppConfig::default();
    config.engine.whole_image_max_side = 32;
    let mut options = cpu_options();
    options.tile.auto = false;
    options.tile.size = 32;
    options.tile.overlap = 4;

    let (tx, mut rx) = unbounded_channel();
    let worker = UpscaleWorker::spawn(engine(&config, factory), tx).expect("spawn");
    worker
        .submit(request("cancel-me", png(96, 96, [100, 100, 100, 255]), options))
        .expect("submit");

    let before = events_until(&mut rx, |event| {
        matches!(
            event,
            UpscaleEvent::Progress {
                stage: ProgressStage::Upscale,
                ..
            }
        )
    });
    let Some(UpscaleEvent::Progress { total_tiles, .. }) = before.last() else {
        panic!("expected progress");
    };
    let total_tiles = *total_tiles;
    assert!(total_tiles > 2);

    assert!(worker.cancel("cancel-me"));
    drop(release);

    let after = events_until(&mut rx, |event| {
        matches!(event, UpscaleEvent::Status { message, .. } if message == CANCELLED_STATUS)
    });
    assert!(after.iter().all(|event| !event.is_terminal()));
    let last_done = after
        .iter()
        .filter_map(|event| match event {
            UpscaleEvent::Progress { done_tiles, .. } => Some(*done_tiles),
            _ => None,
        })
        .last();
    assert_eq!(last_done, Some(2));
    assert!(!worker.is_active("cancel-me"));
    assert!(!worker.cancel("cancel-me"));

    worker.shutdown().expect("shutdown");
}

#[test]
fn unknown_ids_cannot_be_cancelled_and_duplicates_are_refused() {
    let (factory, release) = GatedFactory::new();
    let mut config = AppConfig::default();
    config.engine.whole_image_max_side = 32;
    let mut options = cpu_options();
    options.tile.auto = false;
    options.tile.size = 32;
    options.tile.overlap = 4;

    let (tx, mut rx) = unbounded_channel();
    let worker = UpscaleWorker::spawn(engine(&config, factory), tx).expect("spawn");
    assert!(!worker.cancel("nobody"));

    worker
        .submit(request("dup", png(96, 96, [50, 50, 50, 255]), options.clone()))
        .expect("submit");
    assert!(worker
        .submit(request("dup", png(8, 8, [0, 0, 0, 255]), options))
        .is_err());

    drop(release);
    let events = events_until(&mut rx, UpscaleEvent::is_terminal);
    assert!(matches!(events.last(), Some(UpscaleEvent::Result { .. })));

    worker.shutdown().expect("shutdown");
}

#[test]
fn warm_up_builds_the_session_used_by_the_next_request() {
    let factory = NearestFactory::new(false);
    let config = AppConfig::default();
    let engine = engine(&config, factory.clone());
    let sessions = engine.sessions().clone();
    let (tx, mut rx) = unbounded_channel();
    let worker = UpscaleWorker::spawn(engine, tx).expect("spawn");

    worker
        .warm_up(UpscaleMode::Photo, UpscalePreset::Balanced, false)
        .expect("warm up");
    worker
        .submit(request("warm", png(40, 40, [9, 99, 199, 255]), cpu_options()))
        .expect("submit");
    let events = events_until(&mut rx, UpscaleEvent::is_terminal);

    assert!(matches!(events.last(), Some(UpscaleEvent::Result { .. })));
    assert_eq!(sessions.construction_attempts(), 1);
    assert_eq!(sessions.cached_sessions(), 1);

    worker.shutdown().expect("shutdown");
}
