//! Dedicated upscale thread: one queue, one request at a time, cancellable by id.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnostics::Diagnostics;
use crate::engine::UpscaleEngine;
use crate::events::{EventSink, UpscaleEvent};
use crate::types::{UpscaleMode, UpscalePreset, UpscaleRequest};

pub const CANCELLED_STATUS: &str = "cancelled";

#[derive(Debug)]
pub enum WorkerCommand {
    Upscale(UpscaleRequest),
    WarmUp {
        mode: UpscaleMode,
        preset: UpscalePreset,
        use_acceleration: bool,
    },
    Shutdown,
}

type ActiveRequests = Arc<DashMap<String, CancellationToken>>;

pub struct UpscaleWorker {
    commands: Sender<WorkerCommand>,
    active: ActiveRequests,
    handle: Option<thread::JoinHandle<()>>,
}

impl UpscaleWorker {
    /// Starts the worker thread. Every event for every request goes to `events`.
    pub fn spawn(engine: UpscaleEngine, events: UnboundedSender<UpscaleEvent>) -> Result<Self> {
        let (commands, queue) = channel();
        let active: ActiveRequests = Arc::new(DashMap::new());
        let handle = thread::Builder::new()
            .name("tilescale-worker".to_string())
            .spawn({
                let active = Arc::clone(&active);
                move || worker_loop(engine, queue, active, events)
            })
            .context("failed to spawn upscale worker thread")?;

        Ok(Self {
            commands,
            active,
            handle: Some(handle),
        })
    }

    /// Queues `request`. Its id stays registered until the request finishes,
    /// fails or is cancelled.
    pub fn submit(&self, request: UpscaleRequest) -> Result<()> {
        let request_id = request.request_id.clone();
        if self.active.contains_key(&request_id) {
            bail!("request {request_id} is already active");
        }
        self.active
            .insert(request_id.clone(), CancellationToken::new());
        if self.commands.send(WorkerCommand::Upscale(request)).is_err() {
            self.active.remove(&request_id);
            return Err(anyhow!("upscale worker has stopped"));
        }
        debug!(%request_id, "Request queued");
        Ok(())
    }

    pub fn warm_up(
        &self,
        mode: UpscaleMode,
        preset: UpscalePreset,
        use_acceleration: bool,
    ) -> Result<()> {
        self.commands
            .send(WorkerCommand::WarmUp {
                mode,
                preset,
                use_acceleration,
            })
            .map_err(|_| anyhow!("upscale worker has stopped"))
    }

    /// Returns false for ids that are not queued or running.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.active.get(request_id) {
            Some(token) => {
                token.cancel();
                info!(%request_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, request_id: &str) -> bool {
        self.active.contains_key(request_id)
    }

    pub fn active_requests(&self) -> usize {
        self.active.len()
    }

    /// Lets queued commands drain, then joins the thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("upscale worker thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for UpscaleWorker {
    fn drop(&mut self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
        if let Err(err) = self.stop() {
            warn!(error = %err, "Upscale worker did not stop cleanly");
        }
    }
}

fn worker_loop(
    engine: UpscaleEngine,
    queue: Receiver<WorkerCommand>,
    active: ActiveRequests,
    events: UnboundedSender<UpscaleEvent>,
) {
    let diagnostics = Diagnostics::new();
    info!("Upscale worker started");

    while let Ok(command) = queue.recv() {
        match command {
            WorkerCommand::Upscale(request) => {
                process_request(&engine, request, &active, &events, &diagnostics)
            }
            WorkerCommand::WarmUp {
                mode,
                preset,
                use_acceleration,
            } => {
                diagnostics.reset();
                let ready = engine.warm_up(mode, preset, use_acceleration, &diagnostics);
                info!(%mode, %preset, use_acceleration, ready, "Model warm-up");
            }
            WorkerCommand::Shutdown => break,
        }
    }

    info!("Upscale worker stopped");
}

fn process_request(
    engine: &UpscaleEngine,
    request: UpscaleRequest,
    active: &DashMap<String, CancellationToken>,
    events: &UnboundedSender<UpscaleEvent>,
    diagnostics: &Diagnostics,
) {
    let request_id = request.request_id.clone();
    let token = active
        .get(&request_id)
        .map(|entry| entry.value().clone())
        .unwrap_or_default();
    let sink = EventSink::new(request_id.clone(), events.clone());
    diagnostics.reset();

    let outcome = engine.pipeline().run(&request, &token, &sink, diagnostics);
    active.remove(&request_id);

    match outcome {
        Ok(output) => sink.emit(UpscaleEvent::Result {
            request_id,
            image: output.bytes,
            width: output.width,
            height: output.height,
            format: output.format,
        }),
        Err(err) if err.is_cancelled() => {
            info!(%request_id, "Request cancelled");
            sink.status(CANCELLED_STATUS);
        }
        Err(err) => {
            warn!(%request_id, error = %err, "Request failed");
            sink.error(err.to_string());
            sink.diagnostic(diagnostics.snapshot());
        }
    }
}
