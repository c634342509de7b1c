use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::diagnostics::DiagnosticsSnapshot;
use crate::types::OutputFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Decode,
    Upscale,
    Blend,
    Encode,
}

/// Everything a worker reports back to its host, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpscaleEvent {
    Progress {
        request_id: String,
        done_tiles: usize,
        total_tiles: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        eta_seconds: Option<u64>,
        stage: ProgressStage,
    },
    Status {
        request_id: String,
        message: String,
    },
    Diagnostic {
        request_id: String,
        diagnostics: DiagnosticsSnapshot,
    },
    Result {
        request_id: String,
        #[serde(skip)]
        image: Vec<u8>,
        width: u32,
        height: u32,
        format: OutputFormat,
    },
    Error {
        request_id: String,
        message: String,
    },
}

impl UpscaleEvent {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Progress { request_id, .. }
            | Self::Status { request_id, .. }
            | Self::Diagnostic { request_id, .. }
            | Self::Result { request_id, .. }
            | Self::Error { request_id, .. } => request_id,
        }
    }

    /// `Result` and `Error` end a request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. } | Self::Error { .. })
    }
}

/// Sends events for one request. A dropped receiver is not an error: the
/// host may stop listening, and the request still runs to completion.
#[derive(Debug, Clone)]
pub struct EventSink {
    request_id: String,
    tx: UnboundedSender<UpscaleEvent>,
}

impl EventSink {
    pub fn new(request_id: impl Into<String>, tx: UnboundedSender<UpscaleEvent>) -> Self {
        Self {
            request_id: request_id.into(),
            tx,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn emit(&self, event: UpscaleEvent) {
        if self.tx.send(event).is_err() {
            trace!(request_id = %self.request_id, "Event receiver dropped");
        }
    }

    pub fn progress(&self, done: usize, total: usize, eta_seconds: Option<u64>, stage: ProgressStage) {
        self.emit(UpscaleEvent::Progress {
            request_id: self.request_id.clone(),
            done_tiles: done,
            total_tiles: total,
            eta_seconds,
            stage,
        });
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(UpscaleEvent::Status {
            request_id: self.request_id.clone(),
            message: message.into(),
        });
    }

    pub fn diagnostic(&self, diagnostics: DiagnosticsSnapshot) {
        self.emit(UpscaleEvent::Diagnostic {
            request_id: self.request_id.clone(),
            diagnostics,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(UpscaleEvent::Error {
            request_id: self.request_id.clone(),
            message: message.into(),
        });
    }
}
