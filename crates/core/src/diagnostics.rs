use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

/// Last-known state of the engine for the request in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

/// Partial update; `None` fields leave the current value alone.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsUpdate {
    pub runtime: Option<String>,
    pub provider: Option<String>,
    pub model_id: Option<String>,
    pub model_url: Option<String>,
    pub path: Option<String>,
    pub last_error: Option<String>,
}

/// Shared between the pipeline, the inference runner and the session cache
/// of one worker context. Reset at the start of every request.
#[derive(Debug, Default)]
pub struct Diagnostics {
    inner: Mutex<DiagnosticsSnapshot>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DiagnosticsSnapshot> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn reset(&self) {
        *self.lock() = DiagnosticsSnapshot::default();
    }

    pub fn update(&self, update: DiagnosticsUpdate) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let fields = [
            (&mut state.runtime, update.runtime),
            (&mut state.provider, update.provider),
            (&mut state.model_id, update.model_id),
            (&mut state.model_url, update.model_url),
            (&mut state.path, update.path),
            (&mut state.last_error, update.last_error),
        ];
        for (slot, value) in fields {
            if value.is_some() {
                *slot = value;
            }
        }
    }

    pub fn set_path(&self, path: &str) {
        self.lock().path = Some(path.to_string());
    }

    /// Records the first fallback of the request; later calls are ignored so
    /// the root cause is what the host sees. The error is kept on the same
    /// first-wins basis.
    pub fn set_fallback_once(&self, reason: &str, error: Option<&str>) {
        let mut state = self.lock();
        if state.fallback.is_none() {
            state.fallback = Some(reason.to_string());
        }
        if state.last_error.is_none() {
            if let Some(error) = error {
                state.last_error = Some(error.to_string());
            }
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.lock().clone()
    }
}
