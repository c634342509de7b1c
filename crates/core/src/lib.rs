//! Tiled super-resolution engine.

pub mod blend;
pub mod color;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod events;
pub mod inference;
pub mod logging;
pub mod model_registry;
pub mod model_store;
pub mod normalize;
pub mod pipeline;
pub mod postprocess;
pub mod resample;
pub mod runtime;
pub mod session;
pub mod tiling;
pub mod types;
pub mod worker;

pub use engine::UpscaleEngine;
pub use error::UpscaleError;
pub use events::{ProgressStage, UpscaleEvent};
pub use types::{UpscaleOptions, UpscaleRequest};
pub use worker::UpscaleWorker;
