//! Core inference pipeline
//!
//! Admission control, the streaming token pipeline, and the engine that runs
//! one prediction per request through both.

mod engine;
mod gate;
mod stream;

pub use engine::{EngineError, InferenceEngine, PredictRequest};
pub use stream::TokenSink;
