//! Inference engine
//!
//! Ties the pieces together for one request: validates the per-request
//! options, takes the admission gate, and runs the prediction on its own task
//! while fragments flow out through a channel. The gate is held by that task
//! and released when it ends, however it ends.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::Instrument;
use uuid::Uuid;

use crate::providers::{PredictOptions, Predictor};

use super::gate::{AdmissionGate, GateBusy};
use super::stream::{BodyChunk, ResponseStreamer};

/// Errors raised before any inference starts
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to parse stopRegex: {0}")]
    InvalidStopRegex(#[from] regex::Error),

    #[error("server is busy")]
    Busy(#[from] GateBusy),
}

/// One prediction request, already decoded by the transport
#[derive(Debug, Clone, Default)]
pub struct PredictRequest {
    pub prompt: String,
    pub temperature: Option<f32>,
    pub stop_regex: Option<String>,
}

pub struct InferenceEngine {
    predictor: Arc<dyn Predictor>,
    gate: AdmissionGate,
    options: PredictOptions,
    stop_regex: Option<Regex>,
}

impl InferenceEngine {
    pub fn new(
        predictor: Arc<dyn Predictor>,
        options: PredictOptions,
        stop_regex: Option<Regex>,
    ) -> Self {
        Self {
            predictor,
            gate: AdmissionGate::new(),
            options,
            stop_regex,
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Start a prediction and return the receiving end of its response stream.
    ///
    /// Fails without touching the model if the stop pattern does not compile
    /// or another prediction is running. A runtime failure after this returns
    /// shows up as an `Err` chunk at the end of the stream.
    pub fn start(&self, request: PredictRequest) -> Result<UnboundedReceiver<BodyChunk>, EngineError> {
        let span = tracing::info_span!("predict", request_id = %Uuid::new_v4());
        let _guard = span.enter();

        tracing::debug!(prompt = %request.prompt, "received prompt");

        let request_stop = match request.stop_regex.as_deref() {
            Some(pattern) if !pattern.is_empty() => {
                tracing::debug!(stop_regex = %pattern, "request stop pattern");
                Some(Regex::new(pattern)?)
            }
            _ => None,
        };
        if let Some(temperature) = request.temperature {
            tracing::debug!(temperature = temperature, "temperature override");
        }
        let options = self.options.with_temperature(request.temperature);

        let permit = self.gate.try_acquire().map_err(|busy| {
            tracing::warn!("rejecting request, server is busy");
            busy
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let predictor = Arc::clone(&self.predictor);
        let server_stop = self.stop_regex.clone();
        let prompt = request.prompt;

        let task = async move {
            let _permit = permit;
            let mut streamer =
                ResponseStreamer::new(tx).with_stop_patterns(server_stop, request_stop);

            let outcome = AssertUnwindSafe(predictor.predict(&prompt, &options, &mut streamer))
                .catch_unwind()
                .await;

            let stop_reason = streamer.stop_reason();
            let (response, tx) = streamer.into_parts();
            let failure = match outcome {
                Ok(Ok(_)) => {
                    tracing::info!(response = %response, ?stop_reason, "prediction finished");
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "model runtime panicked".to_string(),
            };
            tracing::error!(error = %failure, partial_response = %response, "prediction failed");
            // the body is already streaming, so end it with an error instead of a status
            let _ = tx.send(Err(std::io::Error::other(failure)));
        };
        tokio::spawn(task.instrument(span.clone()));

        Ok(rx)
    }
}
