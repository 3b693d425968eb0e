//! Ollama model runtime
//!
//! Sends the already-rendered prompt to `/api/generate` in raw mode so Ollama
//! applies no template of its own, and streams the newline-delimited JSON reply.

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use async_trait::async_trait;

use crate::core::TokenSink;

use super::{PredictOptions, Predictor, ProviderError};

pub struct OllamaPredictor {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    raw: bool,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct LoadRequest<'a> {
    model: &'a str,
}

#[derive(Debug, Serialize)]
struct UnloadRequest<'a> {
    model: &'a str,
    keep_alive: u32,
}

#[derive(Debug, Serialize, PartialEq)]
struct OllamaOptions {
    num_ctx: u32,
    num_gpu: u32,
    num_thread: u32,
    num_predict: i64,
    num_keep: u32,
    top_k: u32,
    top_p: f32,
    temperature: f32,
    tfs_z: f32,
    repeat_penalty: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    mirostat: u8,
    mirostat_tau: f32,
    mirostat_eta: f32,
    penalize_newline: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rope_frequency_base: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rope_frequency_scale: Option<f32>,
}

impl From<&PredictOptions> for OllamaOptions {
    fn from(options: &PredictOptions) -> Self {
        Self {
            num_ctx: options.context,
            num_gpu: options.gpu_layers,
            num_thread: options.threads,
            // Ollama uses -1 for "no limit"
            num_predict: if options.tokens == 0 {
                -1
            } else {
                i64::from(options.tokens)
            },
            num_keep: options.n_keep,
            top_k: options.top_k,
            top_p: options.top_p,
            temperature: options.temperature,
            tfs_z: options.tail_free_sampling_z,
            repeat_penalty: options.repetition_penalty,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
            mirostat: options.mirostat,
            mirostat_tau: options.mirostat_tau,
            mirostat_eta: options.mirostat_eta,
            penalize_newline: options.penalize_newline,
            rope_frequency_base: (options.rope_freq_base != 0.0).then_some(options.rope_freq_base),
            rope_frequency_scale: (options.rope_freq_scale != 0.0)
                .then_some(options.rope_freq_scale),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// What to do after handing a chunk to the sink
enum Flow {
    Continue,
    Stop,
}

impl OllamaPredictor {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Turn a failed load reply into an error, preferring Ollama's own message
    fn load_error(status: StatusCode, body: &str) -> ProviderError {
        let message = serde_json::from_str::<GenerateChunk>(body)
            .ok()
            .and_then(|chunk| chunk.error)
            .unwrap_or_else(|| body.trim().to_string());
        ProviderError::ModelLoad(format!("{status}: {message}"))
    }

    fn handle_line(
        line: &str,
        response: &mut String,
        sink: &mut (dyn TokenSink + Send),
    ) -> Result<Flow, ProviderError> {
        let chunk: GenerateChunk = serde_json::from_str(line)
            .map_err(|e| ProviderError::InvalidResponse(format!("{e}: {line}")))?;
        if let Some(error) = chunk.error {
            return Err(ProviderError::Runtime(error));
        }
        if !chunk.response.is_empty() {
            response.push_str(&chunk.response);
            if !sink.on_fragment(&chunk.response) {
                return Ok(Flow::Stop);
            }
        }
        if chunk.done {
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }
}

#[async_trait]
impl Predictor for OllamaPredictor {
    async fn load(&self) -> Result<(), ProviderError> {
        // a generate request without a prompt only loads the model
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&LoadRequest { model: &self.model })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::load_error(status, &body));
        }
        tracing::info!(model = %self.model, "model loaded");
        Ok(())
    }

    async fn predict(
        &self,
        prompt: &str,
        options: &PredictOptions,
        sink: &mut (dyn TokenSink + Send),
    ) -> Result<String, ProviderError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            raw: true,
            stream: true,
            options: options.into(),
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidResponse(format!(
                "{}: {}",
                status, body
            )));
        }

        // dropping the stream closes the connection, which cancels generation upstream
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut full_response = String::new();

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Flow::Stop = Self::handle_line(line, &mut full_response, sink)? {
                    return Ok(full_response);
                }
            }
        }

        let rest = String::from_utf8_lossy(&buffer);
        let rest = rest.trim();
        if !rest.is_empty() {
            Self::handle_line(rest, &mut full_response, sink)?;
        }
        Ok(full_response)
    }

    async fn free(&self) -> Result<(), ProviderError> {
        let request = UnloadRequest {
            model: &self.model,
            keep_alive: 0,
        };
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "unloading model failed: {}",
                response.status()
            )));
        }
        tracing::info!(model = %self.model, "model unloaded");
        Ok(())
    }
}
