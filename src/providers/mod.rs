//! Model runtime integrations
//!
//! The server never talks to a model directly. It hands a rendered prompt to a
//! [`Predictor`], which pushes generated fragments into a [`TokenSink`] until
//! generation ends or the sink asks it to stop.

pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::TokenSink;

pub use ollama::OllamaPredictor;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Model runtime error: {0}")]
    Runtime(String),

    #[error("Loading the model failed: {0}")]
    ModelLoad(String),
}

/// Sampling and model options sent with every prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictOptions {
    /// Context window size in tokens
    pub context: u32,

    /// Number of layers to offload to the GPU
    pub gpu_layers: u32,

    /// RoPE base frequency (0 = model default)
    pub rope_freq_base: f32,

    /// RoPE frequency scaling factor (0 = model default)
    pub rope_freq_scale: f32,

    pub threads: u32,

    /// Maximum tokens to generate (0 = no limit)
    pub tokens: u32,

    /// Tokens to keep from the initial prompt (0 = disabled)
    pub n_keep: u32,

    pub top_k: u32,
    pub top_p: f32,
    pub temperature: f32,
    pub tail_free_sampling_z: f32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,

    /// 0 = disabled, 1 = mirostat, 2 = mirostat 2.0
    pub mirostat: u8,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,

    pub penalize_newline: bool,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            context: 512,
            gpu_layers: 0,
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            threads: default_threads(),
            tokens: 0,
            n_keep: 0,
            top_k: 40,
            top_p: 0.2,
            temperature: 0.8,
            tail_free_sampling_z: 1.0,
            repetition_penalty: 1.1,
            frequency_penalty: 0.1,
            presence_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_newline: false,
        }
    }
}

impl PredictOptions {
    /// Copy of these options with a per-request temperature applied
    pub fn with_temperature(&self, temperature: Option<f32>) -> Self {
        let mut options = self.clone();
        if let Some(temperature) = temperature {
            options.temperature = temperature;
        }
        options
    }
}

pub fn default_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// A model runtime. Only one prediction runs at a time; callers serialize access.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Load the model into the runtime. Called once before the server accepts requests.
    async fn load(&self) -> Result<(), ProviderError>;

    /// Generate a completion for `prompt`, feeding each fragment to `sink` in order.
    ///
    /// Stops as soon as `sink` returns `false`. Returns the concatenation of the
    /// fragments that were delivered.
    async fn predict(
        &self,
        prompt: &str,
        options: &PredictOptions,
        sink: &mut (dyn TokenSink + Send),
    ) -> Result<String, ProviderError>;

    /// Release the model. Called once at shutdown.
    async fn free(&self) -> Result<(), ProviderError>;
}

#[cfg(test)]
pub mod testing {
    //! In-memory predictor for exercising the pipeline without a model

    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    /// Emits a fixed list of fragments and records every call
    #[derive(Debug, Default)]
    pub struct ScriptedPredictor {
        fragments: Vec<String>,
        fail_after: Option<usize>,
        panic_after: Option<usize>,
        delay: Option<Duration>,
        pub prompts: Mutex<Vec<String>>,
        pub options: Mutex<Vec<PredictOptions>>,
        pub delivered: Mutex<usize>,
    }

    impl ScriptedPredictor {
        pub fn new(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                ..Default::default()
            }
        }

        /// Fail with a runtime error after `n` fragments
        pub fn failing_after(mut self, n: usize) -> Self {
            self.fail_after = Some(n);
            self
        }

        /// Panic after `n` fragments
        pub fn panicking_after(mut self, n: usize) -> Self {
            self.panic_after = Some(n);
            self
        }

        /// Sleep between fragments
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn last_prompt(&self) -> Option<String> {
            self.prompts.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl Predictor for ScriptedPredictor {
        async fn load(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn predict(
            &self,
            prompt: &str,
            options: &PredictOptions,
            sink: &mut (dyn TokenSink + Send),
        ) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.options.lock().unwrap().push(options.clone());

            let mut response = String::new();
            for (i, fragment) in self.fragments.iter().enumerate() {
                if self.fail_after == Some(i) {
                    return Err(ProviderError::Runtime("scripted failure".into()));
                }
                if self.panic_after == Some(i) {
                    panic!("scripted panic");
                }
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                *self.delivered.lock().unwrap() += 1;
                response.push_str(fragment);
                if !sink.on_fragment(fragment) {
                    break;
                }
            }
            Ok(response)
        }

        async fn free(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }
}
