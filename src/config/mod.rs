//! Application configuration
//!
//! Settings come from command-line flags (some also read from the
//! environment) and an optional TOML model config file. Flags win over the
//! file, and the file wins over built-in defaults. Everything is validated
//! once at startup; a bad configuration never reaches a request.
//!
//! # Example Model Config File
//!
//! ```toml
//! context = 4096
//! gpu_layers = 35
//! prompt_template_type = "llama-2"
//! rope_freq_base = 10000.0
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::conversation::template::{self, CustomTemplate, PromptTemplate, TemplateError};
use crate::providers::{default_threads, PredictOptions};

/// Command-line interface
#[derive(Debug, Clone, Parser)]
#[command(name = "llm-api")]
#[command(version, about = "HTTP API for a local large language model", long_about = None)]
pub struct Cli {
    /// Model to serve, as named by the model runtime
    #[arg(value_name = "MODEL")]
    pub model: String,

    /// Address to listen on, "host:port" or ":port"
    #[arg(long, env = "LLM_API_ADDR", default_value = "localhost:8080")]
    pub addr: String,

    /// Base URL of the Ollama server running the model
    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    pub ollama_url: String,

    /// Path to a TOML config file for the model
    #[arg(long)]
    pub model_config_file: Option<PathBuf>,

    #[command(flatten)]
    pub model_options: ModelArgs,

    #[command(flatten)]
    pub predict: PredictArgs,
}

/// Model options. Also the layout of the model config file.
#[derive(Debug, Clone, Default, PartialEq, Args, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelArgs {
    /// Context size [default: 512]
    #[arg(long)]
    pub context: Option<u32>,

    /// Number of GPU layers [default: 0]
    #[arg(long)]
    pub gpu_layers: Option<u32>,

    /// Prompt template source (Jinja). One prompt template option is required for /chat
    #[arg(long)]
    pub prompt_template: Option<String>,

    /// Path to a prompt template file (Jinja)
    #[arg(long)]
    pub prompt_template_file: Option<PathBuf>,

    /// Built-in prompt template: llama-2, vicuna_v1.1
    #[arg(long)]
    pub prompt_template_type: Option<String>,

    /// RoPE base frequency [default: from the model]
    #[arg(long)]
    pub rope_freq_base: Option<f32>,

    /// RoPE frequency scaling factor [default: from the model]
    #[arg(long)]
    pub rope_freq_scale: Option<f32>,
}

impl ModelArgs {
    /// Fill unset values from `fallback`
    pub fn or(self, fallback: ModelArgs) -> ModelArgs {
        ModelArgs {
            context: self.context.or(fallback.context),
            gpu_layers: self.gpu_layers.or(fallback.gpu_layers),
            prompt_template: non_empty(self.prompt_template).or(non_empty(fallback.prompt_template)),
            prompt_template_file: self.prompt_template_file.or(fallback.prompt_template_file),
            prompt_template_type: non_empty(self.prompt_template_type)
                .or(non_empty(fallback.prompt_template_type)),
            rope_freq_base: self.rope_freq_base.or(fallback.rope_freq_base),
            rope_freq_scale: self.rope_freq_scale.or(fallback.rope_freq_scale),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = read_file(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Prediction and sampling options
#[derive(Debug, Clone, Args)]
pub struct PredictArgs {
    /// Number of threads
    #[arg(long, default_value_t = default_threads())]
    pub threads: u32,

    /// Number of tokens to predict (0 = no limit)
    #[arg(long, default_value_t = 0)]
    pub tokens: u32,

    /// Number of tokens to keep from the initial prompt (0 = disabled)
    #[arg(long, default_value_t = 0)]
    pub n_keep: u32,

    /// System prompt
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Read the system prompt from this file
    #[arg(long)]
    pub system_prompt_file: Option<PathBuf>,

    /// Regular expression that stops prediction when it matches the response
    #[arg(long)]
    pub stop_regex: Option<String>,

    #[arg(long, default_value_t = 40)]
    pub top_k: u32,

    /// Top-p (1 = disabled)
    #[arg(long, default_value_t = 0.2)]
    pub top_p: f32,

    #[arg(long, default_value_t = 0.8)]
    pub temperature: f32,

    /// Tail free sampling parameter z (1 = disabled)
    #[arg(long, default_value_t = 1.0)]
    pub tail_free_sampling_z: f32,

    /// Repetition penalty (1 = disabled)
    #[arg(long = "penalty-repetition", default_value_t = 1.1)]
    pub repetition_penalty: f32,

    /// Frequency penalty (0 = disabled)
    #[arg(long = "penalty-frequency", default_value_t = 0.1)]
    pub frequency_penalty: f32,

    /// Presence penalty (0 = disabled)
    #[arg(long = "penalty-presence", default_value_t = 0.0)]
    pub presence_penalty: f32,

    /// Mirostat (0 = disabled, 1 = mirostat, 2 = mirostat 2.0)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub mirostat: u8,

    /// Mirostat target entropy
    #[arg(long, default_value_t = 5.0)]
    pub mirostat_tau: f32,

    /// Mirostat learning rate
    #[arg(long, default_value_t = 0.1)]
    pub mirostat_eta: f32,
}

/// Validated settings the server runs with
#[derive(Debug, Clone)]
pub struct Settings {
    pub addr: String,
    pub ollama_url: String,
    pub model: String,
    pub options: PredictOptions,
    pub system_prompt: String,
    pub stop_regex: Option<Regex>,
    pub prompt_template: Option<Arc<dyn PromptTemplate>>,
}

impl Settings {
    pub fn resolve(cli: Cli) -> Result<Self, ConfigError> {
        let model_options = match &cli.model_config_file {
            Some(path) => cli.model_options.or(ModelArgs::from_file(path)?),
            None => cli.model_options.or(ModelArgs::default()),
        };
        let predict = cli.predict;

        let stop_regex = non_empty(predict.stop_regex)
            .map(|pattern| Regex::new(&pattern))
            .transpose()?;

        let system_prompt = match (non_empty(predict.system_prompt), predict.system_prompt_file) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Validation(
                    "cannot use flags --system-prompt and --system-prompt-file at the same time"
                        .into(),
                ))
            }
            (Some(prompt), None) => prompt,
            (None, Some(path)) => read_file(&path)?.trim().to_string(),
            (None, None) => String::new(),
        };

        let prompt_template = build_prompt_template(&model_options)?;
        if let Some(template) = &prompt_template {
            if system_prompt.is_empty() && template.requires_system_prompt() {
                return Err(ConfigError::Validation(format!(
                    "system prompt not set but the prompt template '{}' requires one",
                    template.name()
                )));
            }
        }

        let defaults = PredictOptions::default();
        let options = PredictOptions {
            context: model_options.context.unwrap_or(defaults.context),
            gpu_layers: model_options.gpu_layers.unwrap_or(defaults.gpu_layers),
            rope_freq_base: model_options.rope_freq_base.unwrap_or(defaults.rope_freq_base),
            rope_freq_scale: model_options.rope_freq_scale.unwrap_or(defaults.rope_freq_scale),
            threads: predict.threads,
            tokens: predict.tokens,
            n_keep: predict.n_keep,
            top_k: predict.top_k,
            top_p: predict.top_p,
            temperature: predict.temperature,
            tail_free_sampling_z: predict.tail_free_sampling_z,
            repetition_penalty: predict.repetition_penalty,
            frequency_penalty: predict.frequency_penalty,
            presence_penalty: predict.presence_penalty,
            mirostat: predict.mirostat,
            mirostat_tau: predict.mirostat_tau,
            mirostat_eta: predict.mirostat_eta,
            penalize_newline: false,
        };

        Ok(Self {
            addr: listen_addr(&cli.addr),
            ollama_url: cli.ollama_url,
            model: cli.model,
            options,
            system_prompt,
            stop_regex,
            prompt_template,
        })
    }

    /// Loggable view of the settings
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "addr": self.addr,
            "ollama_url": self.ollama_url,
            "model": self.model,
            "options": self.options,
            "system_prompt": self.system_prompt,
            "stop_regex": self.stop_regex.as_ref().map(Regex::as_str),
            "prompt_template": self.prompt_template.as_ref().map(|t| t.name().to_string()),
        })
    }
}

fn build_prompt_template(
    options: &ModelArgs,
) -> Result<Option<Arc<dyn PromptTemplate>>, ConfigError> {
    let sources = [
        ("--prompt-template", options.prompt_template.is_some()),
        ("--prompt-template-type", options.prompt_template_type.is_some()),
        ("--prompt-template-file", options.prompt_template_file.is_some()),
    ];
    let set: Vec<&str> = sources
        .iter()
        .filter(|(_, is_set)| *is_set)
        .map(|(flag, _)| *flag)
        .collect();
    if set.len() > 1 {
        return Err(ConfigError::Validation(format!(
            "conflicting flags: {}",
            set.join(" ")
        )));
    }

    if let Some(source) = &options.prompt_template {
        return Ok(Some(Arc::new(CustomTemplate::new(source.clone())?)));
    }
    if let Some(name) = &options.prompt_template_type {
        return Ok(Some(template::builtin(name)?));
    }
    if let Some(path) = &options.prompt_template_file {
        return Ok(Some(Arc::new(CustomTemplate::from_file(path)?)));
    }
    Ok(None)
}

/// Accept Go-style ":port" as shorthand for all interfaces
fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{}': {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse --stop-regex: {0}")]
    StopRegex(#[from] regex::Error),

    #[error("failed to create prompt template: {0}")]
    Template(#[from] TemplateError),

    #[error("Validation error: {0}")]
    Validation(String),
}
