//! llm-api - HTTP API for a local large language model
//!
//! Serves raw completions on `/predict` and multi-turn chat on `/chat`.
//! Responses are streamed as they are generated, and only one prediction
//! runs at a time; concurrent requests are rejected with 503.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tower_http::{cors::CorsLayer, timeout::RequestBodyTimeoutLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod conversation;
mod core;
mod providers;
mod routes;

use crate::config::{Cli, Settings};
use crate::core::InferenceEngine;
use crate::providers::{OllamaPredictor, Predictor};
use crate::routes::ChatConfig;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<InferenceEngine>,
    pub chat: Option<Arc<ChatConfig>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::resolve(Cli::parse())?;
    tracing::debug!(
        "configuration:\n{}",
        serde_json::to_string_pretty(&settings.summary())?
    );

    let ollama = OllamaPredictor::new(settings.ollama_url.clone(), settings.model.clone());
    tracing::info!(model = %ollama.model(), url = %settings.ollama_url, "loading model");
    ollama
        .load()
        .await
        .with_context(|| format!("failed to load model '{}'", ollama.model()))?;
    let predictor: Arc<dyn Predictor> = Arc::new(ollama);
    let engine = Arc::new(InferenceEngine::new(
        predictor.clone(),
        settings.options.clone(),
        settings.stop_regex.clone(),
    ));

    let chat = settings.prompt_template.clone().map(|template| {
        Arc::new(ChatConfig {
            template,
            system_prompt: settings.system_prompt.clone(),
        })
    });

    let state = AppState { engine, chat };

    let app = Router::new()
        .merge(routes::router(state.chat.is_some()))
        .layer(RequestBodyTimeoutLayer::new(Duration::from_secs(30)))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.addr).await?;
    tracing::info!("llm-api serving '{}' at http://{}", settings.model, settings.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    if let Err(e) = predictor.free().await {
        tracing::warn!(error = %e, "failed to release the model");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
