//! API routes
//!
//! `/predict` completes a raw prompt and `/chat` renders a conversation
//! through the configured prompt template first. Both accept parameters from
//! the query string or a url-encoded POST body and stream the response as
//! plain text.

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use thiserror::Error;

use crate::conversation::{Conversation, PromptTemplate, TemplateError};
use crate::core::{EngineError, PredictRequest};
use crate::AppState;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Chat settings, present only when a prompt template is configured
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub template: Arc<dyn PromptTemplate>,
    pub system_prompt: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    busy: bool,
    chat: bool,
}

/// Errors reported to the client before the response body starts
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to generate prompt: {0}")]
    Render(#[from] TemplateError),

    #[error("chat is disabled because no prompt template is set")]
    ChatDisabled,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(EngineError::InvalidStopRegex(_)) => StatusCode::BAD_REQUEST,
            ApiError::Engine(EngineError::Busy(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ChatDisabled => StatusCode::NOT_FOUND,
        };
        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "request failed");
        }
        (status, [(header::CONTENT_TYPE, TEXT_PLAIN)], self.to_string()).into_response()
    }
}

/// Decoded form parameters, body values first, then query values
#[derive(Debug, Default)]
struct FormParams {
    pairs: Vec<(String, String)>,
}

impl FormParams {
    fn parse(method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Result<Self, ApiError> {
        let mut pairs = Vec::new();
        if method == Method::POST && is_url_encoded(headers) {
            let body = std::str::from_utf8(body).map_err(|_| bad_request())?;
            pairs.extend(parse_url_encoded(body)?);
        }
        if let Some(query) = uri.query() {
            pairs.extend(parse_url_encoded(query)?);
        }
        Ok(Self { pairs })
    }

    /// First value of `key`
    fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First non-empty value of `key`
    fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    fn temperature(&self) -> Result<Option<f32>, ApiError> {
        self.get_non_empty("temperature")
            .map(|value| {
                value.parse::<f32>().map_err(|e| {
                    ApiError::BadRequest(format!(
                        "failed to parse value 'temperature' {value}: {e}"
                    ))
                })
            })
            .transpose()
    }

    fn predict_request(&self, prompt: String) -> Result<PredictRequest, ApiError> {
        Ok(PredictRequest {
            prompt,
            temperature: self.temperature()?,
            stop_regex: self.get_non_empty("stopRegex").map(str::to_string),
        })
    }
}

fn is_url_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

fn parse_url_encoded(input: &str) -> Result<Vec<(String, String)>, ApiError> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((decode(key)?, decode(value)?))
        })
        .collect()
}

fn decode(component: &str) -> Result<String, ApiError> {
    let component = component.replace('+', " ");
    urlencoding::decode(&component)
        .map(Cow::into_owned)
        .map_err(|_| bad_request())
}

fn bad_request() -> ApiError {
    ApiError::BadRequest(
        StatusCode::BAD_REQUEST
            .canonical_reason()
            .unwrap_or("Bad Request")
            .to_string(),
    )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        busy: state.engine.gate().is_busy(),
        chat: state.chat.is_some(),
    })
}

async fn predict(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let form = FormParams::parse(&method, &uri, &headers, &body)?;
    let prompt = form.get("prompt").unwrap_or_default().to_string();
    let request = form.predict_request(prompt)?;
    stream_prediction(&state, request)
}

async fn chat(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let config = state.chat.as_ref().ok_or(ApiError::ChatDisabled)?;
    let form = FormParams::parse(&method, &uri, &headers, &body)?;

    let system_prompt = form
        .get_non_empty("system")
        .unwrap_or(config.system_prompt.as_str());
    let conversation = Conversation::from_history(system_prompt, &form.get_all("messages"));
    let mut prompt = conversation.render(config.template.as_ref())?;

    if let Some(prefix) = form.get_non_empty("replyPrefix") {
        if !prompt.ends_with('\n') {
            prompt.push(' ');
        }
        prompt.push_str(prefix);
    }

    let request = form.predict_request(prompt)?;
    stream_prediction(&state, request)
}

fn stream_prediction(state: &AppState, request: PredictRequest) -> Result<Response, ApiError> {
    let mut rx = state.engine.start(request)?;

    // an Err chunk aborts the connection, so clients see a truncated response
    let stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield chunk;
        }
    };

    Ok((
        [(header::CONTENT_TYPE, TEXT_PLAIN)],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::CONTENT_TYPE, TEXT_PLAIN)],
        "only GET and POST methods supported",
    )
}

pub fn router(chat_enabled: bool) -> Router<AppState> {
    let router = Router::new()
        .route("/health", get(health))
        .route(
            "/predict",
            get(predict).post(predict).fallback(method_not_allowed),
        );

    if !chat_enabled {
        tracing::warn!("`/chat` endpoint is not available because no prompt template is set");
        return router;
    }
    router.route("/chat", get(chat).post(chat).fallback(method_not_allowed))
}
