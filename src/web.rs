//! HTTP surface over the tracker: read, absolute set, delta add, text relay
//! and an on-demand API poll.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::{Source, UsagePatch, UsageView};
use crate::service::QuotaService;
use crate::tracker::QuotaTracker;

/// Shared state for the API handlers
pub struct ApiState {
    pub tracker: QuotaTracker,
    pub service: QuotaService,
    pub config: AppConfig,
}

/// Response envelope shared by every endpoint
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type ApiResponse = (StatusCode, Json<Envelope>);

fn respond(result: Result<UsageView, AppError>) -> ApiResponse {
    match result {
        Ok(view) => (
            StatusCode::OK,
            Json(Envelope {
                success: true,
                usage: Some(view),
                error: None,
            }),
        ),
        Err(err) => {
            let status = if err.is_input_error() {
                StatusCode::BAD_REQUEST
            } else {
                warn!(error = %err, "usage request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            };
            let message = match err {
                AppError::InvalidInput(msg) => msg,
                other => other.to_string(),
            };
            (
                status,
                Json(Envelope {
                    success: false,
                    usage: None,
                    error: Some(message),
                }),
            )
        }
    }
}

fn parse_body(body: &Bytes) -> Result<Value, AppError> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|_| AppError::InvalidInput("request body must be JSON".into()))
}

/// Runs a tracker operation on the blocking pool; it locks and may fsync.
async fn with_tracker<F>(state: Arc<ApiState>, op: F) -> Result<UsageView, AppError>
where
    F: FnOnce(&QuotaTracker) -> Result<UsageView, AppError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&state.tracker))
        .await
        .map_err(|e| AppError::Task(format!("tracker task join error: {e}")))?
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/usage", get(get_usage).post(set_usage))
        .route("/api/usage/add", post(add_usage))
        .route("/api/usage/relay", post(relay_text))
        .route("/api/usage/refresh", post(refresh_usage))
        .with_state(state)
}

pub async fn serve(state: Arc<ApiState>, listen: &str) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "usage API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// GET /api/usage
pub async fn get_usage(State(state): State<Arc<ApiState>>) -> ApiResponse {
    respond(with_tracker(state, |tracker| tracker.read()).await)
}

/// POST /api/usage
pub async fn set_usage(State(state): State<Arc<ApiState>>, body: Bytes) -> ApiResponse {
    let value = match parse_body(&body) {
        Ok(value) => value,
        Err(err) => return respond(Err(err)),
    };
    let source = value
        .get("source")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Source>().ok())
        .unwrap_or(Source::Manual);
    let patch = UsagePatch::from_json(&value);
    respond(with_tracker(state, move |tracker| tracker.set_usage(&patch, source)).await)
}

/// POST /api/usage/add
pub async fn add_usage(State(state): State<Arc<ApiState>>, body: Bytes) -> ApiResponse {
    let tokens = parse_body(&body).and_then(|value| {
        value
            .get("tokens")
            .and_then(Value::as_f64)
            .ok_or_else(|| AppError::InvalidInput("tokens must be a number".into()))
    });
    match tokens {
        Ok(tokens) => respond(with_tracker(state, move |tracker| tracker.add_usage(tokens)).await),
        Err(err) => respond(Err(err)),
    }
}

/// POST /api/usage/relay
pub async fn relay_text(State(state): State<Arc<ApiState>>, body: Bytes) -> ApiResponse {
    let text = parse_body(&body).and_then(|value| {
        value
            .get("statusText")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| AppError::InvalidInput("statusText required".into()))
    });
    match text {
        Ok(text) => {
            respond(with_tracker(state, move |tracker| tracker.update_from_text(&text)).await)
        }
        Err(err) => respond(Err(err)),
    }
}

/// POST /api/usage/refresh
pub async fn refresh_usage(State(state): State<Arc<ApiState>>) -> ApiResponse {
    respond(state.service.poll(&state.config, &state.tracker).await)
}
