//! Router and request handlers
//!
//! Two request surfaces share the dispatch engine: the OpenAI-compatible
//! chat surface (translated both ways) and the native `generateContent`
//! passthrough (bodies verbatim in both directions). Historical clients used
//! both the `/v1`-prefixed and bare paths for the chat surface, so both are
//! mounted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use gemini_pool::Dispatcher;
use metrics_exporter_prometheus::PrometheusHandle;
use openai_compat::{chat_to_gemini, gemini_to_chat, model_list};
use serde_json::Value;
use tracing::info;

use crate::error::{json_error, pool_error};

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub models: Arc<Vec<String>>,
    /// End-to-end cap on one dispatched request, retry loop included.
    pub request_timeout: Duration,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// A concurrency limit layer caps in-flight requests at `max_connections`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/models", get(models_handler))
        .route("/v1/models", get(models_handler))
        .route("/chat/completions", post(chat_handler))
        .route("/v1/chat/completions", post(chat_handler))
        .route("/v1beta/models/{model_call}", post(native_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Record the request metric and hand the response back.
fn track(endpoint: &str, started: Instant, response: Response) -> Response {
    crate::metrics::record_request(
        response.status().as_u16(),
        endpoint,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Status snapshot: per-key usage with secrets redacted.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let keys = state.dispatcher.store().snapshot().await;
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "status": "ok",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "keys": keys,
        })
        .to_string(),
    )
}

/// Static model catalog in OpenAI list form.
async fn models_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(model_list(&state.models))
}

/// OpenAI-compatible chat surface: translate in, dispatch, translate out.
async fn chat_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let started = Instant::now();

    let request: openai_compat::ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return track(
                "chat",
                started,
                json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("malformed request body: {e}"),
                ),
            );
        }
    };

    if !state.models.contains(&request.model) {
        return track(
            "chat",
            started,
            json_error(
                StatusCode::NOT_FOUND,
                "model_not_found",
                &format!("model {} is not served by this proxy", request.model),
            ),
        );
    }

    info!(model = %request.model, messages = request.messages.len(), "chat completion request");
    let upstream_body = chat_to_gemini(&request.messages);

    let response = match tokio::time::timeout(
        state.request_timeout,
        state
            .dispatcher
            .generate_content(&request.model, &upstream_body),
    )
    .await
    {
        Ok(Ok(upstream)) => {
            let value: Value = serde_json::from_slice(&upstream.body).unwrap_or_default();
            axum::Json(gemini_to_chat(&request.model, &value)).into_response()
        }
        Ok(Err(e)) => pool_error(e),
        Err(_) => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "upstream_timeout",
            "request did not complete within the configured timeout",
        ),
    };

    track("chat", started, response)
}

/// Native passthrough: the request body goes to the dispatcher verbatim and
/// the upstream response comes back verbatim.
async fn native_handler(
    State(state): State<AppState>,
    Path(model_call): Path<String>,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let (model, action) = model_call.split_once(':').unwrap_or(("", ""));
    if model.is_empty() || action != "generateContent" {
        return track(
            "native",
            started,
            json_error(
                StatusCode::NOT_FOUND,
                "not_found",
                "expected /v1beta/models/{model}:generateContent",
            ),
        );
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return track(
                "native",
                started,
                json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("malformed request body: {e}"),
                ),
            );
        }
    };

    let response = match tokio::time::timeout(
        state.request_timeout,
        state.dispatcher.generate_content(model, &payload),
    )
    .await
    {
        Ok(Ok(upstream)) => (
            StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK),
            [(CONTENT_TYPE, "application/json")],
            upstream.body,
        )
            .into_response(),
        Ok(Err(e)) => pool_error(e),
        Err(_) => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "upstream_timeout",
            "request did not complete within the configured timeout",
        ),
    };

    track("native", started, response)
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}
