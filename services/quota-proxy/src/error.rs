//! HTTP error envelopes
//!
//! All failures cross the boundary as `{"error": {"type", "message"}}`.
//! Upstream errors are the exception: their status and body pass through
//! verbatim so callers see exactly what the API said.

use axum::http::{StatusCode, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};

/// Standard error envelope body.
pub fn envelope(kind: &str, message: &str) -> String {
    serde_json::json!({ "error": { "type": kind, "message": message } }).to_string()
}

/// JSON error response with the standard envelope.
pub fn json_error(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        envelope(kind, message),
    )
        .into_response()
}

/// Map a dispatch failure to its HTTP response.
pub fn pool_error(error: gemini_pool::Error) -> Response {
    match error {
        gemini_pool::Error::Upstream { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, [(CONTENT_TYPE, "application/json")], body).into_response()
        }
        gemini_pool::Error::AllKeysExhausted { model } => json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "all_keys_exhausted",
            &format!("every key has reached its daily quota for {model}"),
        ),
        gemini_pool::Error::NoKeysConfigured => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "no_keys_configured",
            "no API keys are configured",
        ),
    }
}
