//! Upstream failure classification
//!
//! The upstream overloads HTTP 429 for two distinct conditions: a short
//! rate window (carries a structured `RetryInfo` retry delay) and a hard
//! daily quota (no delay, a `QuotaFailure`/`quotaMetric` marker instead).
//! The two are distinguishable only from the response body, not the status
//! code. Only the daily quota benches a (key, model) pair.

use std::time::Duration;

use serde_json::Value;

const RETRY_INFO_TYPE: &str = "type.googleapis.com/google.rpc.RetryInfo";

/// Quota-exhaustion markers in Gemini 429 bodies.
///
/// `quotaMetric` appears inside `QuotaFailure.violations`; older responses
/// carried it only in the stringified inner error, so a substring check
/// covers both.
const QUOTA_MARKERS: &[&str] = &["quotaMetric", "google.rpc.QuotaFailure"];

/// Classification of one upstream attempt, driving the retry state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// 2xx: proceed to usage accounting.
    Success,
    /// 503: retry the same key after a fixed delay, bounded attempts.
    /// Transport failures are classified Transient by the dispatch loop.
    Transient,
    /// 429 with a structured retry delay: wait exactly that long, retry the
    /// same key, within a cumulative per-request wait budget.
    RateLimited(Duration),
    /// 429 with a quota marker and no delay: bench the (key, model) pair
    /// until the daily reset, move to the next key.
    QuotaExhausted,
    /// Any other 4xx/5xx, or a 429 with neither marker nor delay: remember
    /// as fallback error, move to the next key. Do not bench.
    Fatal,
}

impl Outcome {
    /// Outcome label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Transient => "transient",
            Outcome::RateLimited(_) => "rate_limited",
            Outcome::QuotaExhausted => "quota_exhausted",
            Outcome::Fatal => "fatal",
        }
    }
}

/// Classify an upstream response by HTTP status and body.
pub fn classify(status: u16, body: &str) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        503 => Outcome::Transient,
        429 => classify_429(body),
        _ => Outcome::Fatal,
    }
}

/// Classify a 429 body: retry delay wins over the quota marker, since a
/// response carrying both is still retryable in place.
pub fn classify_429(body: &str) -> Outcome {
    if let Some(delay) = retry_delay(body) {
        return Outcome::RateLimited(delay);
    }
    if QUOTA_MARKERS.iter().any(|m| body.contains(m)) {
        return Outcome::QuotaExhausted;
    }
    Outcome::Fatal
}

/// Extract a `RetryInfo.retryDelay` duration from a 429 body.
///
/// Accepts both observed shapes: the detail list directly under
/// `error.details`, and the historical shape where `error.message` is
/// itself a JSON document containing the details.
fn retry_delay(body: &str) -> Option<Duration> {
    let root: Value = serde_json::from_str(body).ok()?;
    if let Some(delay) = retry_delay_in(&root) {
        return Some(delay);
    }
    let message = root.get("error")?.get("message")?.as_str()?;
    let inner: Value = serde_json::from_str(message).ok()?;
    retry_delay_in(&inner)
}

fn retry_delay_in(value: &Value) -> Option<Duration> {
    let details = value.get("error")?.get("details")?.as_array()?;
    details
        .iter()
        .filter(|d| d.get("@type").and_then(Value::as_str) == Some(RETRY_INFO_TYPE))
        .find_map(|d| parse_delay(d.get("retryDelay")?.as_str()?))
}

/// Parse a protobuf Duration string like "7s" or "0.8s".
fn parse_delay(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().strip_suffix('s').unwrap_or(raw).parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}
