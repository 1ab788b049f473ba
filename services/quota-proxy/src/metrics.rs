//! Prometheus metrics exposition
//!
//! Request-level metrics for the proxy surface:
//!
//! - `proxy_requests_total` (counter): labels `status`, `endpoint`
//! - `proxy_request_duration_seconds` (histogram): label `endpoint`
//!
//! The dispatch engine records `upstream_attempts_total` per classified
//! attempt; both land in the same recorder and render on `/metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `proxy_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram with `_bucket` lines rather than a summary. The range covers
/// fast catalog hits up to chat requests that ride out the full retry loop.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "proxy_request_duration_seconds".to_string(),
            ),
            &[
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
                300.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed request with status code and endpoint labels.
pub fn record_request(status: u16, endpoint: &str, duration_secs: f64) {
    metrics::counter!(
        "proxy_requests_total",
        "status" => status.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "proxy_request_duration_seconds",
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}
