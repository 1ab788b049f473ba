//! Dispatch engine: key selection, upstream calls, retry/rotate state machine
//!
//! One dispatch flow per inbound request. The flow walks the eligible keys
//! in priority order; each key gets a bounded attempt loop. Classification
//! of each attempt decides: retry the same key (transient / rate limited),
//! bench the pair and rotate (quota), or remember the error and rotate
//! (fatal). The first success is terminal; otherwise the last remembered
//! upstream error crosses the boundary, or a synthesized all-exhausted
//! error if nothing was remembered.
//!
//! Usage mutations go through the key store, which persists after every
//! change, so each transition is reflected in the on-disk snapshot and
//! visible to the status endpoint.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gemini_keys::{EligibleKey, KeyStore};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::classify::{Outcome, classify};
use crate::error::{Error, Result};

/// Retry and upstream tuning for the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upstream base URL; the model is interpolated into the path.
    pub base_url: String,
    /// Per-attempt timeout so one slow key cannot stall a request indefinitely.
    pub upstream_timeout: Duration,
    /// Attempts per key before rotating (transient and rate-limited retries
    /// share this budget).
    pub max_attempts: u32,
    /// Fixed delay before retrying a transient failure.
    pub retry_delay: Duration,
    /// Cumulative cap on honored retry-delay waits per request.
    pub rate_limit_wait_budget: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".into(),
            upstream_timeout: Duration::from_secs(120),
            max_attempts: 3,
            retry_delay: Duration::from_secs(3),
            rate_limit_wait_budget: Duration::from_secs(60),
        }
    }
}

/// A successful upstream response, forwarded verbatim.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Result of trying one key: either terminal success or move to the next
/// key, optionally remembering a fallback error.
enum KeyOutcome {
    Success(UpstreamResponse),
    NextKey(Option<Error>),
}

/// Quota-aware dispatcher over the shared key store.
pub struct Dispatcher {
    store: Arc<KeyStore>,
    client: reqwest::Client,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<KeyStore>, client: reqwest::Client, config: DispatcherConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// The shared key store (for status reporting and the reset task).
    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// Dispatch a native `generateContent` request for `model`.
    ///
    /// `body` is forwarded verbatim; the response body comes back verbatim.
    pub async fn generate_content(&self, model: &str, body: &Value) -> Result<UpstreamResponse> {
        if self.store.is_empty().await {
            return Err(Error::NoKeysConfigured);
        }

        // Keys already tried this request are excluded by construction: the
        // eligible list is walked once, in load order.
        let eligible = self.store.eligible_keys(model).await;
        if eligible.is_empty() {
            info!(model, "no eligible keys, all benched until reset");
            return Err(Error::AllKeysExhausted {
                model: model.to_string(),
            });
        }

        // One budget for the whole request, drained across key rotations
        let mut wait_budget = self.config.rate_limit_wait_budget;
        let mut last_error: Option<Error> = None;
        for key in &eligible {
            info!(key = key.index + 1, model, "selected key");
            match self.try_key(key, model, body, &mut wait_budget).await {
                KeyOutcome::Success(response) => return Ok(response),
                KeyOutcome::NextKey(error) => {
                    if let Some(error) = error {
                        last_error = Some(error);
                    }
                }
            }
        }

        warn!(model, keys_tried = eligible.len(), "all keys tried without success");
        Err(last_error.unwrap_or_else(|| Error::AllKeysExhausted {
            model: model.to_string(),
        }))
    }

    /// Bounded attempt loop for one key. `wait_budget` spans the whole
    /// request and carries over into the next key's loop.
    async fn try_key(
        &self,
        key: &EligibleKey,
        model: &str,
        body: &Value,
        wait_budget: &mut Duration,
    ) -> KeyOutcome {
        let url = format!(
            "{}/v1beta/models/{model}:generateContent",
            self.config.base_url.trim_end_matches('/')
        );

        let mut last_error: Option<Error> = None;

        for attempt in 1..=self.config.max_attempts {
            let sent = self
                .client
                .post(&url)
                .header("x-goog-api-key", key.secret.expose())
                .timeout(self.config.upstream_timeout)
                .json(body)
                .send()
                .await;

            let (status, response_body) = match sent {
                Ok(response) => {
                    let status = response.status().as_u16();
                    match response.bytes().await {
                        Ok(bytes) => (status, bytes),
                        Err(e) => {
                            // Body read failure counts as a transport failure
                            record_attempt("transport");
                            warn!(key = key.index + 1, attempt, error = %e, "upstream body read failed");
                            last_error = Some(transport_error(&e.to_string()));
                            if attempt < self.config.max_attempts {
                                tokio::time::sleep(self.config.retry_delay).await;
                                continue;
                            }
                            break;
                        }
                    }
                }
                Err(e) => {
                    record_attempt("transport");
                    warn!(key = key.index + 1, attempt, error = %e, "upstream request failed");
                    last_error = Some(transport_error(&e.to_string()));
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                        continue;
                    }
                    break;
                }
            };

            let body_text = String::from_utf8_lossy(&response_body);
            let outcome = classify(status, &body_text);
            record_attempt(outcome.label());

            match outcome {
                Outcome::Success => {
                    let tokens = inline_token_count(&response_body);
                    if let Err(e) = self.store.record_success(key.index, model, tokens).await {
                        warn!(key = key.index + 1, error = %e, "failed to record usage");
                    }
                    debug!(key = key.index + 1, model, tokens, "upstream success");
                    return KeyOutcome::Success(UpstreamResponse {
                        status,
                        body: response_body,
                    });
                }
                Outcome::Transient => {
                    last_error = Some(Error::Upstream {
                        status,
                        body: body_text.into_owned(),
                    });
                    if attempt < self.config.max_attempts {
                        debug!(
                            key = key.index + 1,
                            attempt,
                            delay_secs = self.config.retry_delay.as_secs(),
                            "503 from upstream, retrying same key"
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                        continue;
                    }
                    break;
                }
                Outcome::RateLimited(delay) => {
                    last_error = Some(Error::Upstream {
                        status,
                        body: body_text.into_owned(),
                    });
                    if attempt < self.config.max_attempts && delay <= *wait_budget {
                        info!(
                            key = key.index + 1,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "rate limited, honoring upstream retry delay"
                        );
                        *wait_budget -= delay;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    debug!(key = key.index + 1, "retry delay exceeds budget, rotating");
                    break;
                }
                Outcome::QuotaExhausted => {
                    if let Err(e) = self.store.record_exhausted(key.index, model).await {
                        warn!(key = key.index + 1, error = %e, "failed to record exhaustion");
                    }
                    last_error = Some(Error::Upstream {
                        status,
                        body: body_text.into_owned(),
                    });
                    break;
                }
                Outcome::Fatal => {
                    warn!(key = key.index + 1, status, "fatal upstream error, rotating");
                    last_error = Some(Error::Upstream {
                        status,
                        body: body_text.into_owned(),
                    });
                    break;
                }
            }
        }

        KeyOutcome::NextKey(last_error)
    }
}

/// Record one classified upstream attempt.
fn record_attempt(outcome: &str) {
    metrics::counter!("upstream_attempts_total", "outcome" => outcome.to_string()).increment(1);
}

/// Transport failures have no upstream status; surface them as 502.
fn transport_error(message: &str) -> Error {
    Error::Upstream {
        status: 502,
        body: serde_json::json!({
            "error": { "type": "upstream_unreachable", "message": message }
        })
        .to_string(),
    }
}

/// Best-effort token count from the native response's `usageMetadata`.
///
/// The upstream usually reports `totalTokenCount` inline, which saves a
/// counting round trip; absent metadata counts as zero.
fn inline_token_count(body: &[u8]) -> u64 {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("usageMetadata")?.get("totalTokenCount")?.as_u64())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header::CONTENT_TYPE};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MODEL: &str = "gemini-2.5-pro";

    fn success_body() -> String {
        serde_json::json!({
            "candidates": [
                {"content": {"parts": [{"text": "hello"}]}, "finishReason": "STOP"}
            ],
            "usageMetadata": {"totalTokenCount": 42}
        })
        .to_string()
    }

    fn quota_body() -> String {
        serde_json::json!({
            "error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "details": [
                {"@type": "type.googleapis.com/google.rpc.QuotaFailure",
                 "violations": [{"quotaMetric": "generate_requests_per_model_per_day"}]}
            ]}
        })
        .to_string()
    }

    fn rate_limit_body(delay: &str) -> String {
        serde_json::json!({
            "error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "details": [
                {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": delay}
            ]}
        })
        .to_string()
    }

    /// Mock upstream that replays a scripted (status, body) sequence and
    /// records which API key header each request carried.
    async fn scripted_upstream(
        responses: Vec<(u16, String)>,
    ) -> (String, Arc<Mutex<Vec<String>>>, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let keys_seen = Arc::new(Mutex::new(Vec::new()));
        let hits = Arc::new(AtomicUsize::new(0));

        let responses = Arc::new(responses);
        let keys = keys_seen.clone();
        let app = axum::Router::new().fallback(move |request: Request<Body>| {
            let responses = responses.clone();
            let keys = keys.clone();
            let hits = hits.clone();
            async move {
                let key = request
                    .headers()
                    .get("x-goog-api-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                keys.lock().unwrap().push(key);

                let i = hits.fetch_add(1, Ordering::SeqCst).min(responses.len() - 1);
                let (status, body) = responses[i].clone();
                (
                    StatusCode::from_u16(status).unwrap(),
                    [(CONTENT_TYPE, "application/json")],
                    body,
                )
            }
        });

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), keys_seen, handle)
    }

    async fn store_with_keys(dir: &tempfile::TempDir, keys: &[&str]) -> Arc<KeyStore> {
        let path = dir.path().join("api_keys.json");
        let entries: Vec<serde_json::Value> =
            keys.iter().map(|k| serde_json::json!({"key": k})).collect();
        tokio::fs::write(&path, serde_json::to_string(&entries).unwrap())
            .await
            .unwrap();
        Arc::new(KeyStore::load(path).await.unwrap())
    }

    fn dispatcher(store: Arc<KeyStore>, base_url: &str) -> Dispatcher {
        Dispatcher::new(
            store,
            reqwest::Client::new(),
            DispatcherConfig {
                base_url: base_url.to_string(),
                upstream_timeout: Duration::from_secs(5),
                max_attempts: 3,
                // Keep tests fast; the retry logic is what matters
                retry_delay: Duration::from_millis(10),
                rate_limit_wait_budget: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn success_increments_exactly_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["k1", "k2"]).await;
        let (url, keys_seen, _server) = scripted_upstream(vec![(200, success_body())]).await;

        let d = dispatcher(store.clone(), &url);
        let response = d.generate_content(MODEL, &serde_json::json!({})).await.unwrap();
        assert_eq!(response.status, 200);

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot[0].usage[MODEL].request_count, 1);
        assert_eq!(snapshot[0].usage[MODEL].token_count, 42);
        assert!(snapshot[1].usage.is_empty());
        assert_eq!(*keys_seen.lock().unwrap(), ["k1"]);
    }

    #[tokio::test]
    async fn transient_503_retries_same_key_without_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["k1", "k2"]).await;
        let (url, keys_seen, _server) = scripted_upstream(vec![
            (503, "overloaded".into()),
            (503, "overloaded".into()),
            (200, success_body()),
        ])
        .await;

        let d = dispatcher(store.clone(), &url);
        let response = d.generate_content(MODEL, &serde_json::json!({})).await.unwrap();
        assert_eq!(response.status, 200);

        // All three attempts on the same key; no rotation occurred
        assert_eq!(*keys_seen.lock().unwrap(), ["k1", "k1", "k1"]);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot[0].usage[MODEL].request_count, 1);
    }

    #[tokio::test]
    async fn transient_budget_spent_rotates_and_remembers_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["k1"]).await;
        let (url, keys_seen, _server) =
            scripted_upstream(vec![(503, "overloaded".into())]).await;

        let d = dispatcher(store.clone(), &url);
        let err = d
            .generate_content(MODEL, &serde_json::json!({}))
            .await
            .unwrap_err();

        assert_eq!(keys_seen.lock().unwrap().len(), 3, "full attempt budget spent");
        match err {
            Error::Upstream { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("expected Upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quota_429_benches_key_and_escalates_to_next() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["k1", "k2"]).await;
        let (url, keys_seen, _server) =
            scripted_upstream(vec![(429, quota_body()), (200, success_body())]).await;

        let d = dispatcher(store.clone(), &url);
        let response = d.generate_content(MODEL, &serde_json::json!({})).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(*keys_seen.lock().unwrap(), ["k1", "k2"]);

        // Success attributed to #2, #1 benched for this model
        let snapshot = store.snapshot().await;
        assert!(snapshot[0].usage[MODEL].rpd_limit_reached);
        assert_eq!(snapshot[0].usage[MODEL].request_count, 0);
        assert_eq!(snapshot[1].usage[MODEL].request_count, 1);

        // Stickiness: a second request never selects #1
        let eligible = store.eligible_keys(MODEL).await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].index, 1);
    }

    #[tokio::test]
    async fn rate_limited_waits_and_retries_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["k1"]).await;
        let (url, keys_seen, _server) =
            scripted_upstream(vec![(429, rate_limit_body("0.02s")), (200, success_body())]).await;

        let d = dispatcher(store.clone(), &url);
        let response = d.generate_content(MODEL, &serde_json::json!({})).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(*keys_seen.lock().unwrap(), ["k1", "k1"]);

        // Rate limiting never benches the key
        let snapshot = store.snapshot().await;
        assert!(!snapshot[0].usage[MODEL].rpd_limit_reached);
    }

    #[tokio::test]
    async fn rate_limit_delay_beyond_budget_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["k1", "k2"]).await;
        // 1h delay would blow the wait budget; engine must rotate instead
        let (url, keys_seen, _server) =
            scripted_upstream(vec![(429, rate_limit_body("3600s")), (200, success_body())]).await;

        let d = dispatcher(store.clone(), &url);
        let response = d.generate_content(MODEL, &serde_json::json!({})).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(*keys_seen.lock().unwrap(), ["k1", "k2"]);

        let snapshot = store.snapshot().await;
        assert!(
            !snapshot[0].usage[MODEL].rpd_limit_reached,
            "long rate-limit delay must not bench the key"
        );
    }

    #[tokio::test]
    async fn rate_limit_budget_is_shared_across_key_rotations() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["k1", "k2"]).await;
        // Key #1 burns 30ms of the 40ms budget, then rotates on a 400.
        // Key #2's 30ms delay no longer fits the 10ms remainder, so it must
        // rotate without a retry instead of drawing on a fresh budget.
        let (url, keys_seen, _server) = scripted_upstream(vec![
            (429, rate_limit_body("0.03s")),
            (400, r#"{"error":{"message":"bad request"}}"#.into()),
            (429, rate_limit_body("0.03s")),
        ])
        .await;

        let d = Dispatcher::new(
            store,
            reqwest::Client::new(),
            DispatcherConfig {
                base_url: url,
                upstream_timeout: Duration::from_secs(5),
                max_attempts: 3,
                retry_delay: Duration::from_millis(10),
                rate_limit_wait_budget: Duration::from_millis(40),
            },
        );
        let err = d
            .generate_content(MODEL, &serde_json::json!({}))
            .await
            .unwrap_err();

        assert_eq!(*keys_seen.lock().unwrap(), ["k1", "k1", "k2"]);
        match err {
            Error::Upstream { status, .. } => assert_eq!(status, 429),
            other => panic!("expected Upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_error_rotates_and_returns_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["k1", "k2"]).await;
        let (url, keys_seen, _server) = scripted_upstream(vec![
            (400, r#"{"error":{"message":"bad request"}}"#.into()),
            (401, r#"{"error":{"message":"invalid key"}}"#.into()),
        ])
        .await;

        let d = dispatcher(store.clone(), &url);
        let err = d
            .generate_content(MODEL, &serde_json::json!({}))
            .await
            .unwrap_err();

        assert_eq!(*keys_seen.lock().unwrap(), ["k1", "k2"]);
        match err {
            Error::Upstream { status, .. } => assert_eq!(status, 401),
            other => panic!("expected Upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn priority_order_skips_benched_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["k1", "k2", "k3"]).await;
        store.record_exhausted(0, MODEL).await.unwrap();
        store.record_exhausted(1, MODEL).await.unwrap();

        let (url, keys_seen, _server) = scripted_upstream(vec![(200, success_body())]).await;
        let d = dispatcher(store.clone(), &url);
        let response = d.generate_content(MODEL, &serde_json::json!({})).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(*keys_seen.lock().unwrap(), ["k3"]);
    }

    #[tokio::test]
    async fn all_benched_yields_exhausted_error_without_upstream_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["k1"]).await;
        store.record_exhausted(0, MODEL).await.unwrap();

        let (url, keys_seen, _server) = scripted_upstream(vec![(200, success_body())]).await;
        let d = dispatcher(store, &url);
        let err = d
            .generate_content(MODEL, &serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AllKeysExhausted { ref model } if model == MODEL));
        assert!(keys_seen.lock().unwrap().is_empty(), "no upstream call expected");
    }

    #[tokio::test]
    async fn empty_store_refuses_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_keys.json");
        tokio::fs::write(&path, "[]").await.unwrap();
        let store = Arc::new(KeyStore::load(path).await.unwrap());

        let d = dispatcher(store, "http://127.0.0.1:9");
        let err = d
            .generate_content(MODEL, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoKeysConfigured));
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_502_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["k1"]).await;

        // Unroutable port: every attempt is a transport failure
        let d = dispatcher(store, "http://127.0.0.1:1");
        let err = d
            .generate_content(MODEL, &serde_json::json!({}))
            .await
            .unwrap_err();

        match err {
            Error::Upstream { status, body } => {
                assert_eq!(status, 502);
                assert!(body.contains("upstream_unreachable"));
            }
            other => panic!("expected Upstream error, got {other:?}"),
        }
    }

    #[test]
    fn inline_token_count_reads_usage_metadata() {
        assert_eq!(inline_token_count(success_body().as_bytes()), 42);
        assert_eq!(inline_token_count(b"{}"), 0);
        assert_eq!(inline_token_count(b"not json"), 0);
    }
}
