//! Error types for dispatch operations

/// Terminal dispatch errors.
///
/// Per-attempt failures (transient 503s, rate limits, quota hits) resolve
/// inside the dispatch loop; only these cross the engine boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no API keys configured")]
    NoKeysConfigured,

    #[error("all API keys have reached their quota or are unavailable for model '{model}'")]
    AllKeysExhausted { model: String },

    /// Last remembered upstream failure after every key was tried.
    /// `body` is the upstream response body, forwarded for the client.
    #[error("upstream error (status {status})")]
    Upstream { status: u16, body: String },
}

/// Result alias for dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;
