//! Error types for key store operations

/// Errors from key store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key file I/O error: {0}")]
    Io(String),

    #[error("key file parse error: {0}")]
    Parse(String),

    #[error("key index out of range: {0}")]
    NotFound(usize),
}

/// Result alias for key store operations.
pub type Result<T> = std::result::Result<T, Error>;
