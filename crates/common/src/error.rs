//! Startup input errors
//!
//! Shared by everything that reads operator-supplied input at boot: the
//! proxy's TOML config and file paths derived from it. Covers the three
//! ways that input goes bad: a value that fails validation, a file that
//! cannot be read, and TOML that does not parse. Key-file errors live in
//! their own crate; runtime dispatch errors never use this type.

use thiserror::Error;

/// Error for configuration loading and validation.
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value failed validation (bad URL scheme, zero
    /// timeout, unknown timezone).
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
