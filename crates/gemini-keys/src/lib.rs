//! API key storage and per-model usage tracking
//!
//! Owns the ordered list of Gemini API keys and their per-(key, model) usage
//! records. The key list is loaded once at startup and never mutated at
//! runtime; usage records appear lazily on first use of a (key, model) pair
//! and are updated after every completed upstream attempt.
//!
//! The on-disk snapshot is an export: it is rewritten atomically after every
//! mutation and never read back after startup. Writers serialize behind a
//! dedicated I/O lock so the file is always complete, parseable JSON.

pub mod error;
pub mod key;
pub mod store;

pub use error::{Error, Result};
pub use key::{KeyEntry, ModelUsage};
pub use store::{EligibleKey, KeySnapshot, KeyStore};
