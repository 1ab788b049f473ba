//! Key pool dispatch engine for the Gemini quota proxy
//!
//! Selects API keys in fixed priority (load) order, issues upstream
//! `generateContent` calls, classifies failures, and retries or rotates
//! accordingly. Usage accounting and exhaustion flags live in
//! `gemini_keys::KeyStore`; this crate drives them.
//!
//! Request lifecycle:
//! 1. Dispatch engine asks the store for eligible keys (not exhausted for
//!    the model), lowest index first
//! 2. Per key, a bounded attempt loop: 503/transport errors retry after a
//!    fixed delay, 429-with-retryDelay waits exactly that long (within a
//!    cumulative budget), 429-with-quota-marker benches the pair until the
//!    daily reset, everything else escalates to the next key
//! 3. First success wins; otherwise the last remembered upstream error (or
//!    a synthesized all-exhausted error) is returned
//! 4. A background task clears exhaustion flags at midnight in a fixed
//!    reference timezone

pub mod classify;
pub mod dispatch;
pub mod error;
pub mod reset;

pub use classify::{Outcome, classify, classify_429};
pub use dispatch::{Dispatcher, DispatcherConfig, UpstreamResponse};
pub use error::{Error, Result};
pub use reset::spawn_reset_task;
