//! Common types for the Gemini quota proxy

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
