//! Persisted key entry and usage record types
//!
//! The snapshot layout is an ordered JSON array of
//! `{"key": "<secret>", "usage": {"<model>": {"token_count": .., "request_count": .., "rpd_limit_reached": ..}}}`.
//!
//! Earlier key-import tooling wrote the `key` field as the raw CSV row (a
//! nested pair like `["label", "AIza..."]`) instead of the bare secret. The
//! deserializer accepts both shapes and normalizes to the bare string; the
//! serializer always writes the bare string.

use std::collections::BTreeMap;

use common::Secret;
use serde::{Deserialize, Deserializer, Serialize};

/// Per-(key, model) usage counters.
///
/// `token_count` is a lifetime counter and survives the daily reset;
/// `request_count` and `rpd_limit_reached` are cleared at each reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelUsage {
    pub token_count: u64,
    pub request_count: u64,
    pub rpd_limit_reached: bool,
}

/// One persisted API key with its per-model usage map.
///
/// Unknown legacy fields (e.g. `token_usage` from the old import script)
/// are silently ignored on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    #[serde(deserialize_with = "deserialize_key")]
    pub key: Secret<String>,
    #[serde(default)]
    pub usage: BTreeMap<String, ModelUsage>,
}

/// Accepted shapes for the `key` field.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeyField {
    Bare(String),
    Nested(Vec<String>),
}

/// Normalize the `key` field to the bare secret string.
///
/// The legacy nested pair carried the secret in the second column; a
/// single-element row falls back to its only value.
fn deserialize_key<'de, D>(deserializer: D) -> Result<Secret<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match KeyField::deserialize(deserializer)? {
        KeyField::Bare(secret) => Ok(Secret::new(secret)),
        KeyField::Nested(row) => {
            let secret = if row.len() >= 2 {
                row[1].clone()
            } else {
                row.first().cloned().unwrap_or_default()
            };
            if secret.is_empty() {
                return Err(serde::de::Error::custom("legacy key row has no secret"));
            }
            Ok(Secret::new(secret))
        }
    }
}
