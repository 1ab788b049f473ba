//! Key store: eligibility, usage accounting, and snapshot persistence
//!
//! All state access is linearized by one tokio Mutex so no caller observes a
//! partial update. Mutators serialize the new state while holding the state
//! lock, release it, then write the file under a separate I/O lock: slow disk
//! writes never block eligibility reads, and writers never interleave partial
//! output. Last write wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use common::Secret;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::key::{KeyEntry, ModelUsage};

/// A key selected as eligible for a model, with its ordinal position.
///
/// `index` is the zero-based position in load order; low indices are
/// preferred by the dispatch engine (fixed priority).
#[derive(Debug, Clone)]
pub struct EligibleKey {
    pub index: usize,
    pub secret: Secret<String>,
}

/// Read-only usage view of one key for status reporting. Secrets are never
/// included; keys are identified by 1-based ordinal.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub key: usize,
    pub usage: BTreeMap<String, ModelUsage>,
}

/// Ordered key list plus usage map, exclusive owner of the persisted file.
pub struct KeyStore {
    path: PathBuf,
    state: Mutex<Vec<KeyEntry>>,
    io: Mutex<()>,
}

impl KeyStore {
    /// Load keys from the given JSON file.
    ///
    /// The file must exist and parse; a proxy with no key source cannot
    /// serve anything. Emptiness is left to the caller so startup can refuse
    /// with its own message.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Io(format!("reading key file {}: {e}", path.display())))?;
        let entries: Vec<KeyEntry> = serde_json::from_str(&contents)
            .map_err(|e| Error::Parse(format!("parsing key file {}: {e}", path.display())))?;
        info!(path = %path.display(), keys = entries.len(), "loaded API keys");
        Ok(Self {
            path,
            state: Mutex::new(entries),
            io: Mutex::new(()),
        })
    }

    /// Number of loaded keys.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Whether no keys were loaded.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every key whose record for `model` is not exhausted, in load order.
    ///
    /// A missing record counts as eligible; eligibility never creates
    /// records (only mutators do, on first completed attempt).
    pub async fn eligible_keys(&self, model: &str) -> Vec<EligibleKey> {
        let state = self.state.lock().await;
        state
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry
                    .usage
                    .get(model)
                    .is_none_or(|usage| !usage.rpd_limit_reached)
            })
            .map(|(index, entry)| EligibleKey {
                index,
                secret: entry.key.clone(),
            })
            .collect()
    }

    /// Record a successful upstream call: request_count += 1, token_count += tokens.
    pub async fn record_success(&self, index: usize, model: &str, tokens: u64) -> Result<()> {
        let json = {
            let mut state = self.state.lock().await;
            let entry = state.get_mut(index).ok_or(Error::NotFound(index))?;
            let usage = entry.usage.entry(model.to_string()).or_default();
            usage.request_count += 1;
            usage.token_count += tokens;
            debug!(
                key = index + 1,
                model,
                requests = usage.request_count,
                tokens = usage.token_count,
                "recorded success"
            );
            serialize_state(&state)?
        };
        self.persist(&json).await
    }

    /// Mark a (key, model) pair as having hit its daily quota.
    ///
    /// The pair is skipped by `eligible_keys` until the next daily reset.
    pub async fn record_exhausted(&self, index: usize, model: &str) -> Result<()> {
        let json = {
            let mut state = self.state.lock().await;
            let entry = state.get_mut(index).ok_or(Error::NotFound(index))?;
            let usage = entry.usage.entry(model.to_string()).or_default();
            usage.rpd_limit_reached = true;
            info!(key = index + 1, model, "key exhausted for model until daily reset");
            serialize_state(&state)?
        };
        self.persist(&json).await
    }

    /// Clear all exhaustion flags and request counters.
    ///
    /// `token_count` is a lifetime counter and is never reset. Idempotent:
    /// running twice in quick succession leaves the same state as once.
    pub async fn reset_daily(&self) -> Result<()> {
        let json = {
            let mut state = self.state.lock().await;
            for entry in state.iter_mut() {
                for usage in entry.usage.values_mut() {
                    usage.rpd_limit_reached = false;
                    usage.request_count = 0;
                }
            }
            info!("daily quota reset: exhaustion flags cleared, request counters zeroed");
            serialize_state(&state)?
        };
        self.persist(&json).await
    }

    /// Read-only usage snapshot for status reporting. Rendering is the
    /// presentation layer's job.
    pub async fn snapshot(&self) -> Vec<KeySnapshot> {
        let state = self.state.lock().await;
        state
            .iter()
            .enumerate()
            .map(|(index, entry)| KeySnapshot {
                key: index + 1,
                usage: entry.usage.clone(),
            })
            .collect()
    }

    /// Write a pre-serialized state copy to disk under the I/O lock.
    async fn persist(&self, json: &str) -> Result<()> {
        let _io = self.io.lock().await;
        write_atomic(&self.path, json).await
    }
}

fn serialize_state(state: &[KeyEntry]) -> Result<String> {
    serde_json::to_string_pretty(state)
        .map_err(|e| Error::Parse(format!("serializing key state: {e}")))
}

/// Write the snapshot atomically: temp file in the same directory, then
/// rename over the target. Permissions 0600 since the file holds API keys.
async fn write_atomic(path: &Path, json: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("key file path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".api_keys.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp key file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting key file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp key file: {e}")))?;

    debug!(path = %path.display(), "persisted key snapshot");
    Ok(())
}
