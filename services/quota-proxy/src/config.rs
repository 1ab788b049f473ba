//! Configuration types and loading
//!
//! Every field is defaulted so the proxy starts with no config file at all.
//! Config path precedence: CLI arg > CONFIG_PATH env var > ./quota-proxy.toml.
//! API keys never live in the TOML; they come from the keys file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use gemini_pool::DispatcherConfig;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub keys: KeysConfig,
    pub upstream: UpstreamConfig,
    pub retry: RetryConfig,
    pub reset: ResetConfig,
    /// Models served by the catalog and accepted on the chat surface.
    pub models: Vec<String>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    /// End-to-end cap on one chat request, covering the whole retry loop.
    pub chat_timeout_secs: u64,
}

/// Key file location
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub file: PathBuf,
}

/// Upstream API settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Per-attempt timeout; generation can legitimately take minutes.
    pub timeout_secs: u64,
}

/// Retry and rotation tuning
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub rate_limit_wait_budget_secs: u64,
}

/// Daily quota reset settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    /// IANA timezone whose midnight is the quota day boundary.
    pub timezone: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            keys: KeysConfig::default(),
            upstream: UpstreamConfig::default(),
            retry: RetryConfig::default(),
            reset: ResetConfig::default(),
            models: vec![
                "gemini-2.5-pro".into(),
                "gemini-2.5-flash".into(),
                "gemini-2.0-flash".into(),
            ],
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            chat_timeout_secs: 300,
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("api_keys.json"),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".into(),
            timeout_secs: 120,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_secs: 3,
            rate_limit_wait_budget_secs: 60,
        }
    }
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            timezone: "America/Los_Angeles".into(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> common::Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.chat_timeout_secs == 0 {
            return Err(common::Error::Config(
                "chat_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be greater than 0".into(),
            ));
        }
        if self.models.is_empty() {
            return Err(common::Error::Config(
                "models list must not be empty".into(),
            ));
        }
        Tz::from_str(&self.reset.timezone).map_err(|_| {
            common::Error::Config(format!("unknown timezone: {}", self.reset.timezone))
        })?;
        Ok(())
    }

    /// Reset timezone, validated at load time.
    pub fn timezone(&self) -> common::Result<Tz> {
        Tz::from_str(&self.reset.timezone).map_err(|_| {
            common::Error::Config(format!("unknown timezone: {}", self.reset.timezone))
        })
    }

    /// Dispatch engine tuning derived from the upstream and retry sections.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            base_url: self.upstream.base_url.clone(),
            upstream_timeout: Duration::from_secs(self.upstream.timeout_secs),
            max_attempts: self.retry.max_attempts,
            retry_delay: Duration::from_secs(self.retry.retry_delay_secs),
            rate_limit_wait_budget: Duration::from_secs(self.retry.rate_limit_wait_budget_secs),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("quota-proxy.toml")
    }
}
