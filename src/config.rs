//! Configuration file parser for ~/.config/feedgate/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged as likely typos.
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::FetchSettings;
use crate::import::ImportSettings;

/// Environment variable that overrides `rate_limit.redis_url`.
pub const REDIS_URL_ENV: &str = "FEEDGATE_REDIS_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let defaults = FetchSettings::default();
        Self {
            timeout_secs: defaults.timeout.as_secs(),
            max_attempts: defaults.max_attempts,
            max_redirects: defaults.max_redirects,
            max_body_bytes: defaults.max_body_bytes,
            backoff_base_ms: millis(defaults.backoff_base),
            backoff_cap_ms: millis(defaults.backoff_cap),
            user_agent: defaults.user_agent,
        }
    }
}

impl FetchConfig {
    /// Zero values are raised to the smallest usable setting.
    pub fn to_settings(&self) -> FetchSettings {
        FetchSettings {
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            max_attempts: self.max_attempts.max(1),
            max_redirects: self.max_redirects,
            max_body_bytes: self.max_body_bytes.max(1),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms.max(self.backoff_base_ms)),
            user_agent: self.user_agent.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub workers: usize,
    pub deadline_ms: u64,
    pub discovery_budget: usize,
    pub max_entries: usize,
    pub skip_multiple_candidates: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        let defaults = ImportSettings::default();
        Self {
            workers: defaults.workers,
            deadline_ms: millis(defaults.deadline),
            discovery_budget: defaults.discovery_budget,
            max_entries: defaults.max_entries,
            skip_multiple_candidates: defaults.skip_multiple_candidates,
        }
    }
}

impl ImportConfig {
    pub fn to_settings(&self) -> ImportSettings {
        ImportSettings {
            workers: self.workers.max(1),
            deadline: Duration::from_millis(self.deadline_ms),
            discovery_budget: self.discovery_budget,
            max_entries: self.max_entries,
            skip_multiple_candidates: self.skip_multiple_candidates,
        }
    }
}

/// Custom Debug masks `redis_url`, which may embed a password.
#[derive(Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(deserialize_with = "deserialize_secret")]
    pub redis_url: Option<SecretString>,
    /// Requests allowed per window, per user and per client address
    pub requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            requests: 30,
            window_secs: 60,
        }
    }
}

impl std::fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("requests", &self.requests)
            .field("window_secs", &self.window_secs)
            .finish()
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }

    /// `FEEDGATE_REDIS_URL` wins over the file.
    pub fn resolved_redis_url(&self) -> Option<SecretString> {
        std::env::var(REDIS_URL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::from)
            .or_else(|| {
                self.redis_url
                    .as_ref()
                    .map(|url| SecretString::from(url.expose_secret().to_owned()))
            })
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.map(SecretString::from))
}

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file; `~/.config/feedgate/feeds.db` when unset
    pub database_path: Option<PathBuf>,
    pub fetch: FetchConfig,
    pub import: ImportConfig,
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: &'static [(&'static str, &'static [&'static str])] = &[
        ("database_path", &[]),
        (
            "fetch",
            &[
                "timeout_secs",
                "max_attempts",
                "max_redirects",
                "max_body_bytes",
                "backoff_base_ms",
                "backoff_cap_ms",
                "user_agent",
            ],
        ),
        (
            "import",
            &[
                "workers",
                "deadline_ms",
                "discovery_budget",
                "max_entries",
                "skip_multiple_candidates",
            ],
        ),
        ("rate_limit", &["redis_url", "requests", "window_secs"]),
    ];

    /// `~/.config/feedgate`, or `None` when no home directory is known.
    pub fn default_dir() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join("feedgate"))
    }

    pub fn default_path() -> Option<PathBuf> {
        Self::default_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            Self::default_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("feeds.db")
        })
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            // Deleted between metadata and read
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in unknown_keys(&raw) {
                tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            workers = config.import.workers,
            distributed_rate_limit = config.rate_limit.redis_url.is_some(),
            "Loaded configuration"
        );
        Ok(config)
    }
}

/// Dotted paths of keys the config does not know about.
fn unknown_keys(raw: &toml::Table) -> Vec<String> {
    let mut unknown = Vec::new();
    for (key, value) in raw {
        let Some((_, children)) = Config::KNOWN_KEYS.iter().find(|(k, _)| *k == key.as_str()) else {
            unknown.push(key.clone());
            continue;
        };
        if let Some(table) = value.as_table() {
            unknown.extend(
                table
                    .keys()
                    .filter(|child| !children.contains(&child.as_str()))
                    .map(|child| format!("{key}.{child}")),
            );
        }
    }
    unknown
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
