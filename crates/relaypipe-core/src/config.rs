//! Configuration system for relaypipe.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $RELAYPIPE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/relaypipe/config.toml
//!   3. ~/.config/relaypipe/config.toml
//!
//! The core only needs the `[reliable]` and `[events]` tables; `[[stages]]`
//! is the tagged-parameter list the daemon's factory turns into a chain.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    pub reliable: ReliableConfig,
    pub events: EventConfig,
    /// Stages, interface first. Empty = the daemon builds a loopback echo chain.
    pub stages: Vec<StageSpec>,
}

/// ARQ tuning. Also used directly as the `ReliableTransport` constructor
/// parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReliableConfig {
    /// Payload bytes per fragment. The frame on the wire is two bytes longer.
    pub fragment_size: usize,
    /// How long to wait for ACK/NACK before resending.
    pub ack_timeout_ms: u64,
    /// Transmissions per fragment before the message is abandoned.
    pub retry_budget: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventConfig {
    /// Bounded event queue per stage. Slow subscribers lose the oldest events.
    pub queue_length: usize,
}

/// One `[[stages]]` entry: a factory name plus string parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageSpec {
    pub kind: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl StageSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_FRAGMENT_SIZE: usize = 256;
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_RETRY_BUDGET: u32 = 10;
pub const DEFAULT_EVENT_QUEUE_LENGTH: usize = 64;

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            reliable: ReliableConfig::default(),
            events: EventConfig::default(),
            stages: Vec::new(),
        }
    }
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            queue_length: DEFAULT_EVENT_QUEUE_LENGTH,
        }
    }
}

impl ReliableConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fragment_size == 0 {
            return Err(ConfigError::Invalid("reliable.fragment_size must be > 0".into()));
        }
        if self.retry_budget == 0 {
            return Err(ConfigError::Invalid("reliable.retry_budget must be > 0".into()));
        }
        Ok(())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("relaypipe")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PipeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults if it does not
    /// exist. Env overrides still apply.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::from_toml(&text)
                .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            PipeConfig::default()
        };
        config.apply_env_overrides();
        config.reliable.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RELAYPIPE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PipeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply RELAYPIPE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("RELAYPIPE_RELIABLE__FRAGMENT_SIZE") {
            if let Ok(n) = v.parse() {
                self.reliable.fragment_size = n;
            }
        }
        if let Some(v) = lookup("RELAYPIPE_RELIABLE__ACK_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.reliable.ack_timeout_ms = n;
            }
        }
        if let Some(v) = lookup("RELAYPIPE_RELIABLE__RETRY_BUDGET") {
            if let Ok(n) = v.parse() {
                self.reliable.retry_budget = n;
            }
        }
        if let Some(v) = lookup("RELAYPIPE_EVENTS__QUEUE_LENGTH") {
            if let Ok(n) = v.parse() {
                self.events.queue_length = n;
            }
        }
    }
}
