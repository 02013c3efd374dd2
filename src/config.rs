//! Configuration loader and validator for the channel sync engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::db::dispatch::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub sync: SyncConfig,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub max_backoff_seconds: u64,
    pub max_attempts: u32,
}

/// What the outboxes write and what they ignore.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    #[serde(default)]
    pub endpoints: Endpoints,
    /// Reservation fields whose edits alone never reach the channel when the
    /// reservation is locked and came from a channel.
    #[serde(default)]
    pub ignored_reservation_fields: Vec<String>,
}

/// Remote push actions. A missing entry means that integration is not set up
/// and the matching jobs are not queued.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoints {
    #[serde(default)]
    pub booking_upsert: Option<String>,
    #[serde(default)]
    pub booking_delete: Option<String>,
    #[serde(default)]
    pub rate_push: Option<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` if set, else a file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/channel_sync.db", self.app.data_dir))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: i32::try_from(self.app.max_attempts).unwrap_or(i32::MAX),
            max_backoff_secs: i64::try_from(self.app.max_backoff_seconds).unwrap_or(i64::MAX),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| v.trim().is_empty())
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.max_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }

    let endpoints = &cfg.sync.endpoints;
    if blank(&endpoints.booking_upsert) {
        return Err(ConfigError::Invalid("sync.endpoints.booking_upsert must be non-empty when set"));
    }
    if blank(&endpoints.booking_delete) {
        return Err(ConfigError::Invalid("sync.endpoints.booking_delete must be non-empty when set"));
    }
    if blank(&endpoints.rate_push) {
        return Err(ConfigError::Invalid("sync.endpoints.rate_push must be non-empty when set"));
    }
    if cfg
        .sync
        .ignored_reservation_fields
        .iter()
        .any(|f| f.trim().is_empty())
    {
        return Err(ConfigError::Invalid("sync.ignored_reservation_fields must not contain empty names"));
    }

    Ok(())
}

/// Example configuration, printed by `channel-sync example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  max_backoff_seconds: 600
  max_attempts: 8

sync:
  endpoints:
    booking_upsert: "booking.push"
    booking_delete: "booking.delete"
    rate_push: "rates.push"
  ignored_reservation_fields:
    - guest_email
    - guest_phone
    - comment
    - internal_note
"#
}
