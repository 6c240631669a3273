//! Relay configuration.
//!
//! Loading flow:
//! 1. Start with [`RelayConfig::default()`]
//! 2. If the config file exists, deep-merge its values over the defaults
//! 3. Apply `SCANLINK_*` environment overrides (invalid values are ignored)
//!
//! CLI flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::relay::RelaySettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,
    pub json: bool,
    /// Persist warn+ events to a SQLite log database.
    pub persist_warnings: bool,
    pub db_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            persist_warnings: false,
            db_path: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub session_ttl_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_send_queue: usize,
    pub housekeeping_interval_secs: u64,
    pub touch_on_activity: bool,
    /// CORS origins. Empty means any origin.
    pub allowed_origins: Vec<String>,
    pub logging: LoggingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            database_path: default_data_dir().join("scanlink.db"),
            session_ttl_secs: 3600,
            idle_timeout_secs: 300,
            max_send_queue: 256,
            housekeeping_interval_secs: 60,
            touch_on_activity: true,
            allowed_origins: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs.max(1))
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
            max_send_queue: self.max_send_queue.max(1),
            touch_on_activity: self.touch_on_activity,
        }
    }

    /// Reject values no server can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "session_ttl_secs",
                message: "must be greater than zero".into(),
            });
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "host",
                message: "must not be empty".into(),
            });
        }
        if parse_level(&self.logging.level).is_none() {
            return Err(ConfigError::InvalidValue {
                key: "logging.level",
                message: format!("unknown level {:?}", self.logging.level),
            });
        }
        Ok(())
    }
}

/// `~/.scanlink`, falling back to `/tmp/.scanlink` without a home directory.
pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".scanlink")
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.json")
}

/// Load configuration from `path` (or the default location) plus env overrides.
///
/// A missing file yields defaults; a malformed one is an error.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    let path = path.map_or_else(default_config_path, Path::to_path_buf);
    let defaults = serde_json::to_value(RelayConfig::default())?;

    let merged = if path.exists() {
        debug!(path = %path.display(), "loading config from file");
        let content = std::fs::read_to_string(&path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(path = %path.display(), "config file not found, using defaults");
        defaults
    };

    let mut config: RelayConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Recursive merge: objects merge per key, everything else is replaced by
/// `source`, and nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SCANLINK_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut RelayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("SCANLINK_HOST") {
        config.host = v;
    }
    if let Some(v) = env.u16_range("SCANLINK_PORT", 1, 65535) {
        config.port = v;
    }
    if let Some(v) = env.string("SCANLINK_DB_PATH") {
        config.database_path = PathBuf::from(v);
    }
    if let Some(v) = env.u64_range("SCANLINK_SESSION_TTL_SECS", 1, 30 * 24 * 3600) {
        config.session_ttl_secs = v;
    }
    if let Some(v) = env.u64_range("SCANLINK_IDLE_TIMEOUT_SECS", 1, 24 * 3600) {
        config.idle_timeout_secs = v;
    }
    if let Some(v) = env.string("SCANLINK_LOG_LEVEL") {
        if parse_level(&v).is_some() {
            config.logging.level = v;
        } else {
            tracing::warn!(key = "SCANLINK_LOG_LEVEL", value = %v, "invalid log level env var, ignoring");
        }
    }
    if let Some(v) = env.bool("SCANLINK_LOG_JSON") {
        config.logging.json = v;
    }
}

/// Parse a log level name.
pub fn parse_level(val: &str) -> Option<tracing::Level> {
    val.trim().parse().ok()
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16_range(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64_range(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}
