//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists (`~/.relay/settings.json` unless given),
//!    deep-merge its values over the defaults
//! 3. Apply `RELAY_*` environment variable overrides
//!
//! Command-line flags are applied last, in `main`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use relay_consumer::{CheckpointFailurePolicy, ConsumerConfig};
use relay_core::checkpoint::DEFAULT_MESSAGE_THRESHOLD;
use relay_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid setting {key}: {message}")]
    InvalidValue { key: String, message: String },
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub stream: StreamSettings,
    pub checkpoint: CheckpointSettings,
    pub consumer: ConsumerConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Event stream endpoint.
    pub url: String,
    /// Extra request headers, e.g. authorization.
    pub headers: BTreeMap<String, String>,
    pub connect_timeout_ms: u64,
    /// Drop and rebuild the connection after this long without data.
    /// Zero disables the check.
    pub idle_timeout_ms: u64,
    /// Reconnect when the server ends the response cleanly instead of
    /// stopping.
    pub reconnect_on_eof: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: BTreeMap::new(),
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 0,
            reconnect_on_eof: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckpointSettings {
    /// Checkpoint store URL. Checkpointing is off when unset.
    #[serde(alias = "redisUrl")]
    pub store_url: Option<String>,
    /// Handled events between writes.
    pub messages: u32,
    pub on_failure: CheckpointFailurePolicy,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            store_url: None,
            messages: DEFAULT_MESSAGE_THRESHOLD,
            on_failure: CheckpointFailurePolicy::Continue,
        }
    }
}

impl RelaySettings {
    pub fn validate(&self) -> Result<()> {
        if self.stream.url.trim().is_empty() {
            return Err(SettingsError::InvalidValue {
                key: "stream.url".into(),
                message: "an event stream url is required".into(),
            });
        }
        if self.checkpoint.messages == 0 {
            return Err(SettingsError::InvalidValue {
                key: "checkpoint.messages".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Resolve the default settings path (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from `path` (or the default path) with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings(path: Option<&Path>) -> Result<RelaySettings> {
    let path = path.map_or_else(settings_path, Path::to_path_buf);
    let mut settings = load_settings_file(&path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Load and merge one settings file over the defaults, without env overrides.
pub fn load_settings_file(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let mut user: Value = serde_json::from_str(&content)?;
        canonicalize_keys(&mut user);
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Alternate spellings accepted in settings files, mapped to the names the
/// defaults serialize with.
const KEY_ALIASES: &[(&str, &str)] = &[
    ("redisUrl", "storeUrl"),
    ("retries", "maxRetries"),
    ("minTimeout", "minDelayMs"),
    ("maxTimeout", "maxDelayMs"),
    ("randomizeBackoff", "randomize"),
];

/// Rename aliased keys in place so they merge over their canonical defaults.
///
/// Only the objects that carry aliased fields are touched: `checkpoint`, its
/// block retry policy and the `consumer.*Retry` policies. Free-form maps such
/// as `stream.headers` keep their keys.
fn canonicalize_keys(value: &mut Value) {
    if let Some(checkpoint) = value.get_mut("checkpoint") {
        rename_aliases(checkpoint);
        if let Some(retry) = checkpoint.pointer_mut("/onFailure/retry") {
            rename_aliases(retry);
        }
    }
    if let Some(Value::Object(consumer)) = value.get_mut("consumer") {
        consumer
            .iter_mut()
            .filter(|(key, _)| key.ends_with("Retry"))
            .for_each(|(_, policy)| rename_aliases(policy));
    }
}

fn rename_aliases(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };
    for (alias, canonical) in KEY_ALIASES {
        if let Some(v) = map.remove(*alias) {
            let _ = map.entry(*canonical).or_insert(v);
        }
    }
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` environment variable overrides. Invalid values are logged
/// and ignored.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    if let Some(v) = read_env_string("RELAY_URL") {
        settings.stream.url = v;
    }
    if let Some(v) = read_env_u64("RELAY_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.stream.connect_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("RELAY_IDLE_TIMEOUT_MS", 0, 3_600_000) {
        settings.stream.idle_timeout_ms = v;
    }
    if let Some(v) = read_env_bool("RELAY_RECONNECT_ON_EOF") {
        settings.stream.reconnect_on_eof = v;
    }

    // checkpoints
    if let Some(v) = read_env_string("RELAY_STORE_URL") {
        settings.checkpoint.store_url = Some(v);
    }
    if let Some(v) = read_env_u32("RELAY_CHECKPOINT_MESSAGES", 1, 1_000_000) {
        settings.checkpoint.messages = v;
    }

    // retries
    if let Some(v) = read_env_u32("RELAY_HANDLER_RETRIES", 0, 1_000_000) {
        settings.consumer.handler_retry.max_retries = v;
    }
    if let Some(v) = read_env_u32("RELAY_RECONNECT_RETRIES", 0, 1_000_000) {
        settings.consumer.reconnect_retry.max_retries = v;
    }
    if let Some(v) = read_env_string("RELAY_TICKER_TYPE") {
        settings.consumer.ticker_type = v;
    }

    // logging
    if let Some(v) = read_env_string("RELAY_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = read_env_bool("RELAY_LOG_JSON") {
        settings.telemetry.json = v;
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
