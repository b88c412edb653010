//! Layered configuration.
//!
//! Settings are resolved in three layers, lowest priority first:
//! 1. compiled defaults ([`PlanlineSettings::default`])
//! 2. a JSON file, deep-merged over the defaults
//! 3. `PLANLINE_*` environment variables
//!
//! The resolved value is handed to whoever needs it; there is no global.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanlineSettings {
    pub database: DatabaseSettings,
    pub persistence: PersistenceSettings,
    pub snapshots: SnapshotSettings,
    pub history: HistorySettings,
    pub logging: LoggingSettings,
}

impl Default for PlanlineSettings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            persistence: PersistenceSettings::default(),
            snapshots: SnapshotSettings::default(),
            history: HistorySettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: home_dir().join(".planline").join("planline.db"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceSettings {
    /// Background flush period.
    pub flush_interval_ms: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 500,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotSettings {
    /// Persisted events between checkpoints.
    pub threshold: u64,
    /// Number of snapshots kept; older ones are pruned.
    pub retain: u32,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            threshold: 1000,
            retain: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistorySettings {
    pub max_history: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self { max_history: 100 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module levels, e.g. `{"planline_store": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

/// Recursively merge `overlay` into `base`. Objects merge key by key;
/// everything else in `overlay` replaces the base value.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Load settings from `path` (missing file means defaults) and apply env overrides.
pub fn load_settings_from_path(path: &Path) -> Result<PlanlineSettings, SettingsError> {
    let defaults = serde_json::to_value(PlanlineSettings::default())?;
    let merged = if path.exists() {
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&raw)?;
        deep_merge(defaults, user)
    } else {
        tracing::debug!(path = %path.display(), "no settings file, using defaults");
        defaults
    };

    let mut settings: PlanlineSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |var| std::env::var(var).ok())?;
    Ok(settings)
}

/// Apply `PLANLINE_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(
    settings: &mut PlanlineSettings,
    lookup: impl Fn(&'static str) -> Option<String>,
) -> Result<(), SettingsError> {
    if let Some(path) = lookup("PLANLINE_DB_PATH") {
        settings.database.path = PathBuf::from(path);
    }
    if let Some(value) = lookup("PLANLINE_FLUSH_INTERVAL_MS") {
        settings.persistence.flush_interval_ms = parse_env("PLANLINE_FLUSH_INTERVAL_MS", value)?;
    }
    if let Some(value) = lookup("PLANLINE_SNAPSHOT_THRESHOLD") {
        settings.snapshots.threshold = parse_env("PLANLINE_SNAPSHOT_THRESHOLD", value)?;
    }
    if let Some(value) = lookup("PLANLINE_MAX_HISTORY") {
        settings.history.max_history = parse_env("PLANLINE_MAX_HISTORY", value)?;
    }
    if let Some(level) = lookup("PLANLINE_LOG_LEVEL") {
        settings.logging.level = level;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidEnv { var, value })
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
