//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{JournalError, Result};

/// Full journal configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub store: StoreConfig,
    pub snapshots: SnapshotConfig,
    pub logging: LoggingConfig,
}

/// Filesystem paths used by the journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub database: PathBuf,
    pub event_log: PathBuf,
}

/// SQLite connection tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Write-ahead logging. Disable only for filesystems without shared memory.
    pub wal: bool,
    pub synchronous: SyncMode,
}

/// `PRAGMA synchronous` level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Normal,
    Full,
}

impl SyncMode {
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
        }
    }
}

/// Shadow-copy handle staleness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Handles older than this are reported as stale; the OS snapshot
    /// behind them may have expired silently.
    pub max_age_secs: u64,
}

/// JSONL event log settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fallback_path: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[BKJ-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("bkj").join("config.toml");
        let data = home_dir.join(".local").join("share").join("bkj");
        Self {
            config_file: cfg,
            database: data.join("journal.sqlite3"),
            event_log: data.join("events.jsonl"),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            wal: true,
            synchronous: SyncMode::Normal,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            // Windows discards shadow copies that outlive their writers after
            // roughly a day; anything older is suspect.
            max_age_secs: 24 * 60 * 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_bytes: 16 * 1024 * 1024,
            max_rotated_files: 5,
            fallback_path: None,
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| JournalError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(JournalError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the event log.
    ///
    /// FNV-1a over canonical JSON so the value is stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("BKJ_DATABASE") {
            self.paths.database = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("BKJ_EVENT_LOG") {
            self.paths.event_log = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("BKJ_BUSY_TIMEOUT_MS") {
            self.store.busy_timeout_ms = parse_env_u64("BKJ_BUSY_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("BKJ_SNAPSHOT_MAX_AGE_SECS") {
            self.snapshots.max_age_secs = parse_env_u64("BKJ_SNAPSHOT_MAX_AGE_SECS", &raw)?;
        }
        if let Some(raw) = lookup("BKJ_LOGGING_ENABLED") {
            self.logging.enabled = parse_env_bool("BKJ_LOGGING_ENABLED", &raw)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.store.busy_timeout_ms == 0 {
            return Err(JournalError::InvalidConfig {
                details: "store.busy_timeout_ms must be > 0".to_string(),
            });
        }
        if self.snapshots.max_age_secs == 0 {
            return Err(JournalError::InvalidConfig {
                details: "snapshots.max_age_secs must be > 0".to_string(),
            });
        }
        if self.logging.enabled && self.logging.max_size_bytes == 0 {
            return Err(JournalError::InvalidConfig {
                details: "logging.max_size_bytes must be > 0 when logging is enabled".to_string(),
            });
        }
        if self.paths.database.as_os_str().is_empty() {
            return Err(JournalError::InvalidConfig {
                details: "paths.database must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|error| JournalError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim()
        .parse::<bool>()
        .map_err(|error| JournalError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
