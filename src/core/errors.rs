//! BKJ-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, JournalError>;

/// Top-level error type for the backup journal.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("[BKJ-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[BKJ-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[BKJ-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[BKJ-2001] store unavailable in {context}: {details}")]
    StoreUnavailable {
        context: &'static str,
        details: String,
    },

    #[error("[BKJ-2002] database schema version {found} is newer than supported {supported}")]
    SchemaVersion { found: i64, supported: i64 },

    #[error("[BKJ-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[BKJ-3001] {what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    #[error("[BKJ-3002] shadow copy handle already registered: vss={vss_id} set={set_id}")]
    DuplicateHandle { vss_id: String, set_id: String },

    #[error("[BKJ-3003] refcount underflow on shadow copy {id}: {current} {delta:+}")]
    RefCountUnderflow { id: i64, current: i64, delta: i64 },

    #[error("[BKJ-3004] invalid argument: {details}")]
    InvalidArgument { details: String },

    #[error("[BKJ-3101] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl JournalError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "BKJ-1001",
            Self::MissingConfig { .. } => "BKJ-1002",
            Self::ConfigParse { .. } => "BKJ-1003",
            Self::StoreUnavailable { .. } => "BKJ-2001",
            Self::SchemaVersion { .. } => "BKJ-2002",
            Self::Serialization { .. } => "BKJ-2101",
            Self::NotFound { .. } => "BKJ-3001",
            Self::DuplicateHandle { .. } => "BKJ-3002",
            Self::RefCountUnderflow { .. } => "BKJ-3003",
            Self::InvalidArgument { .. } => "BKJ-3004",
            Self::Io { .. } => "BKJ-3101",
        }
    }

    /// Whether the orchestrator may retry the whole cycle after this failure.
    ///
    /// Journal operations themselves never retry; a rolled-back transaction
    /// leaves the previous generation authoritative.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Io { .. })
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Store failure tagged with the journal operation that hit it.
    #[must_use]
    pub fn store(context: &'static str, source: &rusqlite::Error) -> Self {
        Self::StoreUnavailable {
            context,
            details: source.to_string(),
        }
    }
}

impl From<rusqlite::Error> for JournalError {
    fn from(value: rusqlite::Error) -> Self {
        Self::store("rusqlite", &value)
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for JournalError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
