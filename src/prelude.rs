//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use backup_journal::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{JournalError, Result};

// Store
pub use crate::store::db::{JournalDb, JournalStats};

// Journal
pub use crate::journal::changes::{ChangeJournal, ChangedDir, ScopeState, WatchedDirectory};
pub use crate::journal::files::{FileDiff, FileStateStore, TrackedFileRecord};
pub use crate::journal::settings::SettingsStore;
pub use crate::journal::shadowcopy::{
    NewShadowCopy, ShadowCopyInstance, SnapshotGuid, SnapshotRegistry,
};
pub use crate::journal::tokens::{AccessToken, AccessTokenStore};

// Logger
pub use crate::logger::jsonl::EventLog;
