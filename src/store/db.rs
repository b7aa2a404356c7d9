//! SQLite-backed transactional store shared by every journal view.
//!
//! One connection behind a mutex; every mutating journal operation runs in a
//! single `BEGIN IMMEDIATE` transaction so a failure leaves the previous
//! generation fully intact.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use serde::Serialize;

use crate::core::config::{Config, StoreConfig};
use crate::core::errors::{JournalError, Result};
use crate::journal::changes::ChangeJournal;
use crate::journal::files::FileStateStore;
use crate::journal::settings::SettingsStore;
use crate::journal::shadowcopy::SnapshotRegistry;
use crate::journal::tokens::AccessTokenStore;
use crate::logger::jsonl::{EventLog, EventType, JsonlConfig, LogEntry, Severity};

/// Schema version written to `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Handle to the journal database. Owned by the orchestrator and passed
/// explicitly (wrap in `Arc` to share across backup threads).
pub struct JournalDb {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    events: Option<EventLog>,
}

impl JournalDb {
    /// Open (or create) the database at `path`, applying PRAGMAs and schema.
    pub fn open(path: &Path, store: &StoreConfig) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| JournalError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| JournalError::store("open", &e))?;

        apply_pragmas(&conn, store)?;
        migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            events: None,
        })
    }

    /// Private in-memory database, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| JournalError::store("open", &e))?;
        conn.busy_timeout(Duration::from_millis(StoreConfig::default().busy_timeout_ms))
            .map_err(|e| JournalError::store("open", &e))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            events: None,
        })
    }

    /// Open the database and event log described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut db = Self::open(&config.paths.database, &config.store)?;
        if config.logging.enabled {
            let log = EventLog::open(JsonlConfig::from_logging(
                &config.paths.event_log,
                &config.logging,
            ));
            db = db.with_event_log(log);
        }
        let mut entry = LogEntry::new(EventType::JournalOpen, Severity::Info)
            .path(config.paths.database.to_string_lossy());
        if let Ok(hash) = config.stable_hash() {
            entry = entry.details(format!("config_hash={hash}"));
        }
        db.emit(&entry);
        Ok(db)
    }

    /// Attach a JSONL event log; every mutating journal operation records to it.
    #[must_use]
    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Path of the database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ──────────────────── views ────────────────────

    /// Per-directory known-file lists.
    pub fn files(&self) -> FileStateStore<'_> {
        FileStateStore::new(self)
    }

    /// Changed/deleted directory and changed file journal.
    pub fn changes(&self) -> ChangeJournal<'_> {
        ChangeJournal::new(self)
    }

    /// Shadow-copy handle registry.
    pub fn shadowcopies(&self) -> SnapshotRegistry<'_> {
        SnapshotRegistry::new(self)
    }

    /// Pattern slots and misc key/value settings.
    pub fn settings(&self) -> SettingsStore<'_> {
        SettingsStore::new(self)
    }

    /// Restore-browsing access tokens.
    pub fn tokens(&self) -> AccessTokenStore<'_> {
        AccessTokenStore::new(self)
    }

    // ──────────────────── scopes ────────────────────

    /// Run read statements inside one DEFERRED transaction, so every
    /// statement in `op` sees the same snapshot even when another connection
    /// commits in between.
    pub fn read<T, F>(&self, context: &'static str, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(|e| JournalError::store(context, &e))?;
        let out = op(&tx).map_err(|e| JournalError::store(context, &e))?;
        tx.commit().map_err(|e| JournalError::store(context, &e))?;
        Ok(out)
    }

    /// Run `op` inside one IMMEDIATE transaction; commit on `Ok`, roll back on `Err`.
    pub fn write<T, F>(&self, context: &'static str, op: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| JournalError::store(context, &e))?;
        let out = op(&tx).map_err(|e| retag(context, e))?;
        tx.commit().map_err(|e| JournalError::store(context, &e))?;
        Ok(out)
    }

    /// Record an event if a log is attached.
    pub fn emit(&self, entry: &LogEntry) {
        if let Some(events) = &self.events {
            events.record(entry);
        }
    }

    /// Record the outcome of a failed operation and pass the error through.
    pub(crate) fn log_failure<T>(&self, context: &'static str, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.emit(&LogEntry::failure(context, err));
        }
        result
    }

    // ──────────────────── diagnostics ────────────────────

    /// Schema version stored in the database.
    pub fn schema_version(&self) -> Result<i64> {
        self.read("schema_version", |conn| {
            conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        })
    }

    /// Check that WAL mode is active.
    pub fn is_wal_mode(&self) -> bool {
        self.read("journal_mode", |conn| {
            conn.query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
        })
        .is_ok_and(|mode| mode.eq_ignore_ascii_case("wal"))
    }

    /// Row counts across every logical store.
    pub fn stats(&self) -> Result<JournalStats> {
        self.read("stats", |conn| {
            let count = |sql: &str| -> rusqlite::Result<i64> {
                conn.query_row(sql, [], |row| row.get(0))
            };
            Ok(JournalStats {
                schema_version: conn.query_row("PRAGMA user_version", [], |row| row.get(0))?,
                backup_dirs: count("SELECT COUNT(*) FROM backup_dirs")?,
                committed_dirs: count("SELECT COUNT(*) FROM file_dirs")?,
                staged_dirs: count("SELECT COUNT(*) FROM file_dirs_tmp")?,
                pending_changed_dirs: count("SELECT COUNT(*) FROM mdirs WHERE gap = 0")?,
                saved_changed_dirs: count("SELECT COUNT(*) FROM mdirs_saved")?,
                gap_markers: count("SELECT COUNT(*) FROM mdirs WHERE gap = 1")?,
                pending_changed_files: count("SELECT COUNT(*) FROM mfiles")?,
                saved_changed_files: count("SELECT COUNT(*) FROM mfiles_saved")?,
                pending_del_dirs: count("SELECT COUNT(*) FROM del_dirs")?,
                saved_del_dirs: count("SELECT COUNT(*) FROM del_dirs_saved")?,
                shadowcopies: count("SELECT COUNT(*) FROM shadowcopies")?,
                access_tokens: count("SELECT COUNT(*) FROM file_access_tokens")?,
            })
        })
    }
}

/// Row counts reported by `bkj status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JournalStats {
    pub schema_version: i64,
    pub backup_dirs: i64,
    pub committed_dirs: i64,
    pub staged_dirs: i64,
    pub pending_changed_dirs: i64,
    pub saved_changed_dirs: i64,
    pub gap_markers: i64,
    pub pending_changed_files: i64,
    pub saved_changed_files: i64,
    pub pending_del_dirs: i64,
    pub saved_del_dirs: i64,
    pub shadowcopies: i64,
    pub access_tokens: i64,
}

/// Attribute a generic rusqlite failure to the journal operation that hit it.
fn retag(context: &'static str, err: JournalError) -> JournalError {
    match err {
        JournalError::StoreUnavailable {
            context: "rusqlite",
            details,
        } => JournalError::StoreUnavailable { context, details },
        other => other,
    }
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection, store: &StoreConfig) -> Result<()> {
    conn.busy_timeout(Duration::from_millis(store.busy_timeout_ms))
        .map_err(|e| JournalError::store("pragmas", &e))?;
    let journal_mode = if store.wal { "WAL" } else { "DELETE" };
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = {journal_mode};
         PRAGMA synchronous = {};
         PRAGMA foreign_keys = ON;
         PRAGMA temp_store = MEMORY;",
        store.synchronous.pragma_value()
    ))
    .map_err(|e| JournalError::store("pragmas", &e))?;

    if store.wal {
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .map_err(|e| JournalError::store("pragmas", &e))?;
        if !mode.eq_ignore_ascii_case("wal") {
            eprintln!("[BKJ-SQLITE] WARNING: requested WAL mode but got '{mode}'");
        }
    }
    Ok(())
}

fn migrate(conn: &Connection) -> Result<()> {
    let found: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| JournalError::store("migrate", &e))?;
    if found > SCHEMA_VERSION {
        return Err(JournalError::SchemaVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    apply_schema(conn)?;
    if found < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))
            .map_err(|e| JournalError::store("migrate", &e))?;
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS files (
            dir_path TEXT NOT NULL,
            name TEXT NOT NULL,
            size INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            is_dir INTEGER NOT NULL,
            hash BLOB NOT NULL,
            permission_bits BLOB NOT NULL,
            last_modified_orig INTEGER NOT NULL,
            created INTEGER NOT NULL,
            PRIMARY KEY (dir_path, name)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS file_dirs (
            dir_path TEXT PRIMARY KEY
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS files_tmp (
            dir_path TEXT NOT NULL,
            name TEXT NOT NULL,
            size INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            is_dir INTEGER NOT NULL,
            hash BLOB NOT NULL,
            permission_bits BLOB NOT NULL,
            last_modified_orig INTEGER NOT NULL,
            created INTEGER NOT NULL,
            PRIMARY KEY (dir_path, name)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS file_dirs_tmp (
            dir_path TEXT PRIMARY KEY
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS backup_dirs (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            optional INTEGER NOT NULL DEFAULT 0,
            tgroup INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS mdirs (
            id INTEGER NOT NULL,
            name TEXT NOT NULL,
            gap INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (id, name, gap)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS mdirs_saved (
            id INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (id, name)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS mfiles (
            dir_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (dir_id, name)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS mfiles_saved (
            dir_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (dir_id, name)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS del_dirs (
            name TEXT PRIMARY KEY
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS del_dirs_saved (
            name TEXT PRIMARY KEY
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS shadowcopies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            vssid BLOB NOT NULL,
            ssetid BLOB NOT NULL,
            target TEXT NOT NULL,
            path TEXT NOT NULL,
            tname TEXT NOT NULL,
            orig_target TEXT NOT NULL,
            vol TEXT NOT NULL,
            starttoken TEXT NOT NULL,
            filesrv INTEGER NOT NULL DEFAULT 0,
            refs INTEGER NOT NULL DEFAULT 0 CHECK (refs >= 0),
            starttime INTEGER NOT NULL,
            UNIQUE (vssid, ssetid)
        );

        CREATE TABLE IF NOT EXISTS misc (
            tkey TEXT PRIMARY KEY,
            tvalue TEXT NOT NULL
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS file_access_tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            token TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_mdirs_name ON mdirs(name);
        CREATE INDEX IF NOT EXISTS idx_mdirs_saved_name ON mdirs_saved(name);
        COMMIT;",
    )
    .map_err(|e| JournalError::store("schema", &e))?;
    Ok(())
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, JournalDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = JournalDb::open(&dir.path().join("journal.db"), &StoreConfig::default()).unwrap();
        (dir, db)
    }

    #[test]
    fn schema_created_and_wal_active() {
        let (_dir, db) = temp_db();
        assert!(db.is_wal_mode());
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn idempotent_schema_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twice.db");
        drop(JournalDb::open(&path, &StoreConfig::default()).unwrap());
        let db = JournalDb::open(&path, &StoreConfig::default()).unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 99;").unwrap();
        }
        let err = JournalDb::open(&path, &StoreConfig::default())
            .err()
            .expect("future schema must fail");
        match err {
            JournalError::SchemaVersion { found, supported } => {
                assert_eq!(found, 99);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failed_write_rolls_back() {
        let db = JournalDb::open_in_memory().unwrap();
        let result: Result<()> = db.write("test", |tx| {
            tx.execute(
                "INSERT INTO misc (tkey, tvalue) VALUES ('k', 'v')",
                [],
            )?;
            Err(JournalError::InvalidArgument {
                details: "abort".to_string(),
            })
        });
        assert!(result.is_err());
        let count: i64 = db
            .read("test", |c| {
                c.query_row("SELECT COUNT(*) FROM misc", [], |r| r.get(0))
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn sql_failure_is_tagged_with_operation() {
        let db = JournalDb::open_in_memory().unwrap();
        let err = db
            .write("broken_op", |tx| {
                tx.execute("INSERT INTO no_such_table VALUES (1)", [])?;
                Ok(())
            })
            .unwrap_err();
        match err {
            JournalError::StoreUnavailable { context, .. } => assert_eq!(context, "broken_op"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fresh_stats_are_zero() {
        let db = JournalDb::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.schema_version, SCHEMA_VERSION);
        assert_eq!(stats.committed_dirs, 0);
        assert_eq!(stats.shadowcopies, 0);
        assert_eq!(stats.gap_markers, 0);
    }

    #[test]
    fn from_config_writes_open_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.database = dir.path().join("j.db");
        config.paths.event_log = dir.path().join("events.jsonl");
        let db = JournalDb::from_config(&config).unwrap();
        assert_eq!(db.path(), Some(config.paths.database.as_path()));

        let log = std::fs::read_to_string(&config.paths.event_log).unwrap();
        assert!(log.contains("\"journal_open\""));
    }
}
