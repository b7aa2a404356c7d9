//! Change journal: pending → saved two-phase record of changed directories,
//! changed files and deleted directories, plus gap markers.
//!
//! The change feed writes into the pending areas. At the start of a backup
//! the orchestrator consumes pending rows into the saved areas
//! ([`ChangeJournal::take_changed_dirs`], [`ChangeJournal::move_changed_files`],
//! [`ChangeJournal::take_del_dirs`]). Saved rows keep being reported until the
//! run succeeds and purges them, so a failed run loses nothing.
//!
//! A gap marker says the feed lost events under a scope. While any marker
//! exists, incremental results are incomplete and the scope must be fully
//! re-scanned; [`ChangeJournal::delete_changed_dirs`] clears it afterwards.

#![allow(missing_docs)]

use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::core::paths::{descendant_prefix, is_within_scope, normalize_scope};
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::store::db::JournalDb;

/// Directory id stored on gap markers.
pub const GAP_DIR_ID: i64 = -1;

/// A directory the agent is configured to back up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedDirectory {
    pub id: i64,
    /// Display name shown to the server.
    pub name: String,
    pub path: String,
    pub optional: bool,
    pub group: i32,
}

/// A directory whose contents changed since the last successful backup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangedDir {
    pub id: i64,
    pub path: String,
}

/// Trust level of a scope's incremental change records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeState {
    /// Nothing recorded; the committed file state is current.
    Clean,
    /// Changes are recorded and complete.
    Pending,
    /// The change feed lost events; a full re-scan is required.
    GapDetected,
}

/// SQL predicate matching `name` against a scope bound to `?1` (scope) and
/// `?2` (descendant prefix).
const IN_SCOPE: &str = "(name = ?1 OR substr(name, 1, length(?2)) = ?2)";

/// View over the change-journal tables.
pub struct ChangeJournal<'db> {
    db: &'db JournalDb,
}

impl<'db> ChangeJournal<'db> {
    pub(crate) fn new(db: &'db JournalDb) -> Self {
        Self { db }
    }

    // ──────────────────── watched directories ────────────────────

    /// Configured directories ordered by id.
    pub fn get_backup_dirs(&self) -> Result<Vec<WatchedDirectory>> {
        self.db.read("get_backup_dirs", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, path, optional, tgroup FROM backup_dirs ORDER BY id ASC",
            )?;
            stmt.query_map([], watched_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    /// Replace the configured set, as done on configuration load.
    pub fn set_backup_dirs(&self, dirs: &[WatchedDirectory]) -> Result<()> {
        let result = self.db.write("set_backup_dirs", |tx| {
            tx.execute("DELETE FROM backup_dirs", [])?;
            let mut insert = tx.prepare_cached(
                "INSERT OR REPLACE INTO backup_dirs (id, name, path, optional, tgroup)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for d in dirs {
                insert.execute(params![d.id, d.name, d.path, d.optional, d.group])?;
            }
            Ok(())
        });
        self.db.log_failure("set_backup_dirs", result)
    }

    /// Insert or update a single configured directory.
    pub fn add_backup_dir(&self, dir: &WatchedDirectory) -> Result<()> {
        let result = self.db.write("add_backup_dir", |tx| {
            tx.prepare_cached(
                "INSERT OR REPLACE INTO backup_dirs (id, name, path, optional, tgroup)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![dir.id, dir.name, dir.path, dir.optional, dir.group])?;
            Ok(())
        });
        self.db.log_failure("add_backup_dir", result)
    }

    // ──────────────────── recording (change feed) ────────────────────

    /// Record that the contents of `path` changed. Idempotent.
    pub fn record_changed_dir(&self, dir_id: i64, path: &str) -> Result<()> {
        let path = normalize_scope(path);
        let result = self.db.write("record_changed_dir", |tx| {
            tx.prepare_cached("INSERT OR IGNORE INTO mdirs (id, name, gap) VALUES (?1, ?2, 0)")?
                .execute(params![dir_id, path])?;
            Ok(())
        });
        self.db.log_failure("record_changed_dir", result)
    }

    /// Mark `scope` as gapped: its change records can no longer be trusted.
    pub fn record_gap(&self, scope: &str) -> Result<()> {
        let scope = normalize_scope(scope);
        let result = self.db.write("record_gap", |tx| {
            tx.prepare_cached("INSERT OR IGNORE INTO mdirs (id, name, gap) VALUES (?1, ?2, 1)")?
                .execute(params![GAP_DIR_ID, scope])?;
            Ok(())
        });
        self.db.log_failure("record_gap", result)?;
        self.db.emit(
            &LogEntry::new(EventType::GapRecorded, Severity::Warning).path(scope),
        );
        Ok(())
    }

    /// Record a changed file inside watched directory `dir_id`. Idempotent.
    pub fn record_changed_file(&self, dir_id: i64, name: &str) -> Result<()> {
        let result = self.db.write("record_changed_file", |tx| {
            tx.prepare_cached("INSERT OR IGNORE INTO mfiles (dir_id, name) VALUES (?1, ?2)")?
                .execute(params![dir_id, name])?;
            Ok(())
        });
        self.db.log_failure("record_changed_file", result)
    }

    /// Record that `path` disappeared. Idempotent.
    pub fn record_deleted_dir(&self, path: &str) -> Result<()> {
        let path = normalize_scope(path);
        let result = self.db.write("record_deleted_dir", |tx| {
            tx.prepare_cached("INSERT OR IGNORE INTO del_dirs (name) VALUES (?1)")?
                .execute(params![path])?;
            Ok(())
        });
        self.db.log_failure("record_deleted_dir", result)
    }

    // ──────────────────── changed directories ────────────────────

    /// Changed directories at or under `scope`; `del` selects the consuming
    /// variant ([`Self::take_changed_dirs`]) over [`Self::peek_changed_dirs`].
    pub fn get_changed_dirs(&self, scope: &str, del: bool) -> Result<Vec<ChangedDir>> {
        if del {
            self.take_changed_dirs(scope)
        } else {
            self.peek_changed_dirs(scope)
        }
    }

    /// Saved ∪ pending changed directories under `scope`, without mutating.
    pub fn peek_changed_dirs(&self, scope: &str) -> Result<Vec<ChangedDir>> {
        let (scope, prefix) = scope_params(scope);
        self.db.read("peek_changed_dirs", |conn| {
            select_changed_dirs(conn, &scope, &prefix)
        })
    }

    /// Move pending changed directories under `scope` into the saved area and
    /// return saved ∪ pending, all in one transaction. Gap markers stay put.
    pub fn take_changed_dirs(&self, scope: &str) -> Result<Vec<ChangedDir>> {
        let (scope, prefix) = scope_params(scope);
        let result = self.db.write("take_changed_dirs", |tx| {
            tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO mdirs_saved (id, name)
                 SELECT id, name FROM mdirs WHERE gap = 0 AND {IN_SCOPE}"
            ))?
            .execute(params![scope, prefix])?;
            tx.prepare_cached(&format!("DELETE FROM mdirs WHERE gap = 0 AND {IN_SCOPE}"))?
                .execute(params![scope, prefix])?;
            Ok(select_changed_dirs(tx, &scope, &prefix)?)
        });
        let dirs = self.db.log_failure("take_changed_dirs", result)?;
        self.db.emit(
            &LogEntry::new(EventType::ChangesConsumed, Severity::Info)
                .path(scope)
                .count(dirs.len())
                .details("changed_dirs"),
        );
        Ok(dirs)
    }

    /// Purge the saved changed-directory area after a successful backup.
    pub fn delete_saved_changed_dirs(&self) -> Result<usize> {
        let result = self.db.write("delete_saved_changed_dirs", |tx| {
            Ok(tx.execute("DELETE FROM mdirs_saved", [])?)
        });
        self.db.log_failure("delete_saved_changed_dirs", result)
    }

    /// Delete every pending changed-directory row at or under `scope`,
    /// gap markers included. Called once a full re-scan of `scope` finished.
    pub fn delete_changed_dirs(&self, scope: &str) -> Result<usize> {
        let (scope, prefix) = scope_params(scope);
        let result = self.db.write("delete_changed_dirs", |tx| {
            let gaps: i64 = tx
                .prepare_cached(&format!(
                    "SELECT COUNT(*) FROM mdirs WHERE gap = 1 AND {IN_SCOPE}"
                ))?
                .query_row(params![scope, prefix], |row| row.get(0))?;
            let removed = tx
                .prepare_cached(&format!("DELETE FROM mdirs WHERE {IN_SCOPE}"))?
                .execute(params![scope, prefix])?;
            Ok((removed, gaps))
        });
        let (removed, gaps) = self.db.log_failure("delete_changed_dirs", result)?;
        if gaps > 0 {
            self.db.emit(
                &LogEntry::new(EventType::GapCleared, Severity::Info)
                    .path(scope)
                    .count(removed),
            );
        }
        Ok(removed)
    }

    // ──────────────────── gaps ────────────────────

    /// Whether any gap marker is present.
    pub fn has_changed_gap(&self) -> Result<bool> {
        self.db.read("has_changed_gap", |conn| {
            conn.prepare_cached("SELECT EXISTS (SELECT 1 FROM mdirs WHERE gap = 1)")?
                .query_row([], |row| row.get(0))
        })
    }

    /// Gapped scopes, sorted.
    pub fn get_gap_dirs(&self) -> Result<Vec<String>> {
        self.db.read("get_gap_dirs", |conn| {
            let mut stmt = conn
                .prepare_cached("SELECT DISTINCT name FROM mdirs WHERE gap = 1 ORDER BY name ASC")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()
        })
    }

    /// Classify `scope`. A gap anywhere above or below it makes the whole
    /// scope untrustworthy.
    pub fn gap_state(&self, scope: &str) -> Result<ScopeState> {
        let gapped = self
            .get_gap_dirs()?
            .iter()
            .any(|gap| is_within_scope(gap, scope) || is_within_scope(scope, gap));
        if gapped {
            return Ok(ScopeState::GapDetected);
        }
        if self.peek_changed_dirs(scope)?.is_empty() && self.peek_del_dirs(scope)?.is_empty() {
            Ok(ScopeState::Clean)
        } else {
            Ok(ScopeState::Pending)
        }
    }

    // ──────────────────── changed files ────────────────────

    /// Copy pending changed files of `dir_id` into the saved area; with
    /// `del`, clear them from pending in the same transaction. Returns the
    /// number of pending rows seen.
    pub fn move_changed_files(&self, dir_id: i64, del: bool) -> Result<usize> {
        let result = self.db.write("move_changed_files", |tx| {
            let pending: i64 = tx
                .prepare_cached("SELECT COUNT(*) FROM mfiles WHERE dir_id = ?1")?
                .query_row(params![dir_id], |row| row.get(0))?;
            tx.prepare_cached(
                "INSERT OR IGNORE INTO mfiles_saved (dir_id, name)
                 SELECT dir_id, name FROM mfiles WHERE dir_id = ?1",
            )?
            .execute(params![dir_id])?;
            if del {
                tx.prepare_cached("DELETE FROM mfiles WHERE dir_id = ?1")?
                    .execute(params![dir_id])?;
            }
            Ok(usize::try_from(pending).unwrap_or(0))
        });
        let count = self.db.log_failure("move_changed_files", result)?;
        self.db.emit(
            &LogEntry::new(EventType::ChangesConsumed, Severity::Info)
                .id(dir_id)
                .count(count)
                .details("changed_files"),
        );
        Ok(count)
    }

    /// Changed file names of `dir_id` (pending ∪ saved), sorted.
    pub fn get_changed_files(&self, dir_id: i64) -> Result<Vec<String>> {
        self.db.read("get_changed_files", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT name FROM mfiles WHERE dir_id = ?1
                 UNION
                 SELECT name FROM mfiles_saved WHERE dir_id = ?1
                 ORDER BY name ASC",
            )?;
            stmt.query_map(params![dir_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()
        })
    }

    pub fn has_file_change(&self, dir_id: i64, name: &str) -> Result<bool> {
        self.db.read("has_file_change", |conn| {
            conn.prepare_cached(
                "SELECT EXISTS (SELECT 1 FROM mfiles WHERE dir_id = ?1 AND name = ?2)
                     OR EXISTS (SELECT 1 FROM mfiles_saved WHERE dir_id = ?1 AND name = ?2)",
            )?
            .query_row(params![dir_id, name], |row| row.get(0))
        })
    }

    /// Purge the saved changed-file area after a successful backup.
    pub fn delete_saved_changed_files(&self) -> Result<usize> {
        let result = self.db.write("delete_saved_changed_files", |tx| {
            Ok(tx.execute("DELETE FROM mfiles_saved", [])?)
        });
        self.db.log_failure("delete_saved_changed_files", result)
    }

    // ──────────────────── deleted directories ────────────────────

    pub fn get_del_dirs(&self, scope: &str, del: bool) -> Result<Vec<String>> {
        if del {
            self.take_del_dirs(scope)
        } else {
            self.peek_del_dirs(scope)
        }
    }

    pub fn peek_del_dirs(&self, scope: &str) -> Result<Vec<String>> {
        let (scope, prefix) = scope_params(scope);
        self.db.read("peek_del_dirs", |conn| {
            select_del_dirs(conn, &scope, &prefix)
        })
    }

    /// Move pending deleted directories under `scope` into the saved area and
    /// return saved ∪ pending.
    pub fn take_del_dirs(&self, scope: &str) -> Result<Vec<String>> {
        let (scope, prefix) = scope_params(scope);
        let result = self.db.write("take_del_dirs", |tx| {
            tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO del_dirs_saved (name)
                 SELECT name FROM del_dirs WHERE {IN_SCOPE}"
            ))?
            .execute(params![scope, prefix])?;
            tx.prepare_cached(&format!("DELETE FROM del_dirs WHERE {IN_SCOPE}"))?
                .execute(params![scope, prefix])?;
            Ok(select_del_dirs(tx, &scope, &prefix)?)
        });
        self.db.log_failure("take_del_dirs", result)
    }

    pub fn delete_saved_del_dirs(&self) -> Result<usize> {
        let result = self.db.write("delete_saved_del_dirs", |tx| {
            Ok(tx.execute("DELETE FROM del_dirs_saved", [])?)
        });
        self.db.log_failure("delete_saved_del_dirs", result)
    }

    /// Forget `path` in both deleted-directory areas (it reappeared, or the
    /// server acknowledged the deletion).
    pub fn remove_deleted_dir(&self, path: &str) -> Result<bool> {
        let path = normalize_scope(path);
        let result = self.db.write("remove_deleted_dir", |tx| {
            let pending = tx
                .prepare_cached("DELETE FROM del_dirs WHERE name = ?1")?
                .execute(params![path])?;
            let saved = tx
                .prepare_cached("DELETE FROM del_dirs_saved WHERE name = ?1")?
                .execute(params![path])?;
            Ok(pending + saved > 0)
        });
        self.db.log_failure("remove_deleted_dir", result)
    }
}

fn scope_params(scope: &str) -> (String, String) {
    let scope = normalize_scope(scope);
    let prefix = descendant_prefix(&scope);
    (scope, prefix)
}

fn select_changed_dirs(
    conn: &Connection,
    scope: &str,
    prefix: &str,
) -> rusqlite::Result<Vec<ChangedDir>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT id, name FROM mdirs_saved WHERE {IN_SCOPE}
         UNION
         SELECT id, name FROM mdirs WHERE gap = 0 AND {IN_SCOPE}
         ORDER BY name ASC, id ASC"
    ))?;
    stmt.query_map(params![scope, prefix], |row| {
        Ok(ChangedDir {
            id: row.get(0)?,
            path: row.get(1)?,
        })
    })?
    .collect()
}

fn select_del_dirs(conn: &Connection, scope: &str, prefix: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT name FROM del_dirs_saved WHERE {IN_SCOPE}
         UNION
         SELECT name FROM del_dirs WHERE {IN_SCOPE}
         ORDER BY name ASC"
    ))?;
    stmt.query_map(params![scope, prefix], |row| row.get(0))?
        .collect()
}

fn watched_from_row(row: &Row<'_>) -> rusqlite::Result<WatchedDirectory> {
    Ok(WatchedDirectory {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        optional: row.get(3)?,
        group: row.get(4)?,
    })
}
