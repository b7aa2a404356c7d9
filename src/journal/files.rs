//! Per-directory known-file lists: committed generation, staged generation,
//! and diffing of a fresh scan against what was last committed.
//!
//! Each directory path owns exactly one committed list. `modify_files`
//! replaces it in place; `add_files` stages a replacement that
//! `copy_from_tmp_files` promotes together with every other staged directory.

#![allow(missing_docs)]

use std::cmp::Ordering;

use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::core::paths::normalize_scope;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::store::db::JournalDb;

/// Last known state of one filesystem entry.
///
/// Equality covers every attribute; lists are ordered by `name` alone (see
/// [`sort_by_name`]), so two records may sort equal without being equal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackedFileRecord {
    pub name: String,
    pub size: i64,
    pub last_modified: i64,
    pub is_dir: bool,
    /// Opaque content hash computed by the scanner.
    pub hash: Vec<u8>,
    pub permission_bits: Vec<u8>,
    pub last_modified_orig: i64,
    pub created: i64,
}

/// Sort by name and drop earlier duplicates, keeping the last record per name.
pub fn sort_by_name(records: &[TrackedFileRecord]) -> Vec<TrackedFileRecord> {
    let mut sorted: Vec<(usize, &TrackedFileRecord)> = records.iter().enumerate().collect();
    sorted.sort_by(|(ia, a), (ib, b)| a.name.cmp(&b.name).then(ia.cmp(ib)));
    let mut out: Vec<TrackedFileRecord> = Vec::with_capacity(sorted.len());
    for (_, record) in sorted {
        match out.last_mut() {
            Some(last) if last.name == record.name => *last = record.clone(),
            _ => out.push(record.clone()),
        }
    }
    out
}

/// Delta between the committed list of a directory and a fresh scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileDiff {
    /// The directory had never been recorded; every fresh entry is new.
    pub first_scan: bool,
    pub added: Vec<TrackedFileRecord>,
    /// `(previous, current)` pairs sharing a name but differing in some attribute.
    pub modified: Vec<(TrackedFileRecord, TrackedFileRecord)>,
    pub removed: Vec<TrackedFileRecord>,
    pub unchanged: usize,
}

impl FileDiff {
    /// No entry was added, modified or removed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Merge-walk two record lists by name.
pub fn diff_records(old: &[TrackedFileRecord], new: &[TrackedFileRecord]) -> FileDiff {
    let old = sort_by_name(old);
    let new = sort_by_name(new);
    let mut diff = FileDiff::default();
    let (mut i, mut j) = (0, 0);

    while i < old.len() && j < new.len() {
        match old[i].name.cmp(&new[j].name) {
            Ordering::Less => {
                diff.removed.push(old[i].clone());
                i += 1;
            }
            Ordering::Greater => {
                diff.added.push(new[j].clone());
                j += 1;
            }
            Ordering::Equal => {
                if old[i] == new[j] {
                    diff.unchanged += 1;
                } else {
                    diff.modified.push((old[i].clone(), new[j].clone()));
                }
                i += 1;
                j += 1;
            }
        }
    }
    diff.removed.extend_from_slice(&old[i..]);
    diff.added.extend_from_slice(&new[j..]);
    diff
}

/// Which generation a statement targets.
#[derive(Debug, Clone, Copy)]
enum Generation {
    Committed,
    Staged,
}

impl Generation {
    const fn files_table(self) -> &'static str {
        match self {
            Self::Committed => "files",
            Self::Staged => "files_tmp",
        }
    }

    const fn dirs_table(self) -> &'static str {
        match self {
            Self::Committed => "file_dirs",
            Self::Staged => "file_dirs_tmp",
        }
    }
}

/// View over the file-state tables.
pub struct FileStateStore<'db> {
    db: &'db JournalDb,
}

impl<'db> FileStateStore<'db> {
    pub(crate) fn new(db: &'db JournalDb) -> Self {
        Self { db }
    }

    /// Committed list for `dir`, sorted by name.
    ///
    /// `None` means the directory was never recorded; `Some(vec![])` means it
    /// was recorded and is empty.
    pub fn get_files(&self, dir: &str) -> Result<Option<Vec<TrackedFileRecord>>> {
        let dir = normalize_scope(dir);
        self.db.read("get_files", |conn| {
            if !dir_recorded(conn, Generation::Committed, &dir)? {
                return Ok(None);
            }
            let mut stmt = conn.prepare_cached(
                "SELECT name, size, last_modified, is_dir, hash, permission_bits,
                        last_modified_orig, created
                 FROM files WHERE dir_path = ?1 ORDER BY name ASC",
            )?;
            let rows = stmt
                .query_map(params![dir], record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Some(rows))
        })
    }

    /// Whether `dir` has a committed list (possibly empty).
    pub fn has_files(&self, dir: &str) -> Result<bool> {
        let dir = normalize_scope(dir);
        self.db.read("has_files", |conn| {
            dir_recorded(conn, Generation::Committed, &dir)
        })
    }

    /// Stage `records` as the next generation of `dir`, replacing anything
    /// staged for it earlier. The committed list is untouched.
    pub fn add_files(&self, dir: &str, records: &[TrackedFileRecord]) -> Result<()> {
        let dir = normalize_scope(dir);
        let result = self.db.write("add_files", |tx| {
            replace_generation(tx, Generation::Staged, &dir, records)
        });
        self.db.log_failure("add_files", result)?;
        Ok(())
    }

    /// Atomically replace the committed list of `dir` with `records`.
    pub fn modify_files(&self, dir: &str, records: &[TrackedFileRecord]) -> Result<()> {
        let dir = normalize_scope(dir);
        let result = self.db.write("modify_files", |tx| {
            replace_generation(tx, Generation::Committed, &dir, records)
        });
        let count = self.db.log_failure("modify_files", result)?;
        self.db.emit(
            &LogEntry::new(EventType::FilesCommitted, Severity::Info)
                .path(dir)
                .count(count),
        );
        Ok(())
    }

    /// Promote every staged generation into the committed area and clear
    /// staging. Returns the number of directories promoted; a second call
    /// without intervening `add_files` promotes nothing.
    pub fn copy_from_tmp_files(&self) -> Result<usize> {
        let result = self.db.write("copy_from_tmp_files", |tx| {
            let staged: i64 =
                tx.query_row("SELECT COUNT(*) FROM file_dirs_tmp", [], |row| row.get(0))?;
            tx.execute_batch(
                "DELETE FROM files WHERE dir_path IN (SELECT dir_path FROM file_dirs_tmp);
                 INSERT INTO files (dir_path, name, size, last_modified, is_dir, hash,
                                    permission_bits, last_modified_orig, created)
                     SELECT dir_path, name, size, last_modified, is_dir, hash,
                            permission_bits, last_modified_orig, created
                     FROM files_tmp;
                 INSERT OR IGNORE INTO file_dirs (dir_path) SELECT dir_path FROM file_dirs_tmp;
                 DELETE FROM files_tmp;
                 DELETE FROM file_dirs_tmp;",
            )?;
            Ok(usize::try_from(staged).unwrap_or(0))
        });
        let staged = self.db.log_failure("copy_from_tmp_files", result)?;
        if staged > 0 {
            self.db.emit(
                &LogEntry::new(EventType::TmpFilesPromoted, Severity::Info).count(staged),
            );
        }
        Ok(staged)
    }

    /// Clear committed and staged state for every directory.
    pub fn remove_all_files(&self) -> Result<()> {
        let result = self.db.write("remove_all_files", |tx| {
            tx.execute_batch(
                "DELETE FROM files;
                 DELETE FROM file_dirs;
                 DELETE FROM files_tmp;
                 DELETE FROM file_dirs_tmp;",
            )?;
            Ok(())
        });
        self.db.log_failure("remove_all_files", result)?;
        self.db
            .emit(&LogEntry::new(EventType::FilesReset, Severity::Warning));
        Ok(())
    }

    /// Diff a fresh scan of `dir` against its committed list.
    pub fn diff(&self, dir: &str, fresh: &[TrackedFileRecord]) -> Result<FileDiff> {
        Ok(match self.get_files(dir)? {
            Some(known) => diff_records(&known, fresh),
            None => FileDiff {
                first_scan: true,
                added: sort_by_name(fresh),
                ..FileDiff::default()
            },
        })
    }

    /// Directories with a staged generation awaiting promotion.
    pub fn staged_dirs(&self) -> Result<Vec<String>> {
        self.db.read("staged_dirs", |conn| {
            let mut stmt =
                conn.prepare_cached("SELECT dir_path FROM file_dirs_tmp ORDER BY dir_path ASC")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()
        })
    }

    /// Directories with a committed list.
    pub fn committed_dirs(&self) -> Result<Vec<String>> {
        self.db.read("committed_dirs", |conn| {
            let mut stmt =
                conn.prepare_cached("SELECT dir_path FROM file_dirs ORDER BY dir_path ASC")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()
        })
    }
}

fn dir_recorded(conn: &Connection, generation: Generation, dir: &str) -> rusqlite::Result<bool> {
    let sql = format!(
        "SELECT 1 FROM {} WHERE dir_path = ?1",
        generation.dirs_table()
    );
    conn.prepare_cached(&sql)?
        .query_row(params![dir], |_| Ok(()))
        .optional()
        .map(|hit| hit.is_some())
}

/// Replace one directory's list in `generation`; returns the rows written.
fn replace_generation(
    tx: &Transaction<'_>,
    generation: Generation,
    dir: &str,
    records: &[TrackedFileRecord],
) -> Result<usize> {
    let table = generation.files_table();
    tx.prepare_cached(&format!("DELETE FROM {table} WHERE dir_path = ?1"))?
        .execute(params![dir])?;

    let sorted = sort_by_name(records);
    let mut insert = tx.prepare_cached(&format!(
        "INSERT INTO {table} (dir_path, name, size, last_modified, is_dir, hash,
                              permission_bits, last_modified_orig, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
    ))?;
    for r in &sorted {
        insert.execute(params![
            dir,
            r.name,
            r.size,
            r.last_modified,
            r.is_dir,
            r.hash,
            r.permission_bits,
            r.last_modified_orig,
            r.created,
        ])?;
    }

    tx.prepare_cached(&format!(
        "INSERT OR IGNORE INTO {} (dir_path) VALUES (?1)",
        generation.dirs_table()
    ))?
    .execute(params![dir])?;
    Ok(sorted.len())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TrackedFileRecord> {
    Ok(TrackedFileRecord {
        name: row.get(0)?,
        size: row.get(1)?,
        last_modified: row.get(2)?,
        is_dir: row.get(3)?,
        hash: row.get(4)?,
        permission_bits: row.get(5)?,
        last_modified_orig: row.get(6)?,
        created: row.get(7)?,
    })
}
