//! Shadow-copy handle registry: one row per live OS snapshot, shared between
//! concurrent backup runs through a reference count.
//!
//! The registry never creates or destroys snapshots. The caller destroys the
//! OS resource when [`SnapshotRegistry::mod_shadowcopy_ref_count`] returns 0
//! and then deletes the row.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::errors::{JournalError, Result};
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::store::db::JournalDb;

/// Opaque 16-byte snapshot identifier returned by the OS snapshot service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SnapshotGuid(pub [u8; 16]);

impl fmt::Display for SnapshotGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for SnapshotGuid {
    type Err = JournalError;

    /// Accepts 32 hex digits, or the dashed 8-4-4-4-12 GUID layout.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || JournalError::InvalidArgument {
            details: format!("snapshot id must be 32 hex digits, got {s:?}"),
        };
        let bytes = s.as_bytes();
        let hex: Vec<u8> = match bytes.len() {
            32 => bytes.to_vec(),
            36 if DASH_POSITIONS.iter().all(|&i| bytes[i] == b'-') => bytes
                .iter()
                .enumerate()
                .filter(|(i, _)| !DASH_POSITIONS.contains(i))
                .map(|(_, b)| *b)
                .collect(),
            _ => return Err(invalid()),
        };
        if !hex.iter().all(u8::is_ascii_hexdigit) {
            return Err(invalid());
        }
        let mut out = [0u8; 16];
        for (byte, pair) in out.iter_mut().zip(hex.chunks_exact(2)) {
            *byte = (hex_value(pair[0]) << 4) | hex_value(pair[1]);
        }
        Ok(Self(out))
    }
}

const DASH_POSITIONS: [usize; 4] = [8, 13, 18, 23];

const fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

impl Serialize for SnapshotGuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SnapshotGuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl ToSql for SnapshotGuid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(&self.0[..]))
    }
}

impl FromSql for SnapshotGuid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let blob = value.as_blob()?;
        <[u8; 16]>::try_from(blob)
            .map(Self)
            .map_err(|_| FromSqlError::InvalidBlobSize {
                expected_size: 16,
                blob_size: blob.len(),
            })
    }
}

/// Handle metadata supplied when registering a freshly created snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewShadowCopy {
    pub vss_id: SnapshotGuid,
    pub set_id: SnapshotGuid,
    /// Path the backup reads through (inside the snapshot).
    pub target: String,
    pub path: String,
    pub tname: String,
    pub orig_target: String,
    pub vol: String,
    pub starttoken: String,
    pub filesrv: bool,
    pub refs: i64,
}

/// A registered snapshot handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowCopyInstance {
    pub id: i64,
    pub vss_id: SnapshotGuid,
    pub set_id: SnapshotGuid,
    pub target: String,
    pub path: String,
    pub tname: String,
    pub orig_target: String,
    pub vol: String,
    pub starttoken: String,
    pub filesrv: bool,
    pub refs: i64,
    /// Seconds since the handle was created or last refreshed.
    pub passed_secs: i64,
}

const SELECT_COLUMNS: &str = "SELECT id, vssid, ssetid, target, path, tname, orig_target, vol, \
                              starttoken, filesrv, refs, starttime FROM shadowcopies";

/// View over the `shadowcopies` table.
pub struct SnapshotRegistry<'db> {
    db: &'db JournalDb,
}

impl<'db> SnapshotRegistry<'db> {
    pub(crate) fn new(db: &'db JournalDb) -> Self {
        Self { db }
    }

    /// Every registered handle ordered by id.
    pub fn get_shadowcopies(&self) -> Result<Vec<ShadowCopyInstance>> {
        let now = now_secs();
        self.db.read("get_shadowcopies", |conn| {
            let mut stmt = conn.prepare_cached(&format!("{SELECT_COLUMNS} ORDER BY id ASC"))?;
            stmt.query_map([], |row| instance_from_row(row, now))?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    pub fn get_shadowcopy(&self, id: i64) -> Result<Option<ShadowCopyInstance>> {
        let now = now_secs();
        self.db.read("get_shadowcopy", |conn| {
            conn.prepare_cached(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?
                .query_row(params![id], |row| instance_from_row(row, now))
                .optional()
        })
    }

    /// Register a new handle and return its id.
    ///
    /// # Errors
    ///
    /// `DuplicateHandle` when `(vss_id, set_id)` is already registered;
    /// `InvalidArgument` for a negative starting refcount.
    pub fn add_shadowcopy(&self, sc: &NewShadowCopy) -> Result<i64> {
        if sc.refs < 0 {
            return Err(JournalError::InvalidArgument {
                details: format!("initial refcount must not be negative, got {}", sc.refs),
            });
        }
        let result = self.db.write("add_shadowcopy", |tx| {
            let exists: bool = tx
                .prepare_cached(
                    "SELECT EXISTS (SELECT 1 FROM shadowcopies WHERE vssid = ?1 AND ssetid = ?2)",
                )?
                .query_row(params![sc.vss_id, sc.set_id], |row| row.get(0))?;
            if exists {
                return Err(JournalError::DuplicateHandle {
                    vss_id: sc.vss_id.to_string(),
                    set_id: sc.set_id.to_string(),
                });
            }
            tx.prepare_cached(
                "INSERT INTO shadowcopies
                    (vssid, ssetid, target, path, tname, orig_target, vol, starttoken,
                     filesrv, refs, starttime)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?
            .execute(params![
                sc.vss_id,
                sc.set_id,
                sc.target,
                sc.path,
                sc.tname,
                sc.orig_target,
                sc.vol,
                sc.starttoken,
                sc.filesrv,
                sc.refs,
                now_secs(),
            ])?;
            Ok(tx.last_insert_rowid())
        });
        let id = self.db.log_failure("add_shadowcopy", result)?;
        self.db.emit(
            &LogEntry::new(EventType::ShadowcopyAdded, Severity::Info)
                .id(id)
                .refs(sc.refs)
                .path(sc.target.clone()),
        );
        Ok(id)
    }

    /// Adjust the refcount by `delta` and return the new value.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id. `RefCountUnderflow` when the result
    /// would be negative; the stored count is then left unchanged.
    pub fn mod_shadowcopy_ref_count(&self, id: i64, delta: i64) -> Result<i64> {
        let result = self.db.write("mod_shadowcopy_ref_count", |tx| {
            let current: i64 = tx
                .prepare_cached("SELECT refs FROM shadowcopies WHERE id = ?1")?
                .query_row(params![id], |row| row.get(0))
                .optional()?
                .ok_or_else(|| not_found(id))?;
            let next = current
                .checked_add(delta)
                .ok_or_else(|| JournalError::InvalidArgument {
                    details: format!("refcount delta {delta} overflows"),
                })?;
            if next < 0 {
                return Err(JournalError::RefCountUnderflow { id, current, delta });
            }
            tx.prepare_cached("UPDATE shadowcopies SET refs = ?1 WHERE id = ?2")?
                .execute(params![next, id])?;
            Ok(next)
        });
        let refs = self.db.log_failure("mod_shadowcopy_ref_count", result)?;
        let entry = LogEntry::new(EventType::ShadowcopyRefcount, Severity::Info)
            .id(id)
            .refs(refs);
        self.db.emit(&if refs == 0 {
            entry.details("released")
        } else {
            entry
        });
        Ok(refs)
    }

    /// Remove the row. Returns whether it existed.
    pub fn delete_shadowcopy(&self, id: i64) -> Result<bool> {
        let result = self.db.write("delete_shadowcopy", |tx| {
            Ok(tx
                .prepare_cached("DELETE FROM shadowcopies WHERE id = ?1")?
                .execute(params![id])?
                > 0)
        });
        let deleted = self.db.log_failure("delete_shadowcopy", result)?;
        if deleted {
            self.db.emit(&LogEntry::new(EventType::ShadowcopyDeleted, Severity::Info).id(id));
        }
        Ok(deleted)
    }

    /// Reset the start time of a reused handle to now.
    pub fn update_shadow_copy_starttime(&self, id: i64) -> Result<()> {
        let result = self.db.write("update_shadow_copy_starttime", |tx| {
            let updated = tx
                .prepare_cached("UPDATE shadowcopies SET starttime = ?1 WHERE id = ?2")?
                .execute(params![now_secs(), id])?;
            if updated == 0 {
                return Err(not_found(id));
            }
            Ok(())
        });
        self.db.log_failure("update_shadow_copy_starttime", result)
    }

    /// Handles older than `max_age`; their OS snapshot may have expired.
    pub fn stale_shadowcopies(&self, max_age: Duration) -> Result<Vec<ShadowCopyInstance>> {
        let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        Ok(self
            .get_shadowcopies()?
            .into_iter()
            .filter(|sc| sc.passed_secs > max_age)
            .collect())
    }

    /// Handles nobody references; left behind when a run crashed between
    /// release and delete.
    pub fn orphaned_shadowcopies(&self) -> Result<Vec<ShadowCopyInstance>> {
        Ok(self
            .get_shadowcopies()?
            .into_iter()
            .filter(|sc| sc.refs == 0)
            .collect())
    }
}

fn not_found(id: i64) -> JournalError {
    JournalError::NotFound {
        what: "shadow copy",
        key: id.to_string(),
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn instance_from_row(row: &Row<'_>, now: i64) -> rusqlite::Result<ShadowCopyInstance> {
    let starttime: i64 = row.get(11)?;
    Ok(ShadowCopyInstance {
        id: row.get(0)?,
        vss_id: row.get(1)?,
        set_id: row.get(2)?,
        target: row.get(3)?,
        path: row.get(4)?,
        tname: row.get(5)?,
        orig_target: row.get(6)?,
        vol: row.get(7)?,
        starttoken: row.get(8)?,
        filesrv: row.get(9)?,
        refs: row.get(10)?,
        passed_secs: now.saturating_sub(starttime).max(0),
    })
}
