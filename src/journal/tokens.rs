//! Per-user tokens authorizing the restore-browsing interface.
//!
//! One row per username. Re-issuing replaces the token and keeps the row id.
//! Token values never reach the event log; only their fingerprint does.

use std::fmt::Write as _;

use rand::RngCore;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::core::errors::{JournalError, Result};
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::store::db::JournalDb;

/// Random bytes per issued token.
const TOKEN_BYTES: usize = 32;

/// A stored access token.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct AccessToken {
    /// Row id.
    pub id: i64,
    /// Owner.
    pub username: String,
    /// Secret value.
    #[serde(skip)]
    pub token: String,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// View over the `file_access_tokens` table.
pub struct AccessTokenStore<'db> {
    db: &'db JournalDb,
}

impl<'db> AccessTokenStore<'db> {
    pub(crate) fn new(db: &'db JournalDb) -> Self {
        Self { db }
    }

    /// Store `token` for `username`, replacing any previous one.
    pub fn update_file_access_token(&self, username: &str, token: &str) -> Result<()> {
        if username.is_empty() {
            return Err(JournalError::InvalidArgument {
                details: "access token username must not be empty".to_string(),
            });
        }
        let result = self.db.write("update_file_access_token", |tx| {
            tx.prepare_cached(
                "INSERT INTO file_access_tokens (username, token) VALUES (?1, ?2)
                 ON CONFLICT(username) DO UPDATE SET token = excluded.token",
            )?
            .execute(params![username, token])?;
            Ok(())
        });
        self.db.log_failure("update_file_access_token", result)?;
        self.db.emit(
            &LogEntry::new(EventType::TokenIssued, Severity::Info).token(username, token),
        );
        Ok(())
    }

    /// Generate a fresh random token for `username`, store it, and return it.
    pub fn issue_file_access_token(&self, username: &str) -> Result<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let token = bytes.iter().fold(String::with_capacity(TOKEN_BYTES * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        });
        self.update_file_access_token(username, &token)?;
        Ok(token)
    }

    /// All tokens ordered by id.
    pub fn get_file_access_tokens(&self) -> Result<Vec<AccessToken>> {
        self.db.read("get_file_access_tokens", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, username, token FROM file_access_tokens ORDER BY id ASC",
            )?;
            stmt.query_map([], |row| {
                Ok(AccessToken {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    token: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    /// Row id of the token held by `username`, without reading the token.
    pub fn get_file_access_token_id(&self, username: &str) -> Result<Option<i64>> {
        self.db.read("get_file_access_token_id", |conn| {
            conn.prepare_cached("SELECT id FROM file_access_tokens WHERE username = ?1")?
                .query_row(params![username], |row| row.get(0))
                .optional()
        })
    }

    /// Revoke the token of `username`. Returns whether one existed.
    pub fn remove_file_access_token(&self, username: &str) -> Result<bool> {
        let result = self.db.write("remove_file_access_token", |tx| {
            Ok(tx
                .prepare_cached("DELETE FROM file_access_tokens WHERE username = ?1")?
                .execute(params![username])?
                > 0)
        });
        self.db.log_failure("remove_file_access_token", result)
    }
}
