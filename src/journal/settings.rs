//! Agent-wide settings in the `misc` key/value table, including the
//! exclude/include patterns in effect at the last scan.

use rusqlite::{OptionalExtension, params};

use crate::core::errors::Result;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::store::db::JournalDb;

/// Key holding the exclude pattern used by the last scan.
pub const OLD_EXCLUDE_PATTERN_KEY: &str = "old_exclude_pattern";
/// Key holding the include pattern used by the last scan.
pub const OLD_INCLUDE_PATTERN_KEY: &str = "old_include_pattern";

/// View over the `misc` table.
pub struct SettingsStore<'db> {
    db: &'db JournalDb,
}

impl<'db> SettingsStore<'db> {
    pub(crate) fn new(db: &'db JournalDb) -> Self {
        Self { db }
    }

    /// Read a setting; `None` if never written.
    pub fn get_misc_value(&self, key: &str) -> Result<Option<String>> {
        self.db.read("get_misc_value", |conn| {
            conn.prepare_cached("SELECT tvalue FROM misc WHERE tkey = ?1")?
                .query_row(params![key], |row| row.get(0))
                .optional()
        })
    }

    /// Insert or overwrite a setting.
    pub fn update_misc_value(&self, key: &str, value: &str) -> Result<()> {
        let result = self.db.write("update_misc_value", |tx| {
            tx.prepare_cached(
                "INSERT INTO misc (tkey, tvalue) VALUES (?1, ?2)
                 ON CONFLICT(tkey) DO UPDATE SET tvalue = excluded.tvalue",
            )?
            .execute(params![key, value])?;
            Ok(())
        });
        self.db.log_failure("update_misc_value", result)
    }

    /// Exclude pattern of the last scan; empty when never stored.
    pub fn get_old_exclude_pattern(&self) -> Result<String> {
        Ok(self.get_misc_value(OLD_EXCLUDE_PATTERN_KEY)?.unwrap_or_default())
    }

    /// Store the exclude pattern used by the scan that just finished.
    pub fn update_old_exclude_pattern(&self, pattern: &str) -> Result<()> {
        self.update_pattern(OLD_EXCLUDE_PATTERN_KEY, pattern)
    }

    /// Include pattern of the last scan; empty when never stored.
    pub fn get_old_include_pattern(&self) -> Result<String> {
        Ok(self.get_misc_value(OLD_INCLUDE_PATTERN_KEY)?.unwrap_or_default())
    }

    /// Store the include pattern used by the scan that just finished.
    pub fn update_old_include_pattern(&self, pattern: &str) -> Result<()> {
        self.update_pattern(OLD_INCLUDE_PATTERN_KEY, pattern)
    }

    /// Whether the configured patterns differ from those of the last scan.
    /// A change invalidates the committed file lists and calls for a full
    /// re-scan.
    pub fn patterns_changed(&self, exclude: &str, include: &str) -> Result<bool> {
        Ok(self.get_old_exclude_pattern()? != exclude || self.get_old_include_pattern()? != include)
    }

    fn update_pattern(&self, key: &'static str, pattern: &str) -> Result<()> {
        self.update_misc_value(key, pattern)?;
        self.db.emit(
            &LogEntry::new(EventType::PatternsUpdated, Severity::Info).details(key),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_values() {
        let db = JournalDb::open_in_memory().unwrap();
        let settings = db.settings();
        assert_eq!(settings.get_misc_value("client_name").unwrap(), None);
        assert_eq!(settings.get_old_exclude_pattern().unwrap(), "");
        assert_eq!(settings.get_old_include_pattern().unwrap(), "");
    }

    #[test]
    fn misc_value_upserts() {
        let db = JournalDb::open_in_memory().unwrap();
        let settings = db.settings();
        settings.update_misc_value("client_name", "laptop").unwrap();
        settings.update_misc_value("client_name", "desktop").unwrap();
        assert_eq!(
            settings.get_misc_value("client_name").unwrap().as_deref(),
            Some("desktop")
        );
        assert_eq!(db.stats().unwrap().schema_version, 1);
    }

    #[test]
    fn pattern_slots_are_independent() {
        let db = JournalDb::open_in_memory().unwrap();
        let settings = db.settings();
        settings.update_old_exclude_pattern("*.tmp;*.bak").unwrap();
        assert_eq!(settings.get_old_exclude_pattern().unwrap(), "*.tmp;*.bak");
        assert_eq!(settings.get_old_include_pattern().unwrap(), "");

        settings.update_old_include_pattern("/data/*").unwrap();
        assert_eq!(settings.get_old_include_pattern().unwrap(), "/data/*");
        assert_eq!(
            settings.get_misc_value(OLD_EXCLUDE_PATTERN_KEY).unwrap().as_deref(),
            Some("*.tmp;*.bak")
        );
    }

    #[test]
    fn patterns_changed_compares_both_slots() {
        let db = JournalDb::open_in_memory().unwrap();
        let settings = db.settings();
        assert!(!settings.patterns_changed("", "").unwrap());
        assert!(settings.patterns_changed("*.tmp", "").unwrap());

        settings.update_old_exclude_pattern("*.tmp").unwrap();
        settings.update_old_include_pattern("*").unwrap();
        assert!(!settings.patterns_changed("*.tmp", "*").unwrap());
        assert!(settings.patterns_changed("*.tmp", "/data/*").unwrap());
    }
}
