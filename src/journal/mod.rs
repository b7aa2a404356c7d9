//! The change-tracking journal: one narrow view per logical store, each
//! borrowing the shared [`JournalDb`](crate::store::db::JournalDb) handle.
//!
//! ```rust,no_run
//! use backup_journal::store::db::JournalDb;
//!
//! # fn main() -> backup_journal::core::errors::Result<()> {
//! let db = JournalDb::open_in_memory()?;
//! db.changes().record_changed_dir(1, "/data/photos")?;
//! if !db.changes().has_changed_gap()? {
//!     for dir in db.changes().take_changed_dirs("/data")? {
//!         println!("{} changed", dir.path);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod changes;
pub mod files;
pub mod settings;
pub mod shadowcopy;
pub mod tokens;
