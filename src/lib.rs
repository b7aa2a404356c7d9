#![forbid(unsafe_code)]

//! Backup journal (bkj): the client-side change-tracking and snapshot journal
//! of a backup agent.
//!
//! Durably records:
//! 1. **File state**: the last committed file list of every watched directory
//! 2. **Changes**: pending and saved changed/deleted directories and files, plus gap markers
//! 3. **Shadow copies**: refcounted snapshot handles shared between backup runs
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use backup_journal::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use backup_journal::core::config::Config;
//! use backup_journal::journal::files::{TrackedFileRecord, diff_records};
//! ```

pub mod prelude;

pub mod core;
pub mod journal;
pub mod logger;
pub mod store;
