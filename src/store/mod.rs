//! Transactional store adapter: SQLite connection, schema, atomic write scopes.

pub mod db;
