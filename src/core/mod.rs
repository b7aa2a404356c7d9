//! Core types: errors, configuration, path scopes.

pub mod config;
pub mod errors;
pub mod paths;
