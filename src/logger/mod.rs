//! Append-only JSONL event log with rotation and graceful degradation.

pub mod jsonl;
