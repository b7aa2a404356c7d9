//! CLI smoke tests: run the built `bkj` binary against a seeded journal.

#![cfg(feature = "cli")]

mod common;

use serde_json::Value;

use common::{file, open_db, run_cli_case, shadow_copy};

fn json_line(stdout: &str) -> Value {
    let line = stdout.lines().next().unwrap_or_default();
    serde_json::from_str(line).unwrap_or_else(|e| panic!("invalid JSON {line:?}: {e}"))
}

#[test]
fn help_command_prints_usage() {
    let tmp = tempfile::tempdir().unwrap();
    let result = run_cli_case("help_command_prints_usage", tmp.path(), &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: bkj [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn status_reports_counts_and_gap() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let db = open_db(tmp.path());
        db.files().modify_files("/data", &[file("a.txt", 1, b"1")]).unwrap();
        db.changes().record_changed_dir(1, "/data").unwrap();
        db.changes().record_gap("/home").unwrap();
        db.shadowcopies().add_shadowcopy(&shadow_copy(1, 1)).unwrap();
    }

    let result = run_cli_case("status_reports_counts_and_gap", tmp.path(), &["status", "--json"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["command"], "status");
    assert_eq!(payload["gap"], true);
    assert_eq!(payload["stats"]["committed_dirs"], 1);
    assert_eq!(payload["stats"]["pending_changed_dirs"], 1);
    assert_eq!(payload["stats"]["gap_markers"], 1);
    assert_eq!(payload["stats"]["shadowcopies"], 1);
    assert_eq!(payload["stats"]["schema_version"], 1);
}

#[test]
fn changes_consume_moves_rows_to_saved() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let db = open_db(tmp.path());
        db.changes().record_changed_dir(1, "/data/a").unwrap();
        db.changes().record_changed_dir(2, "/database").unwrap();
    }

    let peek = run_cli_case("changes_peek", tmp.path(), &["changes", "/data", "--json"]);
    assert!(peek.status.success(), "log: {}", peek.log_path.display());
    let payload = json_line(&peek.stdout);
    assert_eq!(payload["changed_dirs"].as_array().unwrap().len(), 1);
    assert_eq!(payload["changed_dirs"][0]["path"], "/data/a");
    assert_eq!(payload["state"], "pending");

    let take = run_cli_case(
        "changes_consume",
        tmp.path(),
        &["changes", "/data", "--consume", "--json"],
    );
    assert!(take.status.success(), "log: {}", take.log_path.display());

    let db = open_db(tmp.path());
    let stats = db.stats().unwrap();
    assert_eq!(stats.pending_changed_dirs, 1);
    assert_eq!(stats.saved_changed_dirs, 1);
}

#[test]
fn clear_gap_removes_markers() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let db = open_db(tmp.path());
        db.changes().record_gap("/data").unwrap();
    }

    let result = run_cli_case("clear_gap", tmp.path(), &["clear-gap", "/data", "--json"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert_eq!(json_line(&result.stdout)["removed"], 1);

    let gaps = run_cli_case("gaps_after_clear", tmp.path(), &["gaps", "--json"]);
    assert_eq!(json_line(&gaps.stdout)["gaps"], Value::Array(Vec::new()));
}

#[test]
fn files_distinguishes_unknown_directory() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let db = open_db(tmp.path());
        db.files().modify_files("/empty", &[]).unwrap();
    }

    let unknown = run_cli_case("files_unknown", tmp.path(), &["files", "/nowhere", "--json"]);
    assert!(unknown.status.success(), "log: {}", unknown.log_path.display());
    assert_eq!(json_line(&unknown.stdout)["found"], false);

    let empty = run_cli_case("files_empty", tmp.path(), &["files", "/empty", "--json"]);
    assert_eq!(json_line(&empty.stdout)["found"], true);
}

#[test]
fn tokens_output_never_contains_secret() {
    let tmp = tempfile::tempdir().unwrap();
    let token = {
        let db = open_db(tmp.path());
        db.tokens().issue_file_access_token("alice").unwrap()
    };

    let result = run_cli_case("tokens_fingerprint", tmp.path(), &["tokens", "--json"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(!result.stdout.contains(&token));
    let payload = json_line(&result.stdout);
    assert_eq!(payload["tokens"][0]["username"], "alice");
    assert_eq!(payload["tokens"][0]["fingerprint"].as_str().unwrap().len(), 12);
}

#[test]
fn reset_files_requires_confirmation() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let db = open_db(tmp.path());
        db.files().modify_files("/data", &[file("a", 1, b"1")]).unwrap();
    }

    let refused = run_cli_case("reset_refused", tmp.path(), &["reset-files"]);
    assert_eq!(refused.status.code(), Some(1), "log: {}", refused.log_path.display());

    let done = run_cli_case("reset_confirmed", tmp.path(), &["reset-files", "--yes", "--json"]);
    assert!(done.status.success(), "log: {}", done.log_path.display());
    assert!(!open_db(tmp.path()).files().has_files("/data").unwrap());
}

#[test]
fn missing_explicit_config_is_a_user_error() {
    let tmp = tempfile::tempdir().unwrap();
    let missing = tmp.path().join("absent.toml");
    let result = run_cli_case(
        "missing_config",
        tmp.path(),
        &["--config", missing.to_str().unwrap(), "status"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("BKJ-1002"));
}

#[test]
fn config_validate_reports_hash() {
    let tmp = tempfile::tempdir().unwrap();
    let result = run_cli_case("config_validate", tmp.path(), &["config", "validate", "--json"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["valid"], true);
    assert_eq!(payload["hash"].as_str().unwrap().len(), 16);
}
