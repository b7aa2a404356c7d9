#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

use backup_journal::core::config::StoreConfig;
use backup_journal::journal::files::TrackedFileRecord;
use backup_journal::journal::shadowcopy::{NewShadowCopy, SnapshotGuid};
use backup_journal::store::db::JournalDb;

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_bkj") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "bkj.exe" } else { "bkj" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve bkj binary path for integration test"),
    }
}

/// Run `bkj` against an isolated state directory: database and event log
/// live under `state_dir`, and no user config is picked up.
pub fn run_cli_case(case_name: &str, state_dir: &Path, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("bkj-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("HOME", state_dir)
        .env("BKJ_DATABASE", state_dir.join("journal.db"))
        .env("BKJ_EVENT_LOG", state_dir.join("events.jsonl"))
        .env_remove("BKJ_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute bkj command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Open a file-backed journal at `state_dir/journal.db`.
pub fn open_db(state_dir: &Path) -> JournalDb {
    JournalDb::open(&state_dir.join("journal.db"), &StoreConfig::default())
        .expect("open journal database")
}

pub fn file(name: &str, size: i64, hash: &[u8]) -> TrackedFileRecord {
    TrackedFileRecord {
        name: name.to_string(),
        size,
        last_modified: 1_700_000_000,
        is_dir: false,
        hash: hash.to_vec(),
        permission_bits: vec![0x01, 0xa4],
        last_modified_orig: 1_700_000_000,
        created: 1_690_000_000,
    }
}

pub fn shadow_copy(seed: u8, refs: i64) -> NewShadowCopy {
    NewShadowCopy {
        vss_id: SnapshotGuid([seed; 16]),
        set_id: SnapshotGuid([seed.wrapping_add(1); 16]),
        target: format!("/mnt/snap-{seed}"),
        path: "/data".to_string(),
        tname: "data".to_string(),
        orig_target: "/data".to_string(),
        vol: "/dev/sda1".to_string(),
        starttoken: format!("start-{seed}"),
        filesrv: true,
        refs,
    }
}
