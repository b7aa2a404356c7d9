//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use backup_journal::core::config::Config;
use backup_journal::core::errors::JournalError;
use backup_journal::journal::changes::ScopeState;
use backup_journal::journal::files::TrackedFileRecord;
use backup_journal::logger::jsonl::token_fingerprint;
use backup_journal::store::db::JournalDb;

/// Backup journal inspector: change tracking, gaps and snapshot handles.
#[derive(Debug, Parser)]
#[command(
    name = "bkj",
    author,
    version,
    about = "Backup Journal - change tracking and snapshot registry inspector",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override journal database path.
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Show row counts, gap flag and schema version.
    Status,
    /// List configured backup directories.
    Dirs,
    /// Show the committed file list of a directory.
    Files(FilesArgs),
    /// List changed directories under a scope.
    Changes(ChangesArgs),
    /// List scopes flagged as gapped.
    Gaps,
    /// Clear pending changes and gap markers under a scope after a full re-scan.
    ClearGap(ClearGapArgs),
    /// List registered shadow-copy handles.
    Shadowcopies(ShadowcopiesArgs),
    /// List restore-browsing tokens (fingerprints only).
    Tokens,
    /// Drop every committed and staged file list.
    ResetFiles(ResetFilesArgs),
    /// View configuration state.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct FilesArgs {
    /// Directory path as recorded by the scanner.
    #[arg(value_name = "PATH")]
    path: String,
}

#[derive(Debug, Clone, Args)]
struct ChangesArgs {
    /// Scope to query; every directory when omitted.
    #[arg(value_name = "SCOPE", default_value = "")]
    scope: String,
    /// Move pending entries to the saved area while reading.
    #[arg(long)]
    consume: bool,
}

#[derive(Debug, Clone, Args)]
struct ClearGapArgs {
    /// Scope whose full re-scan completed.
    #[arg(value_name = "SCOPE")]
    scope: String,
}

#[derive(Debug, Clone, Args)]
struct ShadowcopiesArgs {
    /// Only show handles older than `snapshots.max_age_secs`.
    #[arg(long)]
    stale: bool,
}

#[derive(Debug, Clone, Args)]
struct ResetFilesArgs {
    /// Confirm the reset.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Target shell.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

impl From<JournalError> for CliError {
    fn from(err: JournalError) -> Self {
        let message = format!("[{}] {err}", err.code());
        match err {
            JournalError::InvalidConfig { .. }
            | JournalError::MissingConfig { .. }
            | JournalError::ConfigParse { .. }
            | JournalError::InvalidArgument { .. }
            | JournalError::NotFound { .. } => Self::User(message),
            JournalError::Serialization { .. } => Self::Internal(message),
            _ => Self::Runtime(message),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Status => run_status(cli),
        Command::Dirs => run_dirs(cli),
        Command::Files(args) => run_files(cli, args),
        Command::Changes(args) => run_changes(cli, args),
        Command::Gaps => run_gaps(cli),
        Command::ClearGap(args) => run_clear_gap(cli, args),
        Command::Shadowcopies(args) => run_shadowcopies(cli, args),
        Command::Tokens => run_tokens(cli),
        Command::ResetFiles(args) => run_reset_files(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.paths.database.clone_from(db);
    }
    Ok(config)
}

fn open_journal(cli: &Cli) -> Result<(Config, JournalDb), CliError> {
    let config = load_config(cli)?;
    let db = JournalDb::from_config(&config)?;
    Ok((config, db))
}

fn run_status(cli: &Cli) -> Result<(), CliError> {
    let (config, db) = open_journal(cli)?;
    let stats = db.stats()?;
    let gap = db.changes().has_changed_gap()?;
    let wal = db.is_wal_mode();

    match output_mode(cli) {
        OutputMode::Human => {
            println!("Journal: {}", config.paths.database.display());
            println!(
                "  schema v{}  journal_mode={}",
                stats.schema_version,
                if wal { "wal" } else { "delete" }
            );
            if gap {
                println!(
                    "  {}",
                    "GAP DETECTED: incremental changes are incomplete, full re-scan required"
                        .red()
                        .bold()
                );
            }
            println!("  backup dirs:      {}", stats.backup_dirs);
            println!(
                "  file lists:       {} committed, {} staged",
                stats.committed_dirs, stats.staged_dirs
            );
            println!(
                "  changed dirs:     {} pending, {} saved",
                stats.pending_changed_dirs, stats.saved_changed_dirs
            );
            println!(
                "  changed files:    {} pending, {} saved",
                stats.pending_changed_files, stats.saved_changed_files
            );
            println!(
                "  deleted dirs:     {} pending, {} saved",
                stats.pending_del_dirs, stats.saved_del_dirs
            );
            println!("  gap markers:      {}", stats.gap_markers);
            println!("  shadow copies:    {}", stats.shadowcopies);
            println!("  access tokens:    {}", stats.access_tokens);
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "status",
                "database": config.paths.database.to_string_lossy(),
                "wal": wal,
                "gap": gap,
                "stats": serde_json::to_value(stats)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_dirs(cli: &Cli) -> Result<(), CliError> {
    let (_, db) = open_journal(cli)?;
    let dirs = db.changes().get_backup_dirs()?;

    match output_mode(cli) {
        OutputMode::Human => {
            if dirs.is_empty() {
                println!("No backup directories configured.");
            }
            for dir in &dirs {
                let optional = if dir.optional { " (optional)" } else { "" };
                println!(
                    "{:>4}  {:<20} {}  group={}{optional}",
                    dir.id, dir.name, dir.path, dir.group
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "dirs",
                "dirs": serde_json::to_value(&dirs)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_files(cli: &Cli, args: &FilesArgs) -> Result<(), CliError> {
    let (_, db) = open_journal(cli)?;
    let files = db.files().get_files(&args.path)?;

    match output_mode(cli) {
        OutputMode::Human => match &files {
            None => println!("{}: never scanned", args.path),
            Some(records) => {
                println!("{}: {} entries", args.path, records.len());
                for record in records {
                    println!("  {}", format_record(record));
                }
            }
        },
        OutputMode::Json => {
            let payload = json!({
                "command": "files",
                "path": args.path,
                "found": files.is_some(),
                "files": serde_json::to_value(files.unwrap_or_default())?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn format_record(record: &TrackedFileRecord) -> String {
    if record.is_dir {
        format!("{}/", record.name)
    } else {
        format!(
            "{:<40} {:>12}  mtime={}  hash={}",
            record.name,
            format_bytes(record.size),
            record.last_modified,
            hex_prefix(&record.hash, 8)
        )
    }
}

fn run_changes(cli: &Cli, args: &ChangesArgs) -> Result<(), CliError> {
    let (_, db) = open_journal(cli)?;
    let changes = db.changes();
    let gap = changes.gap_state(&args.scope)?;
    let dirs = changes.get_changed_dirs(&args.scope, args.consume)?;
    let deleted = changes.get_del_dirs(&args.scope, args.consume)?;

    match output_mode(cli) {
        OutputMode::Human => {
            if gap == ScopeState::GapDetected {
                eprintln!(
                    "{}",
                    "warning: scope is gapped; this list is incomplete".yellow()
                );
            }
            if dirs.is_empty() && deleted.is_empty() {
                println!("No recorded changes.");
            }
            for dir in &dirs {
                println!("M {:>4}  {}", dir.id, dir.path);
            }
            for path in &deleted {
                println!("D       {path}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "changes",
                "scope": args.scope,
                "consumed": args.consume,
                "state": serde_json::to_value(gap)?,
                "changed_dirs": serde_json::to_value(&dirs)?,
                "deleted_dirs": deleted,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_gaps(cli: &Cli) -> Result<(), CliError> {
    let (_, db) = open_journal(cli)?;
    let gaps = db.changes().get_gap_dirs()?;

    match output_mode(cli) {
        OutputMode::Human => {
            if gaps.is_empty() {
                println!("{}", "No gaps recorded.".green());
            }
            for gap in &gaps {
                println!("{}", gap.red());
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({ "command": "gaps", "gaps": gaps }))?;
        }
    }
    Ok(())
}

fn run_clear_gap(cli: &Cli, args: &ClearGapArgs) -> Result<(), CliError> {
    let (_, db) = open_journal(cli)?;
    let removed = db.changes().delete_changed_dirs(&args.scope)?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!("Cleared {removed} pending entries under {}.", args.scope);
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "clear-gap",
                "scope": args.scope,
                "removed": removed,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_shadowcopies(cli: &Cli, args: &ShadowcopiesArgs) -> Result<(), CliError> {
    let (config, db) = open_journal(cli)?;
    let registry = db.shadowcopies();
    let copies = if args.stale {
        registry.stale_shadowcopies(Duration::from_secs(config.snapshots.max_age_secs))?
    } else {
        registry.get_shadowcopies()?
    };

    match output_mode(cli) {
        OutputMode::Human => {
            if copies.is_empty() {
                println!("No shadow copies registered.");
            }
            for sc in &copies {
                let refs = if sc.refs == 0 {
                    "refs=0".yellow().to_string()
                } else {
                    format!("refs={}", sc.refs)
                };
                println!(
                    "{:>4}  {}  {}  {refs}  age={}  vss={}",
                    sc.id,
                    sc.path,
                    sc.target,
                    format_age(sc.passed_secs),
                    sc.vss_id
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "shadowcopies",
                "stale_only": args.stale,
                "max_age_secs": config.snapshots.max_age_secs,
                "shadowcopies": serde_json::to_value(&copies)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_tokens(cli: &Cli) -> Result<(), CliError> {
    let (_, db) = open_journal(cli)?;
    let tokens = db.tokens().get_file_access_tokens()?;

    match output_mode(cli) {
        OutputMode::Human => {
            if tokens.is_empty() {
                println!("No access tokens issued.");
            }
            for t in &tokens {
                println!("{:>4}  {:<24} {}", t.id, t.username, token_fingerprint(&t.token));
            }
        }
        OutputMode::Json => {
            let rows: Vec<Value> = tokens
                .iter()
                .map(|t| {
                    json!({
                        "id": t.id,
                        "username": t.username,
                        "fingerprint": token_fingerprint(&t.token),
                    })
                })
                .collect();
            write_json_line(&json!({ "command": "tokens", "tokens": rows }))?;
        }
    }
    Ok(())
}

fn run_reset_files(cli: &Cli, args: &ResetFilesArgs) -> Result<(), CliError> {
    if !args.yes {
        return Err(CliError::User(
            "reset-files drops every known file list and forces full re-scans; pass --yes"
                .to_string(),
        ));
    }
    let (_, db) = open_journal(cli)?;
    let before = db.stats()?;
    db.files().remove_all_files()?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "Removed {} committed and {} staged file lists.",
                before.committed_dirs, before.staged_dirs
            );
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "reset-files",
                "committed_dirs": before.committed_dirs,
                "staged_dirs": before.staged_dirs,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match load_config(cli) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_age(secs: i64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3_600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h{:02}m", s / 3_600, (s % 3_600) / 60),
        s => format!("{}d{:02}h", s / 86_400, (s % 86_400) / 3_600),
    }
}

fn hex_prefix(bytes: &[u8], max: usize) -> String {
    bytes.iter().take(max).map(|b| format!("{b:02x}")).collect()
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("BKJ_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
