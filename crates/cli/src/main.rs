use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cli::app::{App, RegisterOutcome, RollbackReport};
use cli::watch;
use mediasort_core::config;
use mediasort_core::error_classifier::ErrorContext;
use mediasort_core::mover::MoveOutcome;
use mediasort_core::MoveError;
use serde::Serialize;
use std::path::PathBuf;
use storage::models::{FileStatus, TrackedFile};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;
    let app = App::open(cfg).await?;
    let json = cli.json;

    match cli.command {
        Commands::Register { path } => {
            let outcome = app.register_path(&path).await?;
            print_out(json, &outcome, |o| match o {
                RegisterOutcome::Registered { file } => {
                    format!("registered {} ({})", file.file_hash, file.original_path)
                }
                RegisterOutcome::AlreadyTracked { file_hash } => {
                    format!("already tracked as {file_hash}")
                }
            })
        }
        Commands::Scan { paths } => {
            let summary = app.scan(&paths).await?;
            print_out(json, &summary, |s| {
                format!(
                    "scan: discovered {}, registered {}, already tracked {}, failed {}",
                    s.discovered, s.registered, s.already_tracked, s.failed
                )
            })
        }
        Commands::Classify {
            hash,
            category,
            confidence,
        } => {
            let file = app
                .lifecycle
                .update_classification(&hash, &category, confidence)
                .await?;
            print_file(json, &file)
        }
        Commands::Confirm { hash, category } => {
            let file = app.lifecycle.confirm_category(&hash, &category).await?;
            print_file(json, &file)
        }
        Commands::Move { hash, all } => run_move(&app, hash, all, json).await,
        Commands::Fail { hash, message } => {
            let ctx = ErrorContext::for_operation("manual").with_error(anyhow::anyhow!(message));
            let action = app.lifecycle.handle_failure(&hash, ctx).await?;
            print_out(json, &action, |a| format!("{:?}: {}", a.action_type, a.message))
        }
        Commands::Reset { hash, all } => {
            if all {
                let mut hashes = Vec::new();
                for status in [FileStatus::Error, FileStatus::Retry] {
                    let files = app.lifecycle.list_by_status(status).await?;
                    hashes.extend(files.into_iter().map(|f| f.file_hash));
                }
                let cancel = cancel_on_ctrl_c();
                let result = app.lifecycle.reset_errors(&hashes, &cancel).await;
                print_out(json, &result, |r| {
                    format!(
                        "reset {} file(s), {} failed{}",
                        r.successful_updates,
                        r.failed_updates,
                        if r.cancelled { " (cancelled)" } else { "" }
                    )
                })
            } else {
                let hash = hash.context("a file hash or --all is required")?;
                let file = app.lifecycle.reset_file_error(&hash).await?;
                print_file(json, &file)
            }
        }
        Commands::Delete { hash, reason } => {
            app.lifecycle.delete_file(&hash, reason.as_deref()).await?;
            print_out(json, &serde_json::json!({ "deleted": hash }), |_| {
                format!("deleted {hash}")
            })
        }
        Commands::Show { hash } => {
            let file = app.lifecycle.get_file(&hash).await?;
            let points = app.rollback.list_rollback_points(&hash).await?;
            let view = serde_json::json!({ "file": file, "rollback_points": points });
            print_out(json, &view, |_| {
                let mut out = describe(&file);
                for p in &points {
                    out.push_str(&format!(
                        "\n  rollback #{} {:?} {} -> {}",
                        p.id,
                        p.operation_type,
                        p.original_path.display(),
                        p.target_path
                            .as_ref()
                            .map(|t| t.display().to_string())
                            .unwrap_or_default()
                    ));
                }
                out
            })
        }
        Commands::List { status } => {
            let status: FileStatus = status.parse().map_err(anyhow::Error::msg)?;
            let files = app.lifecycle.list_by_status(status).await?;
            print_out(json, &files, |files| {
                files.iter().map(describe).collect::<Vec<_>>().join("\n")
            })
        }
        Commands::Rollback { id } => {
            let report = app.rollback(id).await?;
            print_out(json, &report, describe_rollback)
        }
        Commands::RollbackLast { hash } => {
            let report = app.rollback_last(&hash).await?;
            print_out(json, &report, describe_rollback)
        }
        Commands::CleanupRollbacks { older_than_days } => {
            let cutoff = app.rollback_cutoff(older_than_days)?;
            let removed = app.rollback.cleanup_rollback_history(cutoff).await?;
            print_out(
                json,
                &serde_json::json!({ "removed": removed, "cutoff": cutoff }),
                |_| format!("removed {removed} rollback point(s) older than {cutoff}"),
            )
        }
        Commands::Validate { hash } => {
            let file = app.lifecycle.get_file(&hash).await?;
            let target = file.target_path.clone().map(PathBuf::from);
            let ctx = ErrorContext::for_operation("move")
                .with_paths(&file.original_path, target)
                .with_file_size(file.file_size.max(0) as u64);
            let report = app.lifecycle.classifier().validate_system_state(&ctx);
            print_out(json, &report, |r| {
                if r.is_valid {
                    "ok".to_string()
                } else {
                    let mut out = r.issues.join("\n");
                    for action in &r.preventive_actions {
                        out.push_str(&format!("\n  -> {action}"));
                    }
                    out
                }
            })
        }
        Commands::Watch { paths } => {
            let cancel = cancel_on_ctrl_c();
            watch::watch_paths(&app, paths, cancel).await
        }
    }
}

#[derive(Parser)]
#[command(name = "mediasort")]
#[command(about = "Media library organizer: track, classify and move files safely", long_about = None)]
struct Cli {
    /// Path to config TOML
    #[arg(short, long)]
    config: Option<String>,

    /// Output JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start tracking a single file
    Register { path: PathBuf },
    /// Register every candidate file under the given (or configured) folders
    Scan { paths: Vec<PathBuf> },
    /// Record a suggested category for a new file
    Classify {
        hash: String,
        category: String,
        confidence: f64,
    },
    /// Confirm the category and compute the library target
    Confirm { hash: String, category: String },
    /// Move a ready file into the library
    Move {
        hash: Option<String>,
        /// Move every file that is ready
        #[arg(long, conflicts_with = "hash")]
        all: bool,
    },
    /// Record a failure against a file's retry budget
    Fail { hash: String, message: String },
    /// Clear a file's error state
    Reset {
        hash: Option<String>,
        /// Reset every file in the error or retry state
        #[arg(long, conflicts_with = "hash")]
        all: bool,
    },
    /// Stop tracking a file (soft delete)
    Delete {
        hash: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show a tracked file and its rollback points
    Show { hash: String },
    /// List active files in a status
    List {
        /// new|processing|classified|ready_to_move|moved|retry|error
        #[arg(long, default_value = "new")]
        status: String,
    },
    /// Execute a rollback point by id
    Rollback { id: i64 },
    /// Undo the most recent recorded operation for a file
    RollbackLast { hash: String },
    /// Soft-delete rollback points past the retention window
    CleanupRollbacks {
        /// Overrides rollback.retention_days
        #[arg(long)]
        older_than_days: Option<i64>,
    },
    /// Run the pre-move checks for a file without moving it
    Validate { hash: String },
    /// Watch folders and register files as they arrive
    Watch { paths: Vec<PathBuf> },
}

async fn run_move(app: &App, hash: Option<String>, all: bool, json: bool) -> Result<()> {
    if all {
        let cancel = cancel_on_ctrl_c();
        let results = app.mover.move_ready(&cancel).await?;
        let mut views = Vec::with_capacity(results.len());
        for (hash, result) in results {
            views.push(match result {
                Ok(outcome) => serde_json::json!({ "file_hash": hash, "outcome": outcome }),
                Err(e) => serde_json::json!({ "file_hash": hash, "error": e.to_string() }),
            });
        }
        return print_out(json, &views, |views| format!("processed {} file(s)", views.len()));
    }

    let Some(hash) = hash else {
        bail!("a file hash or --all is required");
    };
    match app.mover.move_file(&hash).await {
        Ok(outcome) => print_out(json, &outcome, |o| match o {
            MoveOutcome::Moved { file, rollback_id } => format!(
                "moved to {} (rollback point {rollback_id})",
                file.moved_to_path.as_deref().unwrap_or_default()
            ),
            MoveOutcome::Skipped { target } => {
                format!("skipped, target exists: {}", target.display())
            }
            MoveOutcome::Failed { action, .. } => {
                format!("move failed, {:?}: {}", action.action_type, action.message)
            }
        }),
        Err(e @ MoveError::RollbackFailed { .. }) => {
            Err(anyhow::Error::new(e).context("manual intervention required"))
        }
        Err(e) => Err(e.into()),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    token
}

fn describe(file: &TrackedFile) -> String {
    let mut out = format!(
        "{} [{}] {} (v{}, retries {})",
        file.file_hash, file.status, file.original_path, file.version, file.retry_count
    );
    if let Some(target) = &file.target_path {
        out.push_str(&format!(" -> {target}"));
    }
    if let Some(err) = &file.last_error {
        out.push_str(&format!("\n  last error: {err}"));
    }
    out
}

fn describe_rollback(report: &RollbackReport) -> String {
    let outcome = &report.outcome;
    let mut out = format!(
        "rolled back point {} for {}",
        outcome.rollback_id, outcome.file_hash
    );
    if let Some(path) = &outcome.restored_path {
        out.push_str(&format!("\n  restored to {}", path.display()));
    }
    if let Some(file) = &report.file {
        out.push_str(&format!("\n  file is now {}", file.status));
    }
    out
}

fn print_file(json: bool, file: &TrackedFile) -> Result<()> {
    print_out(json, file, describe)
}

fn print_out<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T) -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human(value));
    }
    Ok(())
}
