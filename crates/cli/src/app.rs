//! Wires the SQLite stores and core services together from an [`AppConfig`].

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use mediasort_core::config::AppConfig;
use mediasort_core::discovery;
use mediasort_core::error::LifecycleError;
use mediasort_core::events::{EventSink, TracingEventSink};
use mediasort_core::mover::{MoveOptions, Mover};
use mediasort_core::rollback::{FileOperationType, RollbackOutcome};
use mediasort_core::{FileLifecycleService, RollbackManager};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::models::{FileStatus, TrackedFile};
use storage::{SqliteLogStore, SqliteTrackedFileStore};
use tracing::{debug, warn};

pub struct App {
    pub config: AppConfig,
    pub lifecycle: Arc<FileLifecycleService>,
    pub rollback: Arc<RollbackManager>,
    pub mover: Mover,
}

#[derive(Debug, Default, Serialize)]
pub struct ScanSummary {
    pub discovered: usize,
    pub registered: usize,
    pub already_tracked: usize,
    pub failed: usize,
}

/// A rollback and, for a reversed move, the tracked file after its status was
/// re-derived.
#[derive(Debug, Serialize)]
pub struct RollbackReport {
    pub outcome: RollbackOutcome,
    pub file: Option<TrackedFile>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RegisterOutcome {
    Registered { file: TrackedFile },
    AlreadyTracked { file_hash: String },
}

impl App {
    pub async fn open(config: AppConfig) -> Result<Self> {
        Self::open_with_events(config, Arc::new(TracingEventSink)).await
    }

    pub async fn open_with_events(config: AppConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        let pool = storage::connect(&config.database.path)
            .await
            .with_context(|| format!("opening database {}", config.database.path))?;
        storage::migrate(&pool)
            .await
            .context("applying database migrations")?;

        let files = Arc::new(SqliteTrackedFileStore::new(pool.clone()));
        let logs = Arc::new(SqliteLogStore::new(pool));
        let lifecycle = Arc::new(
            FileLifecycleService::new(files, logs.clone(), &config.library.root)
                .with_events(events)
                .with_retry(config.retry.clone())
                .with_bulk(config.bulk.clone()),
        );
        let rollback = Arc::new(RollbackManager::new(logs));
        let options = MoveOptions::from_config(&config.library).context("library.conflict")?;
        let mover = Mover::new(lifecycle.clone(), rollback.clone(), options);
        Ok(Self {
            config,
            lifecycle,
            rollback,
            mover,
        })
    }

    /// Registers a single path, treating an already tracked file as success.
    pub async fn register_path(&self, path: &Path) -> Result<RegisterOutcome, LifecycleError> {
        match self.lifecycle.register_file(path).await {
            Ok(file) => Ok(RegisterOutcome::Registered { file }),
            Err(LifecycleError::AlreadyTracked(file_hash)) => {
                debug!(path = %path.display(), %file_hash, "already tracked");
                Ok(RegisterOutcome::AlreadyTracked { file_hash })
            }
            Err(e) => Err(e),
        }
    }

    /// Walks `roots` (or the configured watch folders) and registers every
    /// candidate file. Per-file failures are counted, not returned.
    pub async fn scan(&self, roots: &[PathBuf]) -> Result<ScanSummary> {
        let roots = if roots.is_empty() {
            self.watch_roots()
        } else {
            roots.to_vec()
        };
        let found = discovery::discover(&roots, &self.config.library.exclude).await?;
        let mut summary = ScanSummary {
            discovered: found.len(),
            ..ScanSummary::default()
        };
        for path in found {
            match self.register_path(&path).await {
                Ok(RegisterOutcome::Registered { .. }) => summary.registered += 1,
                Ok(RegisterOutcome::AlreadyTracked { .. }) => summary.already_tracked += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "register failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    pub fn watch_roots(&self) -> Vec<PathBuf> {
        self.config.library.watch.iter().map(PathBuf::from).collect()
    }

    pub async fn rollback(&self, id: i64) -> Result<RollbackReport> {
        let outcome = self.rollback.execute_rollback(id).await?;
        self.settle_rollback(outcome).await
    }

    pub async fn rollback_last(&self, hash: &str) -> Result<RollbackReport> {
        let outcome = self.rollback.rollback_last_operation(hash).await?;
        self.settle_rollback(outcome).await
    }

    /// A reversed move puts the file back at its original path, so a `Moved`
    /// record goes back to the status its data supports.
    async fn settle_rollback(&self, outcome: RollbackOutcome) -> Result<RollbackReport> {
        if outcome.operation_type != FileOperationType::Move {
            return Ok(RollbackReport { outcome, file: None });
        }
        let file = match self.lifecycle.get_file(&outcome.file_hash).await {
            Ok(file) => file,
            Err(LifecycleError::NotFound(_)) => return Ok(RollbackReport { outcome, file: None }),
            Err(e) => return Err(e.into()),
        };
        let file = if file.status == FileStatus::Moved {
            self.lifecycle
                .revert_move(&outcome.file_hash)
                .await
                .context("rollback succeeded but the file record was not updated")?
        } else {
            file
        };
        Ok(RollbackReport {
            outcome,
            file: Some(file),
        })
    }

    /// Cutoff for rollback cleanup; `days` overrides `rollback.retention_days`.
    pub fn rollback_cutoff(&self, days: Option<i64>) -> Result<DateTime<Utc>> {
        let days = days.unwrap_or(self.config.rollback.retention_days).max(0);
        Duration::try_days(days)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .with_context(|| format!("retention of {days} days is out of range"))
    }
}
