//! Moves `ReadyToMove` files into the library, and `Retry` files back through
//! `ReadyToMove` on their next attempt.
//!
//! Order per file: pre-flight validation, rollback point, filesystem move,
//! `mark_moved`. A failed filesystem step is charged to the retry budget; a
//! failed commit after the file already moved executes the rollback point.

use crate::config::LibraryConfig;
use crate::error::{LifecycleError, MoveError};
use crate::error_classifier::{ErrorContext, RecoveryAction};
use crate::lifecycle::FileLifecycleService;
use crate::paths::resolve_conflict;
use crate::rollback::{FileOperationType, RollbackManager};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use storage::models::{FileStatus, TrackedFile};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Pick `name_1.ext`, `name_2.ext`, ... next to the occupied target.
    #[default]
    Rename,
    Skip,
    Overwrite,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rename" => Ok(ConflictPolicy::Rename),
            "skip" => Ok(ConflictPolicy::Skip),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MoveOptions {
    pub copy_then_delete: bool,
    pub conflict: ConflictPolicy,
}

impl MoveOptions {
    pub fn from_config(library: &LibraryConfig) -> anyhow::Result<Self> {
        let conflict = library
            .conflict
            .parse::<ConflictPolicy>()
            .map_err(anyhow::Error::msg)?;
        Ok(Self {
            copy_then_delete: library.copy_then_delete,
            conflict,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MoveOutcome {
    Moved {
        file: TrackedFile,
        rollback_id: i64,
    },
    /// Target occupied and the conflict policy is `skip`; nothing changed.
    Skipped { target: PathBuf },
    /// The move did not happen; the failure was charged to the retry budget.
    Failed {
        action: RecoveryAction,
        issues: Vec<String>,
    },
}

pub struct Mover {
    lifecycle: Arc<FileLifecycleService>,
    rollback: Arc<RollbackManager>,
    options: MoveOptions,
}

impl Mover {
    pub fn new(
        lifecycle: Arc<FileLifecycleService>,
        rollback: Arc<RollbackManager>,
        options: MoveOptions,
    ) -> Self {
        Self {
            lifecycle,
            rollback,
            options,
        }
    }

    /// Moves a `ReadyToMove` file. A `Retry` file that already has a target is
    /// put back to `ReadyToMove` first; its retry budget carries over.
    pub async fn move_file(&self, hash: &str) -> Result<MoveOutcome, MoveError> {
        let mut file = self.lifecycle.get_file(hash).await?;
        if file.status == FileStatus::Retry && has_target(&file) {
            file = self.lifecycle.schedule_retry(hash).await?;
        }
        if file.status != FileStatus::ReadyToMove {
            return Err(LifecycleError::invalid_transition(hash, "move", file.status).into());
        }
        let target = file
            .target_path
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| LifecycleError::InvalidInput(format!("no target path for {hash}")))?;
        let source = PathBuf::from(&file.original_path);

        let destination = if target.exists() {
            match self.options.conflict {
                ConflictPolicy::Skip => {
                    info!(file_hash = %hash, target = %target.display(), "target occupied, skipping");
                    return Ok(MoveOutcome::Skipped { target });
                }
                ConflictPolicy::Overwrite => target,
                ConflictPolicy::Rename => resolve_conflict(&target),
            }
        } else {
            target
        };

        let ctx = ErrorContext::for_operation("move")
            .with_paths(&source, Some(destination.clone()))
            .with_file_size(file.file_size.max(0) as u64)
            .with_retry_attempts(file.retry_count.max(0) as u32);
        let validation = self.lifecycle.classifier().validate_system_state(&ctx);
        if !validation.is_valid {
            let reason = validation.issues.join("; ");
            let action = self
                .lifecycle
                .handle_failure(hash, ctx.with_error(anyhow::anyhow!(reason)))
                .await?;
            return Ok(MoveOutcome::Failed {
                action,
                issues: validation.issues,
            });
        }

        let rollback_id = self
            .rollback
            .create_rollback_point(hash, FileOperationType::Move, &source, Some(&destination), None)
            .await?;

        let copy_then_delete = self.options.copy_then_delete;
        let (from, to) = (source.clone(), destination.clone());
        let moved = tokio::task::spawn_blocking(move || relocate(&from, &to, copy_then_delete))
            .await
            .map_err(io::Error::other)
            .and_then(|r| r);
        if let Err(e) = moved {
            warn!(file_hash = %hash, from = %source.display(), to = %destination.display(), error = %e, "move failed");
            let action = self.lifecycle.handle_failure(hash, ctx.with_error(e)).await?;
            return Ok(MoveOutcome::Failed {
                action,
                issues: Vec::new(),
            });
        }

        let destination_str = destination.to_string_lossy().into_owned();
        match self.lifecycle.mark_moved(hash, &destination_str).await {
            Ok(file) => {
                info!(file_hash = %hash, to = %destination_str, rollback_id, "move completed");
                Ok(MoveOutcome::Moved { file, rollback_id })
            }
            Err(commit) => {
                error!(file_hash = %hash, error = %commit, rollback_id, "commit failed after move, rolling back");
                match self.rollback.execute_rollback(rollback_id).await {
                    Ok(_) => Err(MoveError::CommitFailedRolledBack {
                        hash: hash.to_string(),
                        source: commit,
                    }),
                    Err(rollback) => Err(MoveError::RollbackFailed {
                        hash: hash.to_string(),
                        commit,
                        rollback,
                    }),
                }
            }
        }
    }

    /// Moves every `ReadyToMove` file, then every `Retry` file with a target,
    /// stopping between files on cancellation.
    pub async fn move_ready(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Result<MoveOutcome, MoveError>)>, LifecycleError> {
        let mut ready = self.lifecycle.list_by_status(FileStatus::ReadyToMove).await?;
        ready.extend(
            self.lifecycle
                .list_by_status(FileStatus::Retry)
                .await?
                .into_iter()
                .filter(has_target),
        );
        let mut results = Vec::with_capacity(ready.len());
        for file in ready {
            if cancel.is_cancelled() {
                info!(done = results.len(), "move run cancelled");
                break;
            }
            let outcome = self.move_file(&file.file_hash).await;
            results.push((file.file_hash, outcome));
        }
        Ok(results)
    }
}

fn has_target(file: &TrackedFile) -> bool {
    file.target_path.as_deref().is_some_and(|t| !t.is_empty())
}

fn relocate(from: &Path, to: &Path, copy_then_delete: bool) -> io::Result<()> {
    let parent = to.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    if copy_then_delete {
        // Copy into a staging file next to the target; a failed copy drops it.
        let staged = tempfile::NamedTempFile::new_in(parent)?;
        fs::copy(from, staged.path())?;
        staged.persist(to).map_err(|e| e.error)?;
        if let Err(e) = fs::remove_file(from) {
            // Leave exactly one copy so the rollback point stays meaningful.
            let _ = fs::remove_file(to);
            return Err(e);
        }
        Ok(())
    } else {
        fs::rename(from, to)
    }
}
