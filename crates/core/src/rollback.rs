//! Write-ahead ledger that makes move/copy/rename side effects reversible.
//!
//! A rollback point is a processing log row in [`ROLLBACK_LOG_CATEGORY`]. It
//! must be committed before the filesystem operation it describes runs, and
//! is never rewritten: executing it appends a separate
//! [`ROLLBACK_EXECUTED_LOG_CATEGORY`] entry.

use crate::error::RollbackError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::models::{LogLevel, LogQuery, NewProcessingLog, ProcessingLog};
use storage::LogStore;
use tracing::{error, info, warn};

pub const ROLLBACK_LOG_CATEGORY: &str = "FileOperation.Rollback";
pub const ROLLBACK_EXECUTED_LOG_CATEGORY: &str = "FileOperation.RollbackExecuted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileOperationType {
    Move,
    Copy,
    Rename,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RollbackDetails {
    operation_type: FileOperationType,
    original_path: String,
    target_path: Option<String>,
    additional_info: Option<String>,
    can_rollback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackPoint {
    pub id: i64,
    pub file_hash: String,
    pub operation_type: FileOperationType,
    pub original_path: PathBuf,
    pub target_path: Option<PathBuf>,
    pub additional_info: Option<String>,
    pub can_rollback: bool,
    pub created_date: DateTime<Utc>,
}

impl RollbackPoint {
    fn from_log(entry: ProcessingLog) -> Result<Self, RollbackError> {
        if entry.category != ROLLBACK_LOG_CATEGORY {
            return Err(RollbackError::NotARollbackPoint(entry.id));
        }
        let details = entry.details.ok_or_else(|| RollbackError::Malformed {
            id: entry.id,
            reason: "missing details".to_string(),
        })?;
        let details: RollbackDetails =
            serde_json::from_value(details).map_err(|e| RollbackError::Malformed {
                id: entry.id,
                reason: e.to_string(),
            })?;
        Ok(Self {
            id: entry.id,
            file_hash: entry.file_hash,
            operation_type: details.operation_type,
            original_path: PathBuf::from(details.original_path),
            target_path: details.target_path.map(PathBuf::from),
            additional_info: details.additional_info,
            can_rollback: details.can_rollback,
            created_date: entry.created_date,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackValidation {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub success_probability: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub rollback_id: i64,
    pub file_hash: String,
    pub operation_type: FileOperationType,
    /// Where the file lives after the reversal; `None` for a removed copy.
    pub restored_path: Option<PathBuf>,
    pub audit_entry_id: i64,
}

pub struct RollbackManager {
    logs: Arc<dyn LogStore>,
}

impl RollbackManager {
    pub fn new(logs: Arc<dyn LogStore>) -> Self {
        Self { logs }
    }

    /// Records how to undo an operation that is about to run. Returns once the
    /// entry is durable; the id is what [`execute_rollback`](Self::execute_rollback) takes.
    pub async fn create_rollback_point(
        &self,
        file_hash: &str,
        operation_type: FileOperationType,
        original_path: &Path,
        target_path: Option<&Path>,
        additional_info: Option<&str>,
    ) -> Result<i64, RollbackError> {
        let details = RollbackDetails {
            operation_type,
            original_path: original_path.to_string_lossy().into_owned(),
            target_path: target_path.map(|p| p.to_string_lossy().into_owned()),
            additional_info: additional_info.map(str::to_string),
            can_rollback: true,
        };
        let message = match &details.target_path {
            Some(target) => format!(
                "Rollback point: {:?} {} -> {}",
                operation_type, details.original_path, target
            ),
            None => format!("Rollback point: {:?} {}", operation_type, details.original_path),
        };
        let entry = NewProcessingLog::new(file_hash, LogLevel::Info, ROLLBACK_LOG_CATEGORY, message)
            .with_details(serde_json::to_value(&details).map_err(storage::StoreError::from)?);
        let id = self.logs.add(entry).await?;
        info!(file_hash, rollback_id = id, operation = ?operation_type, "rollback point recorded");
        Ok(id)
    }

    pub async fn get_rollback_point(&self, id: i64) -> Result<RollbackPoint, RollbackError> {
        let entry = self
            .logs
            .get(id)
            .await?
            .ok_or(RollbackError::PointNotFound(id))?;
        RollbackPoint::from_log(entry)
    }

    pub async fn list_rollback_points(
        &self,
        file_hash: &str,
    ) -> Result<Vec<RollbackPoint>, RollbackError> {
        let entries = self
            .logs
            .query(&LogQuery {
                file_hash: Some(file_hash.to_string()),
                category: Some(ROLLBACK_LOG_CATEGORY.to_string()),
                ..LogQuery::default()
            })
            .await?;
        entries.into_iter().map(RollbackPoint::from_log).collect()
    }

    /// Read-only check of whether the point can still be reversed.
    pub async fn validate_rollback_integrity(
        &self,
        id: i64,
    ) -> Result<RollbackValidation, RollbackError> {
        let point = self.get_rollback_point(id).await?;
        Ok(validate_point(&point))
    }

    pub async fn execute_rollback(&self, id: i64) -> Result<RollbackOutcome, RollbackError> {
        let point = self.get_rollback_point(id).await?;
        let validation = validate_point(&point);
        if !validation.is_valid {
            warn!(rollback_id = id, issues = ?validation.issues, "rollback refused");
            self.append_execution_entry(&point, false, Some(&validation.issues.join("; ")))
                .await?;
            return Err(RollbackError::IntegrityCheckFailed {
                id,
                issues: validation.issues,
            });
        }

        match reverse(&point) {
            Ok(restored_path) => {
                let audit_entry_id = self.append_execution_entry(&point, true, None).await?;
                info!(
                    file_hash = %point.file_hash,
                    rollback_id = id,
                    operation = ?point.operation_type,
                    "rollback executed"
                );
                Ok(RollbackOutcome {
                    rollback_id: id,
                    file_hash: point.file_hash,
                    operation_type: point.operation_type,
                    restored_path,
                    audit_entry_id,
                })
            }
            Err(source) => {
                error!(file_hash = %point.file_hash, rollback_id = id, error = %source, "rollback failed");
                self.append_execution_entry(&point, false, Some(&source.to_string()))
                    .await?;
                Err(RollbackError::Execution { id, source })
            }
        }
    }

    pub async fn rollback_last_operation(
        &self,
        file_hash: &str,
    ) -> Result<RollbackOutcome, RollbackError> {
        let latest = self
            .logs
            .latest(file_hash, ROLLBACK_LOG_CATEGORY)
            .await?
            .ok_or_else(|| RollbackError::NoPointForFile(file_hash.to_string()))?;
        self.execute_rollback(latest.id).await
    }

    /// Soft-deletes rollback points older than `older_than`, executed or not.
    pub async fn cleanup_rollback_history(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, RollbackError> {
        let removed = self
            .logs
            .soft_delete_before(ROLLBACK_LOG_CATEGORY, older_than)
            .await?;
        info!(removed, cutoff = %older_than, "rollback history cleaned up");
        Ok(removed)
    }

    async fn append_execution_entry(
        &self,
        point: &RollbackPoint,
        success: bool,
        failure: Option<&str>,
    ) -> Result<i64, RollbackError> {
        let (level, message) = if success {
            (
                LogLevel::Info,
                format!("Rolled back {:?} (point {})", point.operation_type, point.id),
            )
        } else {
            (
                LogLevel::Error,
                format!(
                    "Rollback of {:?} (point {}) failed: {}",
                    point.operation_type,
                    point.id,
                    failure.unwrap_or("unknown error")
                ),
            )
        };
        let entry = NewProcessingLog::new(
            &point.file_hash,
            level,
            ROLLBACK_EXECUTED_LOG_CATEGORY,
            message,
        )
        .with_details(json!({
            "rollback_id": point.id,
            "operation_type": point.operation_type,
            "original_path": point.original_path,
            "target_path": point.target_path,
            "success": success,
            "error": failure,
        }));
        Ok(self.logs.add(entry).await?)
    }
}

fn validate_point(point: &RollbackPoint) -> RollbackValidation {
    let mut issues = Vec::new();
    if !point.can_rollback {
        issues.push("Operation is marked as not reversible".to_string());
    }

    let original_dir_exists = point
        .original_path
        .parent()
        .map(|p| p.as_os_str().is_empty() || p.is_dir())
        .unwrap_or(false);
    let target_exists = match &point.target_path {
        Some(target) => {
            let exists = target.is_file();
            if !exists {
                issues.push(format!("Target file no longer exists: {}", target.display()));
            }
            exists
        }
        None => {
            issues.push("No target path recorded".to_string());
            false
        }
    };

    if matches!(
        point.operation_type,
        FileOperationType::Move | FileOperationType::Rename
    ) && point.original_path.exists()
    {
        issues.push(format!(
            "Original path is occupied: {}",
            point.original_path.display()
        ));
    }

    let success_probability = match (original_dir_exists, target_exists) {
        (true, true) => 0.95,
        (true, false) => 0.3,
        _ => 0.1,
    };

    RollbackValidation {
        is_valid: issues.is_empty(),
        issues,
        success_probability,
    }
}

fn reverse(point: &RollbackPoint) -> std::io::Result<Option<PathBuf>> {
    let Some(target) = point.target_path.as_deref() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "no target path recorded",
        ));
    };
    match point.operation_type {
        FileOperationType::Move => {
            if let Some(parent) = point.original_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(target, &point.original_path)?;
            Ok(Some(point.original_path.clone()))
        }
        FileOperationType::Copy => {
            fs::remove_file(target)?;
            Ok(None)
        }
        FileOperationType::Rename => {
            fs::rename(target, &point.original_path)?;
            Ok(Some(point.original_path.clone()))
        }
    }
}
