//! Merges two divergent snapshots of the same tracked file.
//!
//! `base` is the latest persisted row, `incoming` is what a writer wants to
//! commit after mutating a possibly stale copy. When both carry the same
//! version nothing interleaved and `incoming` wins outright. Otherwise the
//! snapshot with the higher status priority wins (ties go to `base`) and
//! empty field groups on the winner are filled from the loser.

use crate::error::ResolveError;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use storage::models::{LogLevel, NewProcessingLog, TrackedFile};
use storage::LogStore;
use tracing::{debug, warn};

pub const CONFLICT_LOG_CATEGORY: &str = "Concurrency.Conflict";

pub struct ConcurrencyResolver {
    logs: Arc<dyn LogStore>,
}

impl ConcurrencyResolver {
    pub fn new(logs: Arc<dyn LogStore>) -> Self {
        Self { logs }
    }

    pub async fn resolve(
        &self,
        base: &TrackedFile,
        incoming: &TrackedFile,
    ) -> Result<TrackedFile, ResolveError> {
        if base.file_hash != incoming.file_hash {
            return Err(ResolveError::IdentityMismatch {
                base: base.file_hash.clone(),
                incoming: incoming.file_hash.clone(),
            });
        }
        if base.version == incoming.version {
            debug!(file_hash = %base.file_hash, version = base.version, "no interleaving writer");
            return Ok(incoming.clone());
        }

        let merged = merge_snapshots(base, incoming);
        let winner = if incoming.status.priority() > base.status.priority() {
            "incoming"
        } else {
            "base"
        };
        warn!(
            file_hash = %base.file_hash,
            base_version = base.version,
            incoming_version = incoming.version,
            base_status = %base.status,
            incoming_status = %incoming.status,
            resolved_status = %merged.status,
            winner,
            "concurrent update detected, merged snapshots"
        );

        let entry = NewProcessingLog::new(
            &base.file_hash,
            LogLevel::Warning,
            CONFLICT_LOG_CATEGORY,
            format!(
                "Concurrent update: base {} (v{}) vs incoming {} (v{}), resolved to {}",
                base.status, base.version, incoming.status, incoming.version, merged.status
            ),
        )
        .with_details(json!({
            "winner": winner,
            "base": snapshot_summary(base),
            "incoming": snapshot_summary(incoming),
            "resolved": snapshot_summary(&merged),
        }));
        self.logs.add(entry).await.map_err(ResolveError::Audit)?;

        Ok(merged)
    }
}

/// Pure part of the resolution. The result is rebased on `base.version` so the
/// commit is checked against the row it was merged with.
pub fn merge_snapshots(base: &TrackedFile, incoming: &TrackedFile) -> TrackedFile {
    let (winner, loser) = if incoming.status.priority() > base.status.priority() {
        (incoming, base)
    } else {
        (base, incoming)
    };
    let mut merged = winner.clone();

    if is_blank(&merged.suggested_category) && !is_blank(&loser.suggested_category) {
        merged.suggested_category = loser.suggested_category.clone();
        merged.confidence = loser.confidence;
        merged.classified_at = loser.classified_at;
    }
    if is_blank(&merged.category) && !is_blank(&loser.category) {
        merged.category = loser.category.clone();
    }
    if is_blank(&merged.target_path) && !is_blank(&loser.target_path) {
        merged.target_path = loser.target_path.clone();
    }
    if is_blank(&merged.moved_to_path) && !is_blank(&loser.moved_to_path) {
        merged.moved_to_path = loser.moved_to_path.clone();
        merged.moved_at = loser.moved_at;
    }

    let error_source = match (base.last_error_at, incoming.last_error_at) {
        (Some(b), Some(i)) if i > b => incoming,
        (None, Some(_)) => incoming,
        _ => base,
    };
    merged.last_error = error_source.last_error.clone();
    merged.last_error_at = error_source.last_error_at;
    merged.retry_count = base.retry_count.max(incoming.retry_count);

    merged.version = base.version;
    merged.last_update_date = Utc::now();
    merged
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::is_empty).unwrap_or(true)
}

fn snapshot_summary(file: &TrackedFile) -> serde_json::Value {
    json!({
        "version": file.version,
        "status": file.status,
        "suggested_category": file.suggested_category,
        "category": file.category,
        "target_path": file.target_path,
        "moved_to_path": file.moved_to_path,
        "retry_count": file.retry_count,
        "last_error": file.last_error,
        "last_update_date": file.last_update_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use storage::models::{FileStatus, LogQuery};
    use storage::{connect, migrate, SqliteLogStore};

    fn snapshot(status: FileStatus, version: i64) -> TrackedFile {
        let mut f = TrackedFile::new("h", "a.mkv", "/watch/a.mkv", 1);
        f.status = status;
        f.version = version;
        f
    }

    async fn resolver() -> (ConcurrencyResolver, Arc<SqliteLogStore>) {
        let pool = connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        let logs = Arc::new(SqliteLogStore::new(pool));
        (ConcurrencyResolver::new(logs.clone()), logs)
    }

    #[tokio::test]
    async fn same_version_accepts_incoming_without_logging() {
        let (resolver, logs) = resolver().await;
        let base = snapshot(FileStatus::Retry, 3);
        let incoming = snapshot(FileStatus::New, 3);
        let merged = resolver.resolve(&base, &incoming).await.unwrap();
        assert_eq!(merged, incoming);
        assert!(logs.query(&LogQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflict_picks_higher_priority_and_logs() {
        let (resolver, logs) = resolver().await;
        let base = snapshot(FileStatus::Classified, 5);
        let incoming = snapshot(FileStatus::Moved, 4);
        let merged = resolver.resolve(&base, &incoming).await.unwrap();
        assert_eq!(merged.status, FileStatus::Moved);
        assert_eq!(merged.version, 5);

        let entries = logs.query(&LogQuery::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].category, CONFLICT_LOG_CATEGORY);
        assert_eq!(entries[0].level, LogLevel::Warning);
        assert_eq!(entries[0].details.as_ref().unwrap()["winner"], "incoming");
    }

    #[tokio::test]
    async fn identity_mismatch_is_rejected() {
        let (resolver, _) = resolver().await;
        let base = snapshot(FileStatus::New, 1);
        let mut incoming = snapshot(FileStatus::New, 0);
        incoming.file_hash = "other".into();
        assert!(matches!(
            resolver.resolve(&base, &incoming).await,
            Err(ResolveError::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn ties_favour_base() {
        let mut base = snapshot(FileStatus::Classified, 2);
        base.suggested_category = Some("MOVIE".into());
        let mut incoming = snapshot(FileStatus::Classified, 1);
        incoming.suggested_category = Some("SHOW".into());
        let merged = merge_snapshots(&base, &incoming);
        assert_eq!(merged.suggested_category.as_deref(), Some("MOVIE"));
    }

    #[test]
    fn losing_side_fills_empty_category() {
        let base = snapshot(FileStatus::Error, 2);
        let mut incoming = snapshot(FileStatus::ReadyToMove, 1);
        incoming.category = Some("X".into());
        incoming.target_path = Some("/library/X/a.mkv".into());
        incoming.suggested_category = Some("X".into());
        incoming.confidence = Some(0.8);

        let merged = merge_snapshots(&base, &incoming);
        assert_eq!(merged.status, FileStatus::Error);
        assert_eq!(merged.category.as_deref(), Some("X"));
        assert_eq!(merged.target_path.as_deref(), Some("/library/X/a.mkv"));
        assert_eq!(merged.suggested_category.as_deref(), Some("X"));
        assert_eq!(merged.confidence, Some(0.8));
    }

    #[test]
    fn winner_fields_are_not_overwritten() {
        let mut base = snapshot(FileStatus::Moved, 2);
        base.category = Some("MOVIE".into());
        base.moved_to_path = Some("/library/MOVIE/a.mkv".into());
        let mut incoming = snapshot(FileStatus::ReadyToMove, 1);
        incoming.category = Some("SHOW".into());
        incoming.moved_to_path = Some("/elsewhere".into());

        let merged = merge_snapshots(&base, &incoming);
        assert_eq!(merged.category.as_deref(), Some("MOVIE"));
        assert_eq!(merged.moved_to_path.as_deref(), Some("/library/MOVIE/a.mkv"));
    }

    #[test]
    fn error_fields_follow_most_recent_error() {
        let now = Utc::now();
        let mut base = snapshot(FileStatus::Retry, 2);
        base.last_error = Some("old".into());
        base.last_error_at = Some(now - Duration::seconds(30));
        base.retry_count = 1;
        let mut incoming = snapshot(FileStatus::Classified, 1);
        incoming.last_error = Some("new".into());
        incoming.last_error_at = Some(now);
        incoming.retry_count = 2;

        let merged = merge_snapshots(&base, &incoming);
        assert_eq!(merged.status, FileStatus::Retry);
        assert_eq!(merged.last_error.as_deref(), Some("new"));
        assert_eq!(merged.retry_count, 2);
    }

    #[test]
    fn merge_is_deterministic_and_never_lowers_priority() {
        for a in FileStatus::ALL {
            for b in FileStatus::ALL {
                let base = snapshot(a, 2);
                let incoming = snapshot(b, 1);
                let first = merge_snapshots(&base, &incoming);
                let second = merge_snapshots(&base, &incoming);
                assert_eq!(first.status, second.status);
                assert_eq!(first.category, second.category);
                assert!(first.status.priority() >= a.priority().max(b.priority()));
            }
        }
    }
}
