//! State machine of a tracked file, from discovery to its place in the library.
//!
//! ```text
//! New --classify--> Classified --confirm--> ReadyToMove --mark_moved--> Moved
//!  any active status --record_error--> Retry | Error (retry_count >= 3)
//!  any active status --reset_file_error--> derive_status(file)
//!  Retry --schedule_retry--> derive_status(file), budget kept
//!  Moved --revert_move--> derive_status(file)
//! ```
//!
//! Every write goes through [`TransactionalUpdateCoordinator`]; preconditions
//! are checked against the fresh copy inside the mutation so a rejected call
//! leaves the row untouched. Events fire only after the commit.

use crate::config::{BulkConfig, RetryConfig};
use crate::coordinator::{BulkUpdateResult, TransactionalUpdateCoordinator};
use crate::discovery::content_hash;
use crate::error::LifecycleError;
use crate::error_classifier::{ActionType, ErrorClassifier, ErrorContext, RecoveryAction};
use crate::events::{EventSink, FileEvent, NoopEventSink};
use crate::paths::{library_target, sanitize_category};
use chrono::Utc;
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::models::{FileStatus, LogLevel, NewProcessingLog, TrackedFile, MAX_RETRY_COUNT};
use storage::{LogStore, StoreError, TrackedFileStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DELETED_LOG_CATEGORY: &str = "Lifecycle.Deleted";

/// Status a file should hold given the data it carries. Used when an error is
/// cleared so the status is never set independently of the data.
pub fn derive_status(file: &TrackedFile) -> FileStatus {
    if has_value(&file.category) {
        FileStatus::ReadyToMove
    } else if has_value(&file.suggested_category) {
        FileStatus::Classified
    } else {
        FileStatus::New
    }
}

fn has_value(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

pub struct FileLifecycleService {
    coordinator: TransactionalUpdateCoordinator,
    files: Arc<dyn TrackedFileStore>,
    logs: Arc<dyn LogStore>,
    classifier: ErrorClassifier,
    events: Arc<dyn EventSink>,
    library_root: PathBuf,
}

impl FileLifecycleService {
    pub fn new(
        files: Arc<dyn TrackedFileStore>,
        logs: Arc<dyn LogStore>,
        library_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            coordinator: TransactionalUpdateCoordinator::new(files.clone(), logs.clone()),
            classifier: ErrorClassifier::new(logs.clone()),
            files,
            logs,
            events: Arc::new(NoopEventSink),
            library_root: library_root.into(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.coordinator = self.coordinator.with_retry(retry);
        self
    }

    pub fn with_bulk(mut self, bulk: BulkConfig) -> Self {
        self.coordinator = self.coordinator.with_bulk(bulk);
        self
    }

    pub fn coordinator(&self) -> &TransactionalUpdateCoordinator {
        &self.coordinator
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    pub async fn register_file(&self, path: &Path) -> Result<TrackedFile, LifecycleError> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LifecycleError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Err(LifecycleError::InvalidInput(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                LifecycleError::InvalidInput(format!("unusable file name: {}", path.display()))
            })?
            .to_string();

        let owned = path.to_path_buf();
        let hash = tokio::task::spawn_blocking(move || content_hash(&owned))
            .await
            .map_err(io::Error::other)??;

        if self.files.get_by_hash_any(&hash).await?.is_some() {
            return Err(LifecycleError::AlreadyTracked(hash));
        }
        let original_path = path.to_string_lossy().into_owned();
        if let Some(existing) = self.files.find_by_original_path(&original_path).await? {
            return Err(LifecycleError::AlreadyTracked(existing.file_hash));
        }

        let file = TrackedFile::new(&hash, file_name, &original_path, meta.len() as i64);
        let committed = match self.files.add(&file).await {
            Ok(committed) => committed,
            Err(StoreError::Duplicate(h)) => return Err(LifecycleError::AlreadyTracked(h)),
            Err(e) => return Err(e.into()),
        };
        info!(file_hash = %hash, path = %original_path, size = committed.file_size, "file registered");
        self.events.emit(FileEvent::Discovered {
            file_hash: hash,
            path: original_path,
            size: committed.file_size,
        });
        Ok(committed)
    }

    pub async fn update_classification(
        &self,
        hash: &str,
        category: &str,
        confidence: f64,
    ) -> Result<TrackedFile, LifecycleError> {
        let category = category.trim();
        if category.is_empty() {
            return Err(LifecycleError::InvalidInput("category must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(LifecycleError::InvalidInput(format!(
                "confidence {confidence} is outside [0, 1]"
            )));
        }

        let committed = self
            .coordinator
            .update_with_retry(
                hash,
                |f| {
                    if f.status != FileStatus::New {
                        return Err(LifecycleError::invalid_transition(hash, "classify", f.status));
                    }
                    f.suggested_category = Some(category.to_string());
                    f.confidence = Some(confidence);
                    f.classified_at = Some(Utc::now());
                    f.status = FileStatus::Classified;
                    Ok(())
                },
                "update_classification",
            )
            .await?;

        info!(file_hash = %hash, category, confidence, status = %committed.status, "file classified");
        self.events.emit(FileEvent::Classified {
            file_hash: hash.to_string(),
            category: category.to_string(),
            confidence,
        });
        self.events.emit(FileEvent::StatusChanged {
            file_hash: hash.to_string(),
            from: FileStatus::New,
            to: committed.status,
        });
        Ok(committed)
    }

    pub async fn confirm_category(
        &self,
        hash: &str,
        category: &str,
    ) -> Result<TrackedFile, LifecycleError> {
        if category.trim().is_empty() {
            return Err(LifecycleError::InvalidInput("category must not be empty".into()));
        }
        let sanitized = sanitize_category(category);

        let committed = self
            .coordinator
            .update_with_retry(
                hash,
                |f| {
                    if f.status != FileStatus::Classified {
                        return Err(LifecycleError::invalid_transition(hash, "confirm", f.status));
                    }
                    let target = library_target(&self.library_root, &sanitized, &f.file_name);
                    f.category = Some(sanitized.clone());
                    f.target_path = Some(target.to_string_lossy().into_owned());
                    f.status = FileStatus::ReadyToMove;
                    Ok(())
                },
                "confirm_category",
            )
            .await?;

        let target_path = committed.target_path.clone().unwrap_or_default();
        info!(file_hash = %hash, category = %sanitized, target = %target_path, "category confirmed");
        self.events.emit(FileEvent::Confirmed {
            file_hash: hash.to_string(),
            category: sanitized,
            target_path,
        });
        Ok(committed)
    }

    pub async fn mark_moved(
        &self,
        hash: &str,
        target_path: &str,
    ) -> Result<TrackedFile, LifecycleError> {
        if target_path.trim().is_empty() {
            return Err(LifecycleError::InvalidInput("target path must not be empty".into()));
        }
        let committed = self
            .coordinator
            .update_with_retry(
                hash,
                |f| {
                    if f.status != FileStatus::ReadyToMove {
                        return Err(LifecycleError::invalid_transition(hash, "mark moved", f.status));
                    }
                    f.moved_to_path = Some(target_path.to_string());
                    f.moved_at = Some(Utc::now());
                    f.status = FileStatus::Moved;
                    Ok(())
                },
                "mark_moved",
            )
            .await?;

        info!(file_hash = %hash, moved_to = target_path, "file moved");
        self.events.emit(FileEvent::Moved {
            file_hash: hash.to_string(),
            moved_to_path: target_path.to_string(),
        });
        Ok(committed)
    }

    /// Spends one unit of the retry budget. The third error parks the file in
    /// [`FileStatus::Error`]; later errors keep counting but never leave it.
    pub async fn record_error(
        &self,
        hash: &str,
        message: &str,
        detail: Option<&str>,
    ) -> Result<TrackedFile, LifecycleError> {
        let last_error = match detail {
            Some(detail) if !detail.is_empty() => format!("{message}: {detail}"),
            _ => message.to_string(),
        };
        let mut previous = None;

        let committed = self
            .coordinator
            .update_with_retry(
                hash,
                |f| {
                    previous = Some(f.status);
                    f.retry_count += 1;
                    f.last_error = Some(last_error.clone());
                    f.last_error_at = Some(Utc::now());
                    f.status = if f.retry_count >= MAX_RETRY_COUNT {
                        FileStatus::Error
                    } else {
                        FileStatus::Retry
                    };
                    Ok(())
                },
                "record_error",
            )
            .await?;

        warn!(
            file_hash = %hash,
            retry_count = committed.retry_count,
            status = %committed.status,
            error = %last_error,
            "error recorded"
        );
        self.events.emit(FileEvent::ErrorRecorded {
            file_hash: hash.to_string(),
            message: last_error,
            retry_count: committed.retry_count,
        });
        if let Some(from) = previous {
            self.events.emit(FileEvent::StatusChanged {
                file_hash: hash.to_string(),
                from,
                to: committed.status,
            });
        }
        Ok(committed)
    }

    pub async fn reset_file_error(&self, hash: &str) -> Result<TrackedFile, LifecycleError> {
        let mut previous = None;
        let committed = self
            .coordinator
            .update_with_retry(
                hash,
                |f| {
                    previous = Some(f.status);
                    f.last_error = None;
                    f.last_error_at = None;
                    f.retry_count = 0;
                    f.status = derive_status(f);
                    Ok(())
                },
                "reset_file_error",
            )
            .await?;

        info!(file_hash = %hash, status = %committed.status, "file error reset");
        if let Some(from) = previous.filter(|from| *from != committed.status) {
            self.events.emit(FileEvent::StatusChanged {
                file_hash: hash.to_string(),
                from,
                to: committed.status,
            });
        }
        Ok(committed)
    }

    /// Puts a `Retry` file back into the status its data supports for another
    /// attempt. Unlike [`Self::reset_file_error`] the retry budget is kept, so
    /// repeated failures still end in [`FileStatus::Error`].
    pub async fn schedule_retry(&self, hash: &str) -> Result<TrackedFile, LifecycleError> {
        let committed = self
            .coordinator
            .update_with_retry(
                hash,
                |f| {
                    if f.status != FileStatus::Retry {
                        return Err(LifecycleError::invalid_transition(hash, "retry", f.status));
                    }
                    f.status = derive_status(f);
                    Ok(())
                },
                "schedule_retry",
            )
            .await?;

        info!(file_hash = %hash, status = %committed.status, retry_count = committed.retry_count, "retry scheduled");
        self.events.emit(FileEvent::StatusChanged {
            file_hash: hash.to_string(),
            from: FileStatus::Retry,
            to: committed.status,
        });
        Ok(committed)
    }

    /// Undoes [`Self::mark_moved`] after the file was put back at its
    /// original path. The category and target are kept.
    pub async fn revert_move(&self, hash: &str) -> Result<TrackedFile, LifecycleError> {
        let committed = self
            .coordinator
            .update_with_retry(
                hash,
                |f| {
                    if f.status != FileStatus::Moved {
                        return Err(LifecycleError::invalid_transition(hash, "revert move", f.status));
                    }
                    f.moved_to_path = None;
                    f.moved_at = None;
                    f.status = derive_status(f);
                    Ok(())
                },
                "revert_move",
            )
            .await?;

        info!(file_hash = %hash, status = %committed.status, "move reverted");
        self.events.emit(FileEvent::StatusChanged {
            file_hash: hash.to_string(),
            from: FileStatus::Moved,
            to: committed.status,
        });
        Ok(committed)
    }

    /// Clears the error state of many files at once. One failing file does
    /// not stop the run.
    pub async fn reset_errors(
        &self,
        hashes: &[String],
        cancel: &CancellationToken,
    ) -> BulkUpdateResult {
        self.coordinator
            .bulk_update(
                hashes,
                |f| {
                    f.last_error = None;
                    f.last_error_at = None;
                    f.retry_count = 0;
                    f.status = derive_status(f);
                    Ok(())
                },
                "reset_file_error",
                cancel,
            )
            .await
    }

    pub async fn delete_file(&self, hash: &str, reason: Option<&str>) -> Result<(), LifecycleError> {
        match self.files.soft_delete(hash).await {
            Ok(()) => {}
            Err(StoreError::NotFound(h)) => return Err(LifecycleError::NotFound(h)),
            Err(e) => return Err(e.into()),
        }
        let message = match reason {
            Some(reason) => format!("File deleted: {reason}"),
            None => "File deleted".to_string(),
        };
        self.logs
            .add(
                NewProcessingLog::new(hash, LogLevel::Info, DELETED_LOG_CATEGORY, message)
                    .with_details(json!({ "reason": reason })),
            )
            .await?;
        info!(file_hash = %hash, reason = reason.unwrap_or(""), "file deleted");
        Ok(())
    }

    /// Classifies an infrastructure failure, charges it to the file's retry
    /// budget and records the outcome. The caller honours the returned action.
    pub async fn handle_failure(
        &self,
        hash: &str,
        ctx: ErrorContext,
    ) -> Result<RecoveryAction, LifecycleError> {
        let classification = self.classifier.classify(&ctx);
        let message = format!("{} failed ({:?})", ctx.operation, classification.error_type);
        let detail = ctx.error_message();
        let updated = self.record_error(hash, &message, Some(&detail)).await?;

        let ctx = ctx.with_retry_attempts(updated.retry_count.max(0) as u32);
        let action = self.classifier.determine_recovery_action(&classification, &ctx);
        self.classifier
            .record_error_outcome(hash, &classification, &action, false, &ctx)
            .await?;

        if action.action_type == ActionType::AutomaticRetry {
            let delay_ms = action.delay.map(|d| d.as_millis() as u64).unwrap_or_default();
            self.events.emit(FileEvent::RetryScheduled {
                file_hash: hash.to_string(),
                delay_ms,
                attempt: ctx.retry_attempts,
            });
        }
        Ok(action)
    }

    pub async fn get_file(&self, hash: &str) -> Result<TrackedFile, LifecycleError> {
        self.files
            .get_by_hash(hash)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(hash.to_string()))
    }

    pub async fn list_by_status(&self, status: FileStatus) -> Result<Vec<TrackedFile>, LifecycleError> {
        Ok(self.files.list_by_status(status).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_classifier::OUTCOME_LOG_CATEGORY;
    use crate::events::ChannelEventSink;
    use assert_matches::assert_matches;
    use std::fs;
    use storage::{connect, migrate, SqliteLogStore, SqliteTrackedFileStore};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        service: FileLifecycleService,
        files: Arc<SqliteTrackedFileStore>,
        logs: Arc<SqliteLogStore>,
        events: UnboundedReceiver<FileEvent>,
        dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let pool = connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        let files = Arc::new(SqliteTrackedFileStore::new(pool.clone()));
        let logs = Arc::new(SqliteLogStore::new(pool));
        let (sink, events) = ChannelEventSink::new();
        let service = FileLifecycleService::new(files.clone(), logs.clone(), "/library")
            .with_events(Arc::new(sink));
        Fixture {
            service,
            files,
            logs,
            events,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Fixture {
        async fn register(&self, name: &str, content: &[u8]) -> TrackedFile {
            let path = self.dir.path().join(name);
            fs::write(&path, content).unwrap();
            self.service.register_file(&path).await.unwrap()
        }

        async fn force_status(&self, hash: &str, status: FileStatus) -> TrackedFile {
            let mut f = self.files.get_by_hash(hash).await.unwrap().unwrap();
            f.status = status;
            self.files.update(&f, f.version).await.unwrap()
        }

        fn drain(&mut self) -> Vec<FileEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    #[tokio::test]
    async fn happy_path_reaches_moved() {
        let mut fx = fixture().await;
        let file = fx.register("Show.S01E01.mkv", b"episode one").await;
        assert_eq!(file.status, FileStatus::New);
        let hash = file.file_hash.clone();

        let classified = fx.service.update_classification(&hash, "SHOW", 0.9).await.unwrap();
        assert_eq!(classified.status, FileStatus::Classified);
        assert_eq!(classified.confidence, Some(0.9));

        let confirmed = fx.service.confirm_category(&hash, "SHOW").await.unwrap();
        assert_eq!(confirmed.status, FileStatus::ReadyToMove);
        let target = confirmed.target_path.clone().unwrap();
        assert_eq!(
            PathBuf::from(&target),
            Path::new("/library").join("SHOW").join("Show.S01E01.mkv")
        );

        let moved = fx.service.mark_moved(&hash, &target).await.unwrap();
        assert_eq!(moved.status, FileStatus::Moved);
        assert_eq!(moved.moved_to_path.as_deref(), Some(target.as_str()));
        assert!(moved.moved_at.is_some());

        let kinds: Vec<_> = fx.drain().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["discovered", "classified", "status_changed", "confirmed", "moved"]
        );
    }

    #[tokio::test]
    async fn confirm_sanitizes_category() {
        let fx = fixture().await;
        let hash = fx.register("a.mkv", b"a").await.file_hash;
        fx.service.update_classification(&hash, "tv", 0.4).await.unwrap();
        let confirmed = fx.service.confirm_category(&hash, "kids: cartoons").await.unwrap();
        assert_eq!(confirmed.category.as_deref(), Some("KIDS_CARTOONS"));
        assert!(confirmed.target_path.unwrap().contains("KIDS_CARTOONS"));
    }

    #[tokio::test]
    async fn operations_succeed_only_from_their_precondition() {
        let fx = fixture().await;
        let hash = fx.register("grid.mkv", b"grid").await.file_hash;

        for status in FileStatus::ALL {
            for op in ["classify", "confirm", "mark_moved"] {
                let before = fx.force_status(&hash, status).await;
                let res = match op {
                    "classify" => fx.service.update_classification(&hash, "SHOW", 0.5).await,
                    "confirm" => fx.service.confirm_category(&hash, "SHOW").await,
                    _ => fx.service.mark_moved(&hash, "/library/SHOW/grid.mkv").await,
                };
                let allowed = match op {
                    "classify" => status == FileStatus::New,
                    "confirm" => status == FileStatus::Classified,
                    _ => status == FileStatus::ReadyToMove,
                };
                if allowed {
                    assert!(res.is_ok(), "{op} from {status} should succeed");
                } else {
                    assert_matches!(
                        res,
                        Err(LifecycleError::InvalidStateTransition { from, .. }) if from == status
                    );
                    let after = fx.files.get_by_hash(&hash).await.unwrap().unwrap();
                    assert_eq!(after, before, "{op} from {status} changed the row");
                }
            }
        }
    }

    #[tokio::test]
    async fn classification_input_is_validated() {
        let fx = fixture().await;
        let hash = fx.register("v.mkv", b"v").await.file_hash;
        for (category, confidence) in [("", 0.5), ("  ", 0.5), ("SHOW", 1.5), ("SHOW", -0.1), ("SHOW", f64::NAN)] {
            assert_matches!(
                fx.service.update_classification(&hash, category, confidence).await,
                Err(LifecycleError::InvalidInput(_))
            );
        }
        assert_eq!(fx.service.get_file(&hash).await.unwrap().status, FileStatus::New);
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_bad_paths() {
        let fx = fixture().await;
        let first = fx.register("one.mkv", b"same").await;

        let copy = fx.dir.path().join("copy.mkv");
        fs::write(&copy, b"same").unwrap();
        assert_matches!(
            fx.service.register_file(&copy).await,
            Err(LifecycleError::AlreadyTracked(h)) if h == first.file_hash
        );

        // Same path with new content is still the same tracked file.
        fs::write(fx.dir.path().join("one.mkv"), b"changed").unwrap();
        assert_matches!(
            fx.service.register_file(&fx.dir.path().join("one.mkv")).await,
            Err(LifecycleError::AlreadyTracked(_))
        );

        assert_matches!(
            fx.service.register_file(&fx.dir.path().join("missing.mkv")).await,
            Err(LifecycleError::NotFound(_))
        );
        assert_matches!(
            fx.service.register_file(fx.dir.path()).await,
            Err(LifecycleError::InvalidInput(_))
        );
    }

    #[tokio::test]
    async fn deleted_files_stay_tracked_for_registration() {
        let fx = fixture().await;
        let file = fx.register("gone.mkv", b"gone").await;
        fx.service.delete_file(&file.file_hash, Some("duplicate")).await.unwrap();

        assert_matches!(
            fx.service.get_file(&file.file_hash).await,
            Err(LifecycleError::NotFound(_))
        );
        assert_matches!(
            fx.service.register_file(&fx.dir.path().join("gone.mkv")).await,
            Err(LifecycleError::AlreadyTracked(_))
        );
        let entry = fx
            .logs
            .latest(&file.file_hash, DELETED_LOG_CATEGORY)
            .await
            .unwrap()
            .unwrap();
        assert!(entry.message.contains("duplicate"));

        assert_matches!(
            fx.service.delete_file(&file.file_hash, None).await,
            Err(LifecycleError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn third_error_parks_file_and_fourth_keeps_it() {
        let fx = fixture().await;
        let hash = fx.register("e.mkv", b"e").await.file_hash;

        let first = fx.service.record_error(&hash, "move failed", None).await.unwrap();
        assert_eq!((first.status, first.retry_count), (FileStatus::Retry, 1));
        let second = fx.service.record_error(&hash, "move failed", None).await.unwrap();
        assert_eq!((second.status, second.retry_count), (FileStatus::Retry, 2));
        let third = fx.service.record_error(&hash, "move failed", Some("disk")).await.unwrap();
        assert_eq!((third.status, third.retry_count), (FileStatus::Error, 3));
        assert_eq!(third.last_error.as_deref(), Some("move failed: disk"));
        assert!(third.last_error_at.is_some());

        let fourth = fx.service.record_error(&hash, "again", None).await.unwrap();
        assert_eq!(fourth.status, FileStatus::Error);
    }

    #[test]
    fn derive_status_covers_every_combination() {
        let cases = [
            (None, None, FileStatus::New),
            (Some("SHOW"), None, FileStatus::Classified),
            (None, Some("SHOW"), FileStatus::ReadyToMove),
            (Some("SHOW"), Some("SHOW"), FileStatus::ReadyToMove),
            (Some(""), None, FileStatus::New),
            (Some("SHOW"), Some(""), FileStatus::Classified),
        ];
        for (suggested, category, expected) in cases {
            let mut f = TrackedFile::new("h", "a.mkv", "/watch/a.mkv", 1);
            f.status = FileStatus::Error;
            f.suggested_category = suggested.map(str::to_string);
            f.category = category.map(str::to_string);
            assert_eq!(derive_status(&f), expected, "{suggested:?} / {category:?}");
        }
    }

    #[tokio::test]
    async fn reset_clears_errors_and_derives_status() {
        let fx = fixture().await;
        let hash = fx.register("r.mkv", b"r").await.file_hash;
        fx.service.update_classification(&hash, "MOVIE", 0.7).await.unwrap();
        for _ in 0..3 {
            fx.service.record_error(&hash, "boom", None).await.unwrap();
        }

        let reset = fx.service.reset_file_error(&hash).await.unwrap();
        assert_eq!(reset.status, FileStatus::Classified);
        assert_eq!(reset.retry_count, 0);
        assert!(reset.last_error.is_none());
        assert!(reset.last_error_at.is_none());
    }

    #[tokio::test]
    async fn schedule_retry_keeps_the_budget() {
        let fx = fixture().await;
        let hash = fx.register("sr.mkv", b"sr").await.file_hash;
        fx.service.update_classification(&hash, "SHOW", 0.8).await.unwrap();
        fx.service.confirm_category(&hash, "SHOW").await.unwrap();
        fx.service.record_error(&hash, "move failed", None).await.unwrap();

        let retried = fx.service.schedule_retry(&hash).await.unwrap();
        assert_eq!((retried.status, retried.retry_count), (FileStatus::ReadyToMove, 1));
        assert_eq!(retried.last_error.as_deref(), Some("move failed"));

        assert_matches!(
            fx.service.schedule_retry(&hash).await,
            Err(LifecycleError::InvalidStateTransition { from: FileStatus::ReadyToMove, .. })
        );
    }

    #[tokio::test]
    async fn revert_move_returns_file_to_ready() {
        let fx = fixture().await;
        let hash = fx.register("rv.mkv", b"rv").await.file_hash;
        fx.service.update_classification(&hash, "SHOW", 0.8).await.unwrap();
        let ready = fx.service.confirm_category(&hash, "SHOW").await.unwrap();
        let target = ready.target_path.clone().unwrap();
        fx.service.mark_moved(&hash, &target).await.unwrap();

        let reverted = fx.service.revert_move(&hash).await.unwrap();
        assert_eq!(reverted.status, FileStatus::ReadyToMove);
        assert!(reverted.moved_to_path.is_none());
        assert!(reverted.moved_at.is_none());
        assert_eq!(reverted.target_path.as_deref(), Some(target.as_str()));

        assert_matches!(
            fx.service.revert_move(&hash).await,
            Err(LifecycleError::InvalidStateTransition { .. })
        );
    }

    #[tokio::test]
    async fn reset_errors_reports_missing_files() {
        let fx = fixture().await;
        let a = fx.register("ra.mkv", b"ra").await.file_hash;
        let b = fx.register("rb.mkv", b"rb").await.file_hash;
        for hash in [&a, &b] {
            for _ in 0..3 {
                fx.service.record_error(hash, "boom", None).await.unwrap();
            }
        }

        let hashes = vec![a.clone(), "missing".to_string(), b.clone()];
        let result = fx
            .service
            .reset_errors(&hashes, &CancellationToken::new())
            .await;
        assert_eq!(result.successful_updates, 2);
        assert_eq!(result.failed_updates, 1);
        assert_eq!(result.errors[0].file_hash, "missing");
        for hash in [&a, &b] {
            let f = fx.service.get_file(hash).await.unwrap();
            assert_eq!((f.status, f.retry_count), (FileStatus::New, 0));
        }
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry() {
        let mut fx = fixture().await;
        let hash = fx.register("t.mkv", b"t").await.file_hash;
        fx.drain();

        let ctx = ErrorContext::for_operation("move")
            .with_error(io::Error::from(io::ErrorKind::TimedOut));
        let action = fx.service.handle_failure(&hash, ctx).await.unwrap();
        assert_eq!(action.action_type, ActionType::AutomaticRetry);

        let file = fx.service.get_file(&hash).await.unwrap();
        assert_eq!((file.status, file.retry_count), (FileStatus::Retry, 1));
        let outcome = fx
            .logs
            .latest(&hash, OUTCOME_LOG_CATEGORY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.level, LogLevel::Error);

        let events = fx.drain();
        assert_matches!(
            events.last(),
            Some(FileEvent::RetryScheduled { delay_ms: 1000, attempt: 1, .. })
        );
    }

    #[tokio::test]
    async fn exhausted_budget_stops_automatic_retries() {
        let fx = fixture().await;
        let hash = fx.register("x.mkv", b"x").await.file_hash;
        let mut last = None;
        for _ in 0..3 {
            let ctx = ErrorContext::for_operation("move")
                .with_error(io::Error::from(io::ErrorKind::TimedOut));
            last = Some(fx.service.handle_failure(&hash, ctx).await.unwrap());
        }
        assert_eq!(last.unwrap().action_type, ActionType::LogAndFail);
        assert_eq!(fx.service.get_file(&hash).await.unwrap().status, FileStatus::Error);
    }

    #[tokio::test]
    async fn permission_failure_waits_for_user() {
        let mut fx = fixture().await;
        let hash = fx.register("p.mkv", b"p").await.file_hash;
        fx.drain();

        let ctx = ErrorContext::for_operation("move")
            .with_error(io::Error::from(io::ErrorKind::PermissionDenied));
        let action = fx.service.handle_failure(&hash, ctx).await.unwrap();
        assert_eq!(action.action_type, ActionType::WaitForUserIntervention);
        assert!(!fx
            .drain()
            .iter()
            .any(|e| matches!(e, FileEvent::RetryScheduled { .. })));
    }

    #[tokio::test]
    async fn list_by_status_returns_active_files() {
        let fx = fixture().await;
        let a = fx.register("a.mkv", b"a").await.file_hash;
        let b = fx.register("b.mkv", b"b").await.file_hash;
        fx.service.update_classification(&b, "SHOW", 0.5).await.unwrap();

        let new: Vec<_> = fx
            .service
            .list_by_status(FileStatus::New)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.file_hash)
            .collect();
        assert_eq!(new, vec![a]);
    }
}
