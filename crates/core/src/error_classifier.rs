//! Turns raw failures into a closed error taxonomy with a fixed retry policy.
//!
//! Classification runs cheapest and most certain signal first: a known
//! size/space shortfall, then the concrete error types in the chain, then the
//! message text, then a fallback.

use crate::error::LifecycleError;
use crate::paths::has_invalid_file_name_chars;
use serde::Serialize;
use serde_json::json;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use storage::models::{LogLevel, NewProcessingLog};
use storage::{LogStore, StoreError};
use tracing::{debug, info, warn};

pub const OUTCOME_LOG_CATEGORY: &str = "ErrorRecovery.Outcome";

pub const MAX_PATH_LENGTH: usize = 4096;
pub const MAX_COMPONENT_LENGTH: usize = 255;

const SPACE_CHECK_CONFIDENCE: f64 = 0.90;
const TYPE_MATCH_CONFIDENCE: f64 = 0.95;
const MESSAGE_MATCH_CONFIDENCE: f64 = 0.85;
const FALLBACK_CONFIDENCE: f64 = 0.50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorType {
    Transient,
    Permission,
    Space,
    Path,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub auto_retry: bool,
    pub delay: Duration,
    pub max_attempts: u32,
    pub requires_user_action: bool,
}

impl ErrorType {
    pub fn policy(self) -> RetryPolicy {
        match self {
            ErrorType::Transient => RetryPolicy {
                auto_retry: true,
                delay: Duration::from_millis(1000),
                max_attempts: 3,
                requires_user_action: false,
            },
            ErrorType::Permission | ErrorType::Space | ErrorType::Path => RetryPolicy {
                auto_retry: false,
                delay: Duration::ZERO,
                max_attempts: 0,
                requires_user_action: true,
            },
            ErrorType::Unknown => RetryPolicy {
                auto_retry: false,
                delay: Duration::ZERO,
                max_attempts: 0,
                requires_user_action: false,
            },
        }
    }

    pub fn guidance(self) -> &'static str {
        match self {
            ErrorType::Transient => {
                "The file is temporarily unavailable (locked, busy or timed out). It will be retried automatically."
            }
            ErrorType::Permission => {
                "Access was denied. Check that the service account can read the source and write the library folder."
            }
            ErrorType::Space => "The target volume is out of space. Free up space or change the library location.",
            ErrorType::Path => {
                "The path is missing, too long or contains invalid characters. Rename or relocate the file."
            }
            ErrorType::Unknown => "An unexpected error occurred. See the processing log for details.",
        }
    }
}

/// Which rule produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchSource {
    SpaceCheck,
    ErrorType,
    Message,
    Fallback,
}

/// Everything known about a failed (or planned) filesystem operation.
#[derive(Debug)]
pub struct ErrorContext {
    pub error: Option<anyhow::Error>,
    pub operation: String,
    pub source_path: Option<PathBuf>,
    pub target_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub available_space: Option<u64>,
    pub retry_attempts: u32,
}

impl ErrorContext {
    pub fn for_operation(operation: impl Into<String>) -> Self {
        Self {
            error: None,
            operation: operation.into(),
            source_path: None,
            target_path: None,
            file_size: None,
            available_space: None,
            retry_attempts: 0,
        }
    }

    pub fn with_error(mut self, error: impl Into<anyhow::Error>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_paths(mut self, source: impl Into<PathBuf>, target: Option<PathBuf>) -> Self {
        self.source_path = Some(source.into());
        self.target_path = target;
        self
    }

    pub fn with_file_size(mut self, size: u64) -> Self {
        self.file_size = Some(size);
        self
    }

    pub fn with_available_space(mut self, space: u64) -> Self {
        self.available_space = Some(space);
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| format!("{e:#}"))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorClassificationResult {
    pub error_type: ErrorType,
    pub confidence: f64,
    pub user_message: String,
    pub policy: RetryPolicy,
    pub matched_by: MatchSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionType {
    AutomaticRetry,
    WaitForUserIntervention,
    LogAndFail,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAction {
    pub action_type: ActionType,
    /// Delay to wait before the retry; only set for automatic retries.
    pub delay: Option<Duration>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemValidation {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub preventive_actions: Vec<String>,
}

static MESSAGE_PATTERNS: LazyLock<Vec<(ErrorType, regex::Regex)>> = LazyLock::new(|| {
    [
        (
            ErrorType::Permission,
            r"access (is )?denied|permission denied|unauthorized|operation not permitted",
        ),
        (
            ErrorType::Space,
            r"disk full|quota exceeded|no space left|not enough space|insufficient (disk )?space",
        ),
        (
            ErrorType::Path,
            r"path too long|invalid path|file name too long|filename too long|illegal characters",
        ),
        (ErrorType::Path, r"not found|no such file|does not exist"),
        (
            ErrorType::Transient,
            r"timeout|timed out|sharing violation|locked|being used by another process|temporarily unavailable|resource busy",
        ),
    ]
    .into_iter()
    .map(|(ty, pattern)| (ty, regex::Regex::new(pattern).expect("valid regex")))
    .collect()
});

pub struct ErrorClassifier {
    logs: Arc<dyn LogStore>,
}

impl ErrorClassifier {
    pub fn new(logs: Arc<dyn LogStore>) -> Self {
        Self { logs }
    }

    pub fn classify(&self, ctx: &ErrorContext) -> ErrorClassificationResult {
        let (error_type, confidence, matched_by) = classify_context(ctx);
        debug!(
            operation = %ctx.operation,
            error_type = ?error_type,
            confidence,
            matched_by = ?matched_by,
            "error classified"
        );
        ErrorClassificationResult {
            error_type,
            confidence,
            user_message: error_type.guidance().to_string(),
            policy: error_type.policy(),
            matched_by,
        }
    }

    pub fn determine_recovery_action(
        &self,
        result: &ErrorClassificationResult,
        ctx: &ErrorContext,
    ) -> RecoveryAction {
        let policy = result.policy;
        if policy.auto_retry && ctx.retry_attempts < policy.max_attempts {
            return RecoveryAction {
                action_type: ActionType::AutomaticRetry,
                delay: Some(policy.delay),
                message: format!(
                    "Retrying {} in {}ms (attempt {} of {})",
                    ctx.operation,
                    policy.delay.as_millis(),
                    ctx.retry_attempts + 1,
                    policy.max_attempts
                ),
            };
        }
        if policy.requires_user_action {
            return RecoveryAction {
                action_type: ActionType::WaitForUserIntervention,
                delay: None,
                message: result.user_message.clone(),
            };
        }
        RecoveryAction {
            action_type: ActionType::LogAndFail,
            delay: None,
            message: format!("{} failed: {}", ctx.operation, ctx.error_message()),
        }
    }

    /// Persists the classification, the chosen action and whether the
    /// operation eventually succeeded.
    pub async fn record_error_outcome(
        &self,
        file_hash: &str,
        result: &ErrorClassificationResult,
        action: &RecoveryAction,
        success: bool,
        ctx: &ErrorContext,
    ) -> Result<i64, StoreError> {
        let level = if success { LogLevel::Info } else { LogLevel::Error };
        let entry = NewProcessingLog::new(
            file_hash,
            level,
            OUTCOME_LOG_CATEGORY,
            format!(
                "{} {:?} error on {}: {:?}",
                if success { "Recovered from" } else { "Unrecovered" },
                result.error_type,
                ctx.operation,
                action.action_type
            ),
        )
        .with_details(json!({
            "error_type": result.error_type,
            "confidence": result.confidence,
            "matched_by": result.matched_by,
            "action": action.action_type,
            "delay_ms": action.delay.map(|d| d.as_millis() as u64),
            "success": success,
            "operation": ctx.operation,
            "retry_attempts": ctx.retry_attempts,
            "source_path": ctx.source_path,
            "target_path": ctx.target_path,
            "error": ctx.error_message(),
        }));
        let id = self.logs.add(entry).await?;
        info!(file_hash, error_type = ?result.error_type, success, "error outcome recorded");
        Ok(id)
    }

    /// Pre-flight probe run before a risky filesystem operation.
    pub fn validate_system_state(&self, ctx: &ErrorContext) -> SystemValidation {
        let mut report = SystemValidation::default();

        if let Some(required) = ctx.file_size {
            let available = ctx.available_space.or_else(|| {
                ctx.target_path
                    .as_deref()
                    .and_then(existing_ancestor)
                    .and_then(|dir| fs2::available_space(dir).ok())
            });
            if let Some(available) = available {
                if required > available {
                    report.issues.push(format!(
                        "Insufficient disk space: {required} bytes required, {available} available"
                    ));
                    report.preventive_actions.push(format!(
                        "Free at least {} bytes on the target volume",
                        required - available
                    ));
                }
            }
        }

        if let Some(source) = &ctx.source_path {
            match std::fs::File::open(source) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    report
                        .issues
                        .push(format!("Source file does not exist: {}", source.display()));
                    report
                        .preventive_actions
                        .push("Rescan the watch folder before retrying".to_string());
                }
                Err(e) => {
                    report.issues.push(format!(
                        "Source file is not readable: {} ({e})",
                        source.display()
                    ));
                    report
                        .preventive_actions
                        .push("Grant read access to the source file".to_string());
                }
            }
        }

        if let Some(target) = &ctx.target_path {
            let probe_dir = target.parent().and_then(existing_ancestor);
            match probe_dir {
                Some(dir) => {
                    if let Err(e) = write_probe(dir) {
                        report.issues.push(format!(
                            "Target directory is not writable: {} ({e})",
                            dir.display()
                        ));
                        report
                            .preventive_actions
                            .push("Grant write access to the library folder".to_string());
                    }
                }
                None => {
                    report.issues.push(format!(
                        "No existing parent directory for target: {}",
                        target.display()
                    ));
                    report
                        .preventive_actions
                        .push("Check that the library volume is mounted".to_string());
                }
            }
        }

        for path in [&ctx.source_path, &ctx.target_path].into_iter().flatten() {
            check_path_legality(path, &mut report);
        }

        report.is_valid = report.issues.is_empty();
        if !report.is_valid {
            warn!(operation = %ctx.operation, issues = ?report.issues, "pre-flight validation failed");
        }
        report
    }
}

fn classify_context(ctx: &ErrorContext) -> (ErrorType, f64, MatchSource) {
    if let (Some(size), Some(space)) = (ctx.file_size, ctx.available_space) {
        if size > space {
            return (ErrorType::Space, SPACE_CHECK_CONFIDENCE, MatchSource::SpaceCheck);
        }
    }
    let Some(error) = &ctx.error else {
        return (ErrorType::Unknown, FALLBACK_CONFIDENCE, MatchSource::Fallback);
    };
    if let Some(ty) = classify_by_type(error) {
        return (ty, TYPE_MATCH_CONFIDENCE, MatchSource::ErrorType);
    }
    if let Some(ty) = classify_by_message(&format!("{error:#}")) {
        return (ty, MESSAGE_MATCH_CONFIDENCE, MatchSource::Message);
    }
    (ErrorType::Unknown, FALLBACK_CONFIDENCE, MatchSource::Fallback)
}

fn classify_by_type(error: &anyhow::Error) -> Option<ErrorType> {
    for cause in error.chain() {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            return Some(classify_io(io));
        }
        if let Some(store) = cause.downcast_ref::<StoreError>() {
            if store.is_conflict() || store.is_busy() {
                return Some(ErrorType::Transient);
            }
        }
        if let Some(LifecycleError::RetriesExhausted { .. }) = cause.downcast_ref::<LifecycleError>()
        {
            return Some(ErrorType::Transient);
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return Some(ErrorType::Transient);
        }
    }
    None
}

#[cfg(target_os = "linux")]
mod os_codes {
    pub const SPACE: &[i32] = &[28, 122];
    pub const NAME_TOO_LONG: &[i32] = &[36];
    pub const SHARING: &[i32] = &[16, 26];
}

#[cfg(all(unix, not(target_os = "linux")))]
mod os_codes {
    pub const SPACE: &[i32] = &[28, 69];
    pub const NAME_TOO_LONG: &[i32] = &[63];
    pub const SHARING: &[i32] = &[16, 26];
}

#[cfg(windows)]
mod os_codes {
    pub const SPACE: &[i32] = &[39, 112];
    pub const NAME_TOO_LONG: &[i32] = &[123, 206];
    pub const SHARING: &[i32] = &[32, 33];
}

#[cfg(not(any(unix, windows)))]
mod os_codes {
    pub const SPACE: &[i32] = &[];
    pub const NAME_TOO_LONG: &[i32] = &[];
    pub const SHARING: &[i32] = &[];
}

fn classify_io(error: &io::Error) -> ErrorType {
    match error.kind() {
        ErrorKind::PermissionDenied => return ErrorType::Permission,
        ErrorKind::NotFound => return ErrorType::Path,
        _ => {}
    }
    match error.raw_os_error() {
        Some(code) if os_codes::SPACE.contains(&code) => ErrorType::Space,
        Some(code) if os_codes::NAME_TOO_LONG.contains(&code) => ErrorType::Path,
        Some(code) if os_codes::SHARING.contains(&code) => ErrorType::Transient,
        _ => ErrorType::Transient,
    }
}

fn classify_by_message(message: &str) -> Option<ErrorType> {
    let lowered = message.to_lowercase();
    MESSAGE_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(&lowered))
        .map(|(ty, _)| *ty)
}

fn existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.is_dir())
}

fn write_probe(dir: &Path) -> io::Result<()> {
    let mut probe = tempfile::Builder::new()
        .prefix(".mediasort-probe")
        .tempfile_in(dir)?;
    probe.write_all(b"probe")?;
    probe.flush()?;
    probe.close()
}

fn check_path_legality(path: &Path, report: &mut SystemValidation) {
    let len = path.as_os_str().len();
    if len > MAX_PATH_LENGTH {
        report.issues.push(format!(
            "Path exceeds {MAX_PATH_LENGTH} characters ({len}): {}",
            path.display()
        ));
        report
            .preventive_actions
            .push("Shorten the folder structure or file name".to_string());
    }
    if path
        .components()
        .any(|c| c.as_os_str().len() > MAX_COMPONENT_LENGTH)
    {
        report.issues.push(format!(
            "Path component exceeds {MAX_COMPONENT_LENGTH} characters: {}",
            path.display()
        ));
        report
            .preventive_actions
            .push("Shorten the file name".to_string());
    }
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if has_invalid_file_name_chars(name) {
            report.issues.push(format!(
                "File name contains invalid characters: {}",
                path.display()
            ));
            report
                .preventive_actions
                .push("Rename the file to remove control or reserved characters".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::models::LogQuery;
    use storage::{connect, migrate, SqliteLogStore};

    async fn classifier() -> (ErrorClassifier, Arc<SqliteLogStore>) {
        let pool = connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        let logs = Arc::new(SqliteLogStore::new(pool));
        (ErrorClassifier::new(logs.clone()), logs)
    }

    fn ctx(error: anyhow::Error) -> ErrorContext {
        ErrorContext::for_operation("move").with_error(error)
    }

    #[tokio::test]
    async fn known_space_shortfall_wins_over_error_type() {
        let (classifier, _) = classifier().await;
        let c = ctx(io::Error::from(ErrorKind::PermissionDenied).into())
            .with_file_size(10_000)
            .with_available_space(10);
        let result = classifier.classify(&c);
        assert_eq!(result.error_type, ErrorType::Space);
        assert_eq!(result.confidence, 0.90);
        assert_eq!(result.matched_by, MatchSource::SpaceCheck);
    }

    #[tokio::test]
    async fn io_kinds_map_through_type_table() {
        let (classifier, _) = classifier().await;
        let cases = [
            (ErrorKind::PermissionDenied, ErrorType::Permission),
            (ErrorKind::NotFound, ErrorType::Path),
            (ErrorKind::TimedOut, ErrorType::Transient),
            (ErrorKind::Interrupted, ErrorType::Transient),
            (ErrorKind::Other, ErrorType::Transient),
        ];
        for (kind, expected) in cases {
            let result = classifier.classify(&ctx(io::Error::from(kind).into()));
            assert_eq!(result.error_type, expected, "{kind:?}");
            assert_eq!(result.confidence, 0.95);
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn os_codes_refine_generic_io_errors() {
        let (classifier, _) = classifier().await;
        let full = classifier.classify(&ctx(io::Error::from_raw_os_error(28).into()));
        assert_eq!(full.error_type, ErrorType::Space);
        let long = classifier.classify(&ctx(io::Error::from_raw_os_error(36).into()));
        assert_eq!(long.error_type, ErrorType::Path);
    }

    #[tokio::test]
    async fn wrapped_errors_are_found_in_the_chain() {
        let (classifier, _) = classifier().await;
        let err = anyhow::Error::new(io::Error::from(ErrorKind::PermissionDenied))
            .context("moving /watch/a.mkv");
        assert_eq!(classifier.classify(&ctx(err)).error_type, ErrorType::Permission);

        let conflict = anyhow::Error::new(StoreError::Concurrency {
            hash: "h".into(),
            expected: 1,
        });
        assert_eq!(classifier.classify(&ctx(conflict)).error_type, ErrorType::Transient);
    }

    #[tokio::test]
    async fn messages_are_matched_when_type_is_unknown() {
        let (classifier, _) = classifier().await;
        let cases = [
            ("Access Denied to share", ErrorType::Permission),
            ("Quota exceeded for user", ErrorType::Space),
            ("The path too long for target", ErrorType::Path),
            ("Episode not found on disk", ErrorType::Path),
            ("Sharing violation on file", ErrorType::Transient),
            ("operation TIMEOUT", ErrorType::Transient),
        ];
        for (message, expected) in cases {
            let result = classifier.classify(&ctx(anyhow::anyhow!(message)));
            assert_eq!(result.error_type, expected, "{message}");
            assert_eq!(result.confidence, 0.85);
            assert_eq!(result.matched_by, MatchSource::Message);
        }
    }

    #[tokio::test]
    async fn unmatched_errors_fall_back_to_unknown() {
        let (classifier, _) = classifier().await;
        let result = classifier.classify(&ctx(anyhow::anyhow!("codec exploded")));
        assert_eq!(result.error_type, ErrorType::Unknown);
        assert_eq!(result.confidence, 0.50);
        assert!(!result.policy.auto_retry);
    }

    #[tokio::test]
    async fn recovery_action_follows_policy_and_budget() {
        let (classifier, _) = classifier().await;

        let transient = ctx(anyhow::anyhow!("file is locked")).with_retry_attempts(1);
        let result = classifier.classify(&transient);
        let action = classifier.determine_recovery_action(&result, &transient);
        assert_eq!(action.action_type, ActionType::AutomaticRetry);
        assert_eq!(action.delay, Some(Duration::from_millis(1000)));

        let exhausted = ctx(anyhow::anyhow!("file is locked")).with_retry_attempts(3);
        let result = classifier.classify(&exhausted);
        let action = classifier.determine_recovery_action(&result, &exhausted);
        assert_eq!(action.action_type, ActionType::LogAndFail);

        let denied = ctx(io::Error::from(ErrorKind::PermissionDenied).into());
        let result = classifier.classify(&denied);
        let action = classifier.determine_recovery_action(&result, &denied);
        assert_eq!(action.action_type, ActionType::WaitForUserIntervention);
        assert!(action.delay.is_none());

        let unknown = ctx(anyhow::anyhow!("codec exploded"));
        let result = classifier.classify(&unknown);
        let action = classifier.determine_recovery_action(&result, &unknown);
        assert_eq!(action.action_type, ActionType::LogAndFail);
    }

    #[tokio::test]
    async fn outcome_is_persisted() {
        let (classifier, logs) = classifier().await;
        let c = ctx(anyhow::anyhow!("file is locked"));
        let result = classifier.classify(&c);
        let action = classifier.determine_recovery_action(&result, &c);
        classifier
            .record_error_outcome("h", &result, &action, false, &c)
            .await
            .unwrap();

        let entries = logs
            .query(&LogQuery {
                category: Some(OUTCOME_LOG_CATEGORY.into()),
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Error);
        let details = entries[0].details.as_ref().unwrap();
        assert_eq!(details["error_type"], "Transient");
        assert_eq!(details["action"], "AutomaticRetry");
        assert_eq!(details["success"], false);
    }

    #[tokio::test]
    async fn system_state_passes_for_healthy_paths() {
        let (classifier, _) = classifier().await;
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.mkv");
        std::fs::write(&source, b"data").unwrap();
        let target = dir.path().join("library/SHOW/a.mkv");

        let c = ErrorContext::for_operation("move")
            .with_paths(&source, Some(target))
            .with_file_size(4)
            .with_available_space(1_000_000);
        let report = classifier.validate_system_state(&c);
        assert!(report.is_valid, "{:?}", report.issues);
        // The write probe cleans up after itself.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn system_state_reports_each_problem() {
        let (classifier, _) = classifier().await;
        let dir = tempfile::tempdir().unwrap();
        let long_name = "x".repeat(300);
        let c = ErrorContext::for_operation("move")
            .with_paths(dir.path().join("missing.mkv"), Some(dir.path().join(long_name)))
            .with_file_size(100)
            .with_available_space(10);
        let report = classifier.validate_system_state(&c);
        assert!(!report.is_valid);
        assert!(report.issues.iter().any(|i| i.contains("Insufficient disk space")));
        assert!(report.issues.iter().any(|i| i.contains("does not exist")));
        assert!(report.issues.iter().any(|i| i.contains("component exceeds")));
        assert_eq!(report.issues.len(), report.preventive_actions.len());
    }
}
