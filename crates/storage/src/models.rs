use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Retry ceiling after which a file is parked in [`FileStatus::Error`].
pub const MAX_RETRY_COUNT: i32 = 3;

/// Processing state of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    New,
    Processing,
    Classified,
    ReadyToMove,
    Moved,
    Retry,
    /// Terminal until an operator resets the file.
    Error,
}

impl FileStatus {
    pub const ALL: [FileStatus; 7] = [
        FileStatus::New,
        FileStatus::Processing,
        FileStatus::Classified,
        FileStatus::ReadyToMove,
        FileStatus::Moved,
        FileStatus::Retry,
        FileStatus::Error,
    ];

    /// Total order used to pick a winner when two writers disagree.
    pub fn priority(self) -> u8 {
        match self {
            FileStatus::New => 0,
            FileStatus::Processing => 1,
            FileStatus::Classified => 2,
            FileStatus::ReadyToMove => 3,
            FileStatus::Moved => 4,
            FileStatus::Retry => 5,
            FileStatus::Error => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::New => "new",
            FileStatus::Processing => "processing",
            FileStatus::Classified => "classified",
            FileStatus::ReadyToMove => "ready_to_move",
            FileStatus::Moved => "moved",
            FileStatus::Retry => "retry",
            FileStatus::Error => "error",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "new" => Ok(FileStatus::New),
            "processing" => Ok(FileStatus::Processing),
            "classified" => Ok(FileStatus::Classified),
            "ready_to_move" | "readytomove" => Ok(FileStatus::ReadyToMove),
            "moved" => Ok(FileStatus::Moved),
            "retry" => Ok(FileStatus::Retry),
            "error" => Ok(FileStatus::Error),
            other => Err(format!("unknown file status: {other}")),
        }
    }
}

/// Persisted record of one discovered media file, keyed by content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub file_hash: String,
    pub file_name: String,
    pub original_path: String,
    pub file_size: i64,
    pub status: FileStatus,
    pub suggested_category: Option<String>,
    pub confidence: Option<f64>,
    pub category: Option<String>,
    pub target_path: Option<String>,
    pub moved_to_path: Option<String>,
    pub classified_at: Option<DateTime<Utc>>,
    pub moved_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub created_date: DateTime<Utc>,
    pub last_update_date: DateTime<Utc>,
    /// Optimistic concurrency token, bumped by the store on every commit.
    pub version: i64,
    pub is_active: bool,
    pub note: Option<String>,
}

impl TrackedFile {
    pub fn new(
        file_hash: impl Into<String>,
        file_name: impl Into<String>,
        original_path: impl Into<String>,
        file_size: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            file_hash: file_hash.into(),
            file_name: file_name.into(),
            original_path: original_path.into(),
            file_size,
            status: FileStatus::New,
            suggested_category: None,
            confidence: None,
            category: None,
            target_path: None,
            moved_to_path: None,
            classified_at: None,
            moved_at: None,
            last_error: None,
            last_error_at: None,
            retry_count: 0,
            created_date: now,
            last_update_date: now,
            version: 0,
            is_active: true,
            note: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLog {
    pub id: i64,
    pub file_hash: String,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_date: DateTime<Utc>,
    pub is_active: bool,
}

/// Insert payload for [`ProcessingLog`]; id and creation date are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewProcessingLog {
    pub file_hash: String,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl NewProcessingLog {
    pub fn new(
        file_hash: impl Into<String>,
        level: LogLevel,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            file_hash: file_hash.into(),
            level,
            category: category.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Range query over the log store. Soft-deleted rows are never returned.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub file_hash: Option<String>,
    pub category: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in FileStatus::ALL {
            assert_eq!(status.as_str().parse::<FileStatus>(), Ok(status));
        }
        assert!("archived".parse::<FileStatus>().is_err());
    }

    #[test]
    fn priority_is_a_total_order() {
        let mut priorities: Vec<u8> = FileStatus::ALL.iter().map(|s| s.priority()).collect();
        priorities.dedup();
        assert_eq!(priorities, vec![0, 1, 2, 3, 4, 5, 6]);
        assert!(FileStatus::Error.priority() > FileStatus::Retry.priority());
        assert!(FileStatus::Retry.priority() > FileStatus::Moved.priority());
    }

    #[test]
    fn millis_conversion_truncates_to_milliseconds() {
        let now = Utc::now();
        let back = from_millis(to_millis(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
