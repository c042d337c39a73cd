//! Domain events raised after a lifecycle change has been committed.

use serde::Serialize;
use storage::models::FileStatus;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileEvent {
    Discovered {
        file_hash: String,
        path: String,
        size: i64,
    },
    Classified {
        file_hash: String,
        category: String,
        confidence: f64,
    },
    Confirmed {
        file_hash: String,
        category: String,
        target_path: String,
    },
    Moved {
        file_hash: String,
        moved_to_path: String,
    },
    ErrorRecorded {
        file_hash: String,
        message: String,
        retry_count: i32,
    },
    RetryScheduled {
        file_hash: String,
        delay_ms: u64,
        attempt: u32,
    },
    StatusChanged {
        file_hash: String,
        from: FileStatus,
        to: FileStatus,
    },
}

impl FileEvent {
    pub fn file_hash(&self) -> &str {
        match self {
            FileEvent::Discovered { file_hash, .. }
            | FileEvent::Classified { file_hash, .. }
            | FileEvent::Confirmed { file_hash, .. }
            | FileEvent::Moved { file_hash, .. }
            | FileEvent::ErrorRecorded { file_hash, .. }
            | FileEvent::RetryScheduled { file_hash, .. }
            | FileEvent::StatusChanged { file_hash, .. } => file_hash,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FileEvent::Discovered { .. } => "discovered",
            FileEvent::Classified { .. } => "classified",
            FileEvent::Confirmed { .. } => "confirmed",
            FileEvent::Moved { .. } => "moved",
            FileEvent::ErrorRecorded { .. } => "error_recorded",
            FileEvent::RetryScheduled { .. } => "retry_scheduled",
            FileEvent::StatusChanged { .. } => "status_changed",
        }
    }
}

/// Consumer of lifecycle events (notifications, metrics, dashboards).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FileEvent);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: FileEvent) {}
}

/// Writes each event as a structured tracing line.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: FileEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(
            file_hash = %event.file_hash(),
            event = event.kind(),
            %payload,
            "file event"
        );
    }
}

/// Forwards events to an async consumer. Dropped receivers are ignored.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<FileEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FileEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: FileEvent) {
        let _ = self.tx.send(event);
    }
}
