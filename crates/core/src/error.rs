use storage::models::FileStatus;
use storage::StoreError;
use thiserror::Error;

/// Failure of a lifecycle or coordinator operation.
///
/// The first group are expected business outcomes; callers match on them.
/// The rest wrap infrastructure failures and should go through the error
/// classifier before anything is retried.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file already tracked: {0}")]
    AlreadyTracked(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cannot {operation} file {hash} in status {from}")]
    InvalidStateTransition {
        hash: String,
        operation: &'static str,
        from: FileStatus,
    },

    #[error("{label} on {hash} gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        hash: String,
        label: String,
        attempts: u32,
        last_error: String,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    pub fn invalid_transition(hash: &str, operation: &'static str, from: FileStatus) -> Self {
        LifecycleError::InvalidStateTransition {
            hash: hash.to_string(),
            operation,
            from,
        }
    }

    /// Business failures are final for the current call and never retried.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            LifecycleError::NotFound(_)
                | LifecycleError::AlreadyTracked(_)
                | LifecycleError::InvalidInput(_)
                | LifecycleError::InvalidStateTransition { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cannot merge snapshots of different files: {base} vs {incoming}")]
    IdentityMismatch { base: String, incoming: String },

    #[error("failed to write conflict audit entry: {0}")]
    Audit(#[source] StoreError),
}

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("rollback point {0} not found")]
    PointNotFound(i64),

    #[error("no rollback point recorded for file {0}")]
    NoPointForFile(String),

    #[error("log entry {0} is not a rollback point")]
    NotARollbackPoint(i64),

    #[error("rollback point {id} failed integrity check: {}", issues.join("; "))]
    IntegrityCheckFailed { id: i64, issues: Vec<String> },

    #[error("rollback of point {id} failed: {source}")]
    Execution {
        id: i64,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed rollback point {id}: {reason}")]
    Malformed { id: i64, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of a library move that could not be handed to the retry budget.
#[derive(Debug, Error)]
pub enum MoveError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error("could not record move of {hash}, file restored: {source}")]
    CommitFailedRolledBack {
        hash: String,
        #[source]
        source: LifecycleError,
    },

    #[error("could not record move of {hash} ({commit}) and restoring the file failed: {rollback}")]
    RollbackFailed {
        hash: String,
        commit: LifecycleError,
        rollback: RollbackError,
    },
}
