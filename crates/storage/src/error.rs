use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("concurrency conflict on {hash}: expected version {expected}")]
    Concurrency { hash: String, expected: i64 },
    #[error("duplicate record: {0}")]
    Duplicate(String),
    #[error("invalid stored data: {0}")]
    InvalidData(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True for failures that a fresh read-modify-write cycle can fix.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Concurrency { .. })
    }

    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            StoreError::Database(sqlx::Error::Database(db)) => {
                let msg = db.message().to_lowercase();
                msg.contains("database is locked") || msg.contains("busy")
            }
            _ => false,
        }
    }
}
