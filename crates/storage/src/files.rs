//! Keyed store for [`TrackedFile`] rows with optimistic version checks.

use crate::error::StoreError;
use crate::models::{from_millis, to_millis, FileStatus, TrackedFile};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

#[async_trait::async_trait]
pub trait TrackedFileStore: Send + Sync {
    /// Active row for `hash`, if any.
    async fn get_by_hash(&self, hash: &str) -> Result<Option<TrackedFile>, StoreError>;
    /// Row for `hash` including soft-deleted ones.
    async fn get_by_hash_any(&self, hash: &str) -> Result<Option<TrackedFile>, StoreError>;
    async fn find_by_original_path(&self, path: &str) -> Result<Option<TrackedFile>, StoreError>;
    async fn add(&self, file: &TrackedFile) -> Result<TrackedFile, StoreError>;
    /// Commits `file` only if the persisted version still equals `expected_version`.
    /// The returned row carries the bumped version.
    async fn update(
        &self,
        file: &TrackedFile,
        expected_version: i64,
    ) -> Result<TrackedFile, StoreError>;
    async fn soft_delete(&self, hash: &str) -> Result<(), StoreError>;
    async fn list_by_status(&self, status: FileStatus) -> Result<Vec<TrackedFile>, StoreError>;
}

const COLUMNS: &str = "file_hash, file_name, original_path, file_size, status, suggested_category, confidence, category, target_path, moved_to_path, classified_at, moved_at, last_error, last_error_at, retry_count, created_date, last_update_date, version, is_active, note";

#[derive(Clone)]
pub struct SqliteTrackedFileStore {
    pool: SqlitePool,
}

impl SqliteTrackedFileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        value: &str,
    ) -> Result<Option<TrackedFile>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM tracked_files WHERE {clause} LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }
}

#[async_trait::async_trait]
impl TrackedFileStore for SqliteTrackedFileStore {
    async fn get_by_hash(&self, hash: &str) -> Result<Option<TrackedFile>, StoreError> {
        self.fetch_one_where("file_hash = ?1 AND is_active = 1", hash)
            .await
    }

    async fn get_by_hash_any(&self, hash: &str) -> Result<Option<TrackedFile>, StoreError> {
        self.fetch_one_where("file_hash = ?1", hash).await
    }

    async fn find_by_original_path(&self, path: &str) -> Result<Option<TrackedFile>, StoreError> {
        self.fetch_one_where("original_path = ?1", path).await
    }

    async fn add(&self, file: &TrackedFile) -> Result<TrackedFile, StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO tracked_files (file_hash, file_name, original_path, file_size, status,
                suggested_category, confidence, category, target_path, moved_to_path,
                classified_at, moved_at, last_error, last_error_at, retry_count,
                created_date, last_update_date, version, is_active, note)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            "#,
        )
        .bind(&file.file_hash)
        .bind(&file.file_name)
        .bind(&file.original_path)
        .bind(file.file_size)
        .bind(file.status.as_str())
        .bind(&file.suggested_category)
        .bind(file.confidence)
        .bind(&file.category)
        .bind(&file.target_path)
        .bind(&file.moved_to_path)
        .bind(file.classified_at.map(to_millis))
        .bind(file.moved_at.map(to_millis))
        .bind(&file.last_error)
        .bind(file.last_error_at.map(to_millis))
        .bind(file.retry_count)
        .bind(to_millis(file.created_date))
        .bind(to_millis(file.last_update_date))
        .bind(file.version)
        .bind(file.is_active)
        .bind(&file.note)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => {
                debug!(file_hash = %file.file_hash, "tracked file inserted");
                Ok(truncated(file.clone()))
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(file.file_hash.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        file: &TrackedFile,
        expected_version: i64,
    ) -> Result<TrackedFile, StoreError> {
        let now = Utc::now();
        let next_version = expected_version + 1;
        let res = sqlx::query(
            r#"
            UPDATE tracked_files SET
                file_name = ?3, original_path = ?4, file_size = ?5, status = ?6,
                suggested_category = ?7, confidence = ?8, category = ?9, target_path = ?10,
                moved_to_path = ?11, classified_at = ?12, moved_at = ?13, last_error = ?14,
                last_error_at = ?15, retry_count = ?16, last_update_date = ?17,
                version = ?18, note = ?19
            WHERE file_hash = ?1 AND version = ?2 AND is_active = 1
            "#,
        )
        .bind(&file.file_hash)
        .bind(expected_version)
        .bind(&file.file_name)
        .bind(&file.original_path)
        .bind(file.file_size)
        .bind(file.status.as_str())
        .bind(&file.suggested_category)
        .bind(file.confidence)
        .bind(&file.category)
        .bind(&file.target_path)
        .bind(&file.moved_to_path)
        .bind(file.classified_at.map(to_millis))
        .bind(file.moved_at.map(to_millis))
        .bind(&file.last_error)
        .bind(file.last_error_at.map(to_millis))
        .bind(file.retry_count)
        .bind(to_millis(now))
        .bind(next_version)
        .bind(&file.note)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return match self.get_by_hash(&file.file_hash).await? {
                Some(_) => Err(StoreError::Concurrency {
                    hash: file.file_hash.clone(),
                    expected: expected_version,
                }),
                None => Err(StoreError::NotFound(file.file_hash.clone())),
            };
        }

        let mut committed = file.clone();
        committed.version = next_version;
        committed.last_update_date = now;
        Ok(truncated(committed))
    }

    async fn soft_delete(&self, hash: &str) -> Result<(), StoreError> {
        let res = sqlx::query(
            "UPDATE tracked_files SET is_active = 0, version = version + 1, last_update_date = ?2 WHERE file_hash = ?1 AND is_active = 1",
        )
        .bind(hash)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(hash.to_string()));
        }
        Ok(())
    }

    async fn list_by_status(&self, status: FileStatus) -> Result<Vec<TrackedFile>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM tracked_files WHERE status = ?1 AND is_active = 1 ORDER BY created_date"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(file_from_row).collect()
    }
}

/// Matches what a fresh read returns, timestamps are stored at millisecond precision.
fn truncated(mut file: TrackedFile) -> TrackedFile {
    let trunc = |ts: chrono::DateTime<Utc>| from_millis(to_millis(ts));
    file.classified_at = file.classified_at.map(trunc);
    file.moved_at = file.moved_at.map(trunc);
    file.last_error_at = file.last_error_at.map(trunc);
    file.created_date = trunc(file.created_date);
    file.last_update_date = trunc(file.last_update_date);
    file
}

fn file_from_row(row: &SqliteRow) -> Result<TrackedFile, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<FileStatus>().map_err(StoreError::InvalidData)?;
    let opt_ts = |name: &str| -> Result<_, StoreError> {
        Ok(row.try_get::<Option<i64>, _>(name)?.map(from_millis))
    };
    Ok(TrackedFile {
        file_hash: row.try_get("file_hash")?,
        file_name: row.try_get("file_name")?,
        original_path: row.try_get("original_path")?,
        file_size: row.try_get("file_size")?,
        status,
        suggested_category: row.try_get("suggested_category")?,
        confidence: row.try_get("confidence")?,
        category: row.try_get("category")?,
        target_path: row.try_get("target_path")?,
        moved_to_path: row.try_get("moved_to_path")?,
        classified_at: opt_ts("classified_at")?,
        moved_at: opt_ts("moved_at")?,
        last_error: row.try_get("last_error")?,
        last_error_at: opt_ts("last_error_at")?,
        retry_count: row.try_get("retry_count")?,
        created_date: from_millis(row.try_get("created_date")?),
        last_update_date: from_millis(row.try_get("last_update_date")?),
        version: row.try_get("version")?,
        is_active: row.try_get("is_active")?,
        note: row.try_get("note")?,
    })
}
