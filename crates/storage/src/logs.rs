//! Append-only processing log store.

use crate::error::StoreError;
use crate::models::{from_millis, to_millis, LogQuery, NewProcessingLog, ProcessingLog};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

#[async_trait::async_trait]
pub trait LogStore: Send + Sync {
    /// Appends an entry and returns its id once the insert has committed.
    async fn add(&self, entry: NewProcessingLog) -> Result<i64, StoreError>;
    /// Active entry by id.
    async fn get(&self, id: i64) -> Result<Option<ProcessingLog>, StoreError>;
    /// Active entries matching `query`, newest first.
    async fn query(&self, query: &LogQuery) -> Result<Vec<ProcessingLog>, StoreError>;
    /// Soft-deletes entries of `category` created before `cutoff`; returns the row count.
    async fn soft_delete_before(
        &self,
        category: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn latest(
        &self,
        file_hash: &str,
        category: &str,
    ) -> Result<Option<ProcessingLog>, StoreError> {
        let rows = self
            .query(&LogQuery {
                file_hash: Some(file_hash.to_string()),
                category: Some(category.to_string()),
                limit: Some(1),
                ..LogQuery::default()
            })
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[derive(Clone)]
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LogStore for SqliteLogStore {
    async fn add(&self, entry: NewProcessingLog) -> Result<i64, StoreError> {
        let details = entry
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let res = sqlx::query(
            "INSERT INTO processing_logs (file_hash, level, category, message, details_json, created_date, is_active) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
        )
        .bind(&entry.file_hash)
        .bind(entry.level.as_str())
        .bind(&entry.category)
        .bind(&entry.message)
        .bind(details)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> Result<Option<ProcessingLog>, StoreError> {
        let row = sqlx::query(
            "SELECT id, file_hash, level, category, message, details_json, created_date, is_active FROM processing_logs WHERE id = ?1 AND is_active = 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<ProcessingLog>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, file_hash, level, category, message, details_json, created_date, is_active FROM processing_logs WHERE is_active = 1",
        );
        if let Some(hash) = &query.file_hash {
            qb.push(" AND file_hash = ").push_bind(hash.clone());
        }
        if let Some(category) = &query.category {
            qb.push(" AND category = ").push_bind(category.clone());
        }
        if let Some(since) = query.since {
            qb.push(" AND created_date >= ").push_bind(to_millis(since));
        }
        if let Some(until) = query.until {
            qb.push(" AND created_date < ").push_bind(to_millis(until));
        }
        qb.push(" ORDER BY created_date DESC, id DESC");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn soft_delete_before(
        &self,
        category: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let res = sqlx::query(
            "UPDATE processing_logs SET is_active = 0 WHERE category = ?1 AND created_date < ?2 AND is_active = 1",
        )
        .bind(category)
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

fn log_from_row(row: &SqliteRow) -> Result<ProcessingLog, StoreError> {
    let level: String = row.try_get("level")?;
    let details: Option<String> = row.try_get("details_json")?;
    Ok(ProcessingLog {
        id: row.try_get("id")?,
        file_hash: row.try_get("file_hash")?,
        level: level.parse().map_err(StoreError::InvalidData)?,
        category: row.try_get("category")?,
        message: row.try_get("message")?,
        details: details.as_deref().map(serde_json::from_str).transpose()?,
        created_date: from_millis(row.try_get("created_date")?),
        is_active: row.try_get("is_active")?,
    })
}
