//! Storage layer: SQLite schemas and helpers.
//!
//! Holds DB pool setup, the migration runner and the two stores the
//! processing core is built on: a keyed tracked-file store and an
//! append-only processing log.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub mod error;
pub mod files;
pub mod logs;
pub mod models;

pub use error::StoreError;
pub use files::{SqliteTrackedFileStore, TrackedFileStore};
pub use logs::{LogStore, SqliteLogStore};

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let mut url = database_url.to_string();
    if !database_url.starts_with("sqlite:") {
        let path = std::path::PathBuf::from(database_url);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let norm = path.to_string_lossy().replace('\\', "/");
        if path.is_absolute() {
            url = format!("sqlite:///{}?mode=rwc", norm.trim_start_matches('/'));
        } else {
            url = format!("sqlite://{}?mode=rwc", norm);
        }
    }
    let mut opts = SqlitePoolOptions::new();
    if url.contains("memory") {
        // Every pooled connection to :memory: would otherwise be its own database.
        opts = opts.max_connections(1);
    } else {
        opts = opts.max_connections(5);
    }
    let pool = opts.connect(&url).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    // Applies SQLx migrations located in crates/storage/migrations.
    // Safe to run multiple times (idempotent).
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
