//! Database access for convsum-cdc
//!
//! One SQLite database holds all pipeline-owned durable state: the
//! dispatch log (idempotency), watermark/backfill cursors, the summary
//! store, the error log and dead-lettered messages. The source fragment
//! table lives in the same database but belongs to an external writer;
//! it is only ever read.

pub mod dispatch_log;
pub mod error_log;
pub mod fragments;
pub mod status;
pub mod summary;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Name of the external source table (read-only)
pub const SOURCE_TABLE: &str = "call_fragments";

/// Initialize database connection pool
///
/// Connects with mode=rwc and creates pipeline-owned tables if missing.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// Create pipeline-owned tables if they don't exist
///
/// Idempotent; safe to run at every startup. The source table is never
/// created here.
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dispatch_log (
            conversation_id TEXT PRIMARY KEY,
            dispatched_at TEXT NOT NULL,
            message_id TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_status (
            mode TEXT PRIMARY KEY,
            cursor TEXT,
            total_processed INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_summary (
            conversation_id TEXT PRIMARY KEY,
            ban TEXT,
            subscriber_no TEXT,
            conversation_time TEXT,
            summary_text TEXT NOT NULL DEFAULT '',
            sentiment INTEGER NOT NULL DEFAULT 3,
            classification_primary TEXT,
            classification_all TEXT NOT NULL DEFAULT '',
            satisfaction INTEGER,
            churn_score REAL NOT NULL DEFAULT 0,
            confidence REAL NOT NULL DEFAULT 0,
            products TEXT NOT NULL DEFAULT '',
            action_items TEXT NOT NULL DEFAULT '',
            unresolved_issues TEXT NOT NULL DEFAULT '',
            model_version TEXT,
            processing_time_ms INTEGER,
            processed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_category (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            category_code TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_category_conversation
        ON conversation_category (conversation_id)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS error_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            reference TEXT,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT,
            message_body TEXT NOT NULL,
            receive_count INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!(
        "Database tables initialized (dispatch_log, pipeline_status, conversation_summary, \
         conversation_category, error_log, dead_letters)"
    );

    Ok(())
}

/// Check the external source table exists
///
/// Missing source data is a warning, not a failure: the writer may simply
/// not have provisioned yet, and the reader degrades to empty cycles.
pub async fn source_table_exists(pool: &SqlitePool) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(SOURCE_TABLE)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use sqlx::SqlitePool;

    /// In-memory pool with pipeline tables plus the source table
    pub async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        super::init_tables(&pool).await.unwrap();

        sqlx::query(
            "CREATE TABLE call_fragments (
                conversation_id TEXT NOT NULL,
                ban TEXT,
                subscriber_no TEXT,
                owner TEXT,
                text TEXT,
                fragment_time TEXT NOT NULL,
                call_start_time TEXT
            )",
        )
        .execute(&pool)
        .await
        .unwrap();

        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_tables_is_idempotent() {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        init_tables(&pool).await.unwrap();
        init_tables(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'dispatch_log'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn source_table_detection() {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        init_tables(&pool).await.unwrap();
        assert!(!source_table_exists(&pool).await.unwrap());

        let pool = test_support::setup_test_db().await;
        assert!(source_table_exists(&pool).await.unwrap());
    }
}
