//! Pipeline status: watermark and backfill cursor
//!
//! One `pipeline_status` row per operating mode carries the cursor as
//! explicit durable state (no global mutable variables): the normal-mode
//! watermark is the last-scanned timestamp, the historical cursor is the
//! next unprocessed batch date. Both survive restarts, which is what
//! makes backfill resume from the last completed batch boundary.

use chrono::{DateTime, NaiveDate, Utc};
use convsum_common::{Error, Result};
use sqlx::SqlitePool;

/// Mode key for the normal-mode watermark row
pub const MODE_NORMAL: &str = "normal";
/// Mode key for the historical/backfill cursor row
pub const MODE_HISTORICAL: &str = "historical";

/// Last-scanned source timestamp in normal mode
pub async fn get_watermark(pool: &SqlitePool) -> Result<Option<DateTime<Utc>>> {
    match get_cursor(pool, MODE_NORMAL).await? {
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| Error::Internal(format!("Corrupt watermark '{}': {}", raw, e)))?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
        None => Ok(None),
    }
}

/// Advance the normal-mode watermark
pub async fn set_watermark(pool: &SqlitePool, watermark: DateTime<Utc>) -> Result<()> {
    set_cursor(pool, MODE_NORMAL, &watermark.to_rfc3339()).await
}

/// Next unprocessed backfill batch date
pub async fn get_backfill_cursor(pool: &SqlitePool) -> Result<Option<NaiveDate>> {
    match get_cursor(pool, MODE_HISTORICAL).await? {
        Some(raw) => {
            let parsed = raw
                .parse::<NaiveDate>()
                .map_err(|e| Error::Internal(format!("Corrupt backfill cursor '{}': {}", raw, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Persist the backfill cursor after a completed batch
pub async fn set_backfill_cursor(pool: &SqlitePool, cursor: NaiveDate) -> Result<()> {
    set_cursor(pool, MODE_HISTORICAL, &cursor.to_string()).await
}

/// Add to the processed counter of a mode
pub async fn bump_processed(pool: &SqlitePool, mode: &str, count: i64) -> Result<()> {
    sqlx::query(
        "UPDATE pipeline_status
         SET total_processed = total_processed + ?, updated_at = ?
         WHERE mode = ?",
    )
    .bind(count)
    .bind(Utc::now())
    .bind(mode)
    .execute(pool)
    .await
    .map_err(Error::Database)?;
    Ok(())
}

async fn get_cursor(pool: &SqlitePool, mode: &str) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT cursor FROM pipeline_status WHERE mode = ?")
            .bind(mode)
            .fetch_optional(pool)
            .await
            .map_err(Error::Database)?;
    Ok(row.and_then(|(cursor,)| cursor))
}

async fn set_cursor(pool: &SqlitePool, mode: &str, cursor: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO pipeline_status (mode, cursor, updated_at)
         VALUES (?, ?, ?)
         ON CONFLICT(mode) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
    )
    .bind(mode)
    .bind(cursor)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(Error::Database)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_test_db;
    use chrono::TimeZone;

    #[tokio::test]
    async fn watermark_roundtrip() {
        let pool = setup_test_db().await;
        assert_eq!(get_watermark(&pool).await.unwrap(), None);

        let ts = Utc.with_ymd_and_hms(2026, 8, 27, 12, 0, 0).unwrap();
        set_watermark(&pool, ts).await.unwrap();
        assert_eq!(get_watermark(&pool).await.unwrap(), Some(ts));

        // Advancing overwrites, never duplicates
        let later = ts + chrono::Duration::minutes(5);
        set_watermark(&pool, later).await.unwrap();
        assert_eq!(get_watermark(&pool).await.unwrap(), Some(later));

        let rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pipeline_status WHERE mode = 'normal'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn backfill_cursor_roundtrip() {
        let pool = setup_test_db().await;
        assert_eq!(get_backfill_cursor(&pool).await.unwrap(), None);

        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        set_backfill_cursor(&pool, date).await.unwrap();
        assert_eq!(get_backfill_cursor(&pool).await.unwrap(), Some(date));
    }

    #[tokio::test]
    async fn processed_counter_accumulates() {
        let pool = setup_test_db().await;
        set_watermark(&pool, Utc::now()).await.unwrap();

        bump_processed(&pool, MODE_NORMAL, 3).await.unwrap();
        bump_processed(&pool, MODE_NORMAL, 2).await.unwrap();

        let total: i64 = sqlx::query_scalar(
            "SELECT total_processed FROM pipeline_status WHERE mode = 'normal'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(total, 5);
    }
}
