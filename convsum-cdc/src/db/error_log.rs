//! Durable error log and dead-letter records
//!
//! Append-only; rows are never mutated. Logging here must never
//! interrupt the pipeline, so callers treat failures as best-effort and
//! fall back to tracing.

use chrono::Utc;
use convsum_common::models::ErrorKind;
use sqlx::SqlitePool;

/// Append one error-log entry
///
/// `reference` is a conversation id or batch reference.
pub async fn log_error(
    pool: &SqlitePool,
    reference: Option<&str>,
    kind: ErrorKind,
    message: &str,
) {
    let result = sqlx::query(
        "INSERT INTO error_log (reference, kind, message, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(reference)
    .bind(kind.as_str())
    .bind(message)
    .bind(Utc::now())
    .execute(pool)
    .await;

    if let Err(e) = result {
        // The error log is observability, not correctness; never propagate
        tracing::error!(
            kind = kind.as_str(),
            reference = reference.unwrap_or("-"),
            "Failed to append error log entry: {}",
            e
        );
    }
}

/// Preserve a dead-lettered message body for manual inspection
pub async fn record_dead_letter(
    pool: &SqlitePool,
    conversation_id: Option<&str>,
    body: &str,
    receive_count: u32,
) {
    let result = sqlx::query(
        "INSERT INTO dead_letters (conversation_id, message_body, receive_count, created_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(conversation_id)
    .bind(body)
    .bind(receive_count as i64)
    .bind(Utc::now())
    .execute(pool)
    .await;

    if let Err(e) = result {
        tracing::error!(
            conversation_id = conversation_id.unwrap_or("-"),
            "Failed to record dead letter: {}",
            e
        );
    }
}

/// Count error-log entries of one kind for a reference (test/inspection)
pub async fn count_errors(
    pool: &SqlitePool,
    reference: &str,
    kind: ErrorKind,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM error_log WHERE reference = ? AND kind = ?")
        .bind(reference)
        .bind(kind.as_str())
        .fetch_one(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_test_db;

    #[tokio::test]
    async fn entries_append_only() {
        let pool = setup_test_db().await;

        log_error(&pool, Some("1001"), ErrorKind::DispatchFailure, "publish timed out").await;
        log_error(&pool, Some("1001"), ErrorKind::DispatchFailure, "publish timed out").await;

        let count = count_errors(&pool, "1001", ErrorKind::DispatchFailure)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn dead_letter_preserves_body() {
        let pool = setup_test_db().await;
        record_dead_letter(&pool, Some("1002"), "{\"broken\": true}", 6).await;

        let (body, receive_count): (String, i64) = sqlx::query_as(
            "SELECT message_body, receive_count FROM dead_letters WHERE conversation_id = '1002'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(body, "{\"broken\": true}");
        assert_eq!(receive_count, 6);
    }
}
