//! Idempotency tracker
//!
//! One row per conversation_id, written the instant a conversation is
//! successfully enqueued. Its existence is the single source of truth
//! preventing re-dispatch on later poll cycles. Correctness rests on the
//! primary-key constraint, not on application-level locking.

use chrono::Utc;
use convsum_common::models::DispatchRecord;
use sqlx::SqlitePool;

/// Has this conversation already been dispatched?
pub async fn already_dispatched(
    pool: &SqlitePool,
    conversation_id: &str,
) -> Result<bool, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM dispatch_log WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Record a successful dispatch
///
/// Single atomic insert; a concurrent or repeated mark for the same id is
/// a no-op rather than an error, so a restart between publish and mark
/// can at worst produce one duplicate downstream message, which the
/// reconciler's upsert absorbs.
pub async fn mark_dispatched(
    pool: &SqlitePool,
    conversation_id: &str,
    message_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO dispatch_log (conversation_id, dispatched_at, message_id)
         VALUES (?, ?, ?)
         ON CONFLICT(conversation_id) DO NOTHING",
    )
    .bind(conversation_id)
    .bind(Utc::now())
    .bind(message_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch the dispatch record for a conversation, if any
pub async fn get_record(
    pool: &SqlitePool,
    conversation_id: &str,
) -> Result<Option<DispatchRecord>, sqlx::Error> {
    sqlx::query_as::<_, DispatchRecord>(
        "SELECT conversation_id, dispatched_at, message_id
         FROM dispatch_log WHERE conversation_id = ?",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await
}
