//! Fragment store reader
//!
//! Read-only access to the external source table. Conversations already
//! present in the dispatch log are excluded at the query level, so a
//! crash between cycles never re-collects finished work. Connectivity
//! failures surface as `SourceUnavailable` and are retried on the next
//! cycle rather than crashing the loop.

use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use convsum_common::models::TextFragment;
use sqlx::SqlitePool;

/// Collect conversation ids with fragments newer than the watermark
///
/// Ordered by first fragment time so older conversations dispatch first.
pub async fn fetch_new_conversation_ids(
    pool: &SqlitePool,
    since: DateTime<Utc>,
    limit: i64,
) -> PipelineResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT conversation_id
        FROM call_fragments
        WHERE fragment_time > ?
          AND conversation_id NOT IN (SELECT conversation_id FROM dispatch_log)
        GROUP BY conversation_id
        ORDER BY MIN(fragment_time) ASC
        LIMIT ?
        "#,
    )
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(source_unavailable)?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Paging position inside a range scan
///
/// Carries the raw stored time text (not a decoded timestamp) so the
/// resume comparison is byte-exact against the column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeCursor {
    pub first_seen: String,
    pub conversation_id: String,
}

/// Collect one page of conversation ids inside a half-open time range
///
/// Backfill paging: rows are keyed on (first fragment time, id) and only
/// entries past `after` are returned, so repeated calls always make
/// progress even when earlier conversations in the range never become
/// dispatchable. The default cursor starts at the beginning of the range.
pub async fn fetch_conversation_ids_in_range(
    pool: &SqlitePool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    after: &RangeCursor,
    limit: i64,
) -> PipelineResult<Vec<(String, RangeCursor)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT conversation_id, MIN(fragment_time) AS first_seen
        FROM call_fragments
        WHERE fragment_time >= ?
          AND fragment_time < ?
          AND conversation_id NOT IN (SELECT conversation_id FROM dispatch_log)
        GROUP BY conversation_id
        HAVING MIN(fragment_time) > ?
            OR (MIN(fragment_time) = ? AND conversation_id > ?)
        ORDER BY MIN(fragment_time) ASC, conversation_id ASC
        LIMIT ?
        "#,
    )
    .bind(start)
    .bind(end)
    .bind(&after.first_seen)
    .bind(&after.first_seen)
    .bind(&after.conversation_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(source_unavailable)?;

    Ok(rows
        .into_iter()
        .map(|(conversation_id, first_seen)| {
            let cursor = RangeCursor {
                first_seen,
                conversation_id: conversation_id.clone(),
            };
            (conversation_id, cursor)
        })
        .collect())
}

/// Fetch every fragment of one conversation, time-ordered
///
/// Ties on fragment_time keep insertion order (rowid), which keeps
/// assembly deterministic.
pub async fn fetch_fragments(
    pool: &SqlitePool,
    conversation_id: &str,
) -> PipelineResult<Vec<TextFragment>> {
    sqlx::query_as::<_, TextFragment>(
        r#"
        SELECT conversation_id, ban, subscriber_no, owner, text,
               fragment_time, call_start_time
        FROM call_fragments
        WHERE conversation_id = ?
        ORDER BY fragment_time ASC, rowid ASC
        "#,
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await
    .map_err(source_unavailable)
}

fn source_unavailable(e: sqlx::Error) -> PipelineError {
    PipelineError::SourceUnavailable(e.to_string())
}
