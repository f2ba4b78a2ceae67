//! Summary store writes
//!
//! The one durable write of the whole pipeline. A result lands as a
//! summary upsert keyed on conversation_id plus one category row per
//! classification label, all inside a single transaction, so duplicate
//! delivery replaces the row instead of duplicating it and a partial
//! write can never be observed.

use chrono::{DateTime, Utc};
use convsum_common::models::ResultMessage;
use convsum_common::{sentiment, text};
use sqlx::SqlitePool;

/// Upper bound on stored summary text
const MAX_SUMMARY_LEN: usize = 4000;
/// Upper bound on stored action-item text
const MAX_ACTION_ITEMS_LEN: usize = 500;

/// One row of the summary store, as persisted
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SummaryRow {
    pub conversation_id: String,
    pub ban: Option<String>,
    pub subscriber_no: Option<String>,
    pub conversation_time: Option<DateTime<Utc>>,
    pub summary_text: String,
    pub sentiment: i64,
    pub classification_primary: Option<String>,
    pub classification_all: String,
    pub satisfaction: Option<i64>,
    pub churn_score: f64,
    pub confidence: f64,
    pub products: String,
    pub action_items: String,
    pub unresolved_issues: String,
    pub model_version: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub processed_at: DateTime<Utc>,
}

/// Persist one successful ML result
///
/// Idempotent on conversation_id: any number of identical writes leaves
/// the store in the same state as exactly one. Callers must only pass
/// messages with success = true.
pub async fn write_result(pool: &SqlitePool, msg: &ResultMessage) -> Result<(), sqlx::Error> {
    let sentiment = sentiment::coerce_ordinal(msg.sentiment.as_ref());

    let mut summary_text = msg.summary_text();
    if summary_text.len() > MAX_SUMMARY_LEN {
        let mut cut = MAX_SUMMARY_LEN;
        while cut > 0 && !summary_text.is_char_boundary(cut) {
            cut -= 1;
        }
        summary_text.truncate(cut);
    }

    let labels = deduped_labels(&msg.classifications);
    let classification_all = labels.join(", ");
    let classification_primary = labels.first().cloned();

    let products = text::normalize_csv(msg.products.as_ref());
    let action_items = text::extract_action_items(msg.action_items.as_ref(), MAX_ACTION_ITEMS_LEN);
    let unresolved = text::normalize_csv(msg.unresolved_issues.as_ref());

    let now = Utc::now();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO conversation_summary (
            conversation_id, ban, subscriber_no, conversation_time,
            summary_text, sentiment, classification_primary, classification_all,
            satisfaction, churn_score, confidence,
            products, action_items, unresolved_issues,
            model_version, processing_time_ms, processed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(conversation_id) DO UPDATE SET
            ban = excluded.ban,
            subscriber_no = excluded.subscriber_no,
            conversation_time = excluded.conversation_time,
            summary_text = excluded.summary_text,
            sentiment = excluded.sentiment,
            classification_primary = excluded.classification_primary,
            classification_all = excluded.classification_all,
            satisfaction = excluded.satisfaction,
            churn_score = excluded.churn_score,
            confidence = excluded.confidence,
            products = excluded.products,
            action_items = excluded.action_items,
            unresolved_issues = excluded.unresolved_issues,
            model_version = excluded.model_version,
            processing_time_ms = excluded.processing_time_ms,
            processed_at = excluded.processed_at
        "#,
    )
    .bind(&msg.conversation_id)
    .bind(&msg.ban)
    .bind(&msg.subscriber_no)
    .bind(msg.call_time)
    .bind(&summary_text)
    .bind(sentiment)
    .bind(&classification_primary)
    .bind(&classification_all)
    .bind(msg.customer_satisfaction)
    .bind(msg.churn_score())
    .bind(msg.confidence.unwrap_or(0.0))
    .bind(&products)
    .bind(&action_items)
    .bind(&unresolved)
    .bind(&msg.model_version)
    .bind(msg.processing_time)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    // Categories are replaced wholesale with the summary, one row per label
    sqlx::query("DELETE FROM conversation_category WHERE conversation_id = ?")
        .bind(&msg.conversation_id)
        .execute(&mut *tx)
        .await?;

    for label in &labels {
        sqlx::query(
            "INSERT INTO conversation_category (conversation_id, category_code, created_at)
             VALUES (?, ?, ?)",
        )
        .bind(&msg.conversation_id)
        .bind(label)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(())
}

/// Fetch the stored summary for a conversation, if any
pub async fn get_summary(
    pool: &SqlitePool,
    conversation_id: &str,
) -> Result<Option<SummaryRow>, sqlx::Error> {
    sqlx::query_as::<_, SummaryRow>(
        "SELECT * FROM conversation_summary WHERE conversation_id = ?",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await
}

/// Fetch stored category labels for a conversation
pub async fn get_categories(
    pool: &SqlitePool,
    conversation_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT category_code FROM conversation_category
         WHERE conversation_id = ? ORDER BY id ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(c,)| c).collect())
}

/// Trim, drop empties, keep first occurrence order
fn deduped_labels(labels: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for label in labels {
        let trimmed = label.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.iter().any(|l| l == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}
