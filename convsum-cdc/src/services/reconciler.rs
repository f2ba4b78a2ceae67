//! Inbound reconciler
//!
//! Drains the inbound queue and folds successful ML results into the
//! summary store. Every handled message is deleted exactly when its
//! outcome is durable: written, skipped with a durable log entry, or
//! diverted to the dead-letter queue. A message whose store write fails
//! is left in flight so the broker redelivers it.

use crate::db;
use crate::error::PipelineResult;
use crate::queue::{QueueTransport, ReceiveOptions, ReceivedMessage};
use crate::services::stats::PipelineStats;
use convsum_common::models::{ErrorKind, ResultMessage, MSG_TYPE_CONFIG, MSG_TYPE_RESULT};
use convsum_common::sentiment::{self, ScoringConfig};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Side-channel scoring threshold update
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigUpdateMessage {
    #[serde(rename = "type")]
    message_type: Option<String>,
    scoring: Option<ScoringConfig>,
}

/// Inbound result consumer
pub struct Reconciler {
    pool: SqlitePool,
    transport: Arc<dyn QueueTransport>,
    inbound_queue_url: String,
    dead_letter_queue_url: String,
    receive_options: ReceiveOptions,
    max_receive_count: u32,
    scoring: watch::Sender<ScoringConfig>,
    stats: Arc<PipelineStats>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        transport: Arc<dyn QueueTransport>,
        inbound_queue_url: String,
        dead_letter_queue_url: String,
        receive_options: ReceiveOptions,
        max_receive_count: u32,
        scoring: watch::Sender<ScoringConfig>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            pool,
            transport,
            inbound_queue_url,
            dead_letter_queue_url,
            receive_options,
            max_receive_count,
            scoring,
            stats,
        }
    }

    /// Consume the inbound queue until cancelled
    pub async fn run(&self, cancel: CancellationToken, idle_delay: Duration) {
        tracing::info!(queue = %self.inbound_queue_url, "Reconciler started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let handled = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once() => match result {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!("Inbound receive failed: {}", e);
                        0
                    }
                },
            };
            if handled == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(idle_delay) => {}
                }
            }
        }
        tracing::info!("Reconciler stopped");
    }

    /// Drain the inbound queue until a receive comes back empty
    ///
    /// Used by flush mode; returns the total number of messages handled.
    pub async fn drain(&self) -> PipelineResult<usize> {
        let mut total = 0;
        loop {
            let handled = self.poll_once().await?;
            if handled == 0 {
                return Ok(total);
            }
            total += handled;
        }
    }

    /// Receive and handle one batch; returns the number of messages seen
    pub async fn poll_once(&self) -> PipelineResult<usize> {
        let messages = self
            .transport
            .receive(&self.inbound_queue_url, self.receive_options)
            .await?;

        let count = messages.len();
        for message in messages {
            self.stats.record_result_received();
            self.handle_message(message).await;
        }
        Ok(count)
    }

    /// Handle one delivery; never propagates, the outcome decides deletion
    async fn handle_message(&self, message: ReceivedMessage) {
        if message.receive_count > self.max_receive_count {
            self.dead_letter(message).await;
            return;
        }

        let value: serde_json::Value = match serde_json::from_str(&message.body) {
            Ok(v) => v,
            Err(e) => {
                db::error_log::log_error(
                    &self.pool,
                    None,
                    ErrorKind::MalformedResult,
                    &format!("unparseable message body: {}", e),
                )
                .await;
                self.delete(&message).await;
                return;
            }
        };

        let message_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match message_type {
            MSG_TYPE_CONFIG => {
                self.apply_config_update(&message.body).await;
                self.delete(&message).await;
            }
            // Untyped messages are treated as results for tolerance of
            // older ML service versions that omitted the attribute
            MSG_TYPE_RESULT | "" => self.handle_result(message, value).await,
            other => {
                db::error_log::log_error(
                    &self.pool,
                    None,
                    ErrorKind::MalformedResult,
                    &format!("unrecognized message type '{}'", other),
                )
                .await;
                self.delete(&message).await;
            }
        }
    }

    async fn handle_result(&self, message: ReceivedMessage, value: serde_json::Value) {
        let result: ResultMessage = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                db::error_log::log_error(
                    &self.pool,
                    None,
                    ErrorKind::MalformedResult,
                    &format!("invalid result message: {}", e),
                )
                .await;
                self.delete(&message).await;
                return;
            }
        };

        if result.conversation_id.is_empty() {
            db::error_log::log_error(
                &self.pool,
                None,
                ErrorKind::MalformedResult,
                "result message without conversation id",
            )
            .await;
            self.delete(&message).await;
            return;
        }

        // Results are only accepted for conversations this pipeline
        // actually dispatched; anything else is a stray and is dropped
        match db::dispatch_log::already_dispatched(&self.pool, &result.conversation_id).await {
            Ok(true) => {}
            Ok(false) => {
                db::error_log::log_error(
                    &self.pool,
                    Some(&result.conversation_id),
                    ErrorKind::ResultSkipped,
                    "result without matching dispatch record",
                )
                .await;
                self.stats.record_result_skipped();
                self.delete(&message).await;
                return;
            }
            Err(e) => {
                // Store unreachable; keep the message for redelivery
                tracing::warn!(
                    conversation_id = %result.conversation_id,
                    "Dispatch record lookup failed, retaining message: {}",
                    e
                );
                return;
            }
        }

        if !result.success {
            db::error_log::log_error(
                &self.pool,
                Some(&result.conversation_id),
                ErrorKind::ResultSkipped,
                &format!(
                    "ML processing failed: {}",
                    result.error.as_deref().unwrap_or("no detail")
                ),
            )
            .await;
            self.stats.record_result_skipped();
            self.delete(&message).await;
            return;
        }

        match db::summary::write_result(&self.pool, &result).await {
            Ok(()) => {
                let ordinal = sentiment::coerce_ordinal(result.sentiment.as_ref());
                let category = self.scoring.borrow().category(Some(ordinal));
                tracing::info!(
                    conversation_id = %result.conversation_id,
                    sentiment = ordinal,
                    category = category.as_str(),
                    "Summary reconciled"
                );
                self.stats.record_result_written();
                self.delete(&message).await;
            }
            Err(e) => {
                // No delete: the broker redelivers after the visibility
                // window and the upsert makes the retry safe
                db::error_log::log_error(
                    &self.pool,
                    Some(&result.conversation_id),
                    ErrorKind::ReconcileWriteFailure,
                    &format!("summary write failed: {}", e),
                )
                .await;
                tracing::warn!(
                    conversation_id = %result.conversation_id,
                    "Summary write failed, message retained: {}",
                    e
                );
            }
        }
    }

    async fn apply_config_update(&self, body: &str) {
        match serde_json::from_str::<ConfigUpdateMessage>(body) {
            Ok(update) => {
                debug_assert_eq!(update.message_type.as_deref(), Some(MSG_TYPE_CONFIG));
                match update.scoring {
                    Some(scoring) => {
                        self.scoring.send_replace(scoring);
                        tracing::info!(
                            negative_max = scoring.negative_max,
                            positive_min = scoring.positive_min,
                            "Scoring thresholds updated"
                        );
                    }
                    None => {
                        tracing::warn!("Config update without scoring payload ignored");
                    }
                }
            }
            Err(e) => {
                db::error_log::log_error(
                    &self.pool,
                    None,
                    ErrorKind::MalformedResult,
                    &format!("invalid config update: {}", e),
                )
                .await;
            }
        }
    }

    /// Divert a poison message to the dead-letter queue
    ///
    /// The inbound copy is deleted only after the dead-letter publish
    /// succeeds; a failed publish leaves the message to try again on the
    /// next redelivery.
    async fn dead_letter(&self, message: ReceivedMessage) {
        let conversation_id = serde_json::from_str::<serde_json::Value>(&message.body)
            .ok()
            .and_then(|v| {
                v.get("conversationId")
                    .and_then(|id| id.as_str())
                    .map(str::to_string)
            });

        if let Err(e) = self
            .transport
            .send(&self.dead_letter_queue_url, &message.body)
            .await
        {
            tracing::warn!(
                message_id = %message.message_id,
                "Dead-letter publish failed, message retained: {}",
                e
            );
            return;
        }

        db::error_log::record_dead_letter(
            &self.pool,
            conversation_id.as_deref(),
            &message.body,
            message.receive_count,
        )
        .await;
        db::error_log::log_error(
            &self.pool,
            conversation_id.as_deref(),
            ErrorKind::DeadLettered,
            &format!("diverted after {} deliveries", message.receive_count),
        )
        .await;
        self.stats.record_dead_lettered();
        self.delete(&message).await;
    }

    async fn delete(&self, message: &ReceivedMessage) {
        if let Err(e) = self
            .transport
            .delete(&self.inbound_queue_url, &message.receipt_handle)
            .await
        {
            // Worst case is one redelivery of an already-handled message,
            // which every handler path absorbs
            tracing::warn!(
                message_id = %message.message_id,
                "Failed to delete handled message: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_test_db;
    use crate::queue::MemoryQueue;
    use serde_json::json;

    const INBOUND: &str = "mem://inbound";
    const DLQ: &str = "mem://dead-letter";

    struct Fixture {
        pool: SqlitePool,
        queue: Arc<MemoryQueue>,
        reconciler: Reconciler,
        scoring_rx: watch::Receiver<ScoringConfig>,
    }

    async fn fixture(max_receive_count: u32) -> Fixture {
        let pool = setup_test_db().await;
        let queue = Arc::new(MemoryQueue::new());
        let (scoring_tx, scoring_rx) = watch::channel(ScoringConfig::default());
        let reconciler = Reconciler::new(
            pool.clone(),
            queue.clone(),
            INBOUND.to_string(),
            DLQ.to_string(),
            ReceiveOptions {
                max_messages: 10,
                wait_secs: 0,
                visibility_timeout_secs: 0,
            },
            max_receive_count,
            scoring_tx,
            Arc::new(PipelineStats::new()),
        );
        Fixture {
            pool,
            queue,
            reconciler,
            scoring_rx,
        }
    }

    fn success_body(conversation_id: &str) -> String {
        json!({
            "type": "ML_PROCESSING_RESULT",
            "conversationId": conversation_id,
            "success": true,
            "sentiment": 4,
            "classifications": ["billing"],
            "summary": "customer asked about invoice",
            "confidence": 0.9,
            "churnConfidence": 0.1
        })
        .to_string()
    }

    #[tokio::test]
    async fn successful_result_written_and_deleted() {
        let f = fixture(5).await;
        db::dispatch_log::mark_dispatched(&f.pool, "1001", "m-1")
            .await
            .unwrap();
        f.queue.send(INBOUND, &success_body("1001")).await.unwrap();

        assert_eq!(f.reconciler.poll_once().await.unwrap(), 1);

        let row = db::summary::get_summary(&f.pool, "1001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.sentiment, 4);
        assert!(f.queue.is_empty(INBOUND).await);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let f = fixture(5).await;
        db::dispatch_log::mark_dispatched(&f.pool, "1001", "m-1")
            .await
            .unwrap();
        f.queue.send(INBOUND, &success_body("1001")).await.unwrap();
        f.queue.send(INBOUND, &success_body("1001")).await.unwrap();

        f.reconciler.poll_once().await.unwrap();
        f.reconciler.poll_once().await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversation_summary WHERE conversation_id = '1001'",
        )
        .fetch_one(&f.pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert!(f.queue.is_empty(INBOUND).await);
    }

    #[tokio::test]
    async fn failed_result_skipped_without_store_write() {
        let f = fixture(5).await;
        db::dispatch_log::mark_dispatched(&f.pool, "1001", "m-1")
            .await
            .unwrap();
        let body = json!({
            "type": "ML_PROCESSING_RESULT",
            "conversationId": "1001",
            "success": false,
            "error": "model timeout"
        })
        .to_string();
        f.queue.send(INBOUND, &body).await.unwrap();

        f.reconciler.poll_once().await.unwrap();

        assert!(db::summary::get_summary(&f.pool, "1001")
            .await
            .unwrap()
            .is_none());
        let skipped = db::error_log::count_errors(&f.pool, "1001", ErrorKind::ResultSkipped)
            .await
            .unwrap();
        assert_eq!(skipped, 1);
        assert!(f.queue.is_empty(INBOUND).await);
    }

    #[tokio::test]
    async fn result_without_dispatch_record_dropped() {
        let f = fixture(5).await;
        f.queue.send(INBOUND, &success_body("9999")).await.unwrap();

        f.reconciler.poll_once().await.unwrap();

        assert!(db::summary::get_summary(&f.pool, "9999")
            .await
            .unwrap()
            .is_none());
        let skipped = db::error_log::count_errors(&f.pool, "9999", ErrorKind::ResultSkipped)
            .await
            .unwrap();
        assert_eq!(skipped, 1);
        assert!(f.queue.is_empty(INBOUND).await);
    }

    #[tokio::test]
    async fn malformed_body_logged_and_drained() {
        let f = fixture(5).await;
        f.queue.send(INBOUND, "{not json").await.unwrap();

        f.reconciler.poll_once().await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM error_log WHERE kind = 'MALFORMED_RESULT'",
        )
        .fetch_one(&f.pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert!(f.queue.is_empty(INBOUND).await);
    }

    #[tokio::test]
    async fn config_update_swaps_thresholds() {
        let f = fixture(5).await;
        let body = json!({
            "type": "CONFIG_UPDATE",
            "scoring": {"negativeMax": 1, "positiveMin": 3}
        })
        .to_string();
        f.queue.send(INBOUND, &body).await.unwrap();

        f.reconciler.poll_once().await.unwrap();

        let scoring = *f.scoring_rx.borrow();
        assert_eq!(scoring.negative_max, 1);
        assert_eq!(scoring.positive_min, 3);
        assert!(f.queue.is_empty(INBOUND).await);
    }

    #[tokio::test]
    async fn poison_message_diverted_to_dead_letter_queue() {
        // max_receive_count 0: the first delivery already exceeds it
        let f = fixture(0).await;
        f.queue.send(INBOUND, &success_body("1001")).await.unwrap();

        f.reconciler.poll_once().await.unwrap();

        assert!(f.queue.is_empty(INBOUND).await);
        assert_eq!(f.queue.len(DLQ).await, 1);

        let (conversation_id,): (Option<String>,) =
            sqlx::query_as("SELECT conversation_id FROM dead_letters")
                .fetch_one(&f.pool)
                .await
                .unwrap();
        assert_eq!(conversation_id.as_deref(), Some("1001"));
    }

    #[tokio::test]
    async fn store_failure_retains_message() {
        let f = fixture(5).await;
        db::dispatch_log::mark_dispatched(&f.pool, "1001", "m-1")
            .await
            .unwrap();
        f.queue.send(INBOUND, &success_body("1001")).await.unwrap();

        f.pool.close().await;
        f.reconciler.poll_once().await.unwrap();

        // Zero visibility in the fixture: still receivable, so retained
        assert_eq!(f.queue.len(INBOUND).await, 1);
    }
}
