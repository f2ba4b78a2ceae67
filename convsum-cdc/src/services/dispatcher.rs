//! Outbound dispatcher
//!
//! Serializes assembled conversations and publishes them to the outbound
//! queue, with bounded retries on transport failure. The idempotency mark
//! is written only after a confirmed publish; on exhausted retries the
//! conversation stays unmarked and the next poll cycle picks it up again.

use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::queue::QueueTransport;
use convsum_common::models::{Conversation, ConversationEnvelope, ErrorKind};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

/// Conversation publisher for the outbound queue
pub struct Dispatcher {
    pool: SqlitePool,
    transport: Arc<dyn QueueTransport>,
    outbound_queue_url: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        pool: SqlitePool,
        transport: Arc<dyn QueueTransport>,
        outbound_queue_url: String,
        max_retries: u32,
        retry_delay_ms: u64,
    ) -> Self {
        Self {
            pool,
            transport,
            outbound_queue_url,
            max_retries,
            retry_delay: Duration::from_millis(retry_delay_ms),
        }
    }

    /// Publish one conversation and record the dispatch
    ///
    /// Returns the broker message id. On exhausted retries the failure is
    /// logged durably and returned; no dispatch record is written, so the
    /// conversation remains eligible for the next cycle.
    pub async fn dispatch(&self, conversation: &Conversation) -> PipelineResult<String> {
        let envelope = ConversationEnvelope::from_conversation(conversation);
        let body = serde_json::to_string(&envelope).map_err(|e| PipelineError::DispatchFailure {
            conversation_id: conversation.conversation_id.clone(),
            detail: format!("envelope serialization: {}", e),
        })?;

        let message_id = self
            .publish_with_retry(&conversation.conversation_id, &body)
            .await?;

        // Publish succeeded but the mark did not: the row is missing, so
        // the conversation will be re-dispatched and the downstream
        // duplicate absorbed by the reconciler's upsert.
        if let Err(e) =
            db::dispatch_log::mark_dispatched(&self.pool, &conversation.conversation_id, &message_id)
                .await
        {
            tracing::warn!(
                conversation_id = %conversation.conversation_id,
                message_id = %message_id,
                "Dispatched but failed to record dispatch mark: {}",
                e
            );
            db::error_log::log_error(
                &self.pool,
                Some(&conversation.conversation_id),
                ErrorKind::DispatchFailure,
                &format!("dispatch mark failed after publish {}: {}", message_id, e),
            )
            .await;
        }

        Ok(message_id)
    }

    async fn publish_with_retry(&self, conversation_id: &str, body: &str) -> PipelineResult<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.send(&self.outbound_queue_url, body).await {
                Ok(message_id) => {
                    tracing::debug!(
                        conversation_id = %conversation_id,
                        message_id = %message_id,
                        attempt,
                        "Conversation published"
                    );
                    return Ok(message_id);
                }
                Err(e) if attempt < self.max_retries => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        attempt,
                        max_retries = self.max_retries,
                        "Publish failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    let detail = format!("publish failed after {} attempts: {}", attempt, e);
                    db::error_log::log_error(
                        &self.pool,
                        Some(conversation_id),
                        ErrorKind::DispatchFailure,
                        &detail,
                    )
                    .await;
                    return Err(PipelineError::DispatchFailure {
                        conversation_id: conversation_id.to_string(),
                        detail,
                    });
                }
            }
        }
    }
}
