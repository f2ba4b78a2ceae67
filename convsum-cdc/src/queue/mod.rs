//! Queue transport abstraction
//!
//! The broker delivers at-least-once: every consumer is idempotent by
//! construction instead of trusting exactly-once delivery. The trait
//! mirrors the broker's receive → process → delete contract, including
//! receipt handles and per-message receive counts; `MemoryQueue` backs
//! tests and documents the expected semantics, `HttpQueue` talks to the
//! real broker.

pub mod http;

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

pub use http::HttpQueue;

/// One message handed out by a receive call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Handle for deleting this delivery; changes on redelivery
    pub receipt_handle: String,
    pub body: String,
    /// How many times this message has been delivered, this one included
    pub receive_count: u32,
}

/// Receive-call tuning
#[derive(Debug, Clone, Copy)]
pub struct ReceiveOptions {
    pub max_messages: u32,
    pub wait_secs: u64,
    pub visibility_timeout_secs: u64,
}

/// Broker operations the pipeline relies on
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Publish a message body; returns the broker-assigned message id
    async fn send(&self, queue_url: &str, body: &str) -> PipelineResult<String>;

    /// Receive up to `max_messages`, hiding them for the visibility window
    async fn receive(
        &self,
        queue_url: &str,
        options: ReceiveOptions,
    ) -> PipelineResult<Vec<ReceivedMessage>>;

    /// Acknowledge one delivery; the message is gone for good
    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> PipelineResult<()>;

    /// Startup reachability check
    async fn probe(&self, queue_url: &str) -> PipelineResult<()>;
}

struct StoredMessage {
    message_id: String,
    receipt_handle: String,
    body: String,
    receive_count: u32,
    visible_at: Instant,
}

/// In-process queue with broker semantics, for tests and local runs
///
/// Messages received but not deleted become visible again once their
/// visibility timeout lapses, with an incremented receive count — the
/// same redelivery behavior the real broker provides.
#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, Vec<StoredMessage>>>,
    /// Remaining send calls to fail, for retry-path tests
    send_failures: AtomicU32,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` send calls fail with a transport error
    pub fn fail_next_sends(&self, count: u32) {
        self.send_failures.store(count, Ordering::SeqCst);
    }

    /// Messages currently in the queue, in-flight included
    pub async fn len(&self, queue_url: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue_url)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, queue_url: &str) -> bool {
        self.len(queue_url).await == 0
    }

    /// Peek message bodies without consuming them
    pub async fn bodies(&self, queue_url: &str) -> Vec<String> {
        self.queues
            .lock()
            .await
            .get(queue_url)
            .map(|q| q.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn send(&self, queue_url: &str, body: &str) -> PipelineResult<String> {
        let remaining = self.send_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.send_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::Queue("injected send failure".into()));
        }

        let message_id = Uuid::new_v4().to_string();
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue_url.to_string())
            .or_default()
            .push(StoredMessage {
                message_id: message_id.clone(),
                receipt_handle: String::new(),
                body: body.to_string(),
                receive_count: 0,
                visible_at: Instant::now(),
            });
        Ok(message_id)
    }

    async fn receive(
        &self,
        queue_url: &str,
        options: ReceiveOptions,
    ) -> PipelineResult<Vec<ReceivedMessage>> {
        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let queue = match queues.get_mut(queue_url) {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        for msg in queue.iter_mut() {
            if out.len() as u32 >= options.max_messages {
                break;
            }
            if msg.visible_at > now {
                continue;
            }
            msg.receive_count += 1;
            msg.receipt_handle = Uuid::new_v4().to_string();
            msg.visible_at = now + Duration::from_secs(options.visibility_timeout_secs);
            out.push(ReceivedMessage {
                message_id: msg.message_id.clone(),
                receipt_handle: msg.receipt_handle.clone(),
                body: msg.body.clone(),
                receive_count: msg.receive_count,
            });
        }
        Ok(out)
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> PipelineResult<()> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get_mut(queue_url) {
            queue.retain(|m| m.receipt_handle != receipt_handle);
        }
        Ok(())
    }

    async fn probe(&self, _queue_url: &str) -> PipelineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: &str = "mem://test";

    fn opts(visibility: u64) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: 10,
            wait_secs: 0,
            visibility_timeout_secs: visibility,
        }
    }

    #[tokio::test]
    async fn send_receive_delete_roundtrip() {
        let queue = MemoryQueue::new();
        queue.send(Q, "hello").await.unwrap();

        let messages = queue.receive(Q, opts(60)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hello");
        assert_eq!(messages[0].receive_count, 1);

        // Hidden while in flight
        assert!(queue.receive(Q, opts(60)).await.unwrap().is_empty());

        queue.delete(Q, &messages[0].receipt_handle).await.unwrap();
        assert!(queue.is_empty(Q).await);
    }

    #[tokio::test]
    async fn undeleted_message_redelivers_with_higher_count() {
        let queue = MemoryQueue::new();
        queue.send(Q, "retry me").await.unwrap();

        let first = queue.receive(Q, opts(0)).await.unwrap();
        assert_eq!(first[0].receive_count, 1);

        // Zero visibility: immediately eligible again
        let second = queue.receive(Q, opts(0)).await.unwrap();
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(first[0].receipt_handle, second[0].receipt_handle);
    }

    #[tokio::test]
    async fn stale_receipt_handle_deletes_nothing() {
        let queue = MemoryQueue::new();
        queue.send(Q, "keep").await.unwrap();

        let first = queue.receive(Q, opts(0)).await.unwrap();
        let _second = queue.receive(Q, opts(0)).await.unwrap();

        // First handle was superseded by the redelivery
        queue.delete(Q, &first[0].receipt_handle).await.unwrap();
        assert_eq!(queue.len(Q).await, 1);
    }

    #[tokio::test]
    async fn injected_send_failures_then_recover() {
        let queue = MemoryQueue::new();
        queue.fail_next_sends(2);

        assert!(queue.send(Q, "a").await.is_err());
        assert!(queue.send(Q, "b").await.is_err());
        assert!(queue.send(Q, "c").await.is_ok());
        assert_eq!(queue.len(Q).await, 1);
    }
}
