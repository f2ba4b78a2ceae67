//! HTTP queue broker client
//!
//! Talks to the message broker over a JSON HTTP API (SQS-style
//! send/receive/delete with receipt handles and receive counts). One
//! client serves all queues; the queue URL identifies the target.

use crate::error::{PipelineError, PipelineResult};
use crate::queue::{QueueTransport, ReceiveOptions, ReceivedMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const USER_AGENT: &str = concat!("convsum-cdc/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceiveRequest {
    max_messages: u32,
    wait_secs: u64,
    visibility_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiveResponse {
    #[serde(default)]
    messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest<'a> {
    receipt_handle: &'a str,
}

/// Queue broker client over reqwest
pub struct HttpQueue {
    http_client: reqwest::Client,
}

impl HttpQueue {
    /// Build a client with a bounded request timeout
    ///
    /// The timeout must exceed the longest receive wait, otherwise
    /// long polls would be cut off as transport errors.
    pub fn new(request_timeout: Duration) -> PipelineResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| PipelineError::Queue(e.to_string()))?;
        Ok(Self { http_client })
    }

    async fn post_json<B: Serialize>(
        &self,
        url: String,
        body: &B,
    ) -> PipelineResult<reqwest::Response> {
        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::Queue(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PipelineError::Queue(format!(
                "{} returned {}: {}",
                url, status, detail
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl QueueTransport for HttpQueue {
    async fn send(&self, queue_url: &str, body: &str) -> PipelineResult<String> {
        let response = self
            .post_json(format!("{}/send", queue_url), &SendRequest { body })
            .await?;
        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Queue(format!("Invalid send response: {}", e)))?;
        Ok(parsed.message_id)
    }

    async fn receive(
        &self,
        queue_url: &str,
        options: ReceiveOptions,
    ) -> PipelineResult<Vec<ReceivedMessage>> {
        let request = ReceiveRequest {
            max_messages: options.max_messages,
            wait_secs: options.wait_secs,
            visibility_timeout_secs: options.visibility_timeout_secs,
        };
        let response = self
            .post_json(format!("{}/receive", queue_url), &request)
            .await?;
        let parsed: ReceiveResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Queue(format!("Invalid receive response: {}", e)))?;
        Ok(parsed.messages)
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> PipelineResult<()> {
        self.post_json(
            format!("{}/delete", queue_url),
            &DeleteRequest { receipt_handle },
        )
        .await?;
        Ok(())
    }

    async fn probe(&self, queue_url: &str) -> PipelineResult<()> {
        let url = format!("{}/attributes", queue_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::Queue(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(PipelineError::Queue(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}
