//! Data model shared by both pipeline loops
//!
//! The outbound loop reads `TextFragment` rows, assembles them into a
//! `Conversation` and publishes a `ConversationEnvelope`. The inbound
//! loop parses `ResultMessage` bodies back off the queue. Wire types
//! serialize camelCase to match the ML service contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message type attribute on outbound conversation messages
pub const MSG_TYPE_CONVERSATION: &str = "CONVERSATION_ASSEMBLY";
/// Message type attribute on inbound ML result messages
pub const MSG_TYPE_RESULT: &str = "ML_PROCESSING_RESULT";
/// Message type attribute on inbound scoring-config updates
pub const MSG_TYPE_CONFIG: &str = "CONFIG_UPDATE";

/// Speaker role on a transcript fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerRole {
    Customer,
    Agent,
    /// Unresolvable owner flag; labeled rather than discarded silently
    Other,
}

impl OwnerRole {
    /// Resolve the source table's owner flag to a role
    ///
    /// The source writer uses single-letter channel codes ('C' customer,
    /// 'A' agent); full words are accepted for robustness.
    pub fn from_owner_flag(flag: &str) -> Self {
        match flag.trim().to_ascii_uppercase().as_str() {
            "C" | "CUSTOMER" => OwnerRole::Customer,
            "A" | "AGENT" => OwnerRole::Agent,
            _ => OwnerRole::Other,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, OwnerRole::Other)
    }
}

/// One row of transcript text from the source table
///
/// Immutable once read; produced by an external writer outside this
/// system's control.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TextFragment {
    pub conversation_id: String,
    /// Billing account number of the calling party
    pub ban: Option<String>,
    pub subscriber_no: Option<String>,
    /// Raw owner flag as stored; resolved to `OwnerRole` at assembly
    pub owner: Option<String>,
    pub text: Option<String>,
    pub fragment_time: DateTime<Utc>,
    pub call_start_time: Option<DateTime<Utc>>,
}

/// One fragment inside an assembled conversation, role resolved
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationFragment {
    pub role: OwnerRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A reassembled, time-ordered conversation
///
/// Built once per dispatch cycle and discarded after serialization.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub conversation_id: String,
    pub ban: Option<String>,
    pub subscriber_no: Option<String>,
    /// Start time of the call (first fragment's conversation start)
    pub call_time: Option<DateTime<Utc>>,
    /// Ordered by fragment_time, ties broken by insertion order
    pub fragments: Vec<ConversationFragment>,
}

/// Outbound queue message: a complete conversation for ML scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub conversation_id: String,
    pub ban: Option<String>,
    pub subscriber_no: Option<String>,
    pub call_time: Option<DateTime<Utc>>,
    pub messages: Vec<ConversationFragment>,
    pub message_count: usize,
    pub assembled_at: DateTime<Utc>,
    pub source: String,
}

impl ConversationEnvelope {
    pub fn from_conversation(conversation: &Conversation) -> Self {
        Self {
            message_type: MSG_TYPE_CONVERSATION.to_string(),
            conversation_id: conversation.conversation_id.clone(),
            ban: conversation.ban.clone(),
            subscriber_no: conversation.subscriber_no.clone(),
            call_time: conversation.call_time,
            message_count: conversation.fragments.len(),
            messages: conversation.fragments.clone(),
            assembled_at: Utc::now(),
            source: "on-premises-cdc".to_string(),
        }
    }
}

/// Inbound queue message: one ML scoring result
///
/// The ML service is loose about field shapes (sentiment may be a number,
/// a label, or an object; summary may be a string or `{ "text": ... }`),
/// so lenient `serde_json::Value` fields are coerced by accessors instead
/// of failing deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultMessage {
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    pub conversation_id: String,
    pub success: bool,
    /// Account identifiers echoed back from the outbound envelope
    pub ban: Option<String>,
    pub subscriber_no: Option<String>,
    pub call_time: Option<DateTime<Utc>>,
    pub sentiment: Option<serde_json::Value>,
    pub classifications: Vec<String>,
    pub summary: Option<serde_json::Value>,
    pub confidence: Option<f64>,
    /// Embedding-based churn confidence, 0.0..=1.0
    pub churn_confidence: Option<f64>,
    pub customer_satisfaction: Option<i64>,
    pub products: Option<serde_json::Value>,
    pub action_items: Option<serde_json::Value>,
    pub unresolved_issues: Option<serde_json::Value>,
    pub processing_time: Option<i64>,
    pub model_version: Option<String>,
    /// Error detail from the ML service when success is false
    pub error: Option<String>,
}

impl ResultMessage {
    /// Free-text summary, unwrapping the object form
    pub fn summary_text(&self) -> String {
        match &self.summary {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Object(map)) => map
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        }
    }

    /// Churn score on the 0-100 scale stored in the summary table
    pub fn churn_score(&self) -> f64 {
        self.churn_confidence.unwrap_or(0.0).clamp(0.0, 1.0) * 100.0
    }

    /// Primary classification label (first of the list)
    pub fn primary_classification(&self) -> Option<&str> {
        self.classifications
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }
}

/// Durable idempotency entry: proof a conversation was already enqueued
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DispatchRecord {
    pub conversation_id: String,
    pub dispatched_at: DateTime<Utc>,
    pub message_id: String,
}

/// Classification of an error-log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SourceUnavailable,
    AssemblyAnomaly,
    DispatchFailure,
    ReconcileWriteFailure,
    MalformedResult,
    ResultSkipped,
    DeadLettered,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "SOURCE_UNAVAILABLE",
            ErrorKind::AssemblyAnomaly => "ASSEMBLY_ANOMALY",
            ErrorKind::DispatchFailure => "DISPATCH_FAILURE",
            ErrorKind::ReconcileWriteFailure => "RECONCILE_WRITE_FAILURE",
            ErrorKind::MalformedResult => "MALFORMED_RESULT",
            ErrorKind::ResultSkipped => "RESULT_SKIPPED",
            ErrorKind::DeadLettered => "DEAD_LETTERED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn owner_flag_resolution() {
        assert_eq!(OwnerRole::from_owner_flag("C"), OwnerRole::Customer);
        assert_eq!(OwnerRole::from_owner_flag("a"), OwnerRole::Agent);
        assert_eq!(OwnerRole::from_owner_flag("customer"), OwnerRole::Customer);
        assert_eq!(OwnerRole::from_owner_flag("B"), OwnerRole::Other);
        assert_eq!(OwnerRole::from_owner_flag(""), OwnerRole::Other);
    }

    #[test]
    fn result_message_lenient_parse() {
        let body = json!({
            "type": "ML_PROCESSING_RESULT",
            "conversationId": "1001",
            "success": true,
            "sentiment": 4,
            "classifications": ["billing", "retention"],
            "summary": {"text": "customer asked about invoice"},
            "confidence": 0.93,
            "churnConfidence": 0.25
        });
        let msg: ResultMessage = serde_json::from_value(body).unwrap();
        assert_eq!(msg.conversation_id, "1001");
        assert!(msg.success);
        assert_eq!(msg.summary_text(), "customer asked about invoice");
        assert_eq!(msg.churn_score(), 25.0);
        assert_eq!(msg.primary_classification(), Some("billing"));
    }

    #[test]
    fn result_message_failure_minimal() {
        let body = json!({"conversationId": "1002", "success": false, "error": "timeout"});
        let msg: ResultMessage = serde_json::from_value(body).unwrap();
        assert!(!msg.success);
        assert_eq!(msg.summary_text(), "");
        assert_eq!(msg.primary_classification(), None);
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let conv = Conversation {
            conversation_id: "42".into(),
            ban: Some("B-1".into()),
            subscriber_no: None,
            call_time: None,
            fragments: vec![],
        };
        let envelope = ConversationEnvelope::from_conversation(&conv);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], MSG_TYPE_CONVERSATION);
        assert_eq!(value["conversationId"], "42");
        assert_eq!(value["messageCount"], 0);
        assert!(value.get("subscriberNo").is_some());
    }
}
