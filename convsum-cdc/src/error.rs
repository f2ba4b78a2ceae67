//! Error taxonomy for the pipeline service
//!
//! Every variant is caught and logged at the boundary where it occurs;
//! none escapes to crash the poll loop. Fatal-only conditions (missing
//! configuration, unreachable source/queue at boot) surface as plain
//! errors out of `main` before the loops start.

use thiserror::Error;

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline error taxonomy
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Source table unreachable; recoverable, retried next cycle
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Unrecognized role or malformed fragment; logged, fragment excluded
    #[error("Assembly anomaly for {conversation_id}: {detail}")]
    AssemblyAnomaly {
        conversation_id: String,
        detail: String,
    },

    /// Publish failed after bounded retries; deferred to the next cycle
    #[error("Dispatch failure for {conversation_id}: {detail}")]
    DispatchFailure {
        conversation_id: String,
        detail: String,
    },

    /// Summary store write failed; message retained for redelivery
    #[error("Reconcile write failure for {conversation_id}: {detail}")]
    ReconcileWriteFailure {
        conversation_id: String,
        detail: String,
    },

    /// Unparseable result message; logged and discarded, never coerced
    #[error("Malformed result message: {0}")]
    MalformedResult(String),

    /// Queue transport error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Database error outside the taxonomy above
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Shared error from convsum-common
    #[error(transparent)]
    Common(#[from] convsum_common::Error),
}

impl PipelineError {
    /// Error-log kind string for durable error records
    pub fn kind(&self) -> convsum_common::models::ErrorKind {
        use convsum_common::models::ErrorKind;
        match self {
            PipelineError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            PipelineError::AssemblyAnomaly { .. } => ErrorKind::AssemblyAnomaly,
            PipelineError::DispatchFailure { .. } => ErrorKind::DispatchFailure,
            PipelineError::ReconcileWriteFailure { .. } => ErrorKind::ReconcileWriteFailure,
            PipelineError::MalformedResult(_) => ErrorKind::MalformedResult,
            PipelineError::Queue(_) => ErrorKind::DispatchFailure,
            PipelineError::Database(_) | PipelineError::Common(_) => {
                ErrorKind::ReconcileWriteFailure
            }
        }
    }
}
