// ABOUTME: Error taxonomy for lease, queue, watcher and serializer operations
// ABOUTME: Separates retryable contention and cancellation from fatal failures

use thiserror::Error;

pub type Result<T, E = StateError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The lease could not be taken within its retry budget.
    #[error("lease {key} not obtained")]
    NotObtained { key: String },

    #[error("lease {key} expired or changed hands")]
    LeaseExpired { key: String },

    #[error("operation canceled")]
    Canceled,

    #[error("{kind} record has no usable {strategy} for document identity")]
    Identity {
        kind: &'static str,
        strategy: &'static str,
    },

    #[error("upstream change stream failed: {0}")]
    Upstream(String),

    #[error("store transaction failed: {0}")]
    Store(String),

    #[error("document {path} is malformed: {reason}")]
    Malformed { path: String, reason: String },

    #[error("queue {dataset} is empty")]
    QueueEmpty { dataset: String },

    #[error("unknown record kind: {0}")]
    UnknownKind(String),

    #[error("no handler registered for {0} records")]
    UnsupportedKind(&'static str),

    #[error("failed to encode record: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("failed to decode record: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache backend error: {0:#}")]
    Cache(#[source] anyhow::Error),
}

impl StateError {
    /// Ordinary contention: the caller may retry the whole operation.
    pub fn is_contention(&self) -> bool {
        matches!(self, StateError::NotObtained { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, StateError::Canceled)
    }

    /// Message safe to hand to an external caller; internal detail stays in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            StateError::NotObtained { .. } | StateError::LeaseExpired { .. } => "resource busy",
            StateError::Canceled => "request canceled",
            StateError::QueueEmpty { .. } => "no pending items",
            StateError::UnknownKind(_) | StateError::UnsupportedKind(_) | StateError::Json(_) => {
                "unsupported payload"
            }
            _ => "internal error",
        }
    }
}
