//! Error types for fieldwatch-core operations.
//!
//! Only ingestion and query calls surface errors to callers. Fan-out failures
//! stay inside the dispatcher (see `dispatcher::DeliveryFailure`).

use std::path::PathBuf;

/// All errors that can occur in fieldwatch-core operations.
#[derive(Debug, thiserror::Error)]
pub enum FieldwatchError {
    // ─────────────────────────────────────────────────────────────────────
    // Ingestion Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid location sample for {worker_id}: {reason}")]
    InvalidSample { worker_id: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ─────────────────────────────────────────────────────────────────────
    // Lookup Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Unknown alert: {0}")]
    UnknownAlert(String),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    // ─────────────────────────────────────────────────────────────────────
    // Messaging Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("{participant_id} is not a participant of conversation {conversation_id}")]
    NotParticipant {
        conversation_id: String,
        participant_id: String,
    },

    #[error("Invalid conversation: {0}")]
    InvalidConversation(String),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl FieldwatchError {
    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            FieldwatchError::InvalidSample { .. } => "invalid_sample",
            FieldwatchError::InvalidRequest(_) => "invalid_params",
            FieldwatchError::UnknownWorker(_) => "unknown_worker",
            FieldwatchError::DuplicateWorker(_) => "duplicate_worker",
            FieldwatchError::UnknownAlert(_) => "unknown_alert",
            FieldwatchError::UnknownConversation(_) => "unknown_conversation",
            FieldwatchError::NotParticipant { .. } => "not_participant",
            FieldwatchError::InvalidConversation(_) => "invalid_conversation",
            FieldwatchError::ConfigMalformed { .. } => "config_malformed",
            FieldwatchError::Io { .. } => "io_error",
        }
    }
}

/// Convenience type alias for Results using FieldwatchError.
pub type Result<T> = std::result::Result<T, FieldwatchError>;

impl From<FieldwatchError> for String {
    fn from(err: FieldwatchError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = FieldwatchError::UnknownWorker("w-1".to_string());
        assert_eq!(err.code(), "unknown_worker");
        assert_eq!(err.to_string(), "Unknown worker: w-1");

        let err = FieldwatchError::InvalidSample {
            worker_id: "w-1".to_string(),
            reason: "accuracy 120.0m exceeds 50.0m".to_string(),
        };
        assert_eq!(err.code(), "invalid_sample");
    }
}
