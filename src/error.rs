//! Error types for a3s-txlog

use thiserror::Error;

/// Errors that can occur in the correlation and audit pipeline
#[derive(Debug, Error)]
pub enum TxLogError {
    /// `DetailLog::end()` called on an instance that is already closed
    #[error("detailLog call \"end()\", twice")]
    DetailEnded,

    /// `SummaryLog::end()` / `end_async()` called on a closed instance
    #[error("summaryLog is ended")]
    SummaryEnded,

    /// Payload or header validation failure
    #[error("Validation failed at '{path}': {message}")]
    Validation { path: String, message: String },

    /// Bus or HTTP connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Bus or HTTP connection timed out
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    /// Publish failure
    #[error("Failed to publish message to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// Subscribe failure
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    /// A required resource (producer, consumer) has not been set up
    #[error("{0} not initialized")]
    NotInitialized(String),

    /// Message handler failure
    #[error("Handler error: {0}")]
    Handler(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure in a log sink
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TxLogError {
    /// Shorthand for a validation error at `path`
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True for programmer errors (terminal log operation called twice)
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::DetailEnded | Self::SummaryEnded)
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, TxLogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_error_messages() {
        assert_eq!(
            TxLogError::DetailEnded.to_string(),
            "detailLog call \"end()\", twice"
        );
        assert_eq!(TxLogError::SummaryEnded.to_string(), "summaryLog is ended");
        assert!(TxLogError::DetailEnded.is_usage_error());
        assert!(!TxLogError::Connection("x".into()).is_usage_error());
    }

    #[test]
    fn test_transport_messages_carry_classification_text() {
        let timeout = TxLogError::ConnectionTimeout("broker 1".into());
        assert!(timeout.to_string().contains("Connection timeout"));

        let conn = TxLogError::Connection("refused".into());
        assert!(conn.to_string().contains("Connection error"));
    }

    #[test]
    fn test_validation_error_carries_path() {
        let err = TxLogError::validation("body.email", "is required");
        assert_eq!(
            err.to_string(),
            "Validation failed at 'body.email': is required"
        );
    }
}
