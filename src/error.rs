//! Error types for the dataserver.

use thiserror::Error;

/// Main error type for connection handling and request dispatch.
#[derive(Debug, Error)]
pub enum DataserverError {
    /// I/O error while binding or serving.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error on an outbound envelope.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inbound payload could not be decoded into an envelope.
    #[error("{0}")]
    Decode(String),

    /// Binary frames are not accepted.
    #[error("Binary data not support!")]
    UnsupportedFrame,

    /// A decoded envelope is missing or has malformed required fields.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// A validated request could not be routed to the query engine.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// The query engine could not be constructed.
    #[error("Engine error: {0}")]
    Engine(String),

    /// The websocket transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - outbound queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using DataserverError.
pub type Result<T> = std::result::Result<T, DataserverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_facing_messages() {
        assert_eq!(
            DataserverError::UnsupportedFrame.to_string(),
            "Binary data not support!"
        );
        assert_eq!(
            DataserverError::Decode("expected value at line 1".into()).to_string(),
            "expected value at line 1"
        );
    }
}
