//! Error types for message-bus.

use thiserror::Error;

/// Errors that can occur when publishing to or consuming from the bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A consumer is already attached to the queue.
    #[error("queue {queue} already has a consumer")]
    AlreadyConsumed { queue: String },

    /// A message on the queue could not be decoded into the expected envelope.
    #[error("invalid message on {queue}: {reason}")]
    InvalidMessage { queue: String, reason: String },

    /// Invalid routing configuration.
    #[error("invalid routing configuration: {0}")]
    Config(String),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
