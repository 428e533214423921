//! Error types for account API operations.

use database::DatabaseError;
use message_bus::BusError;
use thiserror::Error;

/// Errors that can occur while acting on behalf of an account.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Persistence failed.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Publishing to the bus failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// A contact or opt-out store failed.
    #[error("store error: {0}")]
    Store(String),

    /// No tag could be acquired for the conversation.
    #[error("no spare messaging tags in pool {pool}")]
    NoSpareTags { pool: String },

    /// The conversation has no delivery pool configured.
    #[error("conversation {key} has no delivery tag pool")]
    NoDeliveryPool { key: String },

    /// A server-initiated conversation needs recipients.
    #[error("conversation {key} has no contact groups")]
    NoContactGroups { key: String },

    /// Conversation does not exist or belongs to another account.
    #[error("conversation not found: {key}")]
    ConversationNotFound { key: String },

    /// Conversation has already ended.
    #[error("conversation {key} has already finished")]
    ConversationFinished { key: String },

    /// Conversation already has a batch.
    #[error("conversation {key} has already been started")]
    ConversationAlreadyStarted { key: String },
}

/// Result type for account API operations.
pub type Result<T> = std::result::Result<T, ApiError>;
