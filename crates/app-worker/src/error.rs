//! Error types for the application worker.

use account_api::ApiError;
use database::DatabaseError;
use message_bus::BusError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while running a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error from the account API.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Error from the database.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Error publishing to or consuming from the bus.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Invalid worker configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The command table could not be built.
    #[error("invalid command table: {0}")]
    CommandTable(String),

    /// A command was missing a required argument or carried a bad one.
    #[error("invalid {command} command: {reason}")]
    InvalidCommand { command: String, reason: String },

    /// The application rejected a command or message.
    #[error("application error: {0}")]
    Application(String),

    /// The control queue closed while the worker was running.
    #[error("control stream ended")]
    StreamEnded,
}

impl WorkerError {
    pub(crate) fn invalid_command(command: &str, reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            command: command.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
