//! Application worker core for campaign conversations.
//!
//! An [`ApplicationWorker`] consumes `<worker_name>.control` and, when a
//! transport is configured, the transport's inbound and event queues. Each
//! control command is looked up in a [`CommandTable`] and run on its own
//! task:
//!
//! - `collect_metrics` / `reconcile_cache` are handled by the core, with
//!   an [`InFlightTracker`] dropping duplicates for the same
//!   `(conversation_key, account_key)`
//! - verbs declared by the [`Application`] go to its `handle_command`
//! - anything else is logged and dropped
//!
//! Inbound messages and transport events are stored in the message store,
//! attributed to a conversation, and handed to the application.
//!
//! A [`QueueRelay`] connects the in-process bus to the durable queues in the
//! shared store, so commands published by other processes reach the worker
//! and messages it publishes reach theirs.
//!
//! # Example
//!
//! ```no_run
//! use account_api::CampaignApi;
//! use app_worker::{ApplicationWorker, BulkMessageApplication, WorkerConfig};
//! use database::Database;
//! use message_bus::MessageBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WorkerConfig::new("bulk_message_application", "go.campaigns.")
//!     .with_transport_name("sms_transport");
//!
//! let db = Database::connect(&config.database_url).await?;
//! db.migrate().await?;
//! let api = CampaignApi::new(db, MessageBus::new());
//!
//! let worker = ApplicationWorker::setup_with_api(config, BulkMessageApplication::new(), api).await?;
//! worker
//!     .run_with_shutdown(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod bulk_message;
pub mod command;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod inflight;
pub mod metrics;
pub mod relay;
mod resolve;
pub mod worker;

pub use application::Application;
pub use bulk_message::BulkMessageApplication;
pub use command::{CommandOutcome, CommandTable, Verb};
pub use config::{ConfigError, ConversationConfig, WorkerConfig};
pub use context::WorkerContext;
pub use dispatcher::CommandDispatcher;
pub use error::{Result, WorkerError};
pub use inflight::{InFlightGuard, InFlightTracker};
pub use metrics::{Aggregator, MetricManager};
pub use relay::QueueRelay;
pub use worker::{ApplicationWorker, CommandRunner};
