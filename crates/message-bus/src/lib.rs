//! Message bus envelopes and exchange for the campaign workers.
//!
//! This crate defines everything that travels between the web tier, the
//! application workers and the transports:
//!
//! - [`ApiCommand`] - control-plane instructions addressed to a named worker
//! - [`ApiEvent`] - application-level notifications about a conversation
//! - [`UserMessage`] / [`TransportEvent`] - messages and delivery events
//! - [`MetricMessage`] - aggregated metric datapoints
//! - [`MessageBus`] - an in-process `direct` exchange with durable queues
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use message_bus::{ApiCommand, MessageBus, RoutingConfig};
//!
//! # async fn example() -> Result<(), message_bus::BusError> {
//! let bus = MessageBus::new();
//! let mut control = bus.consume::<ApiCommand>("vumi", "bulk_message_application.control")?;
//!
//! let routing = RoutingConfig::api_commands()
//!     .with_routing_key("bulk_message_application.control");
//! let command = ApiCommand::command("bulk_message_application", "collect_metrics", Default::default());
//! bus.publish(&routing, &command)?;
//!
//! if let Some(Ok(received)) = control.next().await {
//!     println!("got {}", received.command);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod types;

pub use bus::{Consumer, MessageBus, Outlet, Publisher, Unconsumed};
pub use config::RoutingConfig;
pub use error::{BusError, Result};
pub use types::*;
