//! Envelope types carried on the bus.

mod command;
mod event;
mod message;
mod metadata;
mod metric;
mod tag;

pub use command::ApiCommand;
pub use event::ApiEvent;
pub use message::{DeliveryStatus, EventType, SessionEvent, TransportEvent, UserMessage};
pub use metadata::GoMetadata;
pub use metric::{Datapoint, MetricMessage};
pub use tag::Tag;

/// Generate a fresh message identifier (32 lowercase hex characters).
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
