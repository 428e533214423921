//! Routing configuration for bus publishers and consumers.

use serde::{Deserialize, Serialize};

/// Default exchange shared by commands and events.
pub const DEFAULT_EXCHANGE: &str = "vumi";

/// Default exchange type.
pub const DEFAULT_EXCHANGE_TYPE: &str = "direct";

/// Routing key commands are published on.
pub const API_ROUTING_KEY: &str = "vumi.api";

/// Routing key application events are published on.
pub const EVENT_ROUTING_KEY: &str = "vumi.event";

/// Routing key metric datapoints are published on.
pub const METRICS_ROUTING_KEY: &str = "vumi.metrics";

/// Where a message is published and how the queue behind it behaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Exchange name.
    pub exchange: String,
    /// Exchange type. Only `direct` routing is supported.
    pub exchange_type: String,
    /// Routing key (and queue name) messages are delivered to.
    pub routing_key: String,
    /// Durable queues keep messages published while no consumer is attached.
    pub durable: bool,
}

impl RoutingConfig {
    /// Create a durable routing config on the default exchange.
    pub fn new(routing_key: impl Into<String>) -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            exchange_type: DEFAULT_EXCHANGE_TYPE.to_string(),
            routing_key: routing_key.into(),
            durable: true,
        }
    }

    /// Default routing for [`ApiCommand`](crate::ApiCommand)s.
    pub fn api_commands() -> Self {
        Self::new(API_ROUTING_KEY)
    }

    /// Default routing for [`ApiEvent`](crate::ApiEvent)s.
    pub fn app_events() -> Self {
        Self::new(EVENT_ROUTING_KEY)
    }

    /// Default routing for metric datapoints.
    pub fn metrics() -> Self {
        Self::new(METRICS_ROUTING_KEY)
    }

    /// Routing for a worker's control queue (`<worker_name>.control`).
    pub fn control(worker_name: &str) -> Self {
        Self::new(format!("{}.control", worker_name))
    }

    /// Routing for messages a transport should send (`<transport>.outbound`).
    pub fn transport_outbound(transport_name: &str) -> Self {
        Self::new(format!("{}.outbound", transport_name))
    }

    /// Routing for messages a transport received (`<transport>.inbound`).
    pub fn transport_inbound(transport_name: &str) -> Self {
        Self::new(format!("{}.inbound", transport_name))
    }

    /// Routing for transport delivery events (`<transport>.event`).
    pub fn transport_events(transport_name: &str) -> Self {
        Self::new(format!("{}.event", transport_name))
    }

    /// Replace the exchange name.
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Replace the routing key.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Set queue durability.
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self::api_commands()
    }
}
