//! Application-level events about a conversation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::RoutingConfig;

/// Notification tying an account and conversation to an event type.
///
/// Published by workers, consumed by external listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEvent {
    /// Account owning the conversation.
    pub account_key: String,
    /// Conversation the event is about.
    pub conversation_key: String,
    /// Event type, e.g. `new_message` or `delivery_report`.
    pub event_type: String,
    /// Free-form content.
    #[serde(default)]
    pub content: Map<String, Value>,
}

impl ApiEvent {
    /// Create a new event.
    pub fn event(
        account_key: impl Into<String>,
        conversation_key: impl Into<String>,
        event_type: impl Into<String>,
        content: Map<String, Value>,
    ) -> Self {
        Self {
            account_key: account_key.into(),
            conversation_key: conversation_key.into(),
            event_type: event_type.into(),
            content,
        }
    }

    /// Default routing for events.
    pub fn default_routing_config() -> RoutingConfig {
        RoutingConfig::app_events()
    }
}
