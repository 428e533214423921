//! Transport-level messages and delivery events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::metadata::GoMetadata;
use super::new_message_id;
use super::tag::Tag;

/// Session state for session-based transports such as USSD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    New,
    Resume,
    Close,
}

/// A message sent to or received from a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    /// Message identifier.
    #[serde(default = "new_message_id")]
    pub message_id: String,

    /// Recipient address.
    pub to_addr: String,

    /// Sender address.
    pub from_addr: String,

    /// Text content.
    #[serde(default)]
    pub content: Option<String>,

    /// Transport the message travels over.
    #[serde(default)]
    pub transport_name: Option<String>,

    /// Transport type (`sms`, `ussd`, ...).
    #[serde(default)]
    pub transport_type: Option<String>,

    /// Message this one replies to.
    #[serde(default)]
    pub in_reply_to: Option<String>,

    /// Session state for session-based transports.
    #[serde(default)]
    pub session_event: Option<SessionEvent>,

    /// Routing metadata added by helpers (`go`, `tag`, ...).
    #[serde(default)]
    pub helper_metadata: Map<String, Value>,

    /// When the message was created.
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl UserMessage {
    /// Create a new message with a fresh id.
    pub fn new(
        to_addr: impl Into<String>,
        from_addr: impl Into<String>,
        content: Option<String>,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            to_addr: to_addr.into(),
            from_addr: from_addr.into(),
            content,
            transport_name: None,
            transport_type: None,
            in_reply_to: None,
            session_event: None,
            helper_metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the message id.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Set the transport name and type.
    pub fn with_transport(
        mut self,
        transport_name: impl Into<String>,
        transport_type: impl Into<String>,
    ) -> Self {
        self.transport_name = Some(transport_name.into());
        self.transport_type = Some(transport_type.into());
        self
    }

    /// Address of the user on the other end of an inbound message.
    pub fn user(&self) -> &str {
        &self.from_addr
    }

    /// Routing metadata stored under `helper_metadata.go`.
    pub fn go_metadata(&self) -> GoMetadata {
        GoMetadata::from_helper_metadata(&self.helper_metadata)
    }

    /// Merge routing metadata into `helper_metadata.go`. Keys already there
    /// and not set on `metadata` are kept.
    pub fn set_go_metadata(&mut self, metadata: &GoMetadata) {
        metadata.write_to(&mut self.helper_metadata);
    }

    /// Tag stored under `helper_metadata.tag.tag`, if any.
    pub fn tag(&self) -> Option<Tag> {
        self.helper_metadata
            .get("tag")
            .and_then(|tag| tag.get("tag"))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Store the tag under `helper_metadata.tag.tag`.
    pub fn set_tag(&mut self, tag: &Tag) {
        let mut inner = Map::new();
        inner.insert("tag".to_string(), tag.to_value());
        self.helper_metadata
            .insert("tag".to_string(), Value::Object(inner));
    }
}

/// Kind of transport event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Ack,
    Nack,
    DeliveryReport,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Nack => "nack",
            Self::DeliveryReport => "delivery_report",
        }
    }
}

/// Delivery status carried by delivery reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Failed,
    Delivered,
}

impl DeliveryStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Delivered => "delivered",
        }
    }
}

/// An ack, nack or delivery report about a previously sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportEvent {
    /// Event identifier.
    #[serde(default = "new_message_id")]
    pub event_id: String,

    /// Event kind.
    pub event_type: EventType,

    /// Id of the outbound message this event is about.
    #[serde(default)]
    pub user_message_id: Option<String>,

    /// Id the transport assigned when sending.
    #[serde(default)]
    pub sent_message_id: Option<String>,

    /// Delivery status for delivery reports.
    #[serde(default)]
    pub delivery_status: Option<DeliveryStatus>,

    /// Reason for a nack.
    #[serde(default)]
    pub nack_reason: Option<String>,

    /// When the event was created.
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TransportEvent {
    fn new(event_type: EventType, user_message_id: impl Into<String>) -> Self {
        Self {
            event_id: new_message_id(),
            event_type,
            user_message_id: Some(user_message_id.into()),
            sent_message_id: None,
            delivery_status: None,
            nack_reason: None,
            timestamp: Utc::now(),
        }
    }

    /// Create an ack.
    pub fn ack(user_message_id: impl Into<String>, sent_message_id: impl Into<String>) -> Self {
        Self {
            sent_message_id: Some(sent_message_id.into()),
            ..Self::new(EventType::Ack, user_message_id)
        }
    }

    /// Create a nack.
    pub fn nack(user_message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            nack_reason: Some(reason.into()),
            ..Self::new(EventType::Nack, user_message_id)
        }
    }

    /// Create a delivery report.
    pub fn delivery_report(user_message_id: impl Into<String>, status: DeliveryStatus) -> Self {
        Self {
            delivery_status: Some(status),
            ..Self::new(EventType::DeliveryReport, user_message_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_metadata() {
        let mut msg = UserMessage::new("+27831234567", "1234", Some("hi".into()));
        assert!(msg.tag().is_none());

        msg.set_tag(&Tag::new("pool1", "1234"));
        assert_eq!(msg.helper_metadata["tag"], json!({"tag": ["pool1", "1234"]}));
        assert_eq!(msg.tag(), Some(Tag::new("pool1", "1234")));
    }

    #[test]
    fn test_set_go_metadata_merges() {
        let mut msg = UserMessage::new("+27831234567", "1234", None);
        msg.set_go_metadata(&GoMetadata::for_account("acc"));
        msg.set_go_metadata(&GoMetadata::default().with_conversation("conv", "bulk_message"));

        let go = msg.go_metadata();
        assert_eq!(go.user_account.as_deref(), Some("acc"));
        assert_eq!(go.conversation_info(), Some(("conv", "bulk_message")));
    }

    #[test]
    fn test_parse_event() {
        let json = r#"{
            "event_type": "delivery_report",
            "user_message_id": "abc",
            "delivery_status": "delivered"
        }"#;
        let event: TransportEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, EventType::DeliveryReport);
        assert_eq!(event.delivery_status, Some(DeliveryStatus::Delivered));
        assert_eq!(event.user_message_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_event_constructors() {
        let nack = TransportEvent::nack("m1", "no route");
        assert_eq!(nack.event_type.as_str(), "nack");
        assert_eq!(nack.nack_reason.as_deref(), Some("no route"));

        let ack = TransportEvent::ack("m1", "remote-1");
        assert_eq!(ack.sent_message_id.as_deref(), Some("remote-1"));
    }
}
