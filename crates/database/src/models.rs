//! Database models.

use chrono::{DateTime, Utc};
use message_bus::Tag;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;

/// An account owning conversations and tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UserAccount {
    /// Account key.
    pub key: String,
    /// Display name.
    pub username: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Permission for an account to draw tags from a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TagpoolPermission {
    pub account_key: String,
    pub pool: String,
    /// Maximum number of tags the account may hold from this pool.
    pub max_keys: Option<i64>,
}

/// Message store view of a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TagInfo {
    pub pool: String,
    pub tag: String,
    /// Open batch the tag is bound to, if any.
    pub current_batch: Option<String>,
}

impl TagInfo {
    /// The `(pool, tag)` pair.
    pub fn to_tag(&self) -> Tag {
        Tag::new(&self.pool, &self.tag)
    }
}

/// A group of messages sent and received under a set of tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Batch {
    /// 32 hex character batch id.
    pub batch_id: String,
    /// Free-form metadata; carries `user_account`.
    pub metadata: Json<Map<String, Value>>,
    /// When the batch was opened.
    pub created_at: DateTime<Utc>,
    /// When the batch was closed, if it has been.
    pub closed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Account key recorded in the batch metadata.
    pub fn user_account(&self) -> Option<&str> {
        self.metadata.get("user_account").and_then(Value::as_str)
    }

    /// Whether `batch_done` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

/// Aggregated status counters for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BatchStatus {
    pub sent: i64,
    pub ack: i64,
    pub nack: i64,
    pub delivery_report: i64,
    pub delivery_report_delivered: i64,
    pub delivery_report_failed: i64,
    pub delivery_report_pending: i64,
}

/// Cached message counts for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CachedCounts {
    pub outbound_count: i64,
    pub inbound_count: i64,
}

/// Lifecycle status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Draft,
    Running,
    Finished,
}

impl ConversationStatus {
    /// Status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }
}

/// A configured messaging campaign owned by an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// 32 hex character key.
    pub key: String,
    /// Owning account.
    pub account_key: String,
    /// Conversation type (`bulk_message`, `survey`, ...).
    pub conversation_type: String,
    pub subject: String,
    pub message: String,
    /// Delivery class (`sms`, `ussd`, ...).
    pub delivery_class: Option<String>,
    pub delivery_tag_pool: Option<String>,
    /// Specific tag to send from, if the account picked one.
    pub delivery_tag: Option<String>,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Application-specific extensions, stored opaquely.
    pub metadata: Map<String, Value>,
    /// Contact group keys.
    pub groups: Vec<String>,
    /// Batch ids, oldest first.
    pub batches: Vec<String>,
}

impl Conversation {
    /// A conversation has started once it has a batch.
    pub fn started(&self) -> bool {
        !self.batches.is_empty()
    }

    /// A conversation has ended once its end timestamp is set.
    pub fn ended(&self) -> bool {
        self.end_timestamp.is_some()
    }

    /// Started and not ended.
    pub fn running(&self) -> bool {
        self.started() && !self.ended()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ConversationStatus {
        if self.ended() {
            ConversationStatus::Finished
        } else if self.running() {
            ConversationStatus::Running
        } else {
            ConversationStatus::Draft
        }
    }

    /// The configured delivery tag, when both pool and tag are set.
    pub fn delivery_tag(&self) -> Option<Tag> {
        match (&self.delivery_tag_pool, &self.delivery_tag) {
            (Some(pool), Some(tag)) => Some(Tag::new(pool, tag)),
            _ => None,
        }
    }
}

/// Fields for creating a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewConversation {
    pub conversation_type: String,
    pub subject: String,
    pub message: String,
    pub delivery_class: Option<String>,
    pub delivery_tag_pool: Option<String>,
    pub delivery_tag: Option<String>,
    /// Defaults to now.
    pub start_timestamp: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
    pub groups: Vec<String>,
}

impl NewConversation {
    /// Create with the required fields.
    pub fn new(
        conversation_type: impl Into<String>,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            conversation_type: conversation_type.into(),
            subject: subject.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Set the delivery class.
    pub fn with_delivery_class(mut self, delivery_class: impl Into<String>) -> Self {
        self.delivery_class = Some(delivery_class.into());
        self
    }

    /// Send from any free tag in `pool`.
    pub fn with_delivery_pool(mut self, pool: impl Into<String>) -> Self {
        self.delivery_tag_pool = Some(pool.into());
        self
    }

    /// Send from one specific tag.
    pub fn with_delivery_tag(mut self, tag: &Tag) -> Self {
        self.delivery_tag_pool = Some(tag.pool.clone());
        self.delivery_tag = Some(tag.name.clone());
        self
    }

    /// Add a contact group.
    pub fn with_group(mut self, group_key: impl Into<String>) -> Self {
        self.groups.push(group_key.into());
        self
    }
}
