//! Routing metadata embedded in messages at send time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `helper_metadata.go` section of a message.
///
/// Written when a message is sent on behalf of a conversation so that
/// replies and delivery events can be attributed without an index lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoMetadata {
    /// Account the message was sent for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_account: Option<String>,

    /// Conversation the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<String>,

    /// Type of that conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,
}

impl GoMetadata {
    /// Metadata carrying only the account key.
    pub fn for_account(account_key: impl Into<String>) -> Self {
        Self {
            user_account: Some(account_key.into()),
            ..Default::default()
        }
    }

    /// Set the conversation key and type.
    pub fn with_conversation(
        mut self,
        conversation_key: impl Into<String>,
        conversation_type: impl Into<String>,
    ) -> Self {
        self.conversation_key = Some(conversation_key.into());
        self.conversation_type = Some(conversation_type.into());
        self
    }

    /// Read the `go` section out of a helper metadata map.
    ///
    /// A missing or malformed section yields empty metadata.
    pub fn from_helper_metadata(helper_metadata: &Map<String, Value>) -> Self {
        helper_metadata
            .get("go")
            .and_then(|go| serde_json::from_value(go.clone()).ok())
            .unwrap_or_default()
    }

    /// Merge these fields into the `go` section of a helper metadata map,
    /// keeping any other keys already there.
    pub fn write_to(&self, helper_metadata: &mut Map<String, Value>) {
        let section = helper_metadata
            .entry("go".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !section.is_object() {
            *section = Value::Object(Map::new());
        }
        if let Value::Object(go) = section {
            if let Some(account) = &self.user_account {
                go.insert("user_account".into(), Value::String(account.clone()));
            }
            if let Some(key) = &self.conversation_key {
                go.insert("conversation_key".into(), Value::String(key.clone()));
            }
            if let Some(kind) = &self.conversation_type {
                go.insert("conversation_type".into(), Value::String(kind.clone()));
            }
        }
    }

    /// Conversation key and type, when both are present.
    pub fn conversation_info(&self) -> Option<(&str, &str)> {
        match (&self.conversation_key, &self.conversation_type) {
            (Some(key), Some(kind)) => Some((key.as_str(), kind.as_str())),
            _ => None,
        }
    }
}
