//! Pool configuration and outbound message options.

use message_bus::{GoMetadata, Tag};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Typed view over the metadata stored for a tag pool.
///
/// Unknown keys are kept in `extra` so a read-modify-write round trip does
/// not lose them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetadata {
    /// Transport type stamped on outbound messages (`sms`, `ussd`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_type: Option<String>,

    /// Default options merged into every outbound message.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub msg_options: Map<String, Value>,

    /// Accounts pick a specific tag instead of getting the next free one.
    #[serde(default)]
    pub user_selects_tag: bool,

    /// Recipients must contact the platform first (USSD style).
    #[serde(default)]
    pub client_initiated: bool,

    /// The platform may originate contact (SMS style).
    #[serde(default)]
    pub server_initiated: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PoolMetadata {
    /// Parse stored pool metadata.
    pub fn from_map(map: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(map))
    }

    /// Encode for storage.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Set the transport type.
    pub fn with_transport_type(mut self, transport_type: impl Into<String>) -> Self {
        self.transport_type = Some(transport_type.into());
        self
    }

    /// Add a default message option.
    pub fn with_msg_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.msg_options.insert(key.into(), value);
        self
    }

    /// Mark the pool as client initiated.
    pub fn client_initiated(mut self) -> Self {
        self.client_initiated = true;
        self
    }

    /// Mark the pool as server initiated.
    pub fn server_initiated(mut self) -> Self {
        self.server_initiated = true;
        self
    }
}

/// Options for messages sent from `tag` on behalf of `account_key`.
///
/// Pool defaults go in first, then `from_addr` and the routing metadata
/// that lets delivery events be traced back to the account and tag.
pub fn msg_options(account_key: &str, tag: &Tag, pool: &PoolMetadata) -> Map<String, Value> {
    let mut options = Map::new();

    if let Some(transport_type) = &pool.transport_type {
        options.insert(
            "transport_type".to_string(),
            Value::String(transport_type.clone()),
        );
    }
    for (key, value) in &pool.msg_options {
        options.insert(key.clone(), value.clone());
    }

    options.insert("from_addr".to_string(), Value::String(tag.name.clone()));

    let mut helper_metadata = Map::new();
    GoMetadata::for_account(account_key).write_to(&mut helper_metadata);
    let mut tag_metadata = Map::new();
    tag_metadata.insert("tag".to_string(), tag.to_value());
    helper_metadata.insert("tag".to_string(), Value::Object(tag_metadata));
    options.insert(
        "helper_metadata".to_string(),
        Value::Object(helper_metadata),
    );

    options
}
