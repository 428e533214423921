//! Messaging address tags.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `(pool, tag)` pair identifying a sender address.
///
/// Serialized as a two-element array `[pool, tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct Tag {
    /// Pool the tag was declared in.
    pub pool: String,
    /// Tag name; also the address messages are sent from.
    pub name: String,
}

impl Tag {
    /// Create a tag.
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
        }
    }

    /// JSON form (`[pool, tag]`).
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.pool.clone()),
            Value::String(self.name.clone()),
        ])
    }
}

impl From<(String, String)> for Tag {
    fn from((pool, name): (String, String)) -> Self {
        Self { pool, name }
    }
}

impl From<(&str, &str)> for Tag {
    fn from((pool, name): (&str, &str)) -> Self {
        Self::new(pool, name)
    }
}

impl From<Tag> for (String, String) {
    fn from(tag: Tag) -> Self {
        (tag.pool, tag.name)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_pair() {
        let tag = Tag::new("poolA", "t1");
        assert_eq!(serde_json::to_string(&tag).unwrap(), r#"["poolA","t1"]"#);
        let parsed: Tag = serde_json::from_str(r#"["poolA","t1"]"#).unwrap();
        assert_eq!(parsed, tag);
        assert_eq!(tag.to_string(), "poolA:t1");
    }
}
