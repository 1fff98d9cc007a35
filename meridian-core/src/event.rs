//! Wire events exchanged between nodes over the broadcast channels.
//!
//! Two logical channels exist: per-key change announcements and bulk
//! invalidation announcements. Both are JSON on the wire so that nodes
//! written against other client libraries can join the same channels.

use crate::{NodeId, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// Kind of per-key mutation being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Set,
    Delete,
    /// Wildcard event; `key` is `*` and `tags` names what was invalidated.
    InvalidateTags,
}

/// A mutation announcement on the changes channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Keys resolved by the publisher for tag invalidations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    pub node_id: NodeId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: Timestamp,
}

impl ChangeEvent {
    pub fn set(
        key: impl Into<String>,
        version: Version,
        tags: Vec<String>,
        node_id: NodeId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            kind: ChangeKind::Set,
            key: key.into(),
            version: Some(version),
            tags,
            keys: Vec::new(),
            node_id,
            timestamp,
        }
    }

    pub fn delete(key: impl Into<String>, node_id: NodeId, timestamp: Timestamp) -> Self {
        Self {
            kind: ChangeKind::Delete,
            key: key.into(),
            version: None,
            tags: Vec::new(),
            keys: Vec::new(),
            node_id,
            timestamp,
        }
    }

    pub fn invalidate_tags(
        tags: Vec<String>,
        keys: Vec<String>,
        node_id: NodeId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            kind: ChangeKind::InvalidateTags,
            key: "*".to_string(),
            version: None,
            tags,
            keys,
            node_id,
            timestamp,
        }
    }
}

/// What a bulk invalidation targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidationScope {
    Keys { keys: Vec<String> },
    Pattern { pattern: String },
    Tags { tags: Vec<String> },
    All,
}

/// A bulk invalidation announcement on the invalidation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    pub scope: InvalidationScope,
    pub node_id: NodeId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: Timestamp,
}

impl InvalidationEvent {
    pub fn new(scope: InvalidationScope, node_id: NodeId, timestamp: Timestamp) -> Self {
        Self {
            scope,
            node_id,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};

    fn ts() -> Timestamp {
        DateTime::UNIX_EPOCH + Duration::milliseconds(1_700_000_000_123)
    }

    #[test]
    fn test_change_event_wire_format() {
        let event = ChangeEvent::set(
            "user:1",
            Version::new("1700000000123-0000abcd"),
            vec!["users".to_string()],
            NodeId::new("node-a"),
            ts(),
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "SET");
        assert_eq!(json["key"], "user:1");
        assert_eq!(json["version"], "1700000000123-0000abcd");
        assert_eq!(json["tags"][0], "users");
        assert_eq!(json["nodeId"], "node-a");
        assert_eq!(json["timestamp"], 1_700_000_000_123i64);
        assert!(json.get("keys").is_none());
    }

    #[test]
    fn test_change_event_accepts_minimal_delete() {
        let raw = r#"{"type":"DELETE","key":"k","nodeId":"peer","timestamp":5}"#;
        let event: ChangeEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert!(event.version.is_none());
        assert!(event.tags.is_empty());
    }

    #[test]
    fn test_invalidate_tags_event_uses_wildcard_key() {
        let event = ChangeEvent::invalidate_tags(
            vec!["t".to_string()],
            vec!["a".to_string()],
            NodeId::new("n"),
            ts(),
        );
        assert_eq!(event.key, "*");
        assert_eq!(event.kind, ChangeKind::InvalidateTags);
    }

    #[test]
    fn test_invalidation_scope_tagging() {
        let event = InvalidationEvent::new(
            InvalidationScope::Pattern {
                pattern: "user:*".to_string(),
            },
            NodeId::new("n"),
            ts(),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["scope"]["type"], "PATTERN");
        assert_eq!(json["scope"]["pattern"], "user:*");

        let all: InvalidationScope = serde_json::from_str(r#"{"type":"ALL"}"#).unwrap();
        assert_eq!(all, InvalidationScope::All);
    }
}
