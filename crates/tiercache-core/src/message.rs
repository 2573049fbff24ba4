//! Cross-node invalidation messages.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::CacheResult;

/// What an invalidation message drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvalidationKind {
    /// A single key.
    Key,
    /// Every entry of one cache-name.
    Cache,
    /// Every entry of every cache-name.
    All,
}

/// Message published on the invalidation topic.
///
/// `key` is the serialized key token, `tenant_id` is omitted for the default
/// tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    #[serde(rename = "type")]
    pub kind: InvalidationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_name: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
    pub origin_node_id: String,
    #[serde(default)]
    pub timestamp: u64,
}

impl InvalidationMessage {
    /// Drop one key on peers. `version` is `None` for deletes.
    pub fn of_key(
        cache_name: impl Into<String>,
        key: impl Into<String>,
        tenant_id: Option<String>,
        version: Option<u64>,
        origin_node_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: InvalidationKind::Key,
            cache_name: Some(cache_name.into()),
            key: Some(key.into()),
            tenant_id,
            version,
            origin_node_id: origin_node_id.into(),
            timestamp: now_millis(),
        }
    }

    /// Drop a whole cache-name on peers.
    pub fn of_cache(cache_name: impl Into<String>, origin_node_id: impl Into<String>) -> Self {
        Self {
            kind: InvalidationKind::Cache,
            cache_name: Some(cache_name.into()),
            key: None,
            tenant_id: None,
            version: None,
            origin_node_id: origin_node_id.into(),
            timestamp: now_millis(),
        }
    }

    /// Drop everything on peers.
    pub fn of_all(origin_node_id: impl Into<String>) -> Self {
        Self {
            kind: InvalidationKind::All,
            cache_name: None,
            key: None,
            tenant_id: None,
            version: None,
            origin_node_id: origin_node_id.into(),
            timestamp: now_millis(),
        }
    }

    /// Returns `true` if `node_id` published this message.
    pub fn is_from(&self, node_id: &str) -> bool {
        self.origin_node_id == node_id
    }

    pub fn to_json(&self) -> CacheResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> CacheResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_message_wire_shape() {
        let message = InvalidationMessage::of_key("orders", "42", None, None, "nodeB");
        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "KEY");
        assert_eq!(json["cacheName"], "orders");
        assert_eq!(json["key"], "42");
        assert!(json["version"].is_null());
        assert_eq!(json["originNodeId"], "nodeB");
        assert!(json.get("tenantId").is_none());
    }

    #[test]
    fn test_parse_foreign_payload() {
        let payload =
            r#"{"type":"KEY","cacheName":"orders","key":"42","version":9,"originNodeId":"n1"}"#;
        let message = InvalidationMessage::from_json(payload).unwrap();
        assert_eq!(message.kind, InvalidationKind::Key);
        assert_eq!(message.version, Some(9));
        assert_eq!(message.timestamp, 0);
        assert!(message.is_from("n1"));
        assert!(!message.is_from("n2"));
    }

    #[test]
    fn test_cache_and_all_messages() {
        let cache = InvalidationMessage::of_cache("orders", "n1");
        assert_eq!(cache.kind, InvalidationKind::Cache);
        assert_eq!(cache.cache_name.as_deref(), Some("orders"));
        assert!(cache.key.is_none());

        let all = InvalidationMessage::of_all("n1");
        let json = all.to_json().unwrap();
        assert!(json.contains(r#""type":"ALL""#));
        assert_eq!(InvalidationMessage::from_json(&json).unwrap(), all);
    }

    #[test]
    fn test_malformed_payload() {
        assert!(InvalidationMessage::from_json("{not json").unwrap_err().is_serialization());
        assert!(InvalidationMessage::from_json(r#"{"type":"BOGUS","originNodeId":"x"}"#).is_err());
    }
}
