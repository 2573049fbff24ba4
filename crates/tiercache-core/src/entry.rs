//! Cached values and their byte encoding.
//!
//! Both tiers store the same MessagePack bytes: the value together with its
//! optional writer-assigned version.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CacheResult;

/// A cached value with an optional monotonically increasing version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl<V> CacheEntry<V> {
    /// An unversioned entry.
    pub fn new(value: V) -> Self {
        Self {
            value,
            version: None,
        }
    }

    /// An entry carrying `version`.
    pub fn versioned(value: V, version: u64) -> Self {
        Self {
            value,
            version: Some(version),
        }
    }

    pub fn into_value(self) -> V {
        self.value
    }
}

impl<V: Serialize> CacheEntry<V> {
    /// Encodes the entry for storage.
    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

impl<V: DeserializeOwned> CacheEntry<V> {
    /// Decodes stored bytes.
    pub fn decode(bytes: &[u8]) -> CacheResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Reads only the version of stored bytes, without knowing the value type.
pub fn peek_version(bytes: &[u8]) -> Option<u64> {
    #[derive(Deserialize)]
    struct VersionOnly {
        #[serde(default)]
        version: Option<u64>,
    }

    rmp_serde::from_slice::<VersionOnly>(bytes)
        .ok()
        .and_then(|header| header.version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        total_cents: i64,
        items: Vec<String>,
    }

    #[test]
    fn test_versioned_entry_decodes() {
        let order = Order {
            id: 42,
            total_cents: 1_999,
            items: vec!["book".into()],
        };
        let bytes = CacheEntry::versioned(order.clone(), 7).encode().unwrap();
        let decoded = CacheEntry::<Order>::decode(&bytes).unwrap();
        assert_eq!(decoded.value, order);
        assert_eq!(decoded.version, Some(7));
        assert_eq!(peek_version(&bytes), Some(7));
    }

    #[test]
    fn test_unversioned_entry_has_no_version() {
        let bytes = CacheEntry::new("hello".to_string()).encode().unwrap();
        assert_eq!(peek_version(&bytes), None);
        assert_eq!(
            CacheEntry::<String>::decode(&bytes).unwrap().into_value(),
            "hello"
        );
    }

    #[test]
    fn test_decode_with_wrong_type_is_serialization_error() {
        let bytes = CacheEntry::new("text".to_string()).encode().unwrap();
        let err = CacheEntry::<u64>::decode(&bytes).unwrap_err();
        assert!(err.is_serialization());
        assert!(CacheEntry::<u64>::decode(b"\xc1garbage").is_err());
    }
}
