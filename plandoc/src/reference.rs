//! Structured references between normalized records

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a non-root record by type and id
///
/// Rendered as `objectType:objectId` only when a storage key is needed;
/// the parts are never recovered by splitting a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "objectType")]
    pub kind: String,
    #[serde(rename = "objectId")]
    pub id: String,
}

impl ObjectRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Primary-store key for this record
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Key of a normalized record in the primary store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// Root plan, keyed by its bare id
    Root(String),
    /// Any owned sub-object
    Child(ObjectRef),
}

impl RecordKey {
    pub fn as_key(&self) -> String {
        match self {
            RecordKey::Root(id) => id.clone(),
            RecordKey::Child(r) => r.key(),
        }
    }

    /// The object id, which doubles as the index document id
    pub fn object_id(&self) -> &str {
        match self {
            RecordKey::Root(id) => id,
            RecordKey::Child(r) => &r.id,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Root(id) => f.write_str(id),
            RecordKey::Child(r) => r.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let r = ObjectRef::new("membercostshare", "cs1");
        assert_eq!(r.key(), "membercostshare:cs1");
        assert_eq!(RecordKey::Root("p1".into()).as_key(), "p1");
        assert_eq!(RecordKey::Child(r).object_id(), "cs1");
    }

    #[test]
    fn test_serde_shape() {
        let r = ObjectRef::new("service", "s1");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json, serde_json::json!({"objectType": "service", "objectId": "s1"}));
    }
}
