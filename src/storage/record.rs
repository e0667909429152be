//! Normalized record shape
//!
//! A record holds a node's own fields plus structured references to the
//! nodes it owns. Nested bodies are never stored inline.
//!
//! ```json
//! {
//!   "fields": { "objectId": "p1", "objectType": "plan", "planType": "inNetwork" },
//!   "links": {
//!     "planCostShares": { "objectType": "membercostshare", "objectId": "cs1" },
//!     "linkedPlanServices": [ { "objectType": "planservice", "objectId": "ls1" } ]
//!   }
//! }
//! ```

use plandoc::{Body, ObjectRef, Slot, OBJECT_ID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Reference(s) held in one slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linked {
    One(ObjectRef),
    Many(Vec<ObjectRef>),
}

impl Linked {
    pub fn refs(&self) -> Vec<&ObjectRef> {
        match self {
            Linked::One(r) => vec![r],
            Linked::Many(rs) => rs.iter().collect(),
        }
    }
}

/// A normalized record in the primary store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The node's own fields, composite slots removed
    pub fields: Body,
    /// References to owned nodes, by slot
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<Slot, Linked>,
}

impl Record {
    pub fn new(fields: Body) -> Self {
        Self {
            fields,
            links: BTreeMap::new(),
        }
    }

    pub fn object_id(&self) -> Option<&str> {
        self.fields.get(OBJECT_ID).and_then(|v| v.as_str())
    }

    /// Every reference held by this record, in slot order
    pub fn children(&self) -> Vec<(Slot, &ObjectRef)> {
        self.links
            .iter()
            .flat_map(|(slot, linked)| linked.refs().into_iter().map(move |r| (*slot, r)))
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a stored record, reporting undecodable data as corruption
    pub fn from_json(key: &str, raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::CorruptRecord {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_roundtrip() {
        let mut record = Record::new(
            json!({"objectId": "p1", "objectType": "plan"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        record.links.insert(
            Slot::PlanCostShares,
            Linked::One(ObjectRef::new("membercostshare", "cs1")),
        );
        record.links.insert(Slot::LinkedPlanServices, Linked::Many(vec![]));

        let raw = record.to_json().unwrap();
        let parsed = Record::from_json("p1", &raw).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.object_id(), Some("p1"));
        assert_eq!(parsed.children().len(), 1);
    }

    #[test]
    fn test_corrupt_record() {
        assert!(matches!(
            Record::from_json("p1", "not json"),
            Err(Error::CorruptRecord { .. })
        ));
    }
}
