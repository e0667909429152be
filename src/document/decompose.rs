//! Plan decomposition

use plandoc::{Body, NodeKind, ObjectRef, RecordKey, Slot, OBJECT_ID};
use serde_json::Value;
use std::collections::BTreeMap;

use super::node_ref;
use crate::error::{Error, Result};
use crate::index::{IndexDocument, JoinField};
use crate::storage::{Linked, Record};

/// A record and the key it is stored under
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryRecord {
    pub key: RecordKey,
    pub record: Record,
}

/// Normalized form of one plan
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub plan_id: String,
    /// Records in pre-order: the root first, each node before its children
    pub records: Vec<PrimaryRecord>,
    /// Index documents, in the same order as `records`
    pub documents: Vec<IndexDocument>,
}

impl Decomposition {
    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key.as_key()).collect()
    }

    pub fn document_ids(&self) -> Vec<String> {
        self.documents.iter().map(|d| d.id.clone()).collect()
    }
}

/// Split a plan into primary-store records and index documents
///
/// Each composite slot is replaced by references to its children; every
/// child becomes its own record under `objectType:objectId` and its own
/// index document routed by the plan id.
pub fn decompose(plan: &Body) -> Result<Decomposition> {
    let plan_id = plan
        .get(OBJECT_ID)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::MissingRequiredField {
            path: "$".to_string(),
            field: OBJECT_ID.to_string(),
        })?
        .to_string();

    let mut out = Decomposition {
        plan_id: plan_id.clone(),
        records: Vec::new(),
        documents: Vec::new(),
    };
    split_node(NodeKind::Plan, plan, "$", None, &plan_id, &mut out)?;
    Ok(out)
}

fn split_node(
    kind: NodeKind,
    body: &Body,
    path: &str,
    parent_id: Option<&str>,
    plan_id: &str,
    out: &mut Decomposition,
) -> Result<ObjectRef> {
    let this = node_ref(body, path)?;
    let mut fields = body.clone();
    let mut links = BTreeMap::new();
    let mut children: Vec<(Slot, String, Body)> = Vec::new();

    for &slot in kind.slots() {
        let slot_path = format!("{}.{}", path, slot.field());
        let value = fields.remove(slot.field()).ok_or_else(|| Error::MissingRequiredField {
            path: path.to_string(),
            field: slot.field().to_string(),
        })?;

        if slot.is_list() {
            let Value::Array(items) = value else {
                return Err(not_a(&slot_path, "array"));
            };
            let mut refs = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let item_path = format!("{}[{}]", slot_path, i);
                let Value::Object(child) = item else {
                    return Err(not_a(&item_path, "object"));
                };
                refs.push(node_ref(&child, &item_path)?);
                children.push((slot, item_path, child));
            }
            links.insert(slot, Linked::Many(refs));
        } else {
            let Value::Object(child) = value else {
                return Err(not_a(&slot_path, "object"));
            };
            links.insert(slot, Linked::One(node_ref(&child, &slot_path)?));
            children.push((slot, slot_path, child));
        }
    }

    let key = match kind {
        NodeKind::Plan => RecordKey::Root(this.id.clone()),
        _ => RecordKey::Child(this.clone()),
    };

    out.documents.push(IndexDocument::new(
        this.id.clone(),
        plan_id,
        fields.clone(),
        JoinField {
            name: kind.join_name().to_string(),
            parent: parent_id.map(str::to_string),
        },
    ));
    out.records.push(PrimaryRecord {
        key,
        record: Record { fields, links },
    });

    for (slot, child_path, child) in children {
        split_node(slot.child(), &child, &child_path, Some(&this.id), plan_id, out)?;
    }

    Ok(this)
}

fn not_a(path: &str, expected: &str) -> Error {
    Error::SchemaValidation {
        path: path.to_string(),
        message: format!("expected {}", expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::JOIN_FIELD;
    use serde_json::json;

    fn plan() -> Body {
        json!({
            "objectId": "p1",
            "objectType": "plan",
            "planCostShares": {"objectId": "cs1", "objectType": "membercostshare", "deductible": 2000},
            "linkedPlanServices": [{
                "objectId": "ls1",
                "objectType": "planservice",
                "linkedService": {"objectId": "s1", "objectType": "service"},
                "planserviceCostShares": {"objectId": "cs2", "objectType": "membercostshare"}
            }]
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_decompose_records() {
        let d = decompose(&plan()).unwrap();
        assert_eq!(
            d.keys(),
            vec![
                "p1",
                "membercostshare:cs1",
                "planservice:ls1",
                "service:s1",
                "membercostshare:cs2"
            ]
        );

        let root = &d.records[0].record;
        assert!(!root.fields.contains_key("planCostShares"));
        assert_eq!(
            root.links[&Slot::PlanCostShares],
            Linked::One(ObjectRef::new("membercostshare", "cs1"))
        );
        assert_eq!(
            root.links[&Slot::LinkedPlanServices],
            Linked::Many(vec![ObjectRef::new("planservice", "ls1")])
        );
        assert!(d.records[1].record.links.is_empty());
    }

    #[test]
    fn test_decompose_index_documents() {
        let d = decompose(&plan()).unwrap();
        let parents: Vec<(String, Option<String>)> = d
            .documents
            .iter()
            .map(|doc| (doc.id.clone(), doc.join().unwrap().parent))
            .collect();
        assert_eq!(
            parents,
            vec![
                ("p1".to_string(), None),
                ("cs1".to_string(), Some("p1".to_string())),
                ("ls1".to_string(), Some("p1".to_string())),
                ("s1".to_string(), Some("ls1".to_string())),
                ("cs2".to_string(), Some("ls1".to_string())),
            ]
        );
        assert!(d.documents.iter().all(|doc| doc.routing == "p1"));
        assert_eq!(d.documents[0].source[JOIN_FIELD], json!({"name": "plan"}));
        assert!(!d.documents[2].source.contains_key("linkedService"));
    }

    #[test]
    fn test_empty_service_list() {
        let mut doc = plan();
        doc.insert("linkedPlanServices".into(), json!([]));
        let d = decompose(&doc).unwrap();
        assert_eq!(d.records.len(), 2);
        assert_eq!(d.records[0].record.links[&Slot::LinkedPlanServices], Linked::Many(vec![]));
    }

    #[test]
    fn test_missing_slot() {
        let mut doc = plan();
        doc.remove("planCostShares");
        assert!(matches!(
            decompose(&doc),
            Err(Error::MissingRequiredField { field, .. }) if field == "planCostShares"
        ));
    }
}
