//! Plan reconstruction
//!
//! Two paths rebuild the nested plan: one follows the structured references
//! held by primary-store records, the other walks parent-child relations in
//! the search index. Both load everything first and assemble afterwards.

use plandoc::{Body, NodeKind, ObjectRef, RecordKey};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::{Error, Result};
use crate::index::{strip_metadata, SearchHit, SearchIndex, SearchQuery};
use crate::storage::{Linked, PrimaryStore, Record};

/// Depth of the deepest node below the root
const MAX_DEPTH: usize = 2;

/// What to do when a referenced record is absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    /// Report a dangling reference
    Fail,
    /// Log and continue
    Skip,
}

/// Every record reachable from one plan root
#[derive(Debug, Clone)]
pub struct Closure {
    pub plan_id: String,
    /// Records by key, in breadth-first discovery order
    pub records: Vec<(String, Record)>,
    /// References whose records were absent (only under [`Missing::Skip`])
    pub missing: Vec<ObjectRef>,
}

impl Closure {
    /// Load the closure of a plan, or `None` if the root record is absent
    pub async fn collect(store: &dyn PrimaryStore, plan_id: &str, missing: Missing) -> Result<Option<Self>> {
        let root_key = RecordKey::Root(plan_id.to_string()).as_key();
        let Some(raw) = store.get(&root_key).await? else {
            return Ok(None);
        };

        let mut closure = Closure {
            plan_id: plan_id.to_string(),
            records: Vec::new(),
            missing: Vec::new(),
        };
        let mut seen = HashSet::from([root_key.clone()]);
        let mut queue = VecDeque::from([(root_key, raw)]);

        while let Some((key, raw)) = queue.pop_front() {
            let record = Record::from_json(&key, &raw)?;
            for (_, child) in record.children() {
                let child_key = child.key();
                if !seen.insert(child_key.clone()) {
                    if missing == Missing::Fail {
                        return Err(Error::CorruptRecord {
                            key: child_key,
                            message: format!("referenced more than once within plan '{}'", plan_id),
                        });
                    }
                    continue;
                }
                match store.get(&child_key).await? {
                    Some(raw) => queue.push_back((child_key, raw)),
                    None if missing == Missing::Fail => {
                        return Err(Error::DanglingReference {
                            plan_id: plan_id.to_string(),
                            key: child_key,
                        });
                    }
                    None => {
                        tracing::warn!(plan_id, key = %child_key, "Skipping missing record");
                        closure.missing.push(child.clone());
                    }
                }
            }
            closure.records.push((key, record));
        }

        Ok(Some(closure))
    }

    /// Primary-store keys of every loaded record
    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Index document ids of every loaded record
    pub fn document_ids(&self) -> Vec<String> {
        self.records
            .iter()
            .filter_map(|(_, r)| r.object_id().map(str::to_string))
            .collect()
    }

    /// Rebuild the nested plan document
    pub fn assemble(&self) -> Result<Body> {
        let by_key: HashMap<&str, &Record> = self
            .records
            .iter()
            .map(|(k, r)| (k.as_str(), r))
            .collect();
        self.assemble_node(&by_key, &self.plan_id, 0)
    }

    fn assemble_node(&self, by_key: &HashMap<&str, &Record>, key: &str, depth: usize) -> Result<Body> {
        let record = by_key.get(key).ok_or_else(|| Error::DanglingReference {
            plan_id: self.plan_id.clone(),
            key: key.to_string(),
        })?;
        if depth > MAX_DEPTH && !record.links.is_empty() {
            return Err(Error::CorruptRecord {
                key: key.to_string(),
                message: "plan tree is deeper than its shape allows".to_string(),
            });
        }

        let mut body = record.fields.clone();
        for (slot, linked) in &record.links {
            let value = match linked {
                Linked::One(r) => Value::Object(self.assemble_node(by_key, &r.key(), depth + 1)?),
                Linked::Many(rs) => Value::Array(
                    rs.iter()
                        .map(|r| self.assemble_node(by_key, &r.key(), depth + 1).map(Value::Object))
                        .collect::<Result<Vec<_>>>()?,
                ),
            };
            body.insert(slot.field().to_string(), value);
        }
        Ok(body)
    }
}

/// Rebuild a plan from the primary store
pub async fn reconstruct(store: &dyn PrimaryStore, plan_id: &str) -> Result<Body> {
    Closure::collect(store, plan_id, Missing::Fail)
        .await?
        .ok_or_else(|| Error::PlanNotFound {
            id: plan_id.to_string(),
        })?
        .assemble()
}

/// Rebuild a plan from parent-child relations in the search index
///
/// Children of each node are ordered by when they were indexed. A list slot
/// with no children is rendered as an empty array.
pub async fn reconstruct_from_index(index: &dyn SearchIndex, plan_id: &str) -> Result<Body> {
    let not_found = || Error::PlanNotFound {
        id: plan_id.to_string(),
    };
    let root = index.get(plan_id).await?.ok_or_else(not_found)?;
    match root.join() {
        Some(join) if join.name == NodeKind::Plan.join_name() && join.parent.is_none() => {}
        _ => return Err(not_found()),
    }

    let mut children: HashMap<String, Vec<SearchHit>> = HashMap::new();
    let mut queue = VecDeque::from([root.id.clone()]);
    while let Some(parent_id) = queue.pop_front() {
        let hits = index
            .search(&SearchQuery::ChildrenOf {
                parent_id: parent_id.clone(),
            })
            .await?;
        queue.extend(
            hits.iter()
                .filter(|h| !children.contains_key(&h.id))
                .map(|h| h.id.clone()),
        );
        children.insert(parent_id, hits);
    }

    assemble_hit(root, NodeKind::Plan, &mut children)
}

fn assemble_hit(
    hit: SearchHit,
    kind: NodeKind,
    children: &mut HashMap<String, Vec<SearchHit>>,
) -> Result<Body> {
    let id = hit.id.clone();
    let mut body = strip_metadata(hit.source);
    let mut by_slot: BTreeMap<&str, Vec<SearchHit>> = BTreeMap::new();
    for child in children.remove(&id).unwrap_or_default() {
        let Some(name) = child.join().map(|j| j.name) else {
            continue;
        };
        if let Some(slot) = kind.slots().iter().find(|s| s.child().join_name() == name) {
            by_slot.entry(slot.field()).or_default().push(child);
        }
    }

    for &slot in kind.slots() {
        let hits = by_slot.remove(slot.field()).unwrap_or_default();
        if slot.is_list() {
            let items = hits
                .into_iter()
                .map(|h| assemble_hit(h, slot.child(), children).map(Value::Object))
                .collect::<Result<Vec<_>>>()?;
            body.insert(slot.field().to_string(), Value::Array(items));
        } else if let Some(first) = hits.into_iter().next() {
            let child = assemble_hit(first, slot.child(), children)?;
            body.insert(slot.field().to_string(), Value::Object(child));
        }
    }
    Ok(body)
}
