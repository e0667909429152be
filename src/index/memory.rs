//! In-memory search index with an optional JSON snapshot
//!
//! Holds the parent-child document set in process memory. When opened with a
//! snapshot path, the whole index is written to that file after every
//! mutation and read back on open, so a CLI run sees the previous run's
//! documents.

use async_trait::async_trait;
use plandoc::Body;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::fs;

use super::{
    join_of, BulkItem, BulkOp, BulkResponse, IndexDocument, IndexError, IndexResult, SearchHit,
    SearchIndex, SearchQuery, JOIN_FIELD,
};
use crate::storage::glob_to_regex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDoc {
    seq_no: u64,
    routing: String,
    source: Body,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    next_seq_no: u64,
    docs: BTreeMap<String, StoredDoc>,
}

impl IndexState {
    fn hit(id: &str, doc: &StoredDoc) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            routing: doc.routing.clone(),
            source: doc.source.clone(),
        }
    }

    /// Check the co-location rule before a write
    fn check_routing(&self, doc: &IndexDocument) -> IndexResult<()> {
        let Some(parent) = doc.join().and_then(|j| j.parent) else {
            return Ok(());
        };
        if doc.routing.is_empty() {
            return Err(IndexError::MissingRouting { id: doc.id.clone() });
        }
        if let Some(stored) = self.docs.get(&parent) {
            if stored.routing != doc.routing {
                return Err(IndexError::RoutingMismatch {
                    id: doc.id.clone(),
                    expected: stored.routing.clone(),
                    actual: doc.routing.clone(),
                });
            }
        }
        Ok(())
    }

    fn put(&mut self, doc: IndexDocument) -> IndexResult<u16> {
        self.check_routing(&doc)?;
        let seq_no = self.next_seq_no;
        self.next_seq_no += 1;
        let created = self
            .docs
            .insert(
                doc.id,
                StoredDoc {
                    seq_no,
                    routing: doc.routing,
                    source: doc.source,
                },
            )
            .is_none();
        Ok(if created { 201 } else { 200 })
    }

    fn merge(&mut self, doc: IndexDocument) -> IndexResult<()> {
        self.check_routing(&doc)?;
        let seq_no = self.next_seq_no;
        self.next_seq_no += 1;
        match self.docs.get_mut(&doc.id) {
            Some(stored) => {
                stored.source.extend(doc.source);
                stored.seq_no = seq_no;
            }
            None => {
                self.docs.insert(
                    doc.id,
                    StoredDoc {
                        seq_no,
                        routing: doc.routing,
                        source: doc.source,
                    },
                );
            }
        }
        Ok(())
    }

    fn matches(&self, query: &SearchQuery, doc: &StoredDoc) -> IndexResult<bool> {
        Ok(match query {
            SearchQuery::MatchAll => true,
            SearchQuery::Term { field, value } => doc.source.get(field) == Some(value),
            SearchQuery::Wildcard { field, pattern } => {
                let re = glob_to_regex(pattern)
                    .map_err(|_| IndexError::InvalidQuery(format!("bad pattern '{}'", pattern)))?;
                doc.source
                    .get(field)
                    .and_then(Value::as_str)
                    .map(|s| re.is_match(s))
                    .unwrap_or(false)
            }
            SearchQuery::Text(text) => {
                let needle = text.to_lowercase();
                doc.source
                    .iter()
                    .filter(|(k, _)| k.as_str() != JOIN_FIELD)
                    .filter_map(|(_, v)| v.as_str())
                    .any(|s| s.to_lowercase().contains(&needle))
            }
            SearchQuery::ChildrenOf { parent_id } => join_of(&doc.source)
                .and_then(|j| j.parent)
                .map(|p| &p == parent_id)
                .unwrap_or(false),
            SearchQuery::ParentOf { .. } => false,
        })
    }

    fn search(&self, query: &SearchQuery) -> IndexResult<Vec<SearchHit>> {
        if let SearchQuery::ParentOf { child_id } = query {
            let parent = self
                .docs
                .get(child_id)
                .and_then(|d| join_of(&d.source))
                .and_then(|j| j.parent);
            return Ok(parent
                .and_then(|p| self.docs.get(&p).map(|d| Self::hit(&p, d)))
                .into_iter()
                .collect());
        }

        let mut hits = Vec::new();
        for (id, doc) in &self.docs {
            if self.matches(query, doc)? {
                hits.push((doc.seq_no, Self::hit(id, doc)));
            }
        }
        hits.sort_by_key(|(seq_no, _)| *seq_no);
        Ok(hits.into_iter().map(|(_, hit)| hit).collect())
    }
}

/// Process-local parent-child index
#[derive(Debug)]
pub struct MemoryIndex {
    name: String,
    state: RwLock<IndexState>,
    snapshot: Option<PathBuf>,
}

impl MemoryIndex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(IndexState::default()),
            snapshot: None,
        }
    }

    /// Open an index persisted at `snapshot`, loading it if the file exists
    pub async fn open(name: impl Into<String>, snapshot: &Path) -> IndexResult<Self> {
        let state = if snapshot.exists() {
            let content = fs::read_to_string(snapshot)
                .await
                .map_err(|e| IndexError::Snapshot(e.to_string()))?;
            serde_json::from_str(&content).map_err(|e| IndexError::Snapshot(e.to_string()))?
        } else {
            IndexState::default()
        };

        let index = Self {
            name: name.into(),
            state: RwLock::new(state),
            snapshot: Some(snapshot.to_path_buf()),
        };
        tracing::info!(index = %index.name, documents = index.len(), "Opened search index");
        Ok(index)
    }

    /// Number of documents currently indexed
    pub fn len(&self) -> usize {
        self.read().map(|s| s.docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> IndexResult<RwLockReadGuard<'_, IndexState>> {
        self.state
            .read()
            .map_err(|_| IndexError::Unavailable("index lock poisoned".to_string()))
    }

    fn write(&self) -> IndexResult<RwLockWriteGuard<'_, IndexState>> {
        self.state
            .write()
            .map_err(|_| IndexError::Unavailable("index lock poisoned".to_string()))
    }

    async fn persist(&self) -> IndexResult<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let content = {
            let state = self.read()?;
            serde_json::to_string(&*state).map_err(|e| IndexError::Snapshot(e.to_string()))?
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| IndexError::Snapshot(e.to_string()))?;
        }
        fs::write(path, content)
            .await
            .map_err(|e| IndexError::Snapshot(e.to_string()))
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn index(&self, doc: IndexDocument) -> IndexResult<()> {
        let id = doc.id.clone();
        self.write()?.put(doc)?;
        tracing::debug!(index = %self.name, id = %id, "Indexed document");
        self.persist().await
    }

    async fn update(&self, doc: IndexDocument) -> IndexResult<()> {
        let id = doc.id.clone();
        self.write()?.merge(doc)?;
        tracing::debug!(index = %self.name, id = %id, "Updated document");
        self.persist().await
    }

    async fn bulk(&self, ops: Vec<BulkOp>) -> IndexResult<BulkResponse> {
        let mut response = BulkResponse::default();
        {
            let mut state = self.write()?;
            for op in ops {
                let id = op.id().to_string();
                let item = match op {
                    BulkOp::Index { doc, .. } => match state.put(doc) {
                        Ok(status) => BulkItem { id, status, error: None },
                        Err(e) => BulkItem {
                            id,
                            status: 400,
                            error: Some(e.to_string()),
                        },
                    },
                    BulkOp::Delete { .. } => {
                        let status = if state.docs.remove(&id).is_some() { 200 } else { 404 };
                        BulkItem { id, status, error: None }
                    }
                };
                response.items.push(item);
            }
        }
        tracing::debug!(
            index = %self.name,
            operations = response.items.len(),
            failed = response.failures().len(),
            "Bulk operations completed"
        );
        self.persist().await?;
        Ok(response)
    }

    async fn get(&self, id: &str) -> IndexResult<Option<SearchHit>> {
        Ok(self.read()?.docs.get(id).map(|d| IndexState::hit(id, d)))
    }

    async fn search(&self, query: &SearchQuery) -> IndexResult<Vec<SearchHit>> {
        self.read()?.search(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::JoinField;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(id: &str, routing: &str, name: &str, parent: Option<&str>, body: Value) -> IndexDocument {
        IndexDocument::new(
            id,
            routing,
            body.as_object().cloned().unwrap(),
            JoinField {
                name: name.into(),
                parent: parent.map(str::to_string),
            },
        )
    }

    async fn seeded() -> MemoryIndex {
        let index = MemoryIndex::new("plans");
        index
            .index(doc("p1", "p1", "plan", None, json!({"objectId": "p1", "planType": "inNetwork"})))
            .await
            .unwrap();
        index
            .index(doc("ls1", "p1", "linkedPlanServices", Some("p1"), json!({"objectId": "ls1"})))
            .await
            .unwrap();
        index
            .index(doc("s1", "p1", "linkedService", Some("ls1"), json!({"objectId": "s1", "name": "Yearly physical"})))
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn test_children_and_parent_queries() {
        let index = seeded().await;

        let children = index
            .search(&SearchQuery::ChildrenOf { parent_id: "p1".into() })
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "ls1");

        let parent = index
            .search(&SearchQuery::ParentOf { child_id: "s1".into() })
            .await
            .unwrap();
        assert_eq!(parent[0].id, "ls1");
    }

    #[tokio::test]
    async fn test_attribute_queries() {
        let index = seeded().await;

        let hits = index.search(&SearchQuery::Text("PHYSICAL".into())).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].routing, "p1");

        let hits = index
            .search(&SearchQuery::Wildcard { field: "planType".into(), pattern: "in*".into() })
            .await
            .unwrap();
        assert_eq!(hits[0].id, "p1");

        let hits = index
            .search(&SearchQuery::Term { field: "objectId".into(), value: json!("s1") })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_routing_rule() {
        let index = seeded().await;
        let err = index
            .index(doc("s2", "ls1", "linkedService", Some("ls1"), json!({"objectId": "s2"})))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::RoutingMismatch { .. }));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let index = seeded().await;
        index
            .update(doc("s1", "p1", "linkedService", Some("ls1"), json!({"name": "Annual physical"})))
            .await
            .unwrap();
        let hit = index.get("s1").await.unwrap().unwrap();
        assert_eq!(hit.source["name"], json!("Annual physical"));
        assert_eq!(hit.source["objectId"], json!("s1"));
    }

    #[tokio::test]
    async fn test_bulk_delete() {
        let index = seeded().await;
        let response = index
            .bulk(vec![
                BulkOp::Delete { index: "plans".into(), id: "s1".into(), routing: Some("p1".into()) },
                BulkOp::Delete { index: "plans".into(), id: "nope".into(), routing: None },
            ])
            .await
            .unwrap();
        assert_eq!(response.items[0].status, 200);
        assert_eq!(response.items[1].status, 404);
        assert!(!response.has_errors());
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.json");

        let index = MemoryIndex::open("plans", &path).await.unwrap();
        index
            .index(doc("p1", "p1", "plan", None, json!({"objectId": "p1"})))
            .await
            .unwrap();

        let reopened = MemoryIndex::open("plans", &path).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get("p1").await.unwrap().is_some());
    }
}
