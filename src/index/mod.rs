//! Secondary search index for plansync
//!
//! Mirrors the plan tree as parent-child documents. Every document carries a
//! `join_field` naming its relation and, for children, its parent's id.
//! Children are routed by the id of the plan at the top of their tree so a
//! whole plan lives on one shard.
//!
//! ```json
//! { "objectId": "s1", "objectType": "service", "name": "Yearly physical",
//!   "join_field": { "name": "linkedService", "parent": "ls1" } }
//! ```

pub mod memory;

pub use memory::MemoryIndex;

use async_trait::async_trait;
use plandoc::Body;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Field holding parent-child metadata in an index document
pub const JOIN_FIELD: &str = "join_field";

/// Errors raised by a search index adapter
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("{0}")]
    Unavailable(String),

    #[error("Child document '{id}' has no routing")]
    MissingRouting { id: String },

    #[error("Document '{id}' routed to '{actual}' but its parent lives on '{expected}'")]
    RoutingMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("{failed} bulk operation(s) rejected, first: {message}")]
    BulkRejected { failed: usize, message: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Index snapshot error: {0}")]
    Snapshot(String),
}

/// Result type alias for index operations
pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Parent-child relation metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// A document as stored in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: String,
    pub routing: String,
    /// Body including the `join_field`
    pub source: Body,
}

impl IndexDocument {
    pub fn new(id: impl Into<String>, routing: impl Into<String>, mut body: Body, join: JoinField) -> Self {
        body.insert(JOIN_FIELD.to_string(), json!(join));
        Self {
            id: id.into(),
            routing: routing.into(),
            source: body,
        }
    }

    pub fn join(&self) -> Option<JoinField> {
        join_of(&self.source)
    }
}

/// Parse the `join_field` of a document body
pub fn join_of(source: &Body) -> Option<JoinField> {
    source
        .get(JOIN_FIELD)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Remove index-only metadata from a document body
pub fn strip_metadata(mut source: Body) -> Body {
    source.remove(JOIN_FIELD);
    source
}

/// One line pair of a bulk request
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
    Index { index: String, doc: IndexDocument },
    Delete { index: String, id: String, routing: Option<String> },
}

impl BulkOp {
    pub fn id(&self) -> &str {
        match self {
            BulkOp::Index { doc, .. } => &doc.id,
            BulkOp::Delete { id, .. } => id,
        }
    }
}

/// Outcome of one bulk operation
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    pub id: String,
    pub status: u16,
    pub error: Option<String>,
}

/// Outcome of a bulk request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResponse {
    pub items: Vec<BulkItem>,
}

impl BulkResponse {
    /// Items that failed; deleting an absent document is not a failure
    pub fn failures(&self) -> Vec<&BulkItem> {
        self.items
            .iter()
            .filter(|i| i.status >= 400 && i.status != 404)
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        !self.failures().is_empty()
    }
}

/// A search against the index
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    MatchAll,
    /// Exact value of a field
    Term { field: String, value: Value },
    /// Glob (`*`, `?`) over a string field
    Wildcard { field: String, pattern: String },
    /// Case-insensitive substring over all string fields
    Text(String),
    /// Documents whose `join_field.parent` is the given id
    ChildrenOf { parent_id: String },
    /// The parent of the given document
    ParentOf { child_id: String },
}

/// A document returned by a search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub routing: String,
    pub source: Body,
}

impl SearchHit {
    pub fn join(&self) -> Option<JoinField> {
        join_of(&self.source)
    }
}

/// Hierarchical document index
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Name of the index documents are written to
    fn name(&self) -> &str;

    /// Index (create or replace) a document
    async fn index(&self, doc: IndexDocument) -> IndexResult<()>;

    /// Merge fields into a document, creating it if absent
    async fn update(&self, doc: IndexDocument) -> IndexResult<()>;

    /// Apply several operations, reporting per-item outcomes
    async fn bulk(&self, ops: Vec<BulkOp>) -> IndexResult<BulkResponse>;

    /// Fetch one document by id
    async fn get(&self, id: &str) -> IndexResult<Option<SearchHit>>;

    /// Run a query, returning hits in indexing order
    async fn search(&self, query: &SearchQuery) -> IndexResult<Vec<SearchHit>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> IndexDocument {
        IndexDocument::new(
            "cs1",
            "p1",
            json!({"objectId": "cs1", "deductible": 2000}).as_object().cloned().unwrap(),
            JoinField {
                name: "planCostShares".into(),
                parent: Some("p1".into()),
            },
        )
    }

    #[test]
    fn test_join_field_roundtrip() {
        let doc = doc();
        assert_eq!(doc.join().unwrap().parent.as_deref(), Some("p1"));
        let body = strip_metadata(doc.source.clone());
        assert!(!body.contains_key(JOIN_FIELD));
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn test_root_join_omits_parent() {
        let root = IndexDocument::new(
            "p1",
            "p1",
            Body::new(),
            JoinField {
                name: "plan".into(),
                parent: None,
            },
        );
        assert_eq!(root.source[JOIN_FIELD], json!({"name": "plan"}));
    }

    #[test]
    fn test_bulk_failures_ignore_missing() {
        let response = BulkResponse {
            items: vec![
                BulkItem { id: "a".into(), status: 200, error: None },
                BulkItem { id: "b".into(), status: 404, error: None },
            ],
        };
        assert!(!response.has_errors());
    }
}
