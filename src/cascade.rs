//! Cascade delete of a plan across both stores

use std::sync::Arc;

use crate::document::{Closure, Missing};
use crate::error::{Error, Result};
use crate::etag::EtagManager;
use crate::index::{BulkOp, SearchIndex};
use crate::storage::PrimaryStore;

/// Everything to remove for one plan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Removal {
    /// Primary-store keys, records and ETag keys alike
    pub keys: Vec<String>,
    /// Index document ids
    pub documents: Vec<String>,
}

impl Removal {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.documents.is_empty()
    }
}

/// Removes a plan and everything it owns
#[derive(Clone)]
pub struct CascadeDeleter {
    store: Arc<dyn PrimaryStore>,
    index: Arc<dyn SearchIndex>,
    etags: EtagManager,
}

impl CascadeDeleter {
    pub fn new(store: Arc<dyn PrimaryStore>, index: Arc<dyn SearchIndex>, etags: EtagManager) -> Self {
        Self { store, index, etags }
    }

    /// Compute the full removal set, or `None` if the plan does not exist
    ///
    /// Records that are referenced but already missing are skipped, so a
    /// half-deleted plan can still be cleaned up.
    pub async fn closure(&self, plan_id: &str) -> Result<Option<Removal>> {
        let Some(closure) = Closure::collect(self.store.as_ref(), plan_id, Missing::Skip).await? else {
            return Ok(None);
        };
        let mut documents = closure.document_ids();
        documents.extend(closure.missing.iter().map(|r| r.id.clone()));
        let mut keys = closure.keys();
        keys.extend(self.etags.keys_for(plan_id).await?);
        Ok(Some(Removal { keys, documents }))
    }

    /// Delete a plan, returning the number of primary-store keys removed
    pub async fn delete_plan(&self, plan_id: &str) -> Result<usize> {
        let removal = self.closure(plan_id).await?.ok_or_else(|| Error::PlanNotFound {
            id: plan_id.to_string(),
        })?;
        let removed = self.remove(plan_id, &removal).await?;
        tracing::info!(plan_id, removed, documents = removal.documents.len(), "Deleted plan");
        Ok(removed)
    }

    /// Remove a set of index documents, then primary keys
    ///
    /// An index failure before anything was deleted is reported as-is; any
    /// failure after the first deletion is a partial delete.
    pub(crate) async fn remove(&self, plan_id: &str, removal: &Removal) -> Result<usize> {
        if !removal.documents.is_empty() {
            let ops = removal
                .documents
                .iter()
                .map(|id| BulkOp::Delete {
                    index: self.index.name().to_string(),
                    id: id.clone(),
                    routing: Some(plan_id.to_string()),
                })
                .collect();
            let response = self.index.bulk(ops).await?;
            let failures = response.failures();
            if let Some(first) = failures.first() {
                return Err(Error::PartialDelete {
                    plan_id: plan_id.to_string(),
                    message: format!(
                        "{} index document(s) not deleted, first '{}': {}",
                        failures.len(),
                        first.id,
                        first.error.as_deref().unwrap_or("unknown error")
                    ),
                });
            }
        }

        if removal.keys.is_empty() {
            return Ok(0);
        }
        self.store
            .delete(&removal.keys)
            .await
            .map_err(|e| Error::PartialDelete {
                plan_id: plan_id.to_string(),
                message: format!("index documents deleted but primary store failed: {}", e),
            })
    }
}
