//! Mutation engine
//!
//! Applies create, update and delete to both stores. Only the queue consumer
//! calls into this, so mutations never overlap.
//!
//! Write order for a plan: ETag invalidation, child records, then the root
//! record (the root's presence is what makes a plan visible), then the index
//! bulk request, then removal of records the new version no longer reaches,
//! then ETag invalidation again for tokens issued while the write ran.
//!
//! A failed store or index write restores the records and documents already
//! written to their previous version, so a failed create leaves nothing
//! behind and a failed update leaves the old plan in place.

use plandoc::{Action, Body, QueueMessage, OBJECT_ID};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cascade::{CascadeDeleter, Removal};
use crate::document::{decompose, merge, Closure, Decomposition, Missing, PlanPatch};
use crate::error::{Error, Result};
use crate::etag::{EtagManager, ALL_PLANS};
use crate::index::{BulkOp, IndexError, SearchIndex};
use crate::schema::PlanSchema;
use crate::storage::{PrimaryStore, Record};
use crate::validation::validate_object_id;

/// Outcome of one applied mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Created { plan_id: String, records: usize },
    /// Duplicate create, nothing written
    AlreadyExists { plan_id: String },
    Updated { plan_id: String, records: usize, removed: usize },
    Deleted { plan_id: String, removed: usize },
}

impl Applied {
    pub fn plan_id(&self) -> &str {
        match self {
            Applied::Created { plan_id, .. }
            | Applied::AlreadyExists { plan_id }
            | Applied::Updated { plan_id, .. }
            | Applied::Deleted { plan_id, .. } => plan_id,
        }
    }
}

/// Applies mutations to the primary store and search index
pub struct SyncEngine {
    store: Arc<dyn PrimaryStore>,
    index: Arc<dyn SearchIndex>,
    schema: Arc<PlanSchema>,
    etags: EtagManager,
    deleter: CascadeDeleter,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn PrimaryStore>, index: Arc<dyn SearchIndex>, schema: Arc<PlanSchema>) -> Self {
        let etags = EtagManager::new(store.clone());
        let deleter = CascadeDeleter::new(store.clone(), index.clone(), etags.clone());
        Self {
            store,
            index,
            schema,
            etags,
            deleter,
        }
    }

    pub fn store(&self) -> &Arc<dyn PrimaryStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    pub fn schema(&self) -> &PlanSchema {
        &self.schema
    }

    pub fn etags(&self) -> &EtagManager {
        &self.etags
    }

    /// Apply a queue message
    pub async fn apply(&self, message: &QueueMessage) -> Result<Applied> {
        match message.action {
            Action::Create => self.create(&message.data).await,
            Action::Update => self.update(&message.data).await,
            Action::Delete => {
                let plan_id = message.object_id().ok_or_else(|| Error::InvalidMessage {
                    message: "delete requires data.objectId".to_string(),
                })?;
                self.delete(plan_id).await
            }
        }
    }

    /// Store a new plan; a plan that already exists is left untouched
    pub async fn create(&self, plan: &Body) -> Result<Applied> {
        let plan_id = plan
            .get(OBJECT_ID)
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::MissingRequiredField {
                path: "$".to_string(),
                field: OBJECT_ID.to_string(),
            })?
            .to_string();
        validate_object_id(&plan_id)?;

        if self.store.exists(&plan_id).await? {
            tracing::info!(plan_id = %plan_id, "Plan already exists, ignoring create");
            return Ok(Applied::AlreadyExists { plan_id });
        }

        self.schema.validate(plan)?;
        let decomposition = decompose(plan)?;
        self.check_ownership(&decomposition, &HashSet::new()).await?;

        self.etags.invalidate_all(ALL_PLANS).await?;
        self.write(&decomposition, None).await?;
        self.etags.invalidate_all(ALL_PLANS).await?;

        tracing::info!(plan_id = %plan_id, records = decomposition.records.len(), "Created plan");
        Ok(Applied::Created {
            plan_id,
            records: decomposition.records.len(),
        })
    }

    /// Merge a patch into an existing plan
    pub async fn update(&self, data: &Body) -> Result<Applied> {
        let patch = PlanPatch::parse(data)?;
        let plan_id = patch.plan_id.clone();

        let closure = Closure::collect(self.store.as_ref(), &plan_id, Missing::Fail)
            .await?
            .ok_or_else(|| Error::PlanNotFound { id: plan_id.clone() })?;
        let current = closure.assemble()?;
        let merged = merge(&current, &patch)?;
        self.schema.validate(&merged)?;

        let previous = decompose(&current)?;
        let decomposition = decompose(&merged)?;
        let owned: HashSet<String> = closure.keys().into_iter().collect();
        self.check_ownership(&decomposition, &owned).await?;

        self.invalidate(&plan_id).await?;
        self.write(&decomposition, Some(&previous)).await?;

        let stale = stale_records(&closure, &decomposition);
        let removed = if stale.is_empty() {
            0
        } else {
            self.deleter.remove(&plan_id, &stale).await?
        };
        self.invalidate(&plan_id).await?;

        tracing::info!(plan_id = %plan_id, removed, "Updated plan");
        Ok(Applied::Updated {
            plan_id,
            records: decomposition.records.len(),
            removed,
        })
    }

    /// Cascade-delete a plan
    pub async fn delete(&self, plan_id: &str) -> Result<Applied> {
        self.invalidate(plan_id).await?;
        let removed = self.deleter.delete_plan(plan_id).await?;
        self.etags.invalidate_all(ALL_PLANS).await?;
        Ok(Applied::Deleted {
            plan_id: plan_id.to_string(),
            removed,
        })
    }

    /// Drop the tokens of a plan and of the plan list
    async fn invalidate(&self, plan_id: &str) -> Result<()> {
        self.etags.invalidate_all(plan_id).await?;
        self.etags.invalidate_all(ALL_PLANS).await?;
        Ok(())
    }

    /// Reject sub-objects that already belong to a different plan
    async fn check_ownership(&self, decomposition: &Decomposition, owned: &HashSet<String>) -> Result<()> {
        for record in decomposition.records.iter().skip(1) {
            let key = record.key.as_key();
            if !owned.contains(&key) && self.store.exists(&key).await? {
                return Err(Error::AliasedObject { key });
            }
        }
        for doc in &decomposition.documents {
            if let Some(hit) = self.index.get(&doc.id).await? {
                if hit.routing != decomposition.plan_id {
                    return Err(Error::AliasedObject { key: doc.id.clone() });
                }
            }
        }
        Ok(())
    }

    /// Store and index a decomposed plan, restoring `previous` on failure
    async fn write(&self, decomposition: &Decomposition, previous: Option<&Decomposition>) -> Result<()> {
        let mut serialized = Vec::with_capacity(decomposition.records.len());
        for record in decomposition.records.iter().rev() {
            serialized.push((record.key.as_key(), record.record.to_json()?));
        }

        let mut written = Vec::with_capacity(serialized.len());
        for (key, json) in &serialized {
            if let Err(e) = self.store.set(key, json).await {
                tracing::error!(
                    plan_id = %decomposition.plan_id,
                    key = %key,
                    error = %e,
                    "Store write failed, rolling back"
                );
                self.restore_records(&written, previous).await;
                return Err(e.into());
            }
            tracing::debug!(key = %key, "Stored record");
            written.push(key.clone());
        }

        if let Err(e) = self.index_documents(decomposition).await {
            tracing::error!(
                plan_id = %decomposition.plan_id,
                error = %e,
                "Index write failed, rolling back"
            );
            self.restore_documents(decomposition, previous).await;
            self.restore_records(&written, previous).await;
            return Err(e);
        }
        Ok(())
    }

    async fn index_documents(&self, decomposition: &Decomposition) -> Result<()> {
        let ops = decomposition
            .documents
            .iter()
            .cloned()
            .map(|doc| BulkOp::Index {
                index: self.index.name().to_string(),
                doc,
            })
            .collect();
        let response = self.index.bulk(ops).await?;
        let failures = response.failures();
        if let Some(first) = failures.first() {
            tracing::error!(
                plan_id = %decomposition.plan_id,
                failed = failures.len(),
                "Index rejected plan documents"
            );
            return Err(IndexError::BulkRejected {
                failed: failures.len(),
                message: format!(
                    "'{}': {}",
                    first.id,
                    first.error.as_deref().unwrap_or("unknown error")
                ),
            }
            .into());
        }
        Ok(())
    }

    /// Put written keys back to their previous record, deleting new ones
    ///
    /// Best effort: failures are logged and the original error is returned.
    async fn restore_records(&self, written: &[String], previous: Option<&Decomposition>) {
        let old: HashMap<String, &Record> = previous
            .map(|d| d.records.iter().map(|r| (r.key.as_key(), &r.record)).collect())
            .unwrap_or_default();

        let mut added = Vec::new();
        for key in written.iter().rev() {
            let Some(record) = old.get(key) else {
                added.push(key.clone());
                continue;
            };
            let restored = match record.to_json() {
                Ok(json) => self.store.set(key, &json).await.map_err(Error::from),
                Err(e) => Err(e),
            };
            if let Err(e) = restored {
                tracing::warn!(key = %key, error = %e, "Could not restore record");
            }
        }

        if added.is_empty() {
            return;
        }
        match self.store.delete(&added).await {
            Ok(removed) => tracing::debug!(removed, "Removed records of failed write"),
            Err(e) => tracing::warn!(keys = added.len(), error = %e, "Could not remove records of failed write"),
        }
    }

    /// Re-index the previous documents and drop documents only the new version has
    async fn restore_documents(&self, decomposition: &Decomposition, previous: Option<&Decomposition>) {
        let index = self.index.name().to_string();
        let old_ids: HashSet<String> = previous.map(|d| d.document_ids().into_iter().collect()).unwrap_or_default();

        let mut ops: Vec<BulkOp> = decomposition
            .documents
            .iter()
            .filter(|doc| !old_ids.contains(&doc.id))
            .map(|doc| BulkOp::Delete {
                index: index.clone(),
                id: doc.id.clone(),
                routing: Some(decomposition.plan_id.clone()),
            })
            .collect();
        if let Some(previous) = previous {
            ops.extend(previous.documents.iter().cloned().map(|doc| BulkOp::Index {
                index: index.clone(),
                doc,
            }));
        }
        if ops.is_empty() {
            return;
        }

        match self.index.bulk(ops).await {
            Ok(response) if !response.has_errors() => {}
            Ok(response) => tracing::warn!(
                plan_id = %decomposition.plan_id,
                failed = response.failures().len(),
                "Could not restore index documents"
            ),
            Err(e) => tracing::warn!(
                plan_id = %decomposition.plan_id,
                error = %e,
                "Could not restore index documents"
            ),
        }
    }
}

/// Records and documents the old version reached but the new one does not
fn stale_records(old: &Closure, new: &Decomposition) -> Removal {
    let new_keys: HashSet<String> = new.keys().into_iter().collect();
    let new_ids: HashSet<String> = new.document_ids().into_iter().collect();
    let mut stale = Removal::default();
    for (key, record) in &old.records {
        if new_keys.contains(key) {
            continue;
        }
        stale.keys.push(key.clone());
        if let Some(id) = record.object_id().filter(|id| !new_ids.contains(*id)) {
            stale.documents.push(id.to_string());
        }
    }
    stale
}
