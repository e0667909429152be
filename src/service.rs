//! Request-facing plan operations
//!
//! Reads are served directly from the stores. Mutations are checked against
//! current state, then published to the queue and answered as accepted; the
//! consumer applies them later.

use plandoc::{Action, Body, QueueMessage, OBJECT_ID};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use crate::document::{merge, reconstruct, reconstruct_from_index, PlanPatch};
use crate::error::{Error, Result};
use crate::etag::{EtagCondition, EtagManager, ALL_PLANS};
use crate::index::{strip_metadata, SearchIndex, SearchQuery};
use crate::queue::MessageQueue;
use crate::schema::PlanSchema;
use crate::storage::{PrimaryStore, StoreError};
use crate::validation::validate_object_id;

/// Reads of a body that keeps changing before its token is confirmed
const MAX_READ_ATTEMPTS: usize = 5;

/// A mutation accepted onto the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub action: Action,
    pub plan_id: String,
}

impl Accepted {
    /// 201 for a create, 202 otherwise
    pub fn status(&self) -> u16 {
        match self.action {
            Action::Create => 201,
            Action::Update | Action::Delete => 202,
        }
    }
}

/// Answer to a conditional read
#[derive(Debug, Clone, PartialEq)]
pub enum Conditional<T> {
    /// The caller's token is still current
    NotModified,
    Fresh { body: T, etag: String },
}

impl<T> Conditional<T> {
    pub fn status(&self) -> u16 {
        match self {
            Conditional::NotModified => 304,
            Conditional::Fresh { .. } => 200,
        }
    }

    pub fn into_body(self) -> Option<T> {
        match self {
            Conditional::NotModified => None,
            Conditional::Fresh { body, .. } => Some(body),
        }
    }
}

/// Plan operations as a controller sees them
#[derive(Clone)]
pub struct PlanService {
    store: Arc<dyn PrimaryStore>,
    index: Arc<dyn SearchIndex>,
    schema: Arc<PlanSchema>,
    queue: Arc<dyn MessageQueue>,
    etags: EtagManager,
    scan_pattern: String,
}

impl PlanService {
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        index: Arc<dyn SearchIndex>,
        schema: Arc<PlanSchema>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        let etags = EtagManager::new(store.clone());
        Self {
            store,
            index,
            schema,
            queue,
            etags,
            scan_pattern: "*".to_string(),
        }
    }

    pub fn with_scan_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.scan_pattern = pattern.into();
        self
    }

    /// Validate a new plan and queue its creation
    pub async fn create_plan(&self, plan: Value) -> Result<Accepted> {
        let Value::Object(plan) = plan else {
            return Err(Error::SchemaValidation {
                path: "$".to_string(),
                message: "plan must be a JSON object".to_string(),
            });
        };
        let plan_id = required_id(&plan)?;
        validate_object_id(&plan_id)?;

        if self.store.exists(&plan_id).await? {
            return Err(Error::PlanAlreadyExists { id: plan_id });
        }
        self.schema.validate(&plan)?;

        self.publish(QueueMessage::create(plan)).await?;
        Ok(Accepted {
            action: Action::Create,
            plan_id,
        })
    }

    /// Check a partial update against the current plan and queue it
    ///
    /// With `if_match`, the update is refused unless one of the listed
    /// tokens is current for the plan.
    pub async fn patch_plan(&self, plan_id: &str, patch: Value, if_match: Option<&str>) -> Result<Accepted> {
        validate_object_id(plan_id)?;
        if !self.store.exists(plan_id).await? {
            return Err(Error::PlanNotFound {
                id: plan_id.to_string(),
            });
        }

        if let Some(header) = if_match {
            let condition = EtagCondition::parse(header);
            if !self.etags.matches(plan_id, &condition).await? {
                tracing::info!(plan_id, if_match = header, "Precondition failed");
                return Err(Error::PreconditionFailed {
                    id: plan_id.to_string(),
                    etag: condition.display(),
                });
            }
        }

        let Value::Object(mut data) = patch else {
            return Err(Error::InvalidPatch {
                message: "patch must be a JSON object".to_string(),
            });
        };
        match data.get(OBJECT_ID) {
            None => {
                data.insert(OBJECT_ID.to_string(), Value::String(plan_id.to_string()));
            }
            Some(Value::String(id)) if id == plan_id => {}
            Some(_) => {
                return Err(Error::InvalidPatch {
                    message: format!("objectId does not match plan '{}'", plan_id),
                })
            }
        }

        let parsed = PlanPatch::parse(&data)?;
        let merged = merge(&reconstruct(self.store.as_ref(), plan_id).await?, &parsed)?;
        self.schema.validate(&merged)?;

        self.publish(QueueMessage::update(data)).await?;
        Ok(Accepted {
            action: Action::Update,
            plan_id: plan_id.to_string(),
        })
    }

    /// Read a plan, honouring `If-None-Match`
    pub async fn get_plan(&self, plan_id: &str, if_none_match: Option<&str>) -> Result<Conditional<Body>> {
        validate_object_id(plan_id)?;
        if let Some(header) = if_none_match {
            if self.etags.matches(plan_id, &EtagCondition::parse(header)).await? {
                tracing::debug!(plan_id, "Plan not modified");
                return Ok(Conditional::NotModified);
            }
        }

        let store = self.store.as_ref();
        let (body, etag) = self
            .read_with_etag(plan_id, move || reconstruct(store, plan_id))
            .await?;
        Ok(Conditional::Fresh { body, etag })
    }

    /// Read every plan, honouring `If-None-Match`
    pub async fn list_plans(&self, if_none_match: Option<&str>) -> Result<Conditional<Vec<Body>>> {
        if let Some(header) = if_none_match {
            if self.etags.matches(ALL_PLANS, &EtagCondition::parse(header)).await? {
                return Ok(Conditional::NotModified);
            }
        }

        let (body, etag) = self
            .read_with_etag(ALL_PLANS, move || self.read_plans())
            .await?;
        Ok(Conditional::Fresh { body, etag })
    }

    async fn read_plans(&self) -> Result<Vec<Body>> {
        let ids = self.plan_ids().await?;
        if ids.is_empty() {
            return Err(Error::NoPlansFound);
        }
        let mut plans = Vec::with_capacity(ids.len());
        for id in &ids {
            plans.push(reconstruct(self.store.as_ref(), id).await?);
        }
        Ok(plans)
    }

    /// Read a body and issue its token, then read again
    ///
    /// A mutation that lands between the first read and the token being
    /// stored has already run its invalidation. When the second read differs
    /// the token is revoked and the newer body goes round again.
    async fn read_with_etag<T, F, Fut>(&self, owner: &str, read: F) -> Result<(T, String)>
    where
        T: PartialEq + Serialize,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut body = read().await?;
        for _ in 0..MAX_READ_ATTEMPTS {
            let etag = self.etags.issue(owner, &serde_json::to_value(&body)?).await?;
            let current = match read().await {
                Ok(current) => current,
                Err(e) => {
                    self.etags.revoke(owner, &etag).await?;
                    return Err(e);
                }
            };
            if current == body {
                return Ok((body, etag));
            }
            tracing::debug!(owner, "Body changed while issuing ETag, reading again");
            self.etags.revoke(owner, &etag).await?;
            body = current;
        }
        Err(StoreError::Unavailable(format!("'{}' kept changing while being read", owner)).into())
    }

    /// Ids of every stored plan, in key order
    pub async fn plan_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .store
            .scan(&self.scan_pattern)
            .await?
            .into_iter()
            .filter(|key| !key.contains(':'))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Queue a cascade delete
    pub async fn delete_plan(&self, plan_id: &str) -> Result<Accepted> {
        validate_object_id(plan_id)?;
        if !self.store.exists(plan_id).await? {
            return Err(Error::PlanNotFound {
                id: plan_id.to_string(),
            });
        }
        self.publish(QueueMessage::delete(plan_id)).await?;
        Ok(Accepted {
            action: Action::Delete,
            plan_id: plan_id.to_string(),
        })
    }

    /// Search the index, returning each owning plan once
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<Body>> {
        let hits = self.index.search(query).await?;
        let mut seen = BTreeSet::new();
        let mut plans = Vec::new();
        for hit in hits {
            if !seen.insert(hit.routing.clone()) {
                continue;
            }
            match reconstruct_from_index(self.index.as_ref(), &hit.routing).await {
                Ok(plan) => plans.push(plan),
                Err(Error::PlanNotFound { id }) => {
                    tracing::warn!(plan_id = %id, doc = %hit.id, "Search hit has no plan root");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(plans)
    }

    /// Direct children of any node, as stored in the index
    pub async fn children(&self, parent_id: &str) -> Result<Vec<Body>> {
        validate_object_id(parent_id)?;
        let hits = self
            .index
            .search(&SearchQuery::ChildrenOf {
                parent_id: parent_id.to_string(),
            })
            .await?;
        Ok(hits.into_iter().map(|h| strip_metadata(h.source)).collect())
    }

    async fn publish(&self, message: QueueMessage) -> Result<()> {
        let bytes = message.to_bytes()?;
        self.queue.publish(bytes).await?;
        tracing::info!(
            action = message.action.as_str(),
            plan_id = message.object_id().unwrap_or_default(),
            queue = %self.queue.name(),
            "Queued mutation"
        );
        Ok(())
    }
}

fn required_id(body: &Body) -> Result<String> {
    body.get(OBJECT_ID)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::MissingRequiredField {
            path: "$".to_string(),
            field: OBJECT_ID.to_string(),
        })
}
