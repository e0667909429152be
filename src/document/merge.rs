//! Partial plan updates
//!
//! A patch names the plan by `objectId` and carries replacement content for
//! the patchable slots:
//!
//! - `planCostShares`: fields overwrite the existing cost share's fields
//! - `linkedPlanServices`: each entry is matched by `objectId`; a match is
//!   merged field by field, anything else is appended
//!
//! Merges are shallow. A nested object supplied inside a patch entry
//! replaces the existing one wholesale.

use plandoc::{Body, Slot, OBJECT_ID, OBJECT_TYPE};
use serde_json::Value;

use crate::error::{Error, Result};

/// Content supplied for one patchable slot
#[derive(Debug, Clone, PartialEq)]
pub enum PatchField {
    PlanCostShares(Body),
    LinkedPlanServices(Vec<Body>),
}

/// A parsed partial update
#[derive(Debug, Clone, PartialEq)]
pub struct PlanPatch {
    pub plan_id: String,
    pub object_type: Option<String>,
    pub fields: Vec<PatchField>,
}

impl PlanPatch {
    /// Parse patch data, rejecting fields outside the patchable slots
    pub fn parse(data: &Body) -> Result<Self> {
        let plan_id = data
            .get(OBJECT_ID)
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("objectId is required"))?
            .to_string();

        let mut patch = PlanPatch {
            plan_id,
            object_type: None,
            fields: Vec::new(),
        };

        for (key, value) in data {
            match key.as_str() {
                OBJECT_ID => {}
                OBJECT_TYPE => {
                    let t = value.as_str().ok_or_else(|| invalid("objectType must be a string"))?;
                    patch.object_type = Some(t.to_string());
                }
                k if k == Slot::PlanCostShares.field() => {
                    let Value::Object(fields) = value else {
                        return Err(invalid("planCostShares must be an object"));
                    };
                    patch.fields.push(PatchField::PlanCostShares(fields.clone()));
                }
                k if k == Slot::LinkedPlanServices.field() => {
                    let Value::Array(items) = value else {
                        return Err(invalid("linkedPlanServices must be an array"));
                    };
                    let mut entries = Vec::with_capacity(items.len());
                    for (i, item) in items.iter().enumerate() {
                        let entry = item
                            .as_object()
                            .filter(|o| o.get(OBJECT_ID).and_then(|v| v.as_str()).is_some())
                            .ok_or_else(|| {
                                invalid(&format!("linkedPlanServices[{}] needs a string objectId", i))
                            })?;
                        entries.push(entry.clone());
                    }
                    patch.fields.push(PatchField::LinkedPlanServices(entries));
                }
                other => {
                    return Err(Error::UnsupportedPatchField {
                        field: other.to_string(),
                    })
                }
            }
        }

        Ok(patch)
    }
}

/// Apply a patch to a reconstructed plan, returning the merged plan
pub fn merge(existing: &Body, patch: &PlanPatch) -> Result<Body> {
    if existing.get(OBJECT_ID).and_then(|v| v.as_str()) != Some(patch.plan_id.as_str()) {
        return Err(invalid("objectId does not match the plan"));
    }
    if let Some(t) = &patch.object_type {
        if existing.get(OBJECT_TYPE).and_then(|v| v.as_str()) != Some(t.as_str()) {
            return Err(invalid("objectType cannot be changed"));
        }
    }

    let mut merged = existing.clone();
    for field in &patch.fields {
        match field {
            PatchField::PlanCostShares(fields) => {
                let slot = Slot::PlanCostShares.field();
                let mut target = merged
                    .get(slot)
                    .and_then(|v| v.as_object())
                    .cloned()
                    .unwrap_or_default();
                target.extend(fields.clone());
                merged.insert(slot.to_string(), Value::Object(target));
            }
            PatchField::LinkedPlanServices(entries) => {
                let slot = Slot::LinkedPlanServices.field();
                let mut list = match merged.get(slot) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                for entry in entries {
                    let id = entry.get(OBJECT_ID);
                    match list
                        .iter_mut()
                        .filter_map(Value::as_object_mut)
                        .find(|item| item.get(OBJECT_ID) == id)
                    {
                        Some(item) => item.extend(entry.clone()),
                        None => list.push(Value::Object(entry.clone())),
                    }
                }
                merged.insert(slot.to_string(), Value::Array(list));
            }
        }
    }
    Ok(merged)
}

fn invalid(message: &str) -> Error {
    Error::InvalidPatch {
        message: message.to_string(),
    }
}
