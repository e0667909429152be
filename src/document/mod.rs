//! Composite plan documents
//!
//! Converts between the nested form clients send and read, and the
//! normalized form held by the primary store and the search index.
//!
//! - [`decompose`] splits a plan into one record and one index document per node
//! - [`reconstruct`] rebuilds the plan from primary-store records
//! - [`reconstruct_from_index`] rebuilds it from parent-child index queries
//! - [`merge`] applies a partial update to a reconstructed plan

mod decompose;
mod merge;
mod reconstruct;

pub use decompose::{decompose, Decomposition, PrimaryRecord};
pub use merge::{merge, PatchField, PlanPatch};
pub use reconstruct::{reconstruct, reconstruct_from_index, Closure, Missing};

use plandoc::{Body, ObjectRef, OBJECT_ID, OBJECT_TYPE};

use crate::error::{Error, Result};

/// Read the `objectType:objectId` reference of a node body
pub(crate) fn node_ref(body: &Body, path: &str) -> Result<ObjectRef> {
    let field = |name: &str| {
        body.get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::MissingRequiredField {
                path: path.to_string(),
                field: name.to_string(),
            })
    };
    Ok(ObjectRef::new(field(OBJECT_TYPE)?, field(OBJECT_ID)?))
}
