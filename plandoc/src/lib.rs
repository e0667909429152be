//! plandoc - Plan document vocabulary
//!
//! Shared types for the plan document tree and the mutation queue.
//!
//! # Document Tree
//!
//! ```text
//! plan
//! ├── planCostShares            (membercostshare)
//! └── linkedPlanServices[]      (planservice)
//!     ├── linkedService         (service)
//!     └── planserviceCostShares (membercostshare)
//! ```
//!
//! # Queue Messages
//!
//! ```json
//! { "action": "create", "data": { "objectId": "p1", "objectType": "plan", ... } }
//! { "action": "update", "data": { "objectId": "p1", "planCostShares": { "deductible": 500 } } }
//! { "action": "delete", "data": { "objectId": "p1" } }
//! ```

mod error;
mod kind;
mod message;
mod reference;

pub use error::MessageError;
pub use kind::{NodeKind, Slot};
pub use message::{Action, QueueMessage};
pub use reference::{ObjectRef, RecordKey};

/// JSON object body of a plan or one of its sub-objects
pub type Body = serde_json::Map<String, serde_json::Value>;

/// Field holding a node's unique id
pub const OBJECT_ID: &str = "objectId";
/// Field holding a node's type name
pub const OBJECT_TYPE: &str = "objectType";

/// Parse a raw queue message body
pub fn parse_message(input: &[u8]) -> Result<QueueMessage, MessageError> {
    message::parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create() {
        let msg = parse_message(br#"{"action":"create","data":{"objectId":"p1","objectType":"plan"}}"#).unwrap();
        assert_eq!(msg.action, Action::Create);
        assert_eq!(msg.object_id(), Some("p1"));
    }

    #[test]
    fn test_parse_update_requires_object_id() {
        let err = parse_message(br#"{"action":"update","data":{"planCostShares":{}}}"#).unwrap_err();
        assert!(err.to_string().contains("objectId"));
    }

    #[test]
    fn test_parse_unknown_action() {
        assert!(parse_message(br#"{"action":"upsert","data":{}}"#).is_err());
    }

    #[test]
    fn test_tree_shape() {
        assert_eq!(NodeKind::Plan.slots(), &[Slot::PlanCostShares, Slot::LinkedPlanServices]);
        assert_eq!(Slot::LinkedService.child(), NodeKind::LinkedService);
        assert_eq!(NodeKind::PlanServiceCostShare.parent(), Some(NodeKind::LinkedPlanService));
        assert!(NodeKind::Plan.parent().is_none());
    }
}
