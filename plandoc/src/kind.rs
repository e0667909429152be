//! Node kinds and the slots that link them

use serde::{Deserialize, Serialize};

/// Position of a node in the plan tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Plan,
    PlanCostShare,
    LinkedPlanService,
    LinkedService,
    PlanServiceCostShare,
}

impl NodeKind {
    pub const ALL: [NodeKind; 5] = [
        NodeKind::Plan,
        NodeKind::PlanCostShare,
        NodeKind::LinkedPlanService,
        NodeKind::LinkedService,
        NodeKind::PlanServiceCostShare,
    ];

    /// Relation name used in the index `join_field`
    pub fn join_name(self) -> &'static str {
        match self {
            NodeKind::Plan => "plan",
            NodeKind::PlanCostShare => "planCostShares",
            NodeKind::LinkedPlanService => "linkedPlanServices",
            NodeKind::LinkedService => "linkedService",
            NodeKind::PlanServiceCostShare => "planserviceCostShares",
        }
    }

    pub fn from_join_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.join_name() == name)
    }

    /// Slots this kind owns, in document order
    pub fn slots(self) -> &'static [Slot] {
        match self {
            NodeKind::Plan => &[Slot::PlanCostShares, Slot::LinkedPlanServices],
            NodeKind::LinkedPlanService => &[Slot::LinkedService, Slot::PlanserviceCostShares],
            _ => &[],
        }
    }

    pub fn parent(self) -> Option<NodeKind> {
        self.slot_in_parent().map(Slot::owner)
    }

    /// The slot through which a parent owns this kind
    pub fn slot_in_parent(self) -> Option<Slot> {
        match self {
            NodeKind::Plan => None,
            NodeKind::PlanCostShare => Some(Slot::PlanCostShares),
            NodeKind::LinkedPlanService => Some(Slot::LinkedPlanServices),
            NodeKind::LinkedService => Some(Slot::LinkedService),
            NodeKind::PlanServiceCostShare => Some(Slot::PlanserviceCostShares),
        }
    }
}

/// A composite field of a node that holds owned sub-objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    #[serde(rename = "planCostShares")]
    PlanCostShares,
    #[serde(rename = "linkedPlanServices")]
    LinkedPlanServices,
    #[serde(rename = "linkedService")]
    LinkedService,
    #[serde(rename = "planserviceCostShares")]
    PlanserviceCostShares,
}

impl Slot {
    /// Field name in the composite document
    pub fn field(self) -> &'static str {
        match self {
            Slot::PlanCostShares => "planCostShares",
            Slot::LinkedPlanServices => "linkedPlanServices",
            Slot::LinkedService => "linkedService",
            Slot::PlanserviceCostShares => "planserviceCostShares",
        }
    }

    /// Kind of node stored in this slot
    pub fn child(self) -> NodeKind {
        match self {
            Slot::PlanCostShares => NodeKind::PlanCostShare,
            Slot::LinkedPlanServices => NodeKind::LinkedPlanService,
            Slot::LinkedService => NodeKind::LinkedService,
            Slot::PlanserviceCostShares => NodeKind::PlanServiceCostShare,
        }
    }

    /// Kind of node that owns this slot
    pub fn owner(self) -> NodeKind {
        match self {
            Slot::PlanCostShares | Slot::LinkedPlanServices => NodeKind::Plan,
            Slot::LinkedService | Slot::PlanserviceCostShares => NodeKind::LinkedPlanService,
        }
    }

    /// True for slots holding an ordered list rather than one object
    pub fn is_list(self) -> bool {
        matches!(self, Slot::LinkedPlanServices)
    }
}
