//! Structural schema for plan documents
//!
//! A schema describes every node kind of the plan tree:
//! - Field definitions with types
//! - Required vs optional fields
//! - The `objectType` value a node must carry (optional)
//!
//! Composite slots (`planCostShares`, `linkedPlanServices`, `linkedService`,
//! `planserviceCostShares`) are structural and always required; their shape
//! comes from the tree itself rather than from field definitions.
//!
//! The built-in schema can be replaced by a YAML file:
//!
//! ```yaml
//! name: plan
//! nodes:
//!   Plan:
//!     object_type: plan
//!     fields:
//!       planType: { type: string, required: true }
//!   PlanCostShare:
//!     object_type: membercostshare
//!     fields:
//!       deductible: { type: int }
//! ```

use plandoc::{Body, NodeKind, OBJECT_ID, OBJECT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::validation::{validate_object_id, validate_object_type, ValidationError};

/// A field type in the schema
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Object,
    Array,
    #[default]
    Any,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }
}

/// Definition of a single field
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field type
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    /// Whether the field is required
    #[serde(default)]
    pub required: bool,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
}

impl FieldDef {
    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            ..Default::default()
        }
    }

    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            ..Default::default()
        }
    }
}

/// Schema for one node kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSchema {
    /// Required `objectType` value, if pinned
    #[serde(default)]
    pub object_type: Option<String>,
    /// Field definitions
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDef>,
    /// Whether fields without a definition are accepted
    #[serde(default = "default_true")]
    pub additional_fields: bool,
}

fn default_true() -> bool {
    true
}

impl NodeSchema {
    pub fn new(object_type: Option<&str>) -> Self {
        Self {
            object_type: object_type.map(str::to_string),
            fields: BTreeMap::new(),
            additional_fields: true,
        }
    }

    /// Add a field definition
    pub fn field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }
}

/// Schema for a whole plan document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSchema {
    /// Schema name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
    /// Per-kind node schemas; missing kinds accept any scalar fields
    #[serde(default)]
    pub nodes: HashMap<NodeKind, NodeSchema>,
}

/// Schema validation error
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Missing required field '{field}' at {path}")]
    MissingRequired { path: String, field: String },
    #[error("Invalid type for field {path}: expected {expected}, got {actual}")]
    TypeMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("Unexpected value at {path}: {message}")]
    UnexpectedValue { path: String, message: String },
    #[error("Duplicate objectId: {0}")]
    DuplicateObjectId(String),
    #[error(transparent)]
    Identifier(#[from] ValidationError),
}

impl PlanSchema {
    /// The insurance-plan use case schema
    pub fn builtin() -> Self {
        let cost_share = |object_type: &str| {
            NodeSchema::new(Some(object_type))
                .field("deductible", FieldDef::optional(FieldType::Int))
                .field("copay", FieldDef::optional(FieldType::Int))
                .field("_org", FieldDef::optional(FieldType::String))
        };

        let mut nodes = HashMap::new();
        nodes.insert(
            NodeKind::Plan,
            NodeSchema::new(Some("plan"))
                .field("_org", FieldDef::optional(FieldType::String))
                .field("planType", FieldDef::optional(FieldType::String))
                .field("creationDate", FieldDef::optional(FieldType::String)),
        );
        nodes.insert(NodeKind::PlanCostShare, cost_share("membercostshare"));
        nodes.insert(
            NodeKind::LinkedPlanService,
            NodeSchema::new(Some("planservice")).field("_org", FieldDef::optional(FieldType::String)),
        );
        nodes.insert(
            NodeKind::LinkedService,
            NodeSchema::new(Some("service"))
                .field("name", FieldDef::optional(FieldType::String))
                .field("_org", FieldDef::optional(FieldType::String)),
        );
        nodes.insert(NodeKind::PlanServiceCostShare, cost_share("membercostshare"));

        Self {
            name: "plan".to_string(),
            description: Some("Insurance plan with cost shares and linked services".to_string()),
            nodes,
        }
    }

    /// Load a schema from a YAML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let schema: PlanSchema = serde_yaml::from_str(&content)?;
        tracing::info!(schema = %schema.name, path = %path.display(), "Loaded plan schema");
        Ok(schema)
    }

    /// Validate a complete plan document against this schema
    pub fn validate(&self, plan: &Body) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        self.validate_node(NodeKind::Plan, plan, "$", &mut seen)
    }

    fn validate_node(
        &self,
        kind: NodeKind,
        body: &Body,
        path: &str,
        seen: &mut HashSet<String>,
    ) -> Result<(), SchemaError> {
        let id = require_str(body, OBJECT_ID, path)?;
        validate_object_id(id)?;
        let object_type = require_str(body, OBJECT_TYPE, path)?;
        validate_object_type(object_type)?;

        if !seen.insert(id.to_string()) {
            return Err(SchemaError::DuplicateObjectId(id.to_string()));
        }

        if let Some(node) = self.nodes.get(&kind) {
            if let Some(expected) = &node.object_type {
                if expected != object_type {
                    return Err(SchemaError::UnexpectedValue {
                        path: format!("{}.{}", path, OBJECT_TYPE),
                        message: format!("expected '{}', got '{}'", expected, object_type),
                    });
                }
            }

            for (name, def) in &node.fields {
                match body.get(name) {
                    None if def.required => {
                        return Err(SchemaError::MissingRequired {
                            path: path.to_string(),
                            field: name.clone(),
                        })
                    }
                    None => {}
                    Some(value) if !def.field_type.accepts(value) => {
                        return Err(SchemaError::TypeMismatch {
                            path: format!("{}.{}", path, name),
                            expected: def.field_type.name().to_string(),
                            actual: json_type_name(value).to_string(),
                        })
                    }
                    Some(_) => {}
                }
            }

            if !node.additional_fields {
                let unknown = body.keys().find(|key| {
                    key.as_str() != OBJECT_ID
                        && key.as_str() != OBJECT_TYPE
                        && !node.fields.contains_key(key.as_str())
                        && !kind.slots().iter().any(|s| s.field() == key.as_str())
                });
                if let Some(key) = unknown {
                    return Err(SchemaError::UnexpectedValue {
                        path: format!("{}.{}", path, key),
                        message: "field is not defined by the schema".to_string(),
                    });
                }
            }
        }

        for slot in kind.slots() {
            let slot_path = format!("{}.{}", path, slot.field());
            let value = body.get(slot.field()).ok_or_else(|| SchemaError::MissingRequired {
                path: path.to_string(),
                field: slot.field().to_string(),
            })?;

            if slot.is_list() {
                let items = value.as_array().ok_or_else(|| type_mismatch(&slot_path, "array", value))?;
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{}[{}]", slot_path, i);
                    let child = item.as_object().ok_or_else(|| type_mismatch(&item_path, "object", item))?;
                    self.validate_node(slot.child(), child, &item_path, seen)?;
                }
            } else {
                let child = value.as_object().ok_or_else(|| type_mismatch(&slot_path, "object", value))?;
                self.validate_node(slot.child(), child, &slot_path, seen)?;
            }
        }

        Ok(())
    }
}

impl Default for PlanSchema {
    fn default() -> Self {
        Self::builtin()
    }
}

fn require_str<'a>(body: &'a Body, field: &str, path: &str) -> Result<&'a str, SchemaError> {
    match body.get(field) {
        None => Err(SchemaError::MissingRequired {
            path: path.to_string(),
            field: field.to_string(),
        }),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(type_mismatch(&format!("{}.{}", path, field), "string", other)),
    }
}

fn type_mismatch(path: &str, expected: &str, actual: &Value) -> SchemaError {
    SchemaError::TypeMismatch {
        path: path.to_string(),
        expected: expected.to_string(),
        actual: json_type_name(actual).to_string(),
    }
}

/// JSON type name for error messages
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
