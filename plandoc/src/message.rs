//! Queue message envelope

use serde::{Deserialize, Serialize};

use crate::{Body, MessageError, OBJECT_ID};

/// Mutation requested by a queue message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

/// A message on the mutation queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub action: Action,
    pub data: Body,
}

impl QueueMessage {
    pub fn create(plan: Body) -> Self {
        Self {
            action: Action::Create,
            data: plan,
        }
    }

    pub fn update(patch: Body) -> Self {
        Self {
            action: Action::Update,
            data: patch,
        }
    }

    pub fn delete(plan_id: impl Into<String>) -> Self {
        let mut data = Body::new();
        data.insert(OBJECT_ID.to_string(), serde_json::Value::String(plan_id.into()));
        Self {
            action: Action::Delete,
            data,
        }
    }

    pub fn object_id(&self) -> Option<&str> {
        self.data.get(OBJECT_ID).and_then(|v| v.as_str())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Envelope before `data` is known to be an object
#[derive(Deserialize)]
struct RawMessage {
    action: Action,
    data: serde_json::Value,
}

pub(crate) fn parse(input: &[u8]) -> Result<QueueMessage, MessageError> {
    let raw: RawMessage = serde_json::from_slice(input)?;
    let data = match raw.data {
        serde_json::Value::Object(map) => map,
        _ => return Err(MessageError::DataNotObject),
    };

    let msg = QueueMessage {
        action: raw.action,
        data,
    };

    if matches!(msg.action, Action::Update | Action::Delete) && msg.object_id().is_none() {
        return Err(MessageError::MissingObjectId {
            action: msg.action.as_str(),
        });
    }

    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_message_bytes() {
        let msg = QueueMessage::delete("p1");
        let bytes = msg.to_bytes().unwrap();
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_data_must_be_object() {
        assert!(matches!(
            parse(br#"{"action":"create","data":[1,2]}"#),
            Err(MessageError::DataNotObject)
        ));
    }
}
