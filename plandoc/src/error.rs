//! Error types for queue message decoding

use thiserror::Error;

/// Error raised when a queue message body cannot be decoded
#[derive(Debug, Clone, Error)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message 'data' must be a JSON object")]
    DataNotObject,

    #[error("'{action}' message requires a string 'objectId' in 'data'")]
    MissingObjectId { action: &'static str },
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        MessageError::Malformed(err.to_string())
    }
}
