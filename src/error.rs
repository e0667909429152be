//! Error types for plansync
//!
//! Every failure a caller can observe maps to one [`ErrorKind`], and every
//! kind maps to one HTTP status. Expected outcomes (not found, conflict,
//! validation, stale precondition) are ordinary values of this type rather
//! than panics.

use thiserror::Error;

use crate::index::IndexError;
use crate::queue::QueueError;
use crate::storage::StoreError;

/// The main error type for plansync operations
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Plan Errors
    // ==========================================================================
    #[error("Plan '{id}' not found")]
    PlanNotFound { id: String },

    #[error("No plans found")]
    NoPlansFound,

    #[error("Plan '{id}' already exists")]
    PlanAlreadyExists { id: String },

    #[error("Object '{key}' is already owned by another plan")]
    AliasedObject { key: String },

    #[error("Precondition failed for plan '{id}': ETag '{etag}' is not current")]
    PreconditionFailed { id: String, etag: String },

    // ==========================================================================
    // Validation Errors
    // ==========================================================================
    #[error("Schema validation failed at '{path}': {message}")]
    SchemaValidation { path: String, message: String },

    #[error("Missing required field '{field}' at '{path}'")]
    MissingRequiredField { path: String, field: String },

    #[error("Type mismatch for field '{path}': expected {expected}, got {actual}")]
    TypeMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid {kind} '{value}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Duplicate objectId '{id}' within plan document")]
    DuplicateObjectId { id: String },

    #[error("Field '{field}' cannot be patched")]
    UnsupportedPatchField { field: String },

    #[error("Invalid patch: {message}")]
    InvalidPatch { message: String },

    #[error("Invalid queue message: {message}")]
    InvalidMessage { message: String },

    // ==========================================================================
    // Integrity Errors
    // ==========================================================================
    #[error("Plan '{plan_id}' references missing record '{key}'")]
    DanglingReference { plan_id: String, key: String },

    #[error("Record '{key}' is corrupt: {message}")]
    CorruptRecord { key: String, message: String },

    #[error("Delete of plan '{plan_id}' left the stores inconsistent: {message}")]
    PartialDelete { plan_id: String, message: String },

    // ==========================================================================
    // Transport Errors
    // ==========================================================================
    #[error("Primary store unavailable: {0}")]
    Store(#[source] StoreError),

    #[error("Search index unavailable: {0}")]
    Index(#[source] IndexError),

    #[error("Mutation queue unavailable: {0}")]
    Queue(#[source] QueueError),

    // ==========================================================================
    // Serialization Errors
    // ==========================================================================
    #[error("Failed to parse JSON: {message}")]
    JsonParseError { message: String },
}

/// Result type alias for plansync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    PreconditionFailed,
    DataIntegrity,
    Transport,
}

impl ErrorKind {
    /// HTTP status a controller should answer with
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::PreconditionFailed => 412,
            ErrorKind::DataIntegrity => 500,
            ErrorKind::Transport => 503,
        }
    }
}

// =============================================================================
// Conversions from external error types
// =============================================================================

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

impl From<IndexError> for Error {
    fn from(err: IndexError) -> Self {
        Error::Index(err)
    }
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Self {
        Error::Queue(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonParseError {
            message: err.to_string(),
        }
    }
}

impl From<plandoc::MessageError> for Error {
    fn from(err: plandoc::MessageError) -> Self {
        Error::InvalidMessage {
            message: err.to_string(),
        }
    }
}

impl From<crate::validation::ValidationError> for Error {
    fn from(err: crate::validation::ValidationError) -> Self {
        Error::InvalidIdentifier {
            kind: err.field(),
            value: err.value().to_string(),
            reason: err.reason(),
        }
    }
}

impl From<crate::schema::SchemaError> for Error {
    fn from(err: crate::schema::SchemaError) -> Self {
        match err {
            crate::schema::SchemaError::MissingRequired { path, field } => {
                Error::MissingRequiredField { path, field }
            }
            crate::schema::SchemaError::TypeMismatch {
                path,
                expected,
                actual,
            } => Error::TypeMismatch {
                path,
                expected,
                actual,
            },
            crate::schema::SchemaError::UnexpectedValue { path, message } => {
                Error::SchemaValidation { path, message }
            }
            crate::schema::SchemaError::DuplicateObjectId(id) => Error::DuplicateObjectId { id },
            crate::schema::SchemaError::Identifier(e) => e.into(),
        }
    }
}

// =============================================================================
// Error Classification
// =============================================================================

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PlanNotFound { .. } | Error::NoPlansFound => ErrorKind::NotFound,
            Error::PlanAlreadyExists { .. } | Error::AliasedObject { .. } => ErrorKind::Conflict,
            Error::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            Error::SchemaValidation { .. }
            | Error::MissingRequiredField { .. }
            | Error::TypeMismatch { .. }
            | Error::InvalidIdentifier { .. }
            | Error::DuplicateObjectId { .. }
            | Error::UnsupportedPatchField { .. }
            | Error::InvalidPatch { .. }
            | Error::InvalidMessage { .. }
            | Error::JsonParseError { .. } => ErrorKind::Validation,
            Error::DanglingReference { .. }
            | Error::CorruptRecord { .. }
            | Error::PartialDelete { .. } => ErrorKind::DataIntegrity,
            Error::Store(_) | Error::Index(_) | Error::Queue(_) => ErrorKind::Transport,
        }
    }

    /// HTTP status for this error
    pub fn status(&self) -> u16 {
        self.kind().status()
    }

    /// Returns a user-friendly suggestion for fixing the error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::PlanNotFound { .. } => Some("Check the plan objectId"),
            Error::PlanAlreadyExists { .. } => {
                Some("Patch the existing plan instead of creating it again")
            }
            Error::PreconditionFailed { .. } => {
                Some("Fetch the plan again and retry with the returned ETag")
            }
            Error::InvalidIdentifier { .. } => {
                Some("Use only letters, numbers, underscores, hyphens, and dots")
            }
            Error::UnsupportedPatchField { .. } => {
                Some("Only planCostShares and linkedPlanServices can be patched")
            }
            _ => None,
        }
    }

    /// Returns true if the caller can fix this error by changing the request
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::DataIntegrity | ErrorKind::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::PlanNotFound {
            id: "p1".to_string(),
        };
        assert_eq!(err.to_string(), "Plan 'p1' not found");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::PlanNotFound { id: "p1".into() }.status(), 404);
        assert_eq!(Error::PlanAlreadyExists { id: "p1".into() }.status(), 409);
        assert_eq!(
            Error::PreconditionFailed {
                id: "p1".into(),
                etag: "x".into()
            }
            .status(),
            412
        );
        assert_eq!(Error::DuplicateObjectId { id: "cs1".into() }.status(), 400);
        assert_eq!(
            Error::Store(StoreError::Unavailable("down".into())).status(),
            503
        );
    }

    #[test]
    fn test_error_suggestion() {
        let err = Error::PlanNotFound { id: "p1".into() };
        assert!(err.suggestion().is_some());
        assert!(err.is_recoverable());
        let err = Error::DanglingReference {
            plan_id: "p1".into(),
            key: "service:s1".into(),
        };
        assert!(!err.is_recoverable());
    }
}
