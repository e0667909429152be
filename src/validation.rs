//! Identifier rules
//!
//! `objectId` and `objectType` values become primary-store keys
//! (`objectType:objectId`, or the bare `objectId` for a root plan) and index
//! document ids. Allowed: ASCII letters, digits, `_`, `-` and `.`, with a
//! letter or digit first. With `:` excluded a root key never looks like a
//! child key, and with `_` barred in front the reserved `_all` ETag owner
//! stays free.
//!
//! The length cap keeps the longest child key (`type%3Aid.hash` once the file
//! store escapes it) inside a 255-byte file name.

use thiserror::Error;

/// Longest accepted identifier, in bytes
pub const MAX_IDENTIFIER_LENGTH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    #[error("{field} '{value}' is longer than {max} bytes")]
    TooLong {
        field: &'static str,
        value: String,
        max: usize,
    },

    #[error("{field} '{value}' contains '{found}'")]
    ForbiddenChar {
        field: &'static str,
        value: String,
        found: char,
    },

    #[error("{field} '{value}' must start with a letter or digit")]
    BadStart { field: &'static str, value: String },
}

impl ValidationError {
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::Empty { field }
            | ValidationError::TooLong { field, .. }
            | ValidationError::ForbiddenChar { field, .. }
            | ValidationError::BadStart { field, .. } => field,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            ValidationError::Empty { .. } => "",
            ValidationError::TooLong { value, .. }
            | ValidationError::ForbiddenChar { value, .. }
            | ValidationError::BadStart { value, .. } => value,
        }
    }

    /// Short reason, without the offending value
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::Empty { .. } => "cannot be empty",
            ValidationError::TooLong { .. } => "exceeds maximum length",
            ValidationError::ForbiddenChar { .. } => {
                "only letters, digits, underscore, hyphen, and dot are allowed"
            }
            ValidationError::BadStart { .. } => "must start with a letter or digit",
        }
    }
}

pub fn validate_object_id(id: &str) -> Result<(), ValidationError> {
    check("objectId", id)
}

pub fn validate_object_type(object_type: &str) -> Result<(), ValidationError> {
    check("objectType", object_type)
}

fn allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn check(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let Some(first) = value.chars().next() else {
        return Err(ValidationError::Empty { field });
    };
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::TooLong {
            field,
            value: value.to_string(),
            max: MAX_IDENTIFIER_LENGTH,
        });
    }
    if let Some(found) = value.chars().find(|c| !allowed(*c)) {
        return Err(ValidationError::ForbiddenChar {
            field,
            value: value.to_string(),
            found,
        });
    }
    if !first.is_ascii_alphanumeric() {
        return Err(ValidationError::BadStart {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plan_ids() {
        assert!(validate_object_id("p1").is_ok());
        assert!(validate_object_id("12xvxc345ssdsds-508").is_ok());
        assert!(validate_object_id("plan.2024").is_ok());
        assert!(validate_object_type("membercostshare").is_ok());
    }

    #[test]
    fn test_key_separator_blocked() {
        assert_eq!(
            validate_object_id("membercostshare:cs1"),
            Err(ValidationError::ForbiddenChar {
                field: "objectId",
                value: "membercostshare:cs1".into(),
                found: ':',
            })
        );
        assert_eq!(validate_object_type("a:b").unwrap_err().field(), "objectType");
    }

    #[test]
    fn test_rejects_unsafe_characters() {
        for id in ["foo bar", "foo/bar", "foo*", "caf\u{e9}"] {
            assert!(validate_object_id(id).is_err(), "{} should be rejected", id);
        }
    }

    #[test]
    fn test_reserved_prefixes() {
        for id in ["-foo", "_all", ".hidden"] {
            assert!(matches!(
                validate_object_id(id),
                Err(ValidationError::BadStart { .. })
            ));
        }
    }

    #[test]
    fn test_length_limits() {
        assert_eq!(
            validate_object_id(""),
            Err(ValidationError::Empty { field: "objectId" })
        );
        let err = validate_object_id(&"a".repeat(MAX_IDENTIFIER_LENGTH + 1)).unwrap_err();
        assert_eq!(err.reason(), "exceeds maximum length");
        assert!(validate_object_id(&"a".repeat(MAX_IDENTIFIER_LENGTH)).is_ok());
        assert!(validate_object_type(&"t".repeat(MAX_IDENTIFIER_LENGTH + 1)).is_err());
    }
}
