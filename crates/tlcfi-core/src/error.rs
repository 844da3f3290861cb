//! # Error Types
//!
//! Domain-specific error types for tlcfi-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tlcfi-core errors (this file)                                         │
//! │  ├── CoreError        - Registry / object model failures               │
//! │  └── ValidationError  - Attribute value checks                         │
//! │                                                                         │
//! │  tlcfi-client errors (separate crate)                                  │
//! │  └── ClientError      - Transport, protocol and session failures       │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → ClientError → consuming app       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::ObjectType;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Core Error
// =============================================================================

/// Object model and registry errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No object of the given kind carries the given id.
    ///
    /// ## When This Occurs
    /// - The consuming application asks for a signal group that was never
    ///   configured
    /// - The facilities object does not list the configured intersection
    #[error("{object_type} with id '{id}' not found")]
    ObjectNotFound { object_type: ObjectType, id: String },

    /// Two objects of the same kind share an id.
    #[error("Duplicate {object_type} id '{id}'")]
    DuplicateId { object_type: ObjectType, id: String },

    /// Registry initialized without any intersection.
    #[error("No intersection present")]
    NoIntersection,

    /// The configured intersection is not among the facility's objects.
    #[error("Intersection '{id}' is not present at the facility")]
    IntersectionMissing { id: String },

    /// A payload was routed to an object of another kind.
    #[error("Object type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: ObjectType,
        actual: ObjectType,
    },

    /// A meta or state payload could not be decoded.
    #[error("Malformed {object_type} payload: {message}")]
    MalformedPayload {
        object_type: ObjectType,
        message: String,
    },

    /// Attribute validation failed.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Shorthand for [`CoreError::ObjectNotFound`].
    pub fn not_found(object_type: ObjectType, id: impl Into<String>) -> Self {
        CoreError::ObjectNotFound {
            object_type,
            id: id.into(),
        }
    }

    /// Returns true if this error must stop any further reconnect attempts.
    ///
    /// Configuration problems never fix themselves by reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::DuplicateId { .. }
                | CoreError::NoIntersection
                | CoreError::IntersectionMissing { .. }
                | CoreError::TypeMismatch { .. }
        )
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Attribute validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Id is empty or uses characters outside `[A-Za-z0-9_-]`.
    #[error("Invalid object id '{0}': only [A-Za-z0-9_-] allowed")]
    InvalidObjectId(String),

    /// Integer state outside the exclusive range (-32768, 32768).
    #[error("Value {value} for {field} out of range")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("Too many predictions: {count} (max {max})")]
    TooManyPredictions { count: usize, max: usize },

    /// Integer does not map to a known enum variant.
    #[error("Unknown {kind} value {value}")]
    UnknownEnumValue { kind: &'static str, value: i64 },

    /// Name does not map to a known enum variant.
    #[error("Unknown {kind} '{name}'")]
    UnknownName { kind: &'static str, name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(CoreError::NoIntersection.is_fatal());
        assert!(CoreError::IntersectionMissing { id: "K205195".into() }.is_fatal());
        assert!(CoreError::DuplicateId {
            object_type: ObjectType::SignalGroup,
            id: "02".into()
        }
        .is_fatal());
        assert!(!CoreError::not_found(ObjectType::Detector, "d1").is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::not_found(ObjectType::SignalGroup, "08");
        assert!(err.to_string().contains("SignalGroup"));
        assert!(err.to_string().contains("08"));

        let err: CoreError = ValidationError::OutOfRange {
            field: "state",
            value: 40_000,
        }
        .into();
        assert!(err.to_string().contains("40000"));
    }
}
