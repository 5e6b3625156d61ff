//! Contract error model.

use thiserror::Error;

/// A single violated field constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// Name of the offending field (`"body"` for document-level problems).
    pub field: &'static str,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Why a raw message could not become an [`Event`](crate::Event).
///
/// Keep this focused on deterministic, structural failures. Redelivering the
/// same bytes always yields the same failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    /// The bytes are not a well-formed JSON document.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The document parsed but violates one or more field constraints.
    ///
    /// Always non-empty; every violated constraint is listed.
    #[error("schema violation: {}", join_violations(.0))]
    SchemaViolation(Vec<FieldViolation>),
}

impl ValidationFailure {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    /// Stable snake_case tag used as the quarantine reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MalformedPayload(_) => "malformed_payload",
            Self::SchemaViolation(_) => "schema_violation",
        }
    }

    /// Stable type name recorded as `exception_type` in quarantine records.
    pub fn exception_type(&self) -> &'static str {
        match self {
            Self::MalformedPayload(_) => "MalformedPayload",
            Self::SchemaViolation(_) => "SchemaViolation",
        }
    }

    /// Violations listed by a schema failure (empty for malformed payloads).
    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            Self::MalformedPayload(_) => &[],
            Self::SchemaViolation(v) => v,
        }
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_violation_lists_every_field() {
        let err = ValidationFailure::SchemaViolation(vec![
            FieldViolation::new("source", "must not be empty"),
            FieldViolation::new("schema_version", "must be >= 1"),
        ]);

        assert_eq!(
            err.to_string(),
            "schema violation: source: must not be empty; schema_version: must be >= 1"
        );
        assert_eq!(err.reason(), "schema_violation");
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn malformed_payload_tags() {
        let err = ValidationFailure::malformed("expected value at line 1 column 1");
        assert_eq!(err.reason(), "malformed_payload");
        assert_eq!(err.exception_type(), "MalformedPayload");
        assert!(err.violations().is_empty());
    }
}
