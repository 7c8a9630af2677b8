//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (malformed ids, invalid payloads, unknown tags).
/// Storage and network failures are modelled by the offline crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty garden reference).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A persisted tag did not map to a known variant.
    #[error("unknown {what}: {value}")]
    UnknownTag { what: &'static str, value: String },

    /// The payload variant does not belong to the job kind it was attached to.
    #[error("payload kind mismatch: expected {expected}, got {actual}")]
    KindMismatch { expected: String, actual: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_tag(what: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownTag {
            what,
            value: value.into(),
        }
    }
}
