//! Error types for resource conversion.

use thiserror::Error;

use crate::kind::Kind;

/// Errors raised when converting between `Resource` and typed objects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The resource is of a different kind than requested.
    #[error("expected {expected} resource, got {actual}")]
    KindMismatch { expected: Kind, actual: Kind },
}
