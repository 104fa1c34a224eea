//! Errors returned by a reconciliation pass.

use std::time::Duration;

use agentpool_api::ObjectKey;
use thiserror::Error;

use crate::store::StoreError;

/// Result type for reconciliation passes.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// A failed pass. The host runtime retries the whole pass with backoff.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A store call failed. Propagated unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The pass did not finish within its deadline and was abandoned.
    #[error("reconciliation of {key} exceeded its deadline after {elapsed:?}")]
    DeadlineExceeded { key: ObjectKey, elapsed: Duration },
}

impl ReconcileError {
    /// Returns true if running the pass again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Store(e) => e.is_retryable(),
            ReconcileError::DeadlineExceeded { .. } => true,
        }
    }
}
