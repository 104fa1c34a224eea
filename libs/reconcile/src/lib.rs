//! Reconciliation pass primitives.
//!
//! This library provides the store-agnostic pieces of a level-triggered
//! reconciliation loop:
//!
//! - **Outcome**: what the host runtime should do after a pass (nothing, or
//!   run another pass after a delay). Failures travel as `Err`.
//! - **Drift**: structural comparison of a desired shape with an observed one.
//! - **Backoff**: per-key retry delays for passes that failed.
//!
//! # Invariants
//!
//! - A pass never depends on memory of a previous pass
//! - Absence of an observed object is never "in sync"
//! - Decisions are deterministic given the same inputs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Delay before re-running a pass that changed something the platform still
/// has to act on (instances scheduling, status settling).
pub const DEFAULT_REQUEUE_AFTER: Duration = Duration::from_secs(60);

/// Interval between passes for a descriptor that is already converged.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// First retry delay after a failed pass.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on retry delay after repeated failures.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// Result of a successful reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; no further pass needed until something changes.
    Done,

    /// Run another pass after the given delay.
    RequeueAfter(Duration),
}

impl Outcome {
    /// Returns the requested delay, if any.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Done => None,
            Self::RequeueAfter(delay) => Some(*delay),
        }
    }
}

/// Relationship between a desired shape and what the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    /// Nothing observed; the object must be created.
    Absent,

    /// Observed shape equals the desired shape.
    InSync,

    /// Observed shape differs; the object must be updated in place.
    Diverged,
}

impl Drift {
    pub fn is_in_sync(&self) -> bool {
        matches!(self, Self::InSync)
    }
}

/// Classify an observed shape against the desired one.
///
/// An absent observation is never in sync.
pub fn detect_drift<T: PartialEq + ?Sized>(desired: &T, observed: Option<&T>) -> Drift {
    match observed {
        None => Drift::Absent,
        Some(observed) if observed == desired => Drift::InSync,
        Some(_) => Drift::Diverged,
    }
}

/// Fingerprint of a serializable shape.
///
/// Used to identify desired and observed shapes in logs without writing out
/// their content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Hash the canonical JSON form of `value`.
    ///
    /// Objects serialize through `serde_json::Value`, whose maps are sorted,
    /// so field order in the source type does not affect the result.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        let canonical = serde_json::to_vec(&serde_json::to_value(value)?)?;
        let digest = Sha256::digest(&canonical);
        Ok(Self(format!("sha256:{}", hex::encode(&digest[..16]))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exponential retry delays for keys whose passes keep failing.
#[derive(Debug, Clone)]
pub struct ErrorBackoff {
    base: Duration,
    max: Duration,

    /// Consecutive failures per key.
    failures: BTreeMap<String, u32>,
}

impl Default for ErrorBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX)
    }
}

impl ErrorBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failed pass and return how long to wait before the next one.
    pub fn record_failure(&mut self, key: &str) -> Duration {
        let count = self.failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);

        let exponent = (*count - 1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Consecutive failures recorded for `key`.
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Forget failures for `key` (after a successful pass).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Drop entries for keys that no longer exist.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.failures.retain(|key, _| keep(key));
    }
}
