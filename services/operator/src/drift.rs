//! Drift detection between desired and observed dependent resources.
//!
//! Comparison is structural over the fields the operator owns: labels,
//! owner references and content. Store-assigned fields (`uid`,
//! `resource_version`) are outside the shape, so an object read back from
//! the store matches the shape it was created from.

use std::collections::BTreeMap;

use agentpool_api::{Configuration, Credential, Labels, OwnerReference, Workload, WorkloadSpec};
use agentpool_reconcile::{detect_drift, Drift, SpecHash};
use serde::Serialize;

/// Projection of a resource onto its semantically relevant fields.
pub trait Shaped {
    type Shape<'a>: PartialEq + Serialize
    where
        Self: 'a;

    fn shape(&self) -> Self::Shape<'_>;
}

#[derive(Debug, PartialEq, Serialize)]
pub struct WorkloadShape<'a> {
    labels: &'a Labels,
    owner_references: &'a [OwnerReference],
    spec: &'a WorkloadSpec,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct CredentialShape<'a> {
    labels: &'a Labels,
    owner_references: &'a [OwnerReference],
    string_data: &'a BTreeMap<String, String>,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct ConfigurationShape<'a> {
    labels: &'a Labels,
    owner_references: &'a [OwnerReference],
    data: &'a BTreeMap<String, String>,
    binary_data: &'a BTreeMap<String, Vec<u8>>,
    immutable: Option<bool>,
}

impl Shaped for Workload {
    type Shape<'a> = WorkloadShape<'a>;

    fn shape(&self) -> WorkloadShape<'_> {
        WorkloadShape {
            labels: &self.metadata.labels,
            owner_references: &self.metadata.owner_references,
            spec: &self.spec,
        }
    }
}

impl Shaped for Credential {
    type Shape<'a> = CredentialShape<'a>;

    fn shape(&self) -> CredentialShape<'_> {
        CredentialShape {
            labels: &self.metadata.labels,
            owner_references: &self.metadata.owner_references,
            string_data: &self.string_data,
        }
    }
}

impl Shaped for Configuration {
    type Shape<'a> = ConfigurationShape<'a>;

    fn shape(&self) -> ConfigurationShape<'_> {
        ConfigurationShape {
            labels: &self.metadata.labels,
            owner_references: &self.metadata.owner_references,
            data: &self.data,
            binary_data: &self.binary_data,
            immutable: self.immutable,
        }
    }
}

/// Classify `observed` against `desired`. Absence is never in sync.
pub fn drift<'a, T: Shaped>(desired: &'a T, observed: Option<&'a T>) -> Drift {
    let observed = observed.map(|o| o.shape());
    detect_drift(&desired.shape(), observed.as_ref())
}

/// True if `observed` exists and structurally equals `desired`.
pub fn matches<'a, T: Shaped>(desired: &'a T, observed: Option<&'a T>) -> bool {
    drift(desired, observed).is_in_sync()
}

/// Fingerprint of a resource's shape, for logging.
pub fn fingerprint<T: Shaped>(resource: &T) -> Option<SpecHash> {
    SpecHash::of(&resource.shape()).ok()
}
