//! Kind discriminator and the `Resource` sum type exchanged with the store.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::error::ApiError;
use crate::meta::ObjectMeta;
use crate::resources::{Configuration, Credential, Instance, Workload};

/// Kinds of objects the operator reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Agent,
    Workload,
    Credential,
    Configuration,
    Instance,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Agent => "agent",
            Kind::Workload => "workload",
            Kind::Credential => "credential",
            Kind::Configuration => "configuration",
            Kind::Instance => "instance",
        };
        write!(f, "{}", s)
    }
}

/// Any object held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Agent(Agent),
    Workload(Workload),
    Credential(Credential),
    Configuration(Configuration),
    Instance(Instance),
}

impl Resource {
    pub fn kind(&self) -> Kind {
        match self {
            Resource::Agent(_) => Kind::Agent,
            Resource::Workload(_) => Kind::Workload,
            Resource::Credential(_) => Kind::Credential,
            Resource::Configuration(_) => Kind::Configuration,
            Resource::Instance(_) => Kind::Instance,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Resource::Agent(r) => &r.metadata,
            Resource::Workload(r) => &r.metadata,
            Resource::Credential(r) => &r.metadata,
            Resource::Configuration(r) => &r.metadata,
            Resource::Instance(r) => &r.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Resource::Agent(r) => &mut r.metadata,
            Resource::Workload(r) => &mut r.metadata,
            Resource::Credential(r) => &mut r.metadata,
            Resource::Configuration(r) => &mut r.metadata,
            Resource::Instance(r) => &mut r.metadata,
        }
    }
}

/// A typed object that can be converted to and from a `Resource`.
pub trait Object: Clone + Into<Resource> + TryFrom<Resource, Error = ApiError> {
    const KIND: Kind;

    fn metadata(&self) -> &ObjectMeta;
}

macro_rules! impl_object {
    ($ty:ident) => {
        impl Object for $ty {
            const KIND: Kind = Kind::$ty;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }
        }

        impl From<$ty> for Resource {
            fn from(value: $ty) -> Self {
                Resource::$ty(value)
            }
        }

        impl TryFrom<Resource> for $ty {
            type Error = ApiError;

            fn try_from(resource: Resource) -> Result<Self, Self::Error> {
                match resource {
                    Resource::$ty(value) => Ok(value),
                    other => Err(ApiError::KindMismatch {
                        expected: Kind::$ty,
                        actual: other.kind(),
                    }),
                }
            }
        }
    };
}

impl_object!(Agent);
impl_object!(Workload);
impl_object!(Credential);
impl_object!(Configuration);
impl_object!(Instance);
