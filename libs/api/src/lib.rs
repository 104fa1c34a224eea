//! # agentpool-api
//!
//! Resource types for the agentpool operator.
//!
//! ## Model
//!
//! - `Agent`: the desired-state descriptor a user submits (instance count,
//!   image, pool/proxy/MTU settings, embedded configuration payload) and
//!   its operator-written status
//! - `Workload`, `Credential`, `Configuration`: dependent resources derived
//!   from an `Agent` and owned by it through an `OwnerReference`
//! - `Instance`: a running instance of a workload, observed but never written
//!
//! The store traffics in `Resource`, a sum over every kind; typed objects
//! convert to it with `Into` and back with `TryFrom`.

mod agent;
mod error;
mod kind;
mod meta;
mod resources;

pub use agent::*;
pub use error::ApiError;
pub use kind::{Kind, Object, Resource};
pub use meta::{Labels, ObjectKey, ObjectMeta, OwnerReference};
pub use resources::*;
