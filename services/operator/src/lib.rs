//! agentpool operator library
//!
//! Drives the resources owned by an `Agent` descriptor (a workload, a
//! credential and a configuration) toward the state the descriptor
//! declares, and reflects running instance names back into its status.
//!
//! ## Architecture
//!
//! ```text
//! Controller (host loop: schedule, requeue, backoff)
//! └── Reconciler (one pass per descriptor)
//!     ├── comparator  desired shapes, pure
//!     ├── drift       desired vs observed, pure
//!     ├── status      instance names into status, pure
//!     └── StoreGateway get/list/create/update/update_status
//! ```
//!
//! ## Modules
//!
//! - `comparator`: desired Workload, Credential and Configuration
//! - `drift`: structural comparison of desired and observed shapes
//! - `engine`: the convergence pass
//! - `status`: status reporting
//! - `store`: store gateway trait and in-memory implementation
//! - `controller`: development host loop

pub mod comparator;
pub mod config;
pub mod controller;
pub mod drift;
pub mod engine;
pub mod error;
pub mod status;
pub mod store;

pub use config::Config;
pub use controller::{Controller, ControllerConfig};
pub use engine::{Reconciler, ReconcilerConfig};
pub use error::{ReconcileError, ReconcileResult};
pub use store::{MemoryStore, StoreError, StoreGateway};
