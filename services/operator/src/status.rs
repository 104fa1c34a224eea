//! Status reporting: reflects observed runtime facts onto the descriptor.
//!
//! Only the in-memory descriptor is touched here; the engine persists the
//! result through the store's status write when anything changed.

use agentpool_api::{Agent, Instance};

/// Names of the given instances, in the order the store listed them.
pub fn instance_names(instances: &[Instance]) -> Vec<String> {
    instances.iter().map(|i| i.name().to_string()).collect()
}

/// Replace the recorded instance names if they differ from `observed`.
///
/// Order-sensitive: the same names in another order count as a change.
/// Returns true if the status was changed.
pub fn reconcile_status(agent: &mut Agent, observed: Vec<String>) -> bool {
    if agent.status.agents == observed {
        return false;
    }
    agent.status.agents = observed;
    true
}

/// Record the name of the available Credential resource.
///
/// Returns true if the status was changed.
pub fn mark_secret_available(agent: &mut Agent, credential_name: &str) -> bool {
    if agent.status.secret_available == credential_name {
        return false;
    }
    agent.status.secret_available = credential_name.to_string();
    true
}
