//! Convergence engine: one reconciliation pass for one descriptor.
//!
//! A pass is level-triggered. Every decision is recomputed from state read
//! during the pass itself, so running it twice, or again after a crash
//! between steps, is safe. The engine holds no locks; the host runtime must
//! not run two passes for the same key at once.
//!
//! Step order:
//! 1. descriptor (not found: done)
//! 2. workload (not found: create, requeue)
//! 3. credential (create, or update on drift)
//! 4. configuration (create, or update on drift unless immutable)
//! 5. workload replicas (mismatch: update, requeue)
//! 6. instance names and secret marker into status (changed: requeue)
//!
//! Only a pass that issued no write at all reports `Outcome::Done`.

use std::sync::Arc;
use std::time::Duration;

use agentpool_api::{
    Agent, Configuration, Credential, Instance, Object, ObjectKey, Resource, Workload,
};
use agentpool_reconcile::{Drift, Outcome, DEFAULT_REQUEUE_AFTER};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::comparator::{
    apply_defaults, desired_configuration, desired_credential, desired_workload,
    labels_for_agent, DEFAULT_AGENT_IMAGE,
};
use crate::drift::{drift, fingerprint, matches, Shaped};
use crate::error::{ReconcileError, ReconcileResult};
use crate::status::{instance_names, mark_secret_available, reconcile_status};
use crate::store::{get_object, list_objects, StoreGateway};

/// Reconciliation pass configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay requested after a change the platform still has to act on.
    pub requeue_after: Duration,

    /// Deadline for one pass under `reconcile_within`.
    pub pass_timeout: Duration,

    /// Image substituted when a descriptor does not name one.
    pub default_image: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            requeue_after: DEFAULT_REQUEUE_AFTER,
            pass_timeout: Duration::from_secs(30),
            default_image: DEFAULT_AGENT_IMAGE.to_string(),
        }
    }
}

/// Store write needed to bring one dependent resource in line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create(Resource),
    Update(Resource),
    None,
}

/// Decide the write for a dependent resource.
///
/// Absence always creates. Drift updates only when `correct_drift` is set.
pub fn plan_dependent<T>(desired: T, observed: Option<&T>, correct_drift: bool) -> Action
where
    T: Object + Shaped,
{
    match drift(&desired, observed) {
        Drift::Absent => Action::Create(desired.into()),
        Drift::Diverged if correct_drift => Action::Update(desired.into()),
        Drift::Diverged | Drift::InSync => Action::None,
    }
}

/// Runs reconciliation passes against a store.
pub struct Reconciler {
    store: Arc<dyn StoreGateway>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn StoreGateway>, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    /// Run one pass, abandoning it once `pass_timeout` elapses.
    ///
    /// Store calls already issued are not rolled back; the next pass
    /// re-derives everything from what the store holds.
    pub async fn reconcile_within(&self, key: &ObjectKey) -> ReconcileResult<Outcome> {
        let started = Instant::now();
        match tokio::time::timeout(self.config.pass_timeout, self.reconcile(key)).await {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::DeadlineExceeded {
                key: key.clone(),
                elapsed: started.elapsed(),
            }),
        }
    }

    /// Run one pass for the descriptor identified by `key`.
    #[instrument(skip(self, key), fields(namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<Outcome> {
        let store = self.store.as_ref();
        let requeue = Outcome::RequeueAfter(self.config.requeue_after);

        let Some(mut agent) = get_object::<Agent>(store, key)
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to get agent"))?
        else {
            info!("Agent not found, assuming it was deleted");
            return Ok(Outcome::Done);
        };

        if apply_defaults(&mut agent.spec, &self.config.default_image) {
            debug!(image = %agent.spec.image, "Substituted default agent image");
        }

        let Some(mut workload) = get_object::<Workload>(store, key)
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to get workload"))?
        else {
            let desired = desired_workload(&agent);
            info!(
                replicas = desired.spec.replicas,
                image = %agent.spec.image,
                "Creating workload"
            );
            store.create(desired.into()).await?;
            return Ok(requeue);
        };

        let observed = get_object::<Credential>(store, key)
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to get credential"))?;
        let action = plan_dependent(desired_credential(&agent), observed.as_ref(), true);
        let mut wrote = self.apply(action, observed.as_ref()).await?;

        let observed = get_object::<Configuration>(store, key)
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to get configuration"))?;
        let desired = desired_configuration(&agent);
        let mutable = observed.as_ref().is_none_or(|c| !c.is_immutable());
        if !mutable && !matches(&desired, observed.as_ref()) {
            warn!("Configuration is immutable and has drifted, leaving it unchanged");
        }
        let action = plan_dependent(desired, observed.as_ref(), mutable);
        wrote |= self.apply(action, observed.as_ref()).await?;

        // Scale before reading instances so a pending scale change is never
        // hidden behind a stale instance list.
        if workload.spec.replicas != agent.spec.size {
            info!(
                from = workload.spec.replicas,
                to = agent.spec.size,
                "Scaling workload"
            );
            workload.spec.replicas = agent.spec.size;
            store.update(workload.into()).await?;
            return Ok(requeue);
        }

        let instances: Vec<Instance> =
            list_objects(store, agent.namespace(), &labels_for_agent(agent.name()))
                .await
                .inspect_err(|e| warn!(error = %e, "Failed to list instances"))?;

        let credential_name = agent.name().to_string();
        let names_changed = reconcile_status(&mut agent, instance_names(&instances));
        let marker_changed = mark_secret_available(&mut agent, &credential_name);
        if names_changed || marker_changed {
            info!(agents = ?agent.status.agents, "Updating agent status");
            store.update_status(&agent).await?;
            return Ok(requeue);
        }

        if wrote {
            return Ok(requeue);
        }

        debug!("Agent is converged");
        Ok(Outcome::Done)
    }

    /// Execute `action`. Returns true if a write was issued.
    async fn apply<T>(&self, action: Action, observed: Option<&T>) -> ReconcileResult<bool>
    where
        T: Object + Shaped,
    {
        let kind = T::KIND;
        match action {
            Action::Create(resource) => {
                info!(%kind, "Creating dependent resource");
                self.store.create(resource).await?;
                Ok(true)
            }
            Action::Update(resource) => {
                info!(
                    %kind,
                    observed = ?observed.and_then(fingerprint::<T>),
                    "Correcting drifted dependent resource"
                );
                self.store.update(resource).await?;
                Ok(true)
            }
            Action::None => {
                debug!(%kind, "Dependent resource in sync");
                Ok(false)
            }
        }
    }
}
