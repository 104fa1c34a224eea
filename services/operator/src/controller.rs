//! Host loop that schedules reconciliation passes.
//!
//! The controller:
//! - Lists descriptors in its namespace on every tick
//! - Runs passes for keys that are due, several keys at a time
//! - Schedules the next pass from each outcome (resync, requeue, backoff)
//!
//! Each key appears at most once per tick and ticks never overlap, so two
//! passes for the same descriptor never run at the same time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agentpool_api::{Agent, Labels, ObjectKey};
use agentpool_reconcile::{
    ErrorBackoff, Outcome, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_RESYNC_INTERVAL,
};
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{Reconciler, ReconcilerConfig};
use crate::error::ReconcileResult;
use crate::store::{list_objects, StoreGateway};

/// Longest delay the controller will schedule a pass out.
pub const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Controller loop configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace whose descriptors are reconciled.
    pub namespace: String,

    /// Interval between passes for a converged descriptor.
    pub resync_interval: Duration,

    /// Maximum passes running at once.
    pub workers: usize,

    /// How often due keys are checked.
    pub tick: Duration,

    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            workers: 4,
            tick: Duration::from_secs(1),
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub passes: usize,
    pub done: usize,
    pub requeued: usize,
    pub failed: usize,
}

/// Schedules and runs reconciliation passes.
pub struct Controller {
    store: Arc<dyn StoreGateway>,
    reconciler: Reconciler,
    config: ControllerConfig,

    /// Next pass time per known descriptor.
    schedule: BTreeMap<ObjectKey, Instant>,

    backoff: ErrorBackoff,
}

impl Controller {
    pub fn new(
        store: Arc<dyn StoreGateway>,
        reconciler_config: ReconcilerConfig,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(Arc::clone(&store), reconciler_config),
            store,
            backoff: ErrorBackoff::new(config.backoff_base, config.backoff_max),
            config,
            schedule: BTreeMap::new(),
        }
    }

    /// When the next pass for `key` is due, if the key is known.
    pub fn next_run(&self, key: &ObjectKey) -> Option<Instant> {
        self.schedule.get(key).copied()
    }

    /// Consecutive failed passes for `key`.
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.backoff.failures(&key.to_string())
    }

    /// Run the controller until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(namespace = %self.config.namespace))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            resync_interval_secs = self.config.resync_interval.as_secs(),
            "Starting controller"
        );

        let mut interval = tokio::time::interval(self.config.tick);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.tick().await;
                    if stats.passes > 0 {
                        debug!(
                            passes = stats.passes,
                            done = stats.done,
                            requeued = stats.requeued,
                            failed = stats.failed,
                            "Controller tick complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Discover descriptors and run every pass that is due.
    pub async fn tick(&mut self) -> TickStats {
        if let Err(e) = self.discover().await {
            warn!(error = %e, "Failed to list agents, using last known set");
        }

        let now = Instant::now();
        let due: Vec<ObjectKey> = self
            .schedule
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let reconciler = &self.reconciler;
        let results: Vec<(ObjectKey, ReconcileResult<Outcome>)> = stream::iter(due)
            .map(|key| async move {
                let result = reconciler.reconcile_within(&key).await;
                (key, result)
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut stats = TickStats::default();
        for (key, result) in results {
            stats.passes += 1;
            let delay = self.record(&key, result, &mut stats);
            self.schedule.insert(key, schedule_after(delay));
        }
        stats
    }

    async fn discover(&mut self) -> ReconcileResult<()> {
        let agents: Vec<Agent> =
            list_objects(self.store.as_ref(), &self.config.namespace, &Labels::new()).await?;

        let now = Instant::now();
        let mut seen = BTreeMap::new();
        for agent in agents {
            let key = agent.key();
            let at = self.schedule.get(&key).copied().unwrap_or(now);
            seen.insert(key, at);
        }

        for key in self.schedule.keys().filter(|k| !seen.contains_key(*k)) {
            debug!(%key, "Agent no longer listed, forgetting it");
        }
        self.schedule = seen;

        let schedule = &self.schedule;
        self.backoff.retain(|key| schedule.keys().any(|k| k.to_string() == key));
        Ok(())
    }

    fn record(
        &mut self,
        key: &ObjectKey,
        result: ReconcileResult<Outcome>,
        stats: &mut TickStats,
    ) -> Duration {
        let backoff_key = key.to_string();
        match result {
            Ok(outcome) => {
                self.backoff.clear(&backoff_key);
                match outcome.requeue_after() {
                    Some(delay) => {
                        stats.requeued += 1;
                        delay
                    }
                    None => {
                        stats.done += 1;
                        self.config.resync_interval
                    }
                }
            }
            Err(e) => {
                let delay = self.backoff.record_failure(&backoff_key);
                stats.failed += 1;
                error!(
                    %key,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconciliation failed"
                );
                delay
            }
        }
    }
}

/// Instant `delay` from now, clamped to `MAX_SCHEDULE_DELAY`.
fn schedule_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_SCHEDULE_DELAY)).unwrap_or(now)
}
