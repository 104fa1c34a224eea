//! agentpool operator
//!
//! Runs the controller loop against an in-memory store seeded from a JSON
//! manifest of `Agent` descriptors. A simulator task plays the platform's
//! part by starting and stopping instances to match each workload.

use std::sync::Arc;
use std::time::Duration;

use agentpool_api::Agent;
use agentpool_operator::{Config, Controller, MemoryStore};
use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        namespace = %config.namespace,
        default_image = %config.default_image,
        workers = config.workers,
        "Starting agentpool operator"
    );

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &config.manifest {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let agents: Vec<Agent> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;
        info!(count = agents.len(), manifest = %path.display(), "Seeding agents");
        for agent in agents {
            store.insert(agent).await;
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller = Controller::new(store.clone(), config.reconciler(), config.controller());
    let controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { controller.run(shutdown_rx).await }
    });

    let simulator_handle = tokio::spawn({
        let store = Arc::clone(&store);
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let changes = store.settle_workloads().await;
                        if changes > 0 {
                            info!(changes, "Platform simulator settled instances");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = simulator_handle.await {
        error!(error = %e, "Simulator task panicked");
    }

    info!("Operator shutdown complete");
    Ok(())
}
