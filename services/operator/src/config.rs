//! Configuration for the operator.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};

use crate::comparator::DEFAULT_AGENT_IMAGE;
use crate::controller::{ControllerConfig, MAX_SCHEDULE_DELAY};
use crate::engine::ReconcilerConfig;

/// Operator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace whose descriptors are reconciled.
    pub namespace: String,

    /// Image substituted when a descriptor does not name one.
    pub default_image: String,

    /// Delay before re-running a pass that changed something.
    pub requeue_after_secs: u64,

    /// Deadline for a single pass.
    pub pass_timeout_secs: u64,

    /// Interval between passes for converged descriptors.
    pub resync_interval_secs: u64,

    /// Maximum passes running at once (always for different descriptors).
    pub workers: usize,

    /// JSON file of descriptors used to seed the development store.
    pub manifest: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            default_image: DEFAULT_AGENT_IMAGE.to_string(),
            requeue_after_secs: 60,
            pass_timeout_secs: 30,
            resync_interval_secs: 30,
            workers: 4,
            manifest: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let parse_u64 = |name: &str, default: u64| -> Result<u64> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{name} must be a non-negative integer, got '{raw}'")),
                None => Ok(default),
            }
        };

        let parse_secs = |name: &str, default: u64| -> Result<u64> {
            let secs = parse_u64(name, default)?;
            let max = MAX_SCHEDULE_DELAY.as_secs();
            ensure!(secs <= max, "{name} must be at most {max} seconds, got {secs}");
            Ok(secs)
        };

        let namespace = lookup("AGENTPOOL_NAMESPACE").unwrap_or(defaults.namespace);
        let default_image = lookup("AGENTPOOL_DEFAULT_IMAGE")
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.default_image);
        let requeue_after_secs =
            parse_secs("AGENTPOOL_REQUEUE_AFTER_SECS", defaults.requeue_after_secs)?;
        let pass_timeout_secs =
            parse_secs("AGENTPOOL_PASS_TIMEOUT_SECS", defaults.pass_timeout_secs)?;
        let resync_interval_secs =
            parse_secs("AGENTPOOL_RESYNC_INTERVAL_SECS", defaults.resync_interval_secs)?;
        let workers = parse_u64("AGENTPOOL_WORKERS", defaults.workers as u64)?.max(1) as usize;
        let manifest = lookup("AGENTPOOL_MANIFEST").map(PathBuf::from);
        let log_level = lookup("AGENTPOOL_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            namespace,
            default_image,
            requeue_after_secs,
            pass_timeout_secs,
            resync_interval_secs,
            workers,
            manifest,
            log_level,
        })
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            requeue_after: Duration::from_secs(self.requeue_after_secs),
            pass_timeout: Duration::from_secs(self.pass_timeout_secs),
            default_image: self.default_image.clone(),
        }
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: self.namespace.clone(),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            workers: self.workers,
            ..ControllerConfig::default()
        }
    }
}
