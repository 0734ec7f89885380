//! Engine configuration, loadable from `SAGAFLOW_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the engine's worker pool and background loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of workers in the pool.
    pub workers: usize,
    /// How long an idle worker sleeps before polling the queue again.
    pub poll_interval: Duration,
    /// How often the cancellation watcher scans for pending requests.
    pub cancel_interval: Duration,
    /// Claims older than this are treated as orphaned and released back to
    /// the queue at worker-pool start.
    pub claim_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            poll_interval: Duration::from_millis(100),
            cancel_interval: Duration::from_secs(1),
            claim_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Build a config from the environment, falling back to defaults for
    /// unset or unparseable values.
    ///
    /// - `SAGAFLOW_WORKERS` -- worker count
    /// - `SAGAFLOW_WORKER_INTERVAL_MS` -- idle poll interval
    /// - `SAGAFLOW_CANCEL_INTERVAL_MS` -- cancellation watcher interval
    /// - `SAGAFLOW_CLAIM_TIMEOUT_MS` -- orphaned-claim timeout
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_parse("SAGAFLOW_WORKERS").unwrap_or(defaults.workers),
            poll_interval: env_millis("SAGAFLOW_WORKER_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval),
            cancel_interval: env_millis("SAGAFLOW_CANCEL_INTERVAL_MS")
                .unwrap_or(defaults.cancel_interval),
            claim_timeout: env_millis("SAGAFLOW_CLAIM_TIMEOUT_MS")
                .unwrap_or(defaults.claim_timeout),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
