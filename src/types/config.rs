//! Configuration structures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global runtime configuration, consumed by
/// [`EventQueue::from_config`](crate::queue::EventQueue::from_config).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Event queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Event queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a quit is allowed to drain before the loop is forced to
    /// terminate with events still pending.
    #[serde(with = "humantime_serde")]
    pub quit_timeout: Duration,

    /// Upper bound on a single condition-variable wait; the wait loop polls
    /// the sigint snapshot at least this often.
    #[serde(with = "humantime_serde")]
    pub wait_interval: Duration,

    /// Spin for up to 10ms before sleeping. Improves latency under high
    /// load at the expense of CPU usage.
    pub spinlock: bool,
}

impl QueueConfig {
    /// Spin budget used when `spinlock` is enabled.
    pub(crate) const SPIN_BUDGET: Duration = Duration::from_millis(10);
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            quit_timeout: Duration::from_millis(5_000),
            wait_interval: Duration::from_millis(500),
            spinlock: false,
        }
    }
}

/// Observability configuration, applied by
/// [`observability::init_tracing`](crate::observability::init_tracing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing filter directive (`info`, `debug`, or a full `EnvFilter`
    /// expression with per-module overrides).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.quit_timeout, Duration::from_secs(5));
        assert!(!config.spinlock);
    }

    #[test]
    fn test_config_deserializes_from_partial_json() {
        let config: Config = serde_json::from_str(r#"{"queue": {"quit_timeout": "1s", "wait_interval": "100ms", "spinlock": true}}"#).unwrap();
        assert_eq!(config.queue.quit_timeout, Duration::from_secs(1));
        assert!(config.queue.spinlock);
        assert_eq!(config.observability.log_level, "info");
    }
}
