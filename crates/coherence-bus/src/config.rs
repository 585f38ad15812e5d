//! Bus configuration.

use std::env;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::envelope::DEFAULT_TTL;

/// Consumer group shared by every consumer loop of a deployment.
pub const DEFAULT_CONSUMER_GROUP: &str = "coherence_group";

/// Per-loop consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Entries requested per poll.
    pub batch_size: usize,
    /// How long a poll waits for new entries.
    pub poll_block: Duration,
    /// Pause while the breaker refuses.
    pub open_backoff: Duration,
    /// Pause after a failed poll.
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_block: Duration::from_secs(1),
            open_backoff: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Complete bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub consumer_group: String,
    /// TTL stamped on envelopes unless the caller overrides it.
    pub default_ttl: Duration,
    /// Single operations slower than this log a warning.
    pub latency_warn_ms: f64,
    /// Average latency at or above this marks the bus unhealthy.
    pub health_latency_budget_ms: f64,
    /// Samples kept for the P95 estimate.
    pub latency_window: usize,
    pub circuit_breaker: CircuitBreakerConfig,
    pub consumer: ConsumerConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            default_ttl: DEFAULT_TTL,
            latency_warn_ms: 50.0,
            health_latency_budget_ms: 100.0,
            latency_window: 1024,
            circuit_breaker: CircuitBreakerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl BusConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `COHERENCE_CONSUMER_GROUP`: consumer group name (default: coherence_group)
    /// - `COHERENCE_CB_FAILURE_THRESHOLD`: failures before opening (default: 3)
    /// - `COHERENCE_CB_RECOVERY_THRESHOLD`: trial successes before closing (default: 5)
    /// - `COHERENCE_CB_TIMEOUT_SECS`: seconds spent OPEN before a trial (default: 300)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`BusConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: parsed("COHERENCE_CB_FAILURE_THRESHOLD")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.circuit_breaker.failure_threshold),
            recovery_threshold: parsed("COHERENCE_CB_RECOVERY_THRESHOLD")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.circuit_breaker.recovery_threshold),
            timeout_window: parsed("COHERENCE_CB_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.circuit_breaker.timeout_window),
        };

        Self {
            consumer_group: lookup("COHERENCE_CONSUMER_GROUP")
                .filter(|g| !g.trim().is_empty())
                .unwrap_or(defaults.consumer_group),
            circuit_breaker,
            ..Self::default()
        }
    }
}
