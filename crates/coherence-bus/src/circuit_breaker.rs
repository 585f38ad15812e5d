//! Circuit breaker guarding the stream transport.
//!
//! One breaker is shared by every publisher and consumer loop of a bus
//! instance. When it is OPEN, neither side touches the transport.
//!
//! ```text
//!                 failure_count >= failure_threshold
//!      ┌──────────┐ ─────────────────────────────► ┌──────────┐
//!      │  CLOSED  │                                │   OPEN   │
//!      └──────────┘ ◄──────────┐                   └──────────┘
//!            ▲                 │                     │     ▲
//!            │ success_count   │                     │     │ trial failed
//!            │ >= recovery_    │   timeout_window    │     │
//!            │    threshold    │      elapsed        ▼     │
//!            │                 │                   ┌──────────┐
//!            └─────────────────┴────────────────── │HALF-OPEN │
//!                                                  └──────────┘
//! ```
//!
//! State is in-memory only and resets when the process restarts.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - calls pass through.
    Closed,
    /// Failing fast - calls are refused.
    Open,
    /// Probing recovery - one trial call at a time.
    HalfOpen,
}

impl CircuitState {
    /// Wire/report representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Numeric encoding used by the state gauge.
    pub fn as_gauge(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures in CLOSED before opening.
    pub failure_threshold: u32,
    /// Successes in HALF_OPEN before closing.
    pub recovery_threshold: u32,
    /// Time spent OPEN before a trial is allowed.
    pub timeout_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 5,
            timeout_window: Duration::from_secs(300),
        }
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
    /// Milliseconds since the last recorded failure, if any.
    pub since_last_failure_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    /// A HALF_OPEN trial has been handed out and no outcome recorded yet.
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    times_opened: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            trial_in_flight: false,
            total_successes: 0,
            total_failures: 0,
            times_opened: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure_time = Some(now);
        self.success_count = 0;
        self.trial_in_flight = false;
        self.times_opened += 1;
    }
}

/// Thread-safe circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a guarded operation may run now.
    ///
    /// In OPEN, the first call after `timeout_window` has elapsed moves the
    /// breaker to HALF_OPEN and returns `true`. In HALF_OPEN only one trial is
    /// outstanding at a time; further calls return `false` until the trial's
    /// outcome is recorded.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let Some(last_failure) = inner.last_failure_time else {
                    return false;
                };
                if last_failure.elapsed() <= self.config.timeout_window {
                    return false;
                }
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.trial_in_flight = true;
                info!("Circuit breaker transitioning to half-open");
                metrics::set_circuit_breaker_state(CircuitState::HalfOpen.as_gauge());
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful guarded operation.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        match inner.state {
            CircuitState::Closed => {
                // Decay by one, floor 0.
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.recovery_threshold {
                    info!(
                        successes = inner.success_count,
                        "Circuit breaker closing after successful trials"
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    metrics::set_circuit_breaker_state(CircuitState::Closed.as_gauge());
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed guarded operation.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        failures = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        timeout_secs = self.config.timeout_window.as_secs(),
                        "Circuit breaker opening due to failures"
                    );
                    inner.open(now);
                    metrics::set_circuit_breaker_state(CircuitState::Open.as_gauge());
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                warn!("Circuit breaker reopening after trial failure");
                inner.open(now);
                metrics::set_circuit_breaker_state(CircuitState::Open.as_gauge());
            }
            CircuitState::Open => {
                // A call admitted before the breaker opened; extend the window.
                inner.failure_count += 1;
                inner.last_failure_time = Some(now);
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Current failure counter.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Current HALF_OPEN success counter.
    pub fn success_count(&self) -> u32 {
        self.inner.lock().success_count
    }

    /// Snapshot of counters and state.
    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            times_opened: inner.times_opened,
            since_last_failure_ms: inner
                .last_failure_time
                .map(|t| t.elapsed().as_millis() as u64),
        }
    }

    /// Force the breaker back to CLOSED (operator action).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!(previous = %inner.state, "Circuit breaker manually reset");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.trial_in_flight = false;
        inner.last_failure_time = None;
        metrics::set_circuit_breaker_state(CircuitState::Closed.as_gauge());
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_threshold: 2,
            timeout_window: Duration::from_millis(50),
        }
    }

    fn open_breaker(cb: &CircuitBreaker) {
        for _ in 0..cb.config().failure_threshold {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    fn wait_out_window() {
        std::thread::sleep(Duration::from_millis(80));
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.config().failure_threshold, 3);
        assert_eq!(cb.config().recovery_threshold, 5);
        assert_eq!(cb.config().timeout_window, Duration::from_secs(300));
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = CircuitBreaker::new(test_config());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
        assert_eq!(cb.stats().times_opened, 1);
    }

    #[test]
    fn test_success_decays_failures() {
        let cb = CircuitBreaker::new(test_config());
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 1);

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        // Needs the full threshold again
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_stays_open_within_window() {
        let mut config = test_config();
        config.timeout_window = Duration::from_secs(1000);
        let cb = CircuitBreaker::new(config);
        open_breaker(&cb);

        for _ in 0..10 {
            assert!(!cb.can_execute());
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let cb = CircuitBreaker::new(test_config());
        open_breaker(&cb);
        wait_out_window();

        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // No outcome recorded yet: no second trial
        assert!(!cb.can_execute());
        assert!(!cb.can_execute());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_half_open_closes_after_recovery_threshold() {
        let cb = CircuitBreaker::new(test_config());
        open_breaker(&cb);
        wait_out_window();

        assert!(cb.can_execute());
        cb.record_success();
        assert_eq!(cb.success_count(), 1);
        assert!(cb.can_execute());
        cb.record_success();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.success_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(test_config());
        open_breaker(&cb);
        wait_out_window();

        assert!(cb.can_execute());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // Window restarted from the trial failure
        assert!(!cb.can_execute());
        assert_eq!(cb.stats().times_opened, 2);
    }

    #[test]
    fn test_failure_while_open_extends_window() {
        let cb = CircuitBreaker::new(test_config());
        open_breaker(&cb);
        std::thread::sleep(Duration::from_millis(40));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        // 70ms since opening but only 30ms since the last failure
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_reset() {
        let cb = CircuitBreaker::new(test_config());
        open_breaker(&cb);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.stats().since_last_failure_ms, None);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(
            serde_json::to_string(&CircuitState::Open).unwrap(),
            "\"OPEN\""
        );
    }

    proptest! {
        #[test]
        fn prop_threshold_failures_open_exactly_once(threshold in 1u32..20, extra in 0u32..10) {
            let cb = CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_threshold: 1,
                timeout_window: Duration::from_secs(1000),
            });
            for i in 0..threshold {
                prop_assert_eq!(cb.state(), CircuitState::Closed, "opened early at {}", i);
                cb.record_failure();
            }
            prop_assert_eq!(cb.state(), CircuitState::Open);
            prop_assert!(!cb.can_execute());
            for _ in 0..extra {
                cb.record_failure();
            }
            prop_assert_eq!(cb.stats().times_opened, 1);
        }

        #[test]
        fn prop_failure_count_never_negative(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let cb = CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: u32::MAX,
                recovery_threshold: 1,
                timeout_window: Duration::from_secs(1000),
            });
            let mut expected: u32 = 0;
            for failed in ops {
                if failed {
                    cb.record_failure();
                    expected += 1;
                } else {
                    cb.record_success();
                    expected = expected.saturating_sub(1);
                }
            }
            prop_assert_eq!(cb.failure_count(), expected);
        }
    }
}
