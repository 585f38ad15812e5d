//! # Performance Tracker
//!
//! Counts messages and aggregates operation latency for the bus. The mean
//! latency drives health; a P95 over a bounded window of recent samples is
//! reported next to it for comparison with the SLA target.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::metrics;

/// Target throughput, messages per second.
pub const THROUGHPUT_TARGET: u64 = 10_000;
/// Target P95 latency in milliseconds.
pub const LATENCY_P95_TARGET_MS: f64 = 50.0;
/// Target availability, percent.
pub const AVAILABILITY_TARGET: f64 = 99.9;

#[derive(Debug)]
struct LatencyStats {
    sum_ms: f64,
    count: u64,
    window: VecDeque<f64>,
    capacity: usize,
}

impl LatencyStats {
    fn push(&mut self, elapsed_ms: f64) {
        self.sum_ms += elapsed_ms;
        self.count += 1;
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(elapsed_ms);
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }

    /// Nearest-rank P95 over the window.
    fn p95(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }
}

/// Snapshot returned by `performance_metrics()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub latency_samples: u64,
    pub circuit_breaker_state: CircuitState,
    pub circuit_breaker_failures: u32,
    pub throughput_target: u64,
    pub latency_p95_target: f64,
    pub availability_target: f64,
}

/// Thread-safe message and latency accounting.
#[derive(Debug)]
pub struct PerformanceTracker {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    latency: Mutex<LatencyStats>,
    warn_threshold_ms: f64,
}

impl PerformanceTracker {
    pub fn new(window: usize, warn_threshold_ms: f64) -> Self {
        let capacity = window.max(1);
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            latency: Mutex::new(LatencyStats {
                sum_ms: 0.0,
                count: 0,
                window: VecDeque::with_capacity(capacity),
                capacity,
            }),
            warn_threshold_ms,
        }
    }

    /// Record the latency of one operation.
    pub fn record(&self, operation: &str, elapsed_ms: f64) {
        self.latency.lock().push(elapsed_ms);
        metrics::observe_latency(operation, elapsed_ms / 1000.0);

        if elapsed_ms > self.warn_threshold_ms {
            warn!(
                operation,
                latency_ms = elapsed_ms,
                target_ms = self.warn_threshold_ms,
                "Operation exceeded latency target"
            );
        }
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, count: u64) {
        self.messages_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn average_latency_ms(&self) -> f64 {
        self.latency.lock().average()
    }

    pub fn snapshot(&self, breaker: &CircuitBreaker) -> PerformanceSnapshot {
        let (avg_latency_ms, p95_latency_ms, latency_samples) = {
            let stats = self.latency.lock();
            (stats.average(), stats.p95(), stats.count)
        };
        let breaker_stats = breaker.stats();

        PerformanceSnapshot {
            messages_sent: self.messages_sent(),
            messages_received: self.messages_received(),
            avg_latency_ms,
            p95_latency_ms,
            latency_samples,
            circuit_breaker_state: breaker_stats.state,
            circuit_breaker_failures: breaker_stats.failure_count,
            throughput_target: THROUGHPUT_TARGET,
            latency_p95_target: LATENCY_P95_TARGET_MS,
            availability_target: AVAILABILITY_TARGET,
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(1024, LATENCY_P95_TARGET_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tracker() {
        let tracker = PerformanceTracker::default();
        let snapshot = tracker.snapshot(&CircuitBreaker::default());
        assert_eq!(snapshot.messages_sent, 0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
        assert_eq!(snapshot.p95_latency_ms, 0.0);
        assert_eq!(snapshot.circuit_breaker_state, CircuitState::Closed);
        assert_eq!(snapshot.throughput_target, 10_000);
        assert_eq!(snapshot.latency_p95_target, 50.0);
        assert_eq!(snapshot.availability_target, 99.9);
    }

    #[test]
    fn test_average_latency() {
        let tracker = PerformanceTracker::default();
        tracker.record("publish", 2.0);
        tracker.record("publish", 4.0);
        tracker.record("consume", 6.0);
        assert!((tracker.average_latency_ms() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_p95_uses_nearest_rank() {
        let tracker = PerformanceTracker::new(100, 1000.0);
        for ms in 1..=100 {
            tracker.record("publish", ms as f64);
        }
        let snapshot = tracker.snapshot(&CircuitBreaker::default());
        assert_eq!(snapshot.p95_latency_ms, 95.0);
        assert_eq!(snapshot.latency_samples, 100);
    }

    #[test]
    fn test_window_is_bounded() {
        let tracker = PerformanceTracker::new(4, 1000.0);
        for _ in 0..10 {
            tracker.record("publish", 500.0);
        }
        for _ in 0..4 {
            tracker.record("publish", 1.0);
        }
        let snapshot = tracker.snapshot(&CircuitBreaker::default());
        // Old slow samples left the window but still weigh on the mean
        assert_eq!(snapshot.p95_latency_ms, 1.0);
        assert!(snapshot.avg_latency_ms > 300.0);
    }

    #[test]
    fn test_message_counters() {
        let tracker = PerformanceTracker::default();
        tracker.record_sent();
        tracker.record_sent();
        tracker.record_received(5);
        assert_eq!(tracker.messages_sent(), 2);
        assert_eq!(tracker.messages_received(), 5);
    }
}
