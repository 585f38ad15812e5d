//! # Publisher
//!
//! Appends envelopes to a channel, gated by the circuit breaker.
//!
//! Everything that can be rejected without touching the transport (unknown
//! channel, invalid payload, wrong payload kind, encoding, not connected) is
//! checked before the breaker is consulted, so a HALF_OPEN trial is only
//! taken by an append that will report its outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error};
use uuid::Uuid;

use crate::channels::ChannelRegistry;
use crate::circuit_breaker::CircuitBreaker;
use crate::envelope::MessageEnvelope;
use crate::error::{BusError, BusResult};
use crate::metrics;
use crate::payload::Payload;
use crate::tracker::PerformanceTracker;
use crate::transport::StreamTransport;

/// Optional envelope metadata for a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub priority: i64,
    pub correlation_id: Option<String>,
    /// Overrides the bus default TTL.
    pub ttl: Option<Duration>,
}

impl PublishOptions {
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Publishing half of the bus.
pub struct Publisher {
    transport: Arc<dyn StreamTransport>,
    registry: Arc<ChannelRegistry>,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<PerformanceTracker>,
    connected: Arc<AtomicBool>,
    default_ttl: Duration,
}

impl Publisher {
    pub(crate) fn new(
        transport: Arc<dyn StreamTransport>,
        registry: Arc<ChannelRegistry>,
        breaker: Arc<CircuitBreaker>,
        tracker: Arc<PerformanceTracker>,
        connected: Arc<AtomicBool>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            breaker,
            tracker,
            connected,
            default_ttl,
        }
    }

    /// Append `payload` to `channel`, returning the new message id.
    pub async fn publish(
        &self,
        channel: &str,
        payload: Payload,
        source_service: &str,
        options: PublishOptions,
    ) -> BusResult<Uuid> {
        let config = self.registry.get(channel)?;

        payload
            .validate()
            .map_err(|reason| BusError::InvalidPayload { reason })?;

        let actual = payload.message_type();
        if actual != config.message_type {
            return Err(BusError::PayloadMismatch {
                channel: channel.to_string(),
                expected: config.message_type.as_str(),
                actual: actual.as_str(),
            });
        }

        let envelope = MessageEnvelope::new(channel, payload, source_service)
            .with_priority(options.priority)
            .with_correlation_id(options.correlation_id)
            .with_ttl(options.ttl.unwrap_or(self.default_ttl));
        let fields = envelope.to_fields()?;

        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }

        if !self.breaker.can_execute() {
            metrics::record_publish_rejected("circuit_open");
            return Err(BusError::Unavailable);
        }

        let started = Instant::now();
        match self
            .transport
            .append(channel, &fields, config.max_length)
            .await
        {
            Ok(entry_id) => {
                self.breaker.record_success();
                self.tracker.record_sent();
                self.tracker
                    .record("publish", started.elapsed().as_secs_f64() * 1000.0);
                metrics::record_published(channel);

                debug!(
                    channel,
                    message_id = %envelope.message_id(),
                    entry_id = %entry_id,
                    message_type = %envelope.message_type(),
                    priority = envelope.priority(),
                    "Message published"
                );
                Ok(envelope.message_id())
            }
            Err(e) => {
                self.breaker.record_failure();
                metrics::record_transport_failure("append");
                error!(
                    channel,
                    message_id = %envelope.message_id(),
                    error = %e,
                    "Failed to publish message"
                );
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("transport", &self.transport.name())
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}
