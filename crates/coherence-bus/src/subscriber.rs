//! # Consumer Loop
//!
//! One long-lived task per subscribed channel. Each iteration:
//!
//! 1. Asks the breaker for permission; while refused, sleeps the open backoff.
//! 2. Reads new entries for the consumer group, blocking up to the poll window.
//! 3. Decodes each entry, hands it to every handler in registration order,
//!    and acknowledges it whatever the handlers returned.
//!
//! Shutdown is cooperative: the loop notices the signal between polls and
//! exits after finishing the batch in hand.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::ConsumerConfig;
use crate::envelope::MessageEnvelope;
use crate::handler::{invoke_isolated, HandlerSet};
use crate::metrics;
use crate::tracker::PerformanceTracker;
use crate::transport::{StreamEntry, StreamTransport};

/// Distinct consumer identity for one loop: `consumer_<channel>_<8 hex>`.
pub fn consumer_name(channel: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("consumer_{}_{}", channel, &suffix[..8])
}

/// The polling task of one channel.
pub struct ConsumerLoop {
    channel: String,
    group: String,
    consumer: String,
    handlers: HandlerSet,
    transport: Arc<dyn StreamTransport>,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<PerformanceTracker>,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        channel: impl Into<String>,
        group: impl Into<String>,
        handlers: HandlerSet,
        transport: Arc<dyn StreamTransport>,
        breaker: Arc<CircuitBreaker>,
        tracker: Arc<PerformanceTracker>,
        config: ConsumerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let channel = channel.into();
        Self {
            consumer: consumer_name(&channel),
            channel,
            group: group.into(),
            handlers,
            transport,
            breaker,
            tracker,
            config,
            shutdown,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Poll until shutdown is signalled.
    pub async fn run(mut self) {
        info!(
            channel = %self.channel,
            group = %self.group,
            consumer = %self.consumer,
            "Consumer loop started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if !self.breaker.can_execute() {
                warn!(
                    channel = %self.channel,
                    backoff_ms = self.config.open_backoff.as_millis() as u64,
                    "Circuit breaker OPEN, pausing consumer"
                );
                if self.pause(self.config.open_backoff).await {
                    break;
                }
                continue;
            }

            let polled = self
                .transport
                .read_group(
                    &self.channel,
                    &self.group,
                    &self.consumer,
                    self.config.batch_size,
                    self.config.poll_block,
                )
                .await;

            match polled {
                Ok(entries) => {
                    self.breaker.record_success();
                    if entries.is_empty() {
                        continue;
                    }
                    let started = Instant::now();
                    self.process_batch(entries).await;
                    self.tracker
                        .record("consume", started.elapsed().as_secs_f64() * 1000.0);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    metrics::record_transport_failure("read");
                    error!(channel = %self.channel, error = %e, "Consumer poll failed");
                    if self.pause(self.config.error_backoff).await {
                        break;
                    }
                }
            }
        }

        info!(channel = %self.channel, consumer = %self.consumer, "Consumer loop stopped");
    }

    /// Sleep for `duration`, returning `true` if shutdown arrived first.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => *self.shutdown.borrow(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }

    async fn process_batch(&self, entries: Vec<StreamEntry>) {
        debug!(channel = %self.channel, count = entries.len(), "Processing batch");

        for entry in entries {
            match MessageEnvelope::from_fields(&entry.fields) {
                Ok(envelope) => self.dispatch(envelope).await,
                Err(e) => {
                    error!(
                        channel = %self.channel,
                        entry_id = %entry.id,
                        error = %e,
                        "Malformed entry, acknowledging without dispatch"
                    );
                }
            }
            self.acknowledge(&entry.id).await;
        }
    }

    async fn dispatch(&self, envelope: MessageEnvelope) {
        if envelope.is_expired(Utc::now()) {
            debug!(
                channel = %self.channel,
                message_id = %envelope.message_id(),
                "Delivering message past its TTL"
            );
        }

        for handler in self.handlers.snapshot() {
            if let Err(e) = invoke_isolated(handler.as_ref(), envelope.clone()).await {
                metrics::record_handler_failure(&self.channel);
                error!(
                    channel = %self.channel,
                    message_id = %envelope.message_id(),
                    error = %e,
                    "Message handler failed"
                );
            }
        }

        self.tracker.record_received(1);
        metrics::record_consumed(&self.channel);
    }

    async fn acknowledge(&self, entry_id: &str) {
        let ids = [entry_id.to_string()];
        if let Err(e) = self.transport.ack(&self.channel, &self.group, &ids).await {
            self.breaker.record_failure();
            metrics::record_transport_failure("ack");
            error!(
                channel = %self.channel,
                entry_id,
                error = %e,
                "Failed to acknowledge entry"
            );
        }
    }
}

impl std::fmt::Debug for ConsumerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerLoop")
            .field("channel", &self.channel)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}
