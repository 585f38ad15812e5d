//! # Coherence Bus
//!
//! Facade composing the channel registry, publisher, consumer loops,
//! circuit breaker and performance tracker behind one handle.
//!
//! ```text
//!  producer ──publish_*()──► Publisher ──append──► ┌───────────────┐
//!                               │                  │StreamTransport│
//!                         CircuitBreaker ◄──────── │ (capped logs) │
//!                               │                  └───────┬───────┘
//!  handlers ◄──dispatch── ConsumerLoop ◄──read_group/ack───┘
//!                               │
//!                       PerformanceTracker ──► health_check()
//! ```
//!
//! The bus is built explicitly and shared by `Arc`; there is no global
//! instance.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channels::{
    ChannelRegistry, COHERENCE_ALERTS, CONTEXT_MUTATIONS, FRAGMENT_UPDATES, SEMANTIC_VALIDATION,
};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::BusConfig;
use crate::error::{BusError, BusResult, HandlerResult};
use crate::handler::{HandlerSet, MessageHandler, TypedHandler};
use crate::metrics;
use crate::payload::{
    CoherenceAlert, ContextMutation, FragmentUpdate, MessageType, Payload, ValidationResult,
};
use crate::publisher::{PublishOptions, Publisher};
use crate::subscriber::ConsumerLoop;
use crate::tracker::{PerformanceSnapshot, PerformanceTracker};
use crate::transport::StreamTransport;

/// Source stamped on context mutations.
pub const SOURCE_CONTEXT_BUILDER: &str = "context_builder_agent";
/// Source stamped on validation results and alerts.
pub const SOURCE_COHERENCE_VALIDATOR: &str = "coherence_validator";
/// Source stamped on fragment updates.
pub const SOURCE_FRAGMENT_MANAGER: &str = "fragment_manager";

/// Priority of alerts.
pub const ALERT_PRIORITY: i64 = 2;

/// Result of [`CoherenceBus::health_check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub transport_connected: bool,
    pub circuit_breaker_state: CircuitState,
    pub average_latency_ms: f64,
    pub messages_processed: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct ChannelSubscription {
    handlers: HandlerSet,
    consumer: String,
    task: JoinHandle<()>,
}

/// Durable pub/sub bus with circuit-breaker backpressure.
pub struct CoherenceBus {
    config: BusConfig,
    registry: Arc<ChannelRegistry>,
    transport: Arc<dyn StreamTransport>,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<PerformanceTracker>,
    publisher: Publisher,
    connected: Arc<AtomicBool>,
    subscriptions: Mutex<HashMap<String, ChannelSubscription>>,
    shutdown: watch::Sender<bool>,
}

impl CoherenceBus {
    pub fn new(
        config: BusConfig,
        registry: ChannelRegistry,
        transport: Arc<dyn StreamTransport>,
    ) -> Self {
        let registry = Arc::new(registry);
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let tracker = Arc::new(PerformanceTracker::new(
            config.latency_window,
            config.latency_warn_ms,
        ));
        let connected = Arc::new(AtomicBool::new(false));
        let publisher = Publisher::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            Arc::clone(&breaker),
            Arc::clone(&tracker),
            Arc::clone(&connected),
            config.default_ttl,
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            registry,
            transport,
            breaker,
            tracker,
            publisher,
            connected,
            subscriptions: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Bus over the four standard channels.
    pub fn with_standard_channels(config: BusConfig, transport: Arc<dyn StreamTransport>) -> Self {
        Self::new(config, ChannelRegistry::standard(), transport)
    }

    /// Verify the transport and provision every channel's consumer group.
    ///
    /// Idempotent: groups that already exist are left as they are.
    pub async fn connect(&self) -> BusResult<()> {
        self.transport.ping().await.map_err(|e| {
            metrics::record_transport_failure("ping");
            error!(transport = self.transport.name(), error = %e, "Failed to connect semantic bus");
            BusError::from(e)
        })?;

        for channel in self.registry.iter() {
            let created = self
                .transport
                .ensure_group(&channel.name, &self.config.consumer_group)
                .await?;
            if created {
                info!(
                    channel = %channel.name,
                    group = %self.config.consumer_group,
                    "Created consumer group"
                );
            }
        }

        self.shutdown.send_replace(false);
        self.connected.store(true, Ordering::SeqCst);
        info!(
            transport = self.transport.name(),
            channels = self.registry.len(),
            "Semantic bus connected"
        );
        Ok(())
    }

    /// Stop every consumer loop, wait for in-flight batches, release the transport.
    ///
    /// Handlers are dropped with their loops; subscribe again after reconnecting.
    pub async fn disconnect(&self) -> BusResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let subscriptions: Vec<(String, ChannelSubscription)> =
            self.subscriptions.lock().drain().collect();
        for (channel, subscription) in subscriptions {
            if let Err(e) = subscription.task.await {
                error!(channel = %channel, error = %e, "Consumer task ended abnormally");
            }
        }

        self.transport.close().await?;
        info!("Semantic bus disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    // =========================================================================
    // PUBLISH
    // =========================================================================

    /// Publish `payload` to `channel` with default metadata.
    pub async fn publish(
        &self,
        channel: &str,
        payload: Payload,
        source_service: &str,
        priority: i64,
    ) -> BusResult<Uuid> {
        self.publish_with(
            channel,
            payload,
            source_service,
            PublishOptions::default().priority(priority),
        )
        .await
    }

    /// Publish with explicit correlation id, TTL and priority.
    pub async fn publish_with(
        &self,
        channel: &str,
        payload: Payload,
        source_service: &str,
        options: PublishOptions,
    ) -> BusResult<Uuid> {
        self.publisher
            .publish(channel, payload, source_service, options)
            .await
    }

    /// Mutations needing downstream validation go out at priority 1.
    pub async fn publish_context_mutation(&self, mutation: ContextMutation) -> BusResult<Uuid> {
        let priority = i64::from(mutation.requires_downstream_validation);
        self.publish(
            CONTEXT_MUTATIONS,
            Payload::ContextMutation(mutation),
            SOURCE_CONTEXT_BUILDER,
            priority,
        )
        .await
    }

    pub async fn publish_semantic_validation(&self, result: ValidationResult) -> BusResult<Uuid> {
        self.publish(
            SEMANTIC_VALIDATION,
            Payload::ValidationResult(result),
            SOURCE_COHERENCE_VALIDATOR,
            0,
        )
        .await
    }

    pub async fn publish_coherence_alert(&self, alert: CoherenceAlert) -> BusResult<Uuid> {
        warn!(
            alert_id = %alert.alert_id,
            alert_type = %alert.alert_type,
            severity = ?alert.severity,
            title = %alert.title,
            "Publishing coherence alert"
        );
        self.publish(
            COHERENCE_ALERTS,
            Payload::CoherenceAlert(alert),
            SOURCE_COHERENCE_VALIDATOR,
            ALERT_PRIORITY,
        )
        .await
    }

    pub async fn publish_fragment_update(&self, fragment: FragmentUpdate) -> BusResult<Uuid> {
        self.publish(
            FRAGMENT_UPDATES,
            Payload::FragmentUpdate(fragment),
            SOURCE_FRAGMENT_MANAGER,
            0,
        )
        .await
    }

    // =========================================================================
    // SUBSCRIBE
    // =========================================================================

    /// Register `handler` on `channel`.
    ///
    /// The first subscriber starts the channel's consumer loop; later ones
    /// join it and see every entry delivered from then on.
    pub async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> BusResult<()> {
        self.registry.get(channel)?;
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }

        let mut subscriptions = self.subscriptions.lock();
        if let Some(existing) = subscriptions.get(channel) {
            existing.handlers.push(handler);
            info!(
                channel,
                handlers = existing.handlers.len(),
                "Handler added to running consumer"
            );
            return Ok(());
        }

        let handlers = HandlerSet::new();
        handlers.push(handler);
        let consumer = ConsumerLoop::new(
            channel,
            self.config.consumer_group.clone(),
            handlers.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.breaker),
            Arc::clone(&self.tracker),
            self.config.consumer.clone(),
            self.shutdown.subscribe(),
        );
        let consumer_name = consumer.consumer().to_string();
        let task = tokio::spawn(consumer.run());

        info!(channel, consumer = %consumer_name, "Subscribed to channel");
        subscriptions.insert(
            channel.to_string(),
            ChannelSubscription {
                handlers,
                consumer: consumer_name,
                task,
            },
        );
        Ok(())
    }

    pub async fn subscribe_to_mutations<F, Fut>(&self, f: F) -> BusResult<()>
    where
        F: Fn(ContextMutation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = TypedHandler::new(
            MessageType::ContextMutation,
            Payload::into_context_mutation,
            f,
        );
        self.subscribe(CONTEXT_MUTATIONS, Arc::new(handler)).await
    }

    pub async fn subscribe_to_validations<F, Fut>(&self, f: F) -> BusResult<()>
    where
        F: Fn(ValidationResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = TypedHandler::new(
            MessageType::ValidationResult,
            Payload::into_validation_result,
            f,
        );
        self.subscribe(SEMANTIC_VALIDATION, Arc::new(handler)).await
    }

    pub async fn subscribe_to_alerts<F, Fut>(&self, f: F) -> BusResult<()>
    where
        F: Fn(CoherenceAlert) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = TypedHandler::new(
            MessageType::CoherenceAlert,
            Payload::into_coherence_alert,
            f,
        );
        self.subscribe(COHERENCE_ALERTS, Arc::new(handler)).await
    }

    pub async fn subscribe_to_fragments<F, Fut>(&self, f: F) -> BusResult<()>
    where
        F: Fn(FragmentUpdate) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = TypedHandler::new(
            MessageType::FragmentUpdate,
            Payload::into_fragment_update,
            f,
        );
        self.subscribe(FRAGMENT_UPDATES, Arc::new(handler)).await
    }

    /// Channels with a running consumer loop, sorted by name.
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Consumer identity of a channel's loop, if subscribed.
    pub fn consumer_name(&self, channel: &str) -> Option<String> {
        self.subscriptions
            .lock()
            .get(channel)
            .map(|s| s.consumer.clone())
    }

    // =========================================================================
    // HEALTH & METRICS
    // =========================================================================

    pub fn performance_metrics(&self) -> PerformanceSnapshot {
        self.tracker.snapshot(&self.breaker)
    }

    /// Ping the transport and summarize breaker state and latency.
    ///
    /// Health checks are not recorded against the breaker.
    pub async fn health_check(&self) -> HealthReport {
        let state = self.breaker.state();
        let average_latency_ms = self.tracker.average_latency_ms();
        let messages_processed = self.tracker.messages_sent() + self.tracker.messages_received();

        let ping = if self.is_connected() {
            self.transport.ping().await.map_err(|e| e.to_string())
        } else {
            Err(BusError::NotConnected.to_string())
        };

        match ping {
            Ok(()) => HealthReport {
                healthy: state != CircuitState::Open
                    && average_latency_ms < self.config.health_latency_budget_ms,
                transport_connected: true,
                circuit_breaker_state: state,
                average_latency_ms,
                messages_processed,
                timestamp: Utc::now(),
                error: None,
            },
            Err(reason) => {
                warn!(error = %reason, "Health check failed");
                HealthReport {
                    healthy: false,
                    transport_connected: false,
                    circuit_breaker_state: state,
                    average_latency_ms,
                    messages_processed,
                    timestamp: Utc::now(),
                    error: Some(reason),
                }
            }
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn transport(&self) -> &Arc<dyn StreamTransport> {
        &self.transport
    }
}

impl std::fmt::Debug for CoherenceBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherenceBus")
            .field("transport", &self.transport.name())
            .field("connected", &self.is_connected())
            .field("channels", &self.registry.len())
            .field("subscriptions", &self.subscribed_channels())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::envelope::MessageEnvelope;
    use crate::payload::{AlertSeverity, MutationType};
    use crate::transport::InMemoryStreamTransport;
    use serde_json::json;

    fn bus() -> (CoherenceBus, Arc<InMemoryStreamTransport>) {
        let transport = Arc::new(InMemoryStreamTransport::new());
        let bus = CoherenceBus::with_standard_channels(BusConfig::default(), transport.clone());
        (bus, transport)
    }

    fn mutation(requires_validation: bool) -> ContextMutation {
        ContextMutation {
            mutation_id: "mut-1".into(),
            mutation_type: MutationType::UpdateField,
            target_domain: "user_profile".into(),
            new_value: json!({"tone": "formal"}),
            previous_value: Some(json!({"tone": "casual"})),
            confidence: 0.8,
            requires_downstream_validation: requires_validation,
            source: "conversation".into(),
            timestamp: Utc::now(),
        }
    }

    fn field<'a>(entry: &'a crate::transport::StreamEntry, name: &str) -> &'a str {
        &entry.fields[name]
    }

    #[tokio::test]
    async fn test_connect_provisions_every_channel() {
        let (bus, transport) = bus();
        bus.connect().await.unwrap();
        assert!(bus.is_connected());
        for channel in [CONTEXT_MUTATIONS, SEMANTIC_VALIDATION, COHERENCE_ALERTS, FRAGMENT_UPDATES] {
            assert!(!transport.ensure_group(channel, "coherence_group").await.unwrap());
        }
        // Second connect is a no-op on existing groups
        bus.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_fails_when_transport_down() {
        let (bus, transport) = bus();
        transport.set_offline(true);
        assert!(matches!(bus.connect().await, Err(BusError::Transport(_))));
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn test_mutation_priority_and_source() {
        let (bus, transport) = bus();
        bus.connect().await.unwrap();
        bus.publish_context_mutation(mutation(true)).await.unwrap();
        bus.publish_context_mutation(mutation(false)).await.unwrap();

        let entries = transport.range(CONTEXT_MUTATIONS).await.unwrap();
        assert_eq!(field(&entries[0], "priority"), "1");
        assert_eq!(field(&entries[1], "priority"), "0");
        assert_eq!(field(&entries[0], "source_service"), "context_builder_agent");
        assert_eq!(field(&entries[0], "message_type"), "context_mutation");
    }

    #[tokio::test]
    async fn test_alert_priority_and_source() {
        let (bus, transport) = bus();
        bus.connect().await.unwrap();
        bus.publish_coherence_alert(CoherenceAlert {
            alert_id: "a-1".into(),
            alert_type: "drift".into(),
            severity: AlertSeverity::Critical,
            title: "Drift".into(),
            description: "Score collapsed".into(),
            metric_name: Some("coherence_score".into()),
            current_value: Some(0.2),
            threshold: Some(0.7),
        })
        .await
        .unwrap();

        let entries = transport.range(COHERENCE_ALERTS).await.unwrap();
        assert_eq!(field(&entries[0], "priority"), "2");
        assert_eq!(field(&entries[0], "source_service"), "coherence_validator");
    }

    #[tokio::test]
    async fn test_publish_with_correlation_and_ttl() {
        let (bus, transport) = bus();
        bus.connect().await.unwrap();
        let fragment = FragmentUpdate {
            fragment_id: "f-1".into(),
            content: "Cite sources.".into(),
            priority: 0.7,
            context_domain: "research".into(),
            validation_score: None,
            usage_count: 0,
            success_rate: 0.0,
            last_updated: "2024-05-01T12:00:00Z".into(),
        };
        bus.publish_with(
            FRAGMENT_UPDATES,
            Payload::FragmentUpdate(fragment),
            SOURCE_FRAGMENT_MANAGER,
            PublishOptions::default()
                .correlation_id("mut-1")
                .ttl(std::time::Duration::from_secs(60)),
        )
        .await
        .unwrap();

        let entries = transport.range(FRAGMENT_UPDATES).await.unwrap();
        let envelope = MessageEnvelope::from_fields(&entries[0].fields).unwrap();
        assert_eq!(envelope.correlation_id(), Some("mut-1"));
        assert_eq!(envelope.ttl().as_secs(), 60);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection_and_known_channel() {
        let (bus, _) = bus();
        let handler = Arc::new(handler_fn(|_env: MessageEnvelope| async { Ok(()) }));
        assert!(matches!(
            bus.subscribe(COHERENCE_ALERTS, handler.clone()).await,
            Err(BusError::NotConnected)
        ));

        bus.connect().await.unwrap();
        assert!(matches!(
            bus.subscribe("belief_updates", handler).await,
            Err(BusError::UnknownChannel { .. })
        ));
        bus.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_one_loop_per_channel() {
        let (bus, _) = bus();
        bus.connect().await.unwrap();
        bus.subscribe_to_alerts(|_| async { Ok(()) }).await.unwrap();
        let first = bus.consumer_name(COHERENCE_ALERTS).unwrap();
        bus.subscribe_to_alerts(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(bus.consumer_name(COHERENCE_ALERTS).unwrap(), first);

        bus.subscribe_to_fragments(|_| async { Ok(()) }).await.unwrap();
        assert_ne!(bus.consumer_name(FRAGMENT_UPDATES).unwrap(), first);
        assert_eq!(
            bus.subscribed_channels(),
            vec![COHERENCE_ALERTS.to_string(), FRAGMENT_UPDATES.to_string()]
        );

        bus.disconnect().await.unwrap();
        assert!(bus.subscribed_channels().is_empty());
    }

    #[tokio::test]
    async fn test_health_reports() {
        let (bus, transport) = bus();
        let report = bus.health_check().await;
        assert!(!report.healthy);
        assert!(!report.transport_connected);

        bus.connect().await.unwrap();
        bus.publish_context_mutation(mutation(false)).await.unwrap();
        let report = bus.health_check().await;
        assert!(report.healthy);
        assert!(report.transport_connected);
        assert_eq!(report.circuit_breaker_state, CircuitState::Closed);
        assert_eq!(report.messages_processed, 1);
        assert!(report.error.is_none());

        transport.set_offline(true);
        let report = bus.health_check().await;
        assert!(!report.healthy);
        assert!(!report.transport_connected);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn test_health_unhealthy_when_open() {
        let (bus, _) = bus();
        bus.connect().await.unwrap();
        for _ in 0..3 {
            bus.circuit_breaker().record_failure();
        }
        let report = bus.health_check().await;
        assert!(report.transport_connected);
        assert_eq!(report.circuit_breaker_state, CircuitState::Open);
        assert!(!report.healthy);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["circuit_breaker_state"], "OPEN");
        assert!(json.get("error").is_none());
    }
}
