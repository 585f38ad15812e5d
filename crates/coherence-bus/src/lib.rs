//! # Coherence Bus - Durable Pub/Sub for Semantic Coherence Events
//!
//! Propagates state-mutation events between independent services that must
//! stay eventually consistent: context mutations, validation results,
//! coherence alerts and prompt fragment updates.
//!
//! ## Delivery Model
//!
//! ```text
//! ┌──────────────┐                       ┌──────────────┐
//! │  Producer    │                       │  Consumer    │
//! │              │   publish_*()         │  handlers    │
//! │              │ ──────┐               │              │
//! └──────────────┘       │               └──────────────┘
//!                        ▼                       ↑
//!                ┌────────────────┐              │
//!                │ capped stream  │ ─────────────┘
//!                │ + group cursor │  read_group / ack
//!                └────────────────┘
//! ```
//!
//! - Ordered per channel and publisher; at-least-once up to the ack.
//! - Entries are acknowledged whether or not handlers succeed.
//! - A shared circuit breaker is the only backpressure: while OPEN, publishes
//!   fail with [`BusError::Unavailable`] and consumer loops pause.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use coherence_bus::{BusConfig, CoherenceBus, InMemoryStreamTransport};
//!
//! # async fn demo() -> coherence_bus::BusResult<()> {
//! let bus = CoherenceBus::with_standard_channels(
//!     BusConfig::default(),
//!     Arc::new(InMemoryStreamTransport::new()),
//! );
//! bus.connect().await?;
//! bus.subscribe_to_alerts(|alert| async move {
//!     println!("{}: {}", alert.title, alert.description);
//!     Ok(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod channels;
pub mod circuit_breaker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod payload;
pub mod publisher;
pub mod subscriber;
pub mod tracker;
pub mod transport;

// Re-export main types
pub use bus::{CoherenceBus, HealthReport};
pub use channels::{
    ChannelConfig, ChannelRegistry, COHERENCE_ALERTS, CONTEXT_MUTATIONS, FRAGMENT_UPDATES,
    standard_channels, SEMANTIC_VALIDATION,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use config::{BusConfig, ConsumerConfig, DEFAULT_CONSUMER_GROUP};
pub use envelope::{MessageEnvelope, DEFAULT_TTL};
pub use error::{BusError, BusResult, CodecError, HandlerError, HandlerResult, TransportError};
pub use handler::{handler_fn, MessageHandler, TypedHandler};
pub use payload::{
    AlertSeverity, CoherenceAlert, ContextMutation, FragmentUpdate, MessageType, MutationType,
    Payload, ValidationResult,
};
pub use publisher::PublishOptions;
pub use tracker::{PerformanceSnapshot, PerformanceTracker};
pub use transport::{
    InMemoryStreamTransport, RedisStreamTransport, StreamEntry, StreamTransport,
};
