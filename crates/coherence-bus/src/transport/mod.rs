//! # Stream Transport
//!
//! The durable log the bus publishes to and consumes from. Semantics follow
//! Redis Streams: capped append, named consumer groups with a shared cursor,
//! explicit acknowledgement.
//!
//! Two implementations:
//!
//! - [`RedisStreamTransport`]: production backend on Redis Streams.
//! - [`InMemoryStreamTransport`]: single-process backend with the same
//!   semantics, plus fault injection for exercising the circuit breaker.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryStreamTransport;
pub use self::redis::RedisStreamTransport;

/// One entry read back from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Transport-assigned entry id (`<millis>-<seq>`).
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Durable, capped, consumer-group aware log.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Short backend name for logs and health reports.
    fn name(&self) -> &'static str;

    /// Round-trip liveness check.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Create `stream` and its consumer `group` if absent.
    ///
    /// A new group starts at the beginning of the stream. Returns `true` when
    /// the group was created, `false` when it already existed.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<bool, TransportError>;

    /// Append an entry, evicting the oldest entries beyond `max_len`.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: usize,
    ) -> Result<String, TransportError>;

    /// Read up to `count` entries never delivered to `group`, waiting up to
    /// `block` when none are available. An empty result means the wait
    /// timed out.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, TransportError>;

    /// Acknowledge delivered entries. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, TransportError>;

    /// Every entry currently retained, oldest first.
    async fn range(&self, stream: &str) -> Result<Vec<StreamEntry>, TransportError>;

    /// Release connections. Retained data is unaffected.
    async fn close(&self) -> Result<(), TransportError>;
}
