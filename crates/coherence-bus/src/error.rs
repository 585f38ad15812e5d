//! Error types for the coherence bus.
//!
//! Four failure families, each with its own propagation policy:
//!
//! | Family        | Variant(s)                                    | Breaker | Policy                          |
//! |---------------|-----------------------------------------------|---------|---------------------------------|
//! | Configuration | `UnknownChannel`, `InvalidChannelConfig`, `PayloadMismatch`, `InvalidPayload` | untouched | caller bug, never retried |
//! | Unavailable   | `Unavailable`                                 | (cause) | back off, retry later           |
//! | Transport     | `Transport`                                   | failure | propagated on publish, logged on consume |
//! | Handler       | [`HandlerError`]                              | untouched | logged, no redelivery         |

use thiserror::Error;

/// Errors surfaced by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The channel is not part of the registry.
    #[error("Unknown channel: {channel}")]
    UnknownChannel { channel: String },

    /// The channel registry itself is malformed.
    #[error("Invalid channel configuration: {reason}")]
    InvalidChannelConfig { reason: String },

    /// The payload kind does not match the kind the channel carries.
    #[error("Channel {channel} carries {expected} messages, got {actual}")]
    PayloadMismatch {
        channel: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// The payload violates one of its own invariants.
    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },

    /// The circuit breaker refused the operation.
    #[error("Circuit breaker is OPEN - semantic bus unavailable")]
    Unavailable,

    /// `connect()` has not been called, or `disconnect()` already was.
    #[error("Semantic bus is not connected")]
    NotConnected,

    /// The durable log rejected or failed the operation.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// An envelope could not be encoded or decoded.
    #[error("Envelope codec error: {0}")]
    Codec(#[from] CodecError),
}

impl BusError {
    /// Whether this error is a caller/configuration bug that retrying cannot fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownChannel { .. }
                | Self::InvalidChannelConfig { .. }
                | Self::PayloadMismatch { .. }
                | Self::InvalidPayload { .. }
        )
    }

    /// Whether the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Transport(_))
    }
}

/// Errors from the durable stream transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not establish or re-establish the connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A command reached the backend and failed there.
    #[error("{command} failed: {reason}")]
    CommandFailed {
        command: &'static str,
        reason: String,
    },

    /// Reading from a consumer group that was never created.
    #[error("No consumer group {group} on stream {stream}")]
    NoGroup { stream: String, group: String },

    /// The backend replied with something we could not interpret.
    #[error("Unexpected reply to {command}: {reason}")]
    UnexpectedReply {
        command: &'static str,
        reason: String,
    },

    /// The transport was closed.
    #[error("Transport closed")]
    Closed,
}

/// Errors while converting between envelopes and wire entries.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Missing wire field: {0}")]
    MissingField(&'static str),

    #[error("Invalid wire field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors returned by subscriber callbacks.
///
/// These never fail the consumer loop and never cause redelivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler reported a failure.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// A typed handler received a payload of a different kind.
    #[error("Handler expected {expected} payload, got {actual}")]
    UnexpectedPayload {
        expected: &'static str,
        actual: &'static str,
    },

    /// The handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Convenience constructor for handler implementations.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Result type for subscriber callbacks.
pub type HandlerResult = Result<(), HandlerError>;
