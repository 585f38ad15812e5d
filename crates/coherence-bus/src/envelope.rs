//! # Message Envelope
//!
//! Transport-level wrapper around a [`Payload`]. Every stream entry is one
//! envelope flattened into string fields:
//!
//! | Field            | Encoding                         |
//! |------------------|----------------------------------|
//! | `message_id`     | UUID string                      |
//! | `channel`        | channel name                     |
//! | `message_type`   | payload tag                      |
//! | `payload`        | JSON object string               |
//! | `timestamp`      | RFC 3339 / ISO-8601, UTC, `Z`    |
//! | `source_service` | producer identifier              |
//! | `correlation_id` | string, omitted when absent      |
//! | `priority`       | integer                          |
//! | `ttl`            | integer seconds                  |

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::error::CodecError;
use crate::payload::{MessageType, Payload};

/// Default advisory time-to-live.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// A message as it travels through a channel. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    message_id: Uuid,
    channel: String,
    payload: Payload,
    timestamp: DateTime<Utc>,
    source_service: String,
    correlation_id: Option<String>,
    priority: i64,
    ttl: Duration,
}

impl MessageEnvelope {
    /// Stamp a new envelope with a fresh id and the current time.
    pub fn new(
        channel: impl Into<String>,
        payload: Payload,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            channel: channel.into(),
            payload,
            timestamp: Utc::now(),
            source_service: source_service.into(),
            correlation_id: None,
            priority: 0,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// The wire carries whole seconds; sub-second parts round up.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        self.ttl = Duration::from_secs(secs);
        self
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source_service(&self) -> &str {
        &self.source_service
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether the advisory TTL has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        match age.to_std() {
            Ok(age) => age > self.ttl,
            // Timestamp in the future relative to `now`
            Err(_) => false,
        }
    }

    /// Flatten into stream entry fields.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>, CodecError> {
        let mut fields = vec![
            ("message_id".to_string(), self.message_id.to_string()),
            ("channel".to_string(), self.channel.clone()),
            (
                "message_type".to_string(),
                self.message_type().as_str().to_string(),
            ),
            ("payload".to_string(), self.payload.encode()?),
            (
                "timestamp".to_string(),
                self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            ("source_service".to_string(), self.source_service.clone()),
            ("priority".to_string(), self.priority.to_string()),
            ("ttl".to_string(), self.ttl.as_secs().to_string()),
        ];
        if let Some(correlation_id) = &self.correlation_id {
            fields.push(("correlation_id".to_string(), correlation_id.clone()));
        }
        Ok(fields)
    }

    /// Rebuild an envelope from stream entry fields.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, CodecError> {
        let message_id = required(fields, "message_id")?;
        let message_id = Uuid::parse_str(message_id).map_err(|e| CodecError::InvalidField {
            field: "message_id",
            reason: e.to_string(),
        })?;

        let message_type: MessageType = required(fields, "message_type")?.parse()?;
        let payload = Payload::decode(message_type, required(fields, "payload")?)?;

        let timestamp = DateTime::parse_from_rfc3339(required(fields, "timestamp")?)
            .map_err(|e| CodecError::InvalidField {
                field: "timestamp",
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);

        let priority = required(fields, "priority")?
            .parse::<i64>()
            .map_err(|e| CodecError::InvalidField {
                field: "priority",
                reason: e.to_string(),
            })?;

        let ttl = required(fields, "ttl")?
            .parse::<u64>()
            .map_err(|e| CodecError::InvalidField {
                field: "ttl",
                reason: e.to_string(),
            })?;

        Ok(Self {
            message_id,
            channel: required(fields, "channel")?.to_string(),
            payload,
            timestamp,
            source_service: required(fields, "source_service")?.to_string(),
            correlation_id: fields
                .get("correlation_id")
                .filter(|id| !id.is_empty())
                .cloned(),
            priority,
            ttl: Duration::from_secs(ttl),
        })
    }
}

fn required<'a>(
    fields: &'a HashMap<String, String>,
    name: &'static str,
) -> Result<&'a str, CodecError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or(CodecError::MissingField(name))
}
