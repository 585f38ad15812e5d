//! # Payloads
//!
//! The closed set of records carried on the bus, one variant per
//! `message_type`. The envelope carries the tag; [`Payload::decode`]
//! dispatches on it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CodecError;

/// Logical kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ContextMutation,
    ValidationResult,
    CoherenceAlert,
    FragmentUpdate,
}

impl MessageType {
    /// Wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ContextMutation => "context_mutation",
            MessageType::ValidationResult => "validation_result",
            MessageType::CoherenceAlert => "coherence_alert",
            MessageType::FragmentUpdate => "fragment_update",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context_mutation" => Ok(MessageType::ContextMutation),
            "validation_result" => Ok(MessageType::ValidationResult),
            "coherence_alert" => Ok(MessageType::CoherenceAlert),
            "fragment_update" => Ok(MessageType::FragmentUpdate),
            other => Err(CodecError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Kind of context mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationType {
    AddInsight,
    CreateField,
    UpdateField,
    RemoveField,
}

impl MutationType {
    /// Creation-type mutations have no previous value.
    pub fn is_creation(&self) -> bool {
        matches!(self, MutationType::AddInsight | MutationType::CreateField)
    }
}

/// A change to shared context that downstream services must converge on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMutation {
    pub mutation_id: String,
    pub mutation_type: MutationType,
    /// Dotted path of the mutated field, e.g. `PAIN_POINTS.current_issues`.
    pub target_domain: String,
    pub new_value: Value,
    #[serde(default)]
    pub previous_value: Option<Value>,
    /// Producer confidence in `[0, 1]`.
    pub confidence: f64,
    pub requires_downstream_validation: bool,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl ContextMutation {
    /// Check the record's invariants.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "mutation {} confidence {} outside [0, 1]",
                self.mutation_id, self.confidence
            ));
        }
        match &self.previous_value {
            // Encodes the same as an absent value
            Some(Value::Null) => Err(format!(
                "mutation {} has an explicit null previous value, omit it instead",
                self.mutation_id
            )),
            None if !self.mutation_type.is_creation() => Err(format!(
                "mutation {} of type {:?} requires a previous value",
                self.mutation_id, self.mutation_type
            )),
            _ => Ok(()),
        }
    }
}

/// Outcome of a semantic coherence validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub validation_id: String,
    /// Mutation that was validated, when the validation was triggered by one.
    #[serde(default)]
    pub mutation_id: Option<String>,
    pub coherence_score: f64,
    pub requires_attention: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl ValidationResult {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.coherence_score) {
            return Err(format!(
                "validation {} coherence score {} outside [0, 1]",
                self.validation_id, self.coherence_score
            ));
        }
        Ok(())
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Alert raised when coherence degrades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoherenceAlert {
    pub alert_id: String,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub current_value: Option<f64>,
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl CoherenceAlert {
    pub fn validate(&self) -> Result<(), String> {
        let record = format!("alert {}", self.alert_id);
        ensure_finite(&record, "current_value", self.current_value)?;
        ensure_finite(&record, "threshold", self.threshold)
    }
}

/// A changed prompt/context fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentUpdate {
    pub fragment_id: String,
    pub content: String,
    pub priority: f64,
    pub context_domain: String,
    #[serde(default)]
    pub validation_score: Option<f64>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub last_updated: String,
}

impl FragmentUpdate {
    pub fn validate(&self) -> Result<(), String> {
        let record = format!("fragment {}", self.fragment_id);
        ensure_finite(&record, "priority", Some(self.priority))?;
        ensure_finite(&record, "success_rate", Some(self.success_rate))?;
        ensure_finite(&record, "validation_score", self.validation_score)
    }
}

/// JSON has no NaN or infinity; serde_json writes them as `null`.
fn ensure_finite(record: &str, field: &str, value: Option<f64>) -> Result<(), String> {
    match value {
        Some(v) if !v.is_finite() => Err(format!("{record} {field} {v} is not a finite number")),
        _ => Ok(()),
    }
}

/// Every record the bus can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    ContextMutation(ContextMutation),
    ValidationResult(ValidationResult),
    CoherenceAlert(CoherenceAlert),
    FragmentUpdate(FragmentUpdate),
}

impl Payload {
    /// Tag for this payload.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::ContextMutation(_) => MessageType::ContextMutation,
            Payload::ValidationResult(_) => MessageType::ValidationResult,
            Payload::CoherenceAlert(_) => MessageType::CoherenceAlert,
            Payload::FragmentUpdate(_) => MessageType::FragmentUpdate,
        }
    }

    /// Check the variant's invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Payload::ContextMutation(m) => m.validate(),
            Payload::ValidationResult(v) => v.validate(),
            Payload::CoherenceAlert(a) => a.validate(),
            Payload::FragmentUpdate(f) => f.validate(),
        }
    }

    /// Serialize the inner record to its JSON wire string.
    pub fn encode(&self) -> Result<String, CodecError> {
        let encoded = match self {
            Payload::ContextMutation(m) => serde_json::to_string(m)?,
            Payload::ValidationResult(v) => serde_json::to_string(v)?,
            Payload::CoherenceAlert(a) => serde_json::to_string(a)?,
            Payload::FragmentUpdate(f) => serde_json::to_string(f)?,
        };
        Ok(encoded)
    }

    /// Decode a JSON wire string according to its tag.
    pub fn decode(message_type: MessageType, raw: &str) -> Result<Self, CodecError> {
        let payload = match message_type {
            MessageType::ContextMutation => Payload::ContextMutation(serde_json::from_str(raw)?),
            MessageType::ValidationResult => {
                Payload::ValidationResult(serde_json::from_str(raw)?)
            }
            MessageType::CoherenceAlert => Payload::CoherenceAlert(serde_json::from_str(raw)?),
            MessageType::FragmentUpdate => Payload::FragmentUpdate(serde_json::from_str(raw)?),
        };
        Ok(payload)
    }

    pub fn into_context_mutation(self) -> Option<ContextMutation> {
        match self {
            Payload::ContextMutation(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_validation_result(self) -> Option<ValidationResult> {
        match self {
            Payload::ValidationResult(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_coherence_alert(self) -> Option<CoherenceAlert> {
        match self {
            Payload::CoherenceAlert(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_fragment_update(self) -> Option<FragmentUpdate> {
        match self {
            Payload::FragmentUpdate(f) => Some(f),
            _ => None,
        }
    }
}

impl From<ContextMutation> for Payload {
    fn from(m: ContextMutation) -> Self {
        Payload::ContextMutation(m)
    }
}

impl From<ValidationResult> for Payload {
    fn from(v: ValidationResult) -> Self {
        Payload::ValidationResult(v)
    }
}

impl From<CoherenceAlert> for Payload {
    fn from(a: CoherenceAlert) -> Self {
        Payload::CoherenceAlert(a)
    }
}

impl From<FragmentUpdate> for Payload {
    fn from(f: FragmentUpdate) -> Self {
        Payload::FragmentUpdate(f)
    }
}
