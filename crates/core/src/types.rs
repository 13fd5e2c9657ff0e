use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};

/// A verified webhook delivery as accepted by the HTTP endpoint.
///
/// The payload is the exact byte sequence the sender signed. Cloning is cheap
/// because the buffer is shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundEvent {
    pub id: String,
    #[serde(serialize_with = "serialize_payload_len", rename = "payload_bytes")]
    pub payload: Arc<[u8]>,
    pub received_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

fn serialize_payload_len<S: Serializer>(payload: &Arc<[u8]>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(payload.len() as u64)
}

impl InboundEvent {
    pub fn new(
        id: impl Into<String>,
        payload: impl Into<Arc<[u8]>>,
        received_at: DateTime<Utc>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            received_at,
            signature: signature.into(),
            event_type: None,
        }
    }

    pub fn with_event_type(mut self, event_type: Option<String>) -> Self {
        self.event_type = event_type;
        self
    }

    /// Label used for metrics and logs; falls back to `unknown`.
    pub fn type_label(&self) -> &str {
        self.event_type.as_deref().unwrap_or("unknown")
    }

    /// Summary safe to publish on debug streams (no payload content).
    pub fn redacted(&self) -> Value {
        json!({
            "event_id": self.id,
            "event_type": self.event_type,
            "size_bytes": self.payload.len(),
            "received_at": self.received_at,
        })
    }
}

/// Unit of work held by the inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub event: InboundEvent,
    /// Number of handler attempts already made.
    pub attempts: u32,
    /// Wall-clock time the pending retry becomes due, if one is scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(event: InboundEvent) -> Self {
        Self {
            event,
            attempts: 0,
            next_retry_at: None,
        }
    }
}

/// Processing state tracked per event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// First-sight bookkeeping for an event identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdempotencyRecord {
    pub event_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(event_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event_id.into(),
            first_seen_at: now,
            outcome: Outcome::Pending,
            updated_at: now,
        }
    }
}

/// Result of an atomic check-and-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    New,
    Duplicate,
}

/// Why an event ended up in the dead-letter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    Permanent,
    RetriesExhausted,
}

impl DeadLetterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl FromStr for DeadLetterKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "permanent" => Ok(Self::Permanent),
            "retries_exhausted" => Ok(Self::RetriesExhausted),
            other => Err(format!("unknown dead letter kind: {other}")),
        }
    }
}

/// An event that will not be retried again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub event: InboundEvent,
    pub attempts: u32,
    pub kind: DeadLetterKind,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}
