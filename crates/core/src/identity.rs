//! Resolution of the identifier used for idempotency.

use serde_json::Value;
use sha2::{Digest, Sha256};

const CONTENT_HASH_PREFIX: &str = "sha256:";
const MAX_ID_LEN: usize = 256;

/// Where an event identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    Header,
    Body,
    ContentHash,
}

impl IdSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Body => "body",
            Self::ContentHash => "content_hash",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIdentity {
    pub id: String,
    pub source: IdSource,
}

/// Picks the event identifier for a delivery.
///
/// Order: the JSON pointer into the body (string or integer values only),
/// then the explicit header, then a digest of the raw body. The body comes
/// first because it is covered by the signature and the header is not.
/// Blank or oversized candidates are skipped.
pub fn resolve_event_id(header: Option<&str>, body: &[u8], pointer: &str) -> EventIdentity {
    if let Some(id) = parse_json(body).and_then(|value| pointer_string(&value, pointer)) {
        if let Some(id) = accept_candidate(&id) {
            return EventIdentity {
                id,
                source: IdSource::Body,
            };
        }
    }

    if let Some(id) = header.and_then(accept_candidate) {
        return EventIdentity {
            id,
            source: IdSource::Header,
        };
    }

    EventIdentity {
        id: content_hash_id(body),
        source: IdSource::ContentHash,
    }
}

/// Deterministic identifier derived from the payload digest.
pub fn content_hash_id(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("{CONTENT_HASH_PREFIX}{}", hex::encode(digest))
}

/// Reads a short label (e.g. `payment.succeeded`) out of a JSON body.
pub fn extract_event_type(body: &[u8], pointer: &str) -> Option<String> {
    let value = parse_json(body)?;
    let label = pointer_string(&value, pointer)?;
    accept_candidate(&label)
}

fn parse_json(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice(body).ok()
}

fn pointer_string(value: &Value, pointer: &str) -> Option<String> {
    if pointer.is_empty() {
        return None;
    }
    match value.pointer(pointer)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) if number.is_i64() || number.is_u64() => Some(number.to_string()),
        _ => None,
    }
}

fn accept_candidate(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_ID_LEN {
        None
    } else {
        Some(trimmed.to_string())
    }
}
