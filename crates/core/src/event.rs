//! The validated, versioned event and its contract.
//!
//! [`parse_and_validate`] is the only way to obtain an [`Event`]. It either
//! yields a complete, normalized event or fails; there is no partial event.
//! The ingestion boundary and the delivery worker both call it, so a message
//! corrupted in transit is caught again on the consumer side.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::error::{FieldViolation, ValidationFailure};
use crate::id::EventId;
use crate::time::{max_clock_skew, normalize_timestamp, MAX_CLOCK_SKEW_SECS};

/// Maximum length (in characters) of `event_type` and `source`.
pub const MAX_NAME_LEN: usize = 100;

/// What to do when a document has no `event_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingEventId {
    /// Treat it as a schema violation (consumer side: a generated id would
    /// defeat idempotency on redelivery).
    Reject,
    /// Generate a UUIDv7 (ingestion side).
    Generate,
}

/// A business event, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    event_id: EventId,
    schema_version: u32,
    event_type: String,
    source: String,
    /// Business time, normalized to UTC.
    occurred_at: DateTime<Utc>,
    payload: Map<String, JsonValue>,
}

impl Event {
    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &Map<String, JsonValue> {
        &self.payload
    }

    /// Payload as a JSON value (for storage columns).
    pub fn payload_value(&self) -> JsonValue {
        JsonValue::Object(self.payload.clone())
    }

    /// Serialize to the wire form published on the queue.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Parse and validate raw message bytes against the contract, using the
/// current wall-clock time and rejecting documents without `event_id`.
pub fn parse_and_validate(raw: &[u8]) -> Result<Event, ValidationFailure> {
    parse_and_validate_at(raw, Utc::now(), MissingEventId::Reject)
}

/// Parse and validate raw message bytes against an explicit "now".
pub fn parse_and_validate_at(
    raw: &[u8],
    now: DateTime<Utc>,
    missing_id: MissingEventId,
) -> Result<Event, ValidationFailure> {
    let doc: JsonValue =
        serde_json::from_slice(raw).map_err(|e| ValidationFailure::malformed(e.to_string()))?;
    validate_document(&doc, now, missing_id)
}

/// Validate an already-parsed JSON document.
///
/// Every field is checked; the error lists all violations, not just the first.
pub fn validate_document(
    doc: &JsonValue,
    now: DateTime<Utc>,
    missing_id: MissingEventId,
) -> Result<Event, ValidationFailure> {
    let Some(obj) = doc.as_object() else {
        return Err(ValidationFailure::SchemaViolation(vec![FieldViolation::new(
            "body",
            format!("expected a JSON object, found {}", json_kind(doc)),
        )]));
    };

    let mut violations = Vec::new();

    let event_id = check_event_id(obj.get("event_id"), missing_id, &mut violations);
    let schema_version = check_schema_version(obj.get("schema_version"), &mut violations);
    let event_type = check_name("event_type", obj.get("event_type"), &mut violations);
    let source = check_name("source", obj.get("source"), &mut violations);
    let occurred_at = check_occurred_at(obj.get("occurred_at"), now, &mut violations);
    let payload = check_payload(obj.get("payload"), &mut violations);

    match (event_id, schema_version, event_type, source, occurred_at, payload) {
        (
            Some(event_id),
            Some(schema_version),
            Some(event_type),
            Some(source),
            Some(occurred_at),
            Some(payload),
        ) if violations.is_empty() => Ok(Event {
            event_id,
            schema_version,
            event_type,
            source,
            occurred_at,
            payload,
        }),
        _ => Err(ValidationFailure::SchemaViolation(violations)),
    }
}

// Each check pushes exactly one violation whenever it returns `None`.

fn check_event_id(
    value: Option<&JsonValue>,
    missing_id: MissingEventId,
    violations: &mut Vec<FieldViolation>,
) -> Option<EventId> {
    match value {
        None | Some(JsonValue::Null) => match missing_id {
            MissingEventId::Generate => Some(EventId::generate()),
            MissingEventId::Reject => {
                violations.push(FieldViolation::new("event_id", "field required"));
                None
            }
        },
        Some(JsonValue::String(s)) => match s.parse::<EventId>() {
            Ok(id) => Some(id),
            Err(_) => {
                violations.push(FieldViolation::new("event_id", "must not be empty"));
                None
            }
        },
        Some(other) => {
            violations.push(expected("event_id", "a string", other));
            None
        }
    }
}

fn check_schema_version(
    value: Option<&JsonValue>,
    violations: &mut Vec<FieldViolation>,
) -> Option<u32> {
    let Some(value) = value else {
        violations.push(FieldViolation::new("schema_version", "field required"));
        return None;
    };

    let JsonValue::Number(n) = value else {
        violations.push(expected("schema_version", "an integer", value));
        return None;
    };

    if let Some(v) = n.as_u64() {
        if v == 0 {
            violations.push(FieldViolation::new("schema_version", "must be >= 1"));
            return None;
        }
        if v > i32::MAX as u64 {
            violations.push(FieldViolation::new(
                "schema_version",
                format!("must be <= {}", i32::MAX),
            ));
            return None;
        }
        return Some(v as u32);
    }

    if n.is_i64() {
        violations.push(FieldViolation::new("schema_version", "must be >= 1"));
    } else {
        violations.push(FieldViolation::new(
            "schema_version",
            format!("expected an integer, found {n}"),
        ));
    }
    None
}

fn check_name(
    field: &'static str,
    value: Option<&JsonValue>,
    violations: &mut Vec<FieldViolation>,
) -> Option<String> {
    match value {
        None => {
            violations.push(FieldViolation::new(field, "field required"));
            None
        }
        Some(JsonValue::String(s)) => {
            let len = s.chars().count();
            if len == 0 {
                violations.push(FieldViolation::new(field, "must not be empty"));
                None
            } else if len > MAX_NAME_LEN {
                violations.push(FieldViolation::new(
                    field,
                    format!("must be at most {MAX_NAME_LEN} characters, got {len}"),
                ));
                None
            } else {
                Some(s.clone())
            }
        }
        Some(other) => {
            violations.push(expected(field, "a string", other));
            None
        }
    }
}

fn check_occurred_at(
    value: Option<&JsonValue>,
    now: DateTime<Utc>,
    violations: &mut Vec<FieldViolation>,
) -> Option<DateTime<Utc>> {
    let raw = match value {
        None => {
            violations.push(FieldViolation::new("occurred_at", "field required"));
            return None;
        }
        Some(JsonValue::String(s)) => s,
        Some(other) => {
            violations.push(expected("occurred_at", "an ISO 8601 timestamp string", other));
            return None;
        }
    };

    let occurred_at = match normalize_timestamp(raw) {
        Ok(dt) => dt,
        Err(msg) => {
            violations.push(FieldViolation::new("occurred_at", msg));
            return None;
        }
    };

    let ahead = occurred_at - now;
    if ahead > max_clock_skew() {
        violations.push(FieldViolation::new(
            "occurred_at",
            format!(
                "is {}s in the future; at most {MAX_CLOCK_SKEW_SECS}s of clock skew is tolerated",
                ahead.num_seconds()
            ),
        ));
        return None;
    }

    Some(occurred_at)
}

fn check_payload(
    value: Option<&JsonValue>,
    violations: &mut Vec<FieldViolation>,
) -> Option<Map<String, JsonValue>> {
    match value {
        None => Some(Map::new()),
        Some(JsonValue::Object(map)) => Some(map.clone()),
        Some(other) => {
            violations.push(expected("payload", "an object", other));
            None
        }
    }
}

fn expected(field: &'static str, what: &str, found: &JsonValue) -> FieldViolation {
    FieldViolation::new(field, format!("expected {what}, found {}", json_kind(found)))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
