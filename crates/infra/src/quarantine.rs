//! Quarantine publisher and reader.
//!
//! Messages that cannot (or must not) be stored are wrapped in a
//! [`QuarantineRecord`] and published to the quarantine queue. The record is
//! the only interface for manual inspection tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, warn};

use eventpipe_core::ValidationFailure;
use eventpipe_events::{DeliveryContext, OutboundMessage, QueueClient, TransportError, headers};

use crate::primary_store::PrimaryStoreError;

/// Why a message was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    MalformedPayload,
    SchemaViolation,
    PersistenceError,
}

impl QuarantineReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedPayload => "malformed_payload",
            Self::SchemaViolation => "schema_violation",
            Self::PersistenceError => "persistence_error",
        }
    }
}

impl std::fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure description carried by a quarantine record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub reason: QuarantineReason,
    pub exception_type: String,
    pub detail: String,
    pub correlation_id: String,
    /// Known only when the body validated (persistence failures).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl ErrorInfo {
    pub fn from_validation(failure: &ValidationFailure, ctx: &DeliveryContext) -> Self {
        let reason = match failure {
            ValidationFailure::MalformedPayload(_) => QuarantineReason::MalformedPayload,
            ValidationFailure::SchemaViolation(_) => QuarantineReason::SchemaViolation,
        };
        Self {
            reason,
            exception_type: failure.exception_type().to_string(),
            detail: failure.to_string(),
            correlation_id: ctx.correlation_id.to_string(),
            event_id: ctx.event_id.as_ref().map(ToString::to_string),
        }
    }

    pub fn from_persistence(err: &PrimaryStoreError, ctx: &DeliveryContext) -> Self {
        Self {
            reason: QuarantineReason::PersistenceError,
            exception_type: err.exception_type().to_string(),
            detail: err.to_string(),
            correlation_id: ctx.correlation_id.to_string(),
            event_id: ctx.event_id.as_ref().map(ToString::to_string),
        }
    }
}

/// The body published to the quarantine queue. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Original bytes as text; invalid UTF-8 sequences are replaced.
    pub original_message: String,
    pub error_info: ErrorInfo,
    pub timestamp: DateTime<Utc>,
    /// Queue the message was consumed from.
    pub queue: String,
}

impl QuarantineRecord {
    pub fn new(raw: &[u8], error_info: ErrorInfo, queue: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            original_message: String::from_utf8_lossy(raw).into_owned(),
            error_info,
            timestamp: now,
            queue: queue.into(),
        }
    }
}

/// Publishes quarantine records for messages consumed from `origin_queue`.
#[derive(Debug)]
pub struct QuarantinePublisher<Q> {
    client: Q,
    quarantine_queue: String,
    origin_queue: String,
}

impl<Q> QuarantinePublisher<Q>
where
    Q: QueueClient,
{
    pub fn new(client: Q, quarantine_queue: impl Into<String>, origin_queue: impl Into<String>) -> Self {
        Self {
            client,
            quarantine_queue: quarantine_queue.into(),
            origin_queue: origin_queue.into(),
        }
    }

    /// Publish a record for `raw`. Returns whether the broker accepted it.
    ///
    /// Never fails: a publish error is logged and reported as `false`.
    pub async fn quarantine(&self, raw: &[u8], error_info: ErrorInfo) -> bool {
        let reason = error_info.reason;
        let correlation_id = error_info.correlation_id.clone();
        let record = QuarantineRecord::new(raw, error_info, &self.origin_queue, Utc::now());

        let body = match serde_json::to_vec(&record) {
            Ok(body) => body,
            Err(e) => {
                error!(reason = %reason, correlation_id = %correlation_id, error = %e, "failed to encode quarantine record");
                return false;
            }
        };

        let mut message = OutboundMessage::new(&self.quarantine_queue, body)
            .with_header(headers::DEATH_REASON, reason.as_str())
            .with_header(headers::ORIGINAL_QUEUE, &self.origin_queue)
            .with_header(headers::CORRELATION_ID, &correlation_id);
        message.correlation_id = Some(correlation_id.clone());

        match self.client.publish(message).await {
            Ok(()) => {
                warn!(
                    reason = %reason,
                    correlation_id = %correlation_id,
                    quarantine_queue = %self.quarantine_queue,
                    "message quarantined"
                );
                true
            }
            Err(e) => {
                error!(
                    reason = %reason,
                    correlation_id = %correlation_id,
                    error = %e,
                    "failed to publish quarantine record"
                );
                false
            }
        }
    }
}

/// One message read back from the quarantine queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineEntry {
    /// `None` for messages the broker dead-lettered itself, or unknown bodies.
    pub record: Option<QuarantineRecord>,
    pub raw: String,
    pub death_reason: Option<String>,
    pub original_queue: Option<String>,
}

/// Consume (and acknowledge) up to `limit` messages from the quarantine queue.
///
/// Stops early once the queue stays empty for `wait`.
pub async fn drain_quarantine<Q>(
    client: &Q,
    quarantine_queue: &str,
    limit: usize,
    wait: Duration,
) -> Result<Vec<QuarantineEntry>, TransportError>
where
    Q: QueueClient + ?Sized,
{
    client.start_consuming(quarantine_queue, 1).await?;

    let mut entries = Vec::new();
    while entries.len() < limit {
        let Some(delivery) = client.next_delivery(wait).await? else {
            break;
        };

        let death_reason = delivery
            .header(headers::DEATH_REASON)
            .or_else(|| delivery.header(headers::FIRST_DEATH_REASON))
            .map(str::to_string);
        let original_queue = delivery
            .header(headers::ORIGINAL_QUEUE)
            .or_else(|| delivery.header(headers::FIRST_DEATH_QUEUE))
            .map(str::to_string);

        entries.push(QuarantineEntry {
            record: serde_json::from_slice(&delivery.body).ok(),
            raw: String::from_utf8_lossy(&delivery.body).into_owned(),
            death_reason,
            original_queue,
        });
        client.ack(delivery.delivery_tag).await?;
    }

    Ok(entries)
}
