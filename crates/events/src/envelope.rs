use std::collections::BTreeMap;

use eventpipe_core::{CorrelationId, EventId};

use crate::headers;

/// A message handed to a consumer, pending ack or nack.
///
/// Notes:
/// - `delivery_tag` is scoped to the channel that produced it; acking it on
///   another channel is an error.
/// - `redelivered` is set when the broker has handed this message out before
///   (e.g. after a nack with requeue or a dropped connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// AMQP `correlation_id` property, if the producer set one.
    pub correlation_id: Option<String>,
    pub redelivered: bool,
}

impl Delivery {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Correlation id propagated by the producer (property first, then the
    /// `x-correlation-id` header), or a freshly generated one.
    pub fn correlation_id(&self) -> CorrelationId {
        let propagated = self
            .correlation_id
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.header(headers::CORRELATION_ID));
        CorrelationId::from_header_or_generate(propagated)
    }
}

/// A message to publish, persistently, to a queue through the default exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub correlation_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(queue: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            queue: queue.into(),
            body,
            headers: BTreeMap::new(),
            correlation_id: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets both the AMQP property and the `x-correlation-id` header.
    pub fn with_correlation_id(mut self, correlation_id: &CorrelationId) -> Self {
        self.headers
            .insert(headers::CORRELATION_ID.to_string(), correlation_id.to_string());
        self.correlation_id = Some(correlation_id.to_string());
        self
    }
}

/// Per-delivery context passed explicitly through validation, persistence,
/// projection and quarantine so every log line and record can be tied to one
/// logical event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    pub correlation_id: CorrelationId,
    pub delivery_tag: u64,
    /// Known once the body has been validated.
    pub event_id: Option<EventId>,
}

impl DeliveryContext {
    pub fn for_delivery(delivery: &Delivery) -> Self {
        Self {
            correlation_id: delivery.correlation_id(),
            delivery_tag: delivery.delivery_tag,
            event_id: None,
        }
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    /// `event_id` for log fields; empty until known.
    pub fn event_id_str(&self) -> &str {
        self.event_id.as_ref().map(EventId::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(correlation_id: Option<&str>, header: Option<&str>) -> Delivery {
        let mut map = BTreeMap::new();
        if let Some(h) = header {
            map.insert(headers::CORRELATION_ID.to_string(), h.to_string());
        }
        Delivery {
            delivery_tag: 7,
            body: b"{}".to_vec(),
            headers: map,
            correlation_id: correlation_id.map(str::to_string),
            redelivered: false,
        }
    }

    #[test]
    fn property_wins_over_header() {
        let d = delivery(Some("prop"), Some("hdr"));
        assert_eq!(d.correlation_id().as_str(), "prop");

        let d = delivery(Some(" "), Some("hdr"));
        assert_eq!(d.correlation_id().as_str(), "hdr");
    }

    #[test]
    fn context_carries_tag_and_correlation() {
        let d = delivery(None, Some("req-1"));
        let ctx = DeliveryContext::for_delivery(&d);
        assert_eq!(ctx.delivery_tag, 7);
        assert_eq!(ctx.correlation_id.as_str(), "req-1");
        assert_eq!(ctx.event_id_str(), "");

        let ctx = ctx.with_event_id("e1".parse().unwrap());
        assert_eq!(ctx.event_id_str(), "e1");
    }

    #[test]
    fn outbound_correlation_sets_property_and_header() {
        let cid = CorrelationId::from_header_or_generate(Some("abc"));
        let msg = OutboundMessage::new("events", b"{}".to_vec())
            .with_header(headers::EVENT_ID, "e1")
            .with_correlation_id(&cid);

        assert_eq!(msg.correlation_id.as_deref(), Some("abc"));
        assert_eq!(msg.headers[headers::CORRELATION_ID], "abc");
        assert_eq!(msg.headers[headers::EVENT_ID], "e1");
    }
}
