//! Durable queue client abstraction (mechanics only).
//!
//! The worker consumes with **manual acknowledgement**: a delivery stays
//! unacknowledged (and is redelivered if the channel drops) until the consumer
//! calls [`QueueClient::ack`] or [`QueueClient::nack`]. Consumers must be
//! idempotent; the broker guarantees at-least-once, never exactly-once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::{Delivery, OutboundMessage};

/// Broker-level failure. Any of these ends the current worker session; the
/// worker reconnects after a fixed delay.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("connection closed")]
    Closed,
}

/// The queues a worker (or producer) expects to exist.
///
/// The primary queue is durable. Unless `broker_dead_letter` is cleared it is
/// declared with `x-dead-letter-exchange = ""` and
/// `x-dead-letter-routing-key = <quarantine>`, so the broker itself routes
/// rejected messages to the quarantine queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub primary: String,
    pub quarantine: String,
    pub broker_dead_letter: bool,
    pub prefetch: u16,
}

impl QueueTopology {
    pub fn new(primary: impl Into<String>, quarantine: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            quarantine: quarantine.into(),
            broker_dead_letter: true,
            prefetch: 1,
        }
    }

    pub fn with_broker_dead_letter(mut self, enabled: bool) -> Self {
        self.broker_dead_letter = enabled;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Queue the broker dead-letters rejected primary messages to, if any.
    pub fn dead_letter_target(&self) -> Option<&str> {
        self.broker_dead_letter.then_some(self.quarantine.as_str())
    }
}

/// One broker channel.
///
/// Implementations:
/// - `InMemoryBroker` channels (tests/dev)
/// - AMQP channels (production, in the infra crate)
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Idempotently declare both queues. Redeclaring a queue with different
    /// arguments is a channel error.
    async fn declare_topology(&self, topology: &QueueTopology) -> Result<(), TransportError>;

    /// Register this channel as a manual-ack consumer of `queue`, with at most
    /// `prefetch` unacknowledged deliveries outstanding.
    async fn start_consuming(&self, queue: &str, prefetch: u16) -> Result<(), TransportError>;

    /// Wait up to `wait` for the next delivery. `Ok(None)` means nothing
    /// arrived in time; the caller should check its stop flag and poll again.
    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Reject a delivery. With `requeue = false` the message is dropped, or
    /// dead-lettered if the queue was declared with a dead-letter target.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Publish persistently (delivery mode 2, `application/json`) to a queue
    /// through the default exchange. Returns once the broker confirmed.
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Close the channel. Unacknowledged deliveries return to their queue.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl<Q> QueueClient for Arc<Q>
where
    Q: QueueClient + ?Sized,
{
    async fn declare_topology(&self, topology: &QueueTopology) -> Result<(), TransportError> {
        (**self).declare_topology(topology).await
    }

    async fn start_consuming(&self, queue: &str, prefetch: u16) -> Result<(), TransportError> {
        (**self).start_consuming(queue, prefetch).await
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        (**self).next_delivery(wait).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        (**self).ack(delivery_tag).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        (**self).nack(delivery_tag, requeue).await
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        (**self).publish(message).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        (**self).close().await
    }
}
