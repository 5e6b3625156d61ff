//! In-memory broker for tests/dev.
//!
//! Mirrors the broker behaviour the worker relies on:
//! - manual ack with per-channel delivery tags and prefetch
//! - nack with requeue (front of queue, `redelivered` set) or without
//!   (dropped, or dead-lettered when the queue was declared that way)
//! - unacked deliveries return to their queue when a channel closes
//! - [`InMemoryBroker::sever`] drops every open channel, like a broker restart

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::envelope::{Delivery, OutboundMessage};
use crate::headers;
use crate::queue::{QueueClient, QueueTopology, TransportError};

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub correlation_id: Option<String>,
    pub redelivered: bool,
}

impl QueuedMessage {
    fn from_outbound(message: OutboundMessage) -> Self {
        Self {
            body: message.body,
            headers: message.headers,
            correlation_id: message.correlation_id,
            redelivered: false,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    dead_letter_to: Option<String>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: QueuedMessage,
}

#[derive(Debug)]
struct Consumer {
    queue: String,
    prefetch: u16,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    /// Keyed by (channel id, delivery tag).
    unacked: BTreeMap<(u64, u64), Unacked>,
    consumers: HashMap<u64, Consumer>,
    generation: u64,
    next_channel_id: u64,
    refuse_connections: bool,
    fail_publishes: bool,
}

impl BrokerState {
    fn declare(&mut self, name: &str, dead_letter_to: Option<&str>) -> Result<(), TransportError> {
        match self.queues.get(name) {
            Some(existing) if existing.dead_letter_to.as_deref() != dead_letter_to => {
                Err(TransportError::Channel(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-routing-key' for queue '{name}'"
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    name.to_string(),
                    QueueState {
                        ready: VecDeque::new(),
                        dead_letter_to: dead_letter_to.map(str::to_string),
                    },
                );
                Ok(())
            }
        }
    }

    /// Return unacked deliveries matching `filter` to the front of their
    /// queues, preserving their original order.
    fn requeue_unacked(&mut self, filter: impl Fn(u64) -> bool) {
        let keys: Vec<(u64, u64)> = self
            .unacked
            .keys()
            .filter(|(channel, _)| filter(*channel))
            .copied()
            .collect();

        for key in keys.into_iter().rev() {
            if let Some(Unacked { queue, mut message }) = self.unacked.remove(&key) {
                message.redelivered = true;
                if let Some(q) = self.queues.get_mut(&queue) {
                    q.ready.push_front(message);
                }
            }
        }
    }

    fn in_flight(&self, channel_id: u64) -> usize {
        self.unacked.keys().filter(|(c, _)| *c == channel_id).count()
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared in-memory broker. Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new channel.
    pub fn connect(&self) -> Result<InMemoryQueue, TransportError> {
        let mut state = self.shared.state();
        if state.refuse_connections {
            return Err(TransportError::Connection("connection refused".to_string()));
        }
        state.next_channel_id += 1;

        Ok(InMemoryQueue {
            shared: Arc::clone(&self.shared),
            channel_id: state.next_channel_id,
            generation: state.generation,
            next_tag: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Declare a topology without opening a channel.
    pub fn declare(&self, topology: &QueueTopology) -> Result<(), TransportError> {
        let mut state = self.shared.state();
        state.declare(&topology.primary, topology.dead_letter_target())?;
        state.declare(&topology.quarantine, None)
    }

    /// Append a raw message to `queue`, creating a plain queue if needed.
    pub fn enqueue(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.enqueue_message(OutboundMessage::new(queue, body.into()));
    }

    pub fn enqueue_message(&self, message: OutboundMessage) {
        {
            let mut state = self.shared.state();
            let queue = state.queues.entry(message.queue.clone()).or_default();
            queue.ready.push_back(QueuedMessage::from_outbound(message));
        }
        self.shared.notify.notify_waiters();
    }

    /// Drop every open channel. Their unacked deliveries are requeued and any
    /// further call on them fails with [`TransportError::Closed`].
    pub fn sever(&self) {
        {
            let mut state = self.shared.state();
            state.generation += 1;
            state.requeue_unacked(|_| true);
            state.consumers.clear();
        }
        self.shared.notify.notify_waiters();
    }

    /// While set, [`connect`](Self::connect) fails.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.state().refuse_connections = refuse;
    }

    /// While set, every publish is rejected by the broker.
    pub fn fail_publishes(&self, fail: bool) {
        self.shared.state().fail_publishes = fail;
    }

    /// Snapshot of the ready (not in-flight) messages of `queue`.
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.shared
            .state()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out and not yet acked or nacked, across all channels.
    pub fn unacked_count(&self) -> usize {
        self.shared.state().unacked.len()
    }
}

/// One channel on an [`InMemoryBroker`].
///
/// Dropping the channel closes it.
#[derive(Debug)]
pub struct InMemoryQueue {
    shared: Arc<Shared>,
    channel_id: u64,
    generation: u64,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryQueue {
    fn check_open(&self, state: &BrokerState) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) || state.generation != self.generation {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn try_take(&self) -> Result<Option<Delivery>, TransportError> {
        let mut state = self.shared.state();
        self.check_open(&state)?;

        let Some(consumer) = state.consumers.get(&self.channel_id) else {
            return Err(TransportError::Channel(
                "no consumer registered on this channel".to_string(),
            ));
        };
        let queue = consumer.queue.clone();
        let prefetch = usize::from(consumer.prefetch);

        if prefetch > 0 && state.in_flight(self.channel_id) >= prefetch {
            return Ok(None);
        }

        let Some(message) = state.queues.get_mut(&queue).and_then(|q| q.ready.pop_front()) else {
            return Ok(None);
        };

        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            delivery_tag,
            body: message.body.clone(),
            headers: message.headers.clone(),
            correlation_id: message.correlation_id.clone(),
            redelivered: message.redelivered,
        };
        state
            .unacked
            .insert((self.channel_id, delivery_tag), Unacked { queue, message });

        Ok(Some(delivery))
    }

    fn take_unacked(&self, state: &mut BrokerState, delivery_tag: u64) -> Result<Unacked, TransportError> {
        state
            .unacked
            .remove(&(self.channel_id, delivery_tag))
            .ok_or_else(|| {
                TransportError::Channel(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                ))
            })
    }

    fn release(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.shared.state();
            if state.generation == self.generation {
                let channel_id = self.channel_id;
                state.requeue_unacked(|c| c == channel_id);
                state.consumers.remove(&channel_id);
            }
        }
        self.shared.notify.notify_waiters();
    }
}

impl Drop for InMemoryQueue {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn declare_topology(&self, topology: &QueueTopology) -> Result<(), TransportError> {
        let mut state = self.shared.state();
        self.check_open(&state)?;
        state.declare(&topology.primary, topology.dead_letter_target())?;
        state.declare(&topology.quarantine, None)
    }

    async fn start_consuming(&self, queue: &str, prefetch: u16) -> Result<(), TransportError> {
        {
            let mut state = self.shared.state();
            self.check_open(&state)?;
            if !state.queues.contains_key(queue) {
                return Err(TransportError::Channel(format!("NOT_FOUND - no queue '{queue}'")));
            }
            state.consumers.insert(
                self.channel_id,
                Consumer {
                    queue: queue.to_string(),
                    prefetch,
                },
            );
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before looking, so a publish in between is not missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        {
            let mut state = self.shared.state();
            self.check_open(&state)?;
            self.take_unacked(&mut state, delivery_tag)?;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        {
            let mut state = self.shared.state();
            self.check_open(&state)?;
            let Unacked { queue, mut message } = self.take_unacked(&mut state, delivery_tag)?;

            if requeue {
                message.redelivered = true;
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.ready.push_front(message);
                }
            } else {
                let target = state.queues.get(&queue).and_then(|q| q.dead_letter_to.clone());
                let dead_letter_queue = match target {
                    Some(t) => state.queues.get_mut(&t),
                    None => None,
                };
                match dead_letter_queue {
                    Some(dlq) => {
                        message
                            .headers
                            .insert(headers::FIRST_DEATH_REASON.to_string(), "rejected".to_string());
                        message
                            .headers
                            .insert(headers::FIRST_DEATH_QUEUE.to_string(), queue);
                        message.redelivered = false;
                        dlq.ready.push_back(message);
                    }
                    None => {
                        tracing::debug!(queue = %queue, delivery_tag, "rejected message discarded");
                    }
                }
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        {
            let mut state = self.shared.state();
            self.check_open(&state)?;
            if state.fail_publishes {
                return Err(TransportError::Channel("publish not confirmed by broker".to_string()));
            }
            match state.queues.get_mut(&message.queue) {
                Some(q) => q.ready.push_back(QueuedMessage::from_outbound(message)),
                None => {
                    tracing::warn!(queue = %message.queue, "unroutable message dropped");
                    return Ok(());
                }
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    fn topology(dead_letter: bool) -> QueueTopology {
        QueueTopology::new("events", "events.dlq").with_broker_dead_letter(dead_letter)
    }

    async fn consumer(broker: &InMemoryBroker, dead_letter: bool) -> InMemoryQueue {
        let channel = broker.connect().unwrap();
        channel.declare_topology(&topology(dead_letter)).await.unwrap();
        channel.start_consuming("events", 1).await.unwrap();
        channel
    }

    #[tokio::test(start_paused = true)]
    async fn publish_consume_ack() {
        let broker = InMemoryBroker::new();
        let channel = consumer(&broker, false).await;

        channel
            .publish(OutboundMessage::new("events", b"m1".to_vec()).with_header("event_id", "e1"))
            .await
            .unwrap();

        let delivery = channel.next_delivery(WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.body, b"m1");
        assert_eq!(delivery.header("event_id"), Some("e1"));
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count(), 1);

        channel.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.depth("events"), 0);

        assert!(channel.next_delivery(WAIT).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_bounds_outstanding_deliveries() {
        let broker = InMemoryBroker::new();
        let channel = consumer(&broker, false).await;
        broker.enqueue("events", "m1");
        broker.enqueue("events", "m2");

        let first = channel.next_delivery(WAIT).await.unwrap().unwrap();
        assert!(channel.next_delivery(WAIT).await.unwrap().is_none());

        channel.ack(first.delivery_tag).await.unwrap();
        let second = channel.next_delivery(WAIT).await.unwrap().unwrap();
        assert_eq!(second.body, b"m2");
    }

    #[tokio::test(start_paused = true)]
    async fn nack_with_requeue_redelivers_first() {
        let broker = InMemoryBroker::new();
        let channel = consumer(&broker, false).await;
        broker.enqueue("events", "m1");
        broker.enqueue("events", "m2");

        let first = channel.next_delivery(WAIT).await.unwrap().unwrap();
        channel.nack(first.delivery_tag, true).await.unwrap();

        let again = channel.next_delivery(WAIT).await.unwrap().unwrap();
        assert_eq!(again.body, b"m1");
        assert!(again.redelivered);
        assert_ne!(again.delivery_tag, first.delivery_tag);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_without_requeue_follows_dead_letter_declaration() {
        let broker = InMemoryBroker::new();
        let channel = consumer(&broker, true).await;
        broker.enqueue("events", "bad");

        let d = channel.next_delivery(WAIT).await.unwrap().unwrap();
        channel.nack(d.delivery_tag, false).await.unwrap();

        let dead = broker.messages("events.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, b"bad");
        assert_eq!(dead[0].headers[headers::FIRST_DEATH_REASON], "rejected");
        assert_eq!(dead[0].headers[headers::FIRST_DEATH_QUEUE], "events");

        let broker = InMemoryBroker::new();
        let channel = consumer(&broker, false).await;
        broker.enqueue("events", "bad");
        let d = channel.next_delivery(WAIT).await.unwrap().unwrap();
        channel.nack(d.delivery_tag, false).await.unwrap();
        assert_eq!(broker.depth("events.dlq"), 0);
        assert_eq!(broker.depth("events"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tag_is_a_channel_error() {
        let broker = InMemoryBroker::new();
        let channel = consumer(&broker, false).await;
        assert!(matches!(channel.ack(99).await, Err(TransportError::Channel(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn redeclaring_with_other_arguments_fails() {
        let broker = InMemoryBroker::new();
        broker.declare(&topology(false)).unwrap();
        broker.declare(&topology(false)).unwrap();

        let channel = broker.connect().unwrap();
        let err = channel.declare_topology(&topology(true)).await.unwrap_err();
        assert!(matches!(err, TransportError::Channel(msg) if msg.contains("PRECONDITION_FAILED")));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_a_channel_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let channel = consumer(&broker, false).await;
        broker.enqueue("events", "m1");

        let _d = channel.next_delivery(WAIT).await.unwrap().unwrap();
        drop(channel);

        assert_eq!(broker.unacked_count(), 0);
        let requeued = broker.messages("events");
        assert_eq!(requeued.len(), 1);
        assert!(requeued[0].redelivered);
    }

    #[tokio::test(start_paused = true)]
    async fn sever_closes_channels_and_requeues() {
        let broker = InMemoryBroker::new();
        let channel = consumer(&broker, false).await;
        broker.enqueue("events", "m1");
        let d = channel.next_delivery(WAIT).await.unwrap().unwrap();

        broker.sever();

        assert_eq!(channel.ack(d.delivery_tag).await, Err(TransportError::Closed));
        assert_eq!(channel.next_delivery(WAIT).await, Err(TransportError::Closed));
        assert_eq!(broker.depth("events"), 1);

        let fresh = consumer(&broker, false).await;
        let again = fresh.next_delivery(WAIT).await.unwrap().unwrap();
        assert_eq!(again.body, b"m1");
        assert!(again.redelivered);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connections_and_failed_publishes() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(true);
        assert!(matches!(broker.connect(), Err(TransportError::Connection(_))));
        broker.refuse_connections(false);

        let channel = consumer(&broker, false).await;
        broker.fail_publishes(true);
        let err = channel
            .publish(OutboundMessage::new("events", b"m".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Channel(_)));
        assert_eq!(broker.depth("events"), 0);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let channel = consumer(&broker, false).await;

        let producer = broker.clone();
        let publish = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue("events", "late");
        });

        let delivery = channel
            .next_delivery(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("delivery before the wait elapsed");
        assert_eq!(delivery.body, b"late");
        publish.await.unwrap();
    }
}
