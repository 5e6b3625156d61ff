use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use eventpipe_core::{Clock, SystemClock};
use eventpipe_events::QueueTopology;

use super::connector::{Connections, Connector};
use super::pipeline::{DeliveryOutcome, Pipeline};
use super::WorkerError;
use crate::config::WorkerConfig;
use crate::primary_store::InsertOutcome;
use crate::projection_store::BestEffortProjection;
use crate::quarantine::QuarantinePublisher;
use crate::retry::RetryPolicy;

/// Worker tuning, usually derived from [`WorkerConfig`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub topology: QueueTopology,
    pub reconnect_delay: Duration,
    pub poll_interval: Duration,
    pub projection_retry: RetryPolicy,
    pub clock: Arc<dyn Clock>,
}

impl WorkerOptions {
    pub fn new(topology: QueueTopology) -> Self {
        Self {
            topology,
            reconnect_delay: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
            projection_retry: RetryPolicy::for_projection(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_projection_retry(mut self, policy: RetryPolicy) -> Self {
        self.projection_retry = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self::new(config.queue.topology())
            .with_reconnect_delay(config.reconnect_delay)
            .with_poll_interval(config.poll_interval)
            .with_projection_retry(config.projection_retry)
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub acknowledged: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub quarantined: u64,
    /// Quarantine records the broker did not accept.
    pub quarantine_failures: u64,
    /// Projection writes abandoned after retry.
    pub projection_failures: u64,
    /// Sessions opened, including the first.
    pub sessions: u64,
    /// Sessions that failed to open or ended with a broker error.
    pub transport_errors: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Acknowledged {
                insert, projected, ..
            } => {
                self.acknowledged += 1;
                match insert {
                    InsertOutcome::Inserted => self.inserted += 1,
                    InsertOutcome::AlreadyExists => self.duplicates += 1,
                }
                if *projected == Some(false) {
                    self.projection_failures += 1;
                }
            }
            DeliveryOutcome::Quarantined { published, .. } => {
                self.quarantined += 1;
                if !published {
                    self.quarantine_failures += 1;
                }
            }
        }
    }
}

/// Handle to control and join a running [`DeliveryWorker`].
#[derive(Debug)]
pub struct WorkerHandle {
    stop: watch::Sender<bool>,
    stats: Arc<Mutex<WorkerStats>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to stop after the in-flight delivery.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stop and wait for the worker to close its connections.
    pub async fn shutdown(mut self) -> WorkerStats {
        self.stop();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "delivery worker task failed");
            }
        }
        self.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Sequential consume loop with reconnect.
///
/// - One session = one [`Connections`] set from the connector.
/// - A session ends on stop (clean) or on a broker error (reconnect after
///   `reconnect_delay`, forever).
/// - Stop is observed between deliveries, never in the middle of one.
#[derive(Debug)]
pub struct DeliveryWorker;

impl DeliveryWorker {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn<C>(connector: C, options: WorkerOptions) -> WorkerHandle
    where
        C: Connector + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let join = tokio::spawn(
            run(connector, options, Arc::clone(&stats), stop_rx)
                .instrument(info_span!("delivery_worker")),
        );

        WorkerHandle {
            stop: stop_tx,
            stats,
            join: Some(join),
        }
    }
}

async fn run<C>(
    connector: C,
    options: WorkerOptions,
    stats: Arc<Mutex<WorkerStats>>,
    mut stop: watch::Receiver<bool>,
) where
    C: Connector,
{
    info!(queue = %options.topology.primary, "delivery worker started");

    while !stop_requested(&stop) {
        match run_session(&connector, &options, &stats, &stop).await {
            Ok(()) => break,
            Err(e) => {
                lock(&stats).transport_errors += 1;
                error!(
                    error = %e,
                    retry_in_secs = options.reconnect_delay.as_secs_f64(),
                    "worker session failed"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(options.reconnect_delay) => {}
            _ = stop.changed() => {}
        }
    }

    info!("delivery worker stopped");
}

async fn run_session<C>(
    connector: &C,
    options: &WorkerOptions,
    stats: &Mutex<WorkerStats>,
    stop: &watch::Receiver<bool>,
) -> Result<(), WorkerError>
where
    C: Connector,
{
    let connections = connector.connect().await?;
    lock(stats).sessions += 1;

    let result = consume(&connections, options, stats, stop).await;
    connections.close().await;
    result
}

async fn consume(
    connections: &Connections,
    options: &WorkerOptions,
    stats: &Mutex<WorkerStats>,
    stop: &watch::Receiver<bool>,
) -> Result<(), WorkerError> {
    let topology = &options.topology;
    let queue = &connections.queue;

    queue.declare_topology(topology).await?;
    queue.start_consuming(&topology.primary, topology.prefetch).await?;

    let projection = connections
        .projection
        .as_ref()
        .map(|store| BestEffortProjection::new(Arc::clone(store), options.projection_retry));
    if projection.is_none() {
        warn!("running without projection store");
    }

    let pipeline = Pipeline::new(
        Arc::clone(queue),
        Arc::clone(&connections.primary),
        projection,
        QuarantinePublisher::new(Arc::clone(queue), &topology.quarantine, &topology.primary),
        Arc::clone(&options.clock),
    );

    info!(
        queue = %topology.primary,
        prefetch = topology.prefetch,
        "session started"
    );

    while !stop_requested(stop) {
        let Some(delivery) = queue.next_delivery(options.poll_interval).await? else {
            continue;
        };
        lock(stats).received += 1;

        let outcome = pipeline.process(delivery).await?;
        lock(stats).record(&outcome);
    }

    Ok(())
}

/// A dropped handle counts as a stop request.
fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

fn lock(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use eventpipe_events::{InMemoryBroker, TransportError};

    use crate::primary_store::InMemoryPrimaryStore;

    struct TestConnector {
        broker: InMemoryBroker,
        primary: Arc<InMemoryPrimaryStore>,
        attempts: AtomicU64,
    }

    #[async_trait]
    impl Connector for TestConnector {
        async fn connect(&self) -> Result<Connections, WorkerError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(Connections {
                queue: Arc::new(self.broker.connect()?),
                primary: self.primary.clone(),
                projection: None,
            })
        }
    }

    fn connector(broker: &InMemoryBroker) -> Arc<TestConnector> {
        Arc::new(TestConnector {
            broker: broker.clone(),
            primary: Arc::new(InMemoryPrimaryStore::new()),
            attempts: AtomicU64::new(0),
        })
    }

    fn options() -> WorkerOptions {
        WorkerOptions::new(QueueTopology::new("events", "events.dlq"))
            .with_reconnect_delay(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(50))
    }

    #[test]
    fn stats_count_outcomes() {
        let mut stats = WorkerStats::default();
        stats.record(&DeliveryOutcome::Acknowledged {
            event_id: "e1".into(),
            insert: InsertOutcome::Inserted,
            projected: Some(false),
        });
        stats.record(&DeliveryOutcome::Acknowledged {
            event_id: "e1".into(),
            insert: InsertOutcome::AlreadyExists,
            projected: None,
        });
        stats.record(&DeliveryOutcome::Quarantined {
            reason: crate::quarantine::QuarantineReason::SchemaViolation,
            published: false,
        });

        assert_eq!(stats.acknowledged, 2);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.projection_failures, 1);
        assert_eq!(stats.quarantined, 1);
        assert_eq!(stats.quarantine_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_session_returns_promptly() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker);
        let handle = DeliveryWorker::spawn(Arc::clone(&connector), options());

        let stats = handle.shutdown().await;

        assert!(stats.sessions <= 1);
        assert_eq!(stats.transport_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_is_retried_after_delay() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(true);
        let connector = connector(&broker);
        let handle = DeliveryWorker::spawn(Arc::clone(&connector), options());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(handle.stats().transport_errors, 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

        broker.refuse_connections(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.stats().sessions, 1);

        let stats = handle.shutdown().await;
        assert_eq!(stats.transport_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_reconnect_delay() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(true);
        let handle = DeliveryWorker::spawn(connector(&broker), options());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = tokio::time::Instant::now();
        handle.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_stops_the_worker() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker);
        let handle = DeliveryWorker::spawn(Arc::clone(&connector), options());
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(handle);

        tokio::time::sleep(Duration::from_secs(1)).await;
        broker.enqueue("events", b"{}".to_vec());
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Nobody consumes any more.
        assert_eq!(broker.depth("events"), 1);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_error_wraps_transport() {
        let err = WorkerError::from(TransportError::Closed);
        assert!(matches!(err, WorkerError::Transport(TransportError::Closed)));
    }
}
