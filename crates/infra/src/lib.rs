//! Infrastructure layer: broker, stores, retry, quarantine and the delivery worker.

pub mod broker;
pub mod config;
pub mod primary_store;
pub mod projection_store;
pub mod quarantine;
pub mod retry;
pub mod shutdown;
pub mod workers;

pub use config::{ConfigError, IngestConfig, QueueSettings, WorkerConfig};
pub use retry::{RetryPolicy, run_with_retry};
pub use shutdown::shutdown_signal;
pub use workers::{AmqpConnector, DeliveryWorker, WorkerError, WorkerHandle, WorkerOptions, WorkerStats};
