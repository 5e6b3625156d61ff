//! Delivery worker: the consume loop, its sessions and the reconnect loop.

pub mod connector;
pub mod delivery_worker;
pub mod pipeline;

pub use connector::{AmqpConnector, Connections, Connector};
pub use delivery_worker::{DeliveryWorker, WorkerHandle, WorkerOptions, WorkerStats};
pub use pipeline::{DeliveryOutcome, Pipeline};

use thiserror::Error;

use eventpipe_events::TransportError;

use crate::primary_store::PrimaryStoreError;

/// Why a worker session ended. Every variant leads to a reconnect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("could not open primary store: {0}")]
    PrimaryStore(#[from] PrimaryStoreError),
}
