use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use eventpipe_core::Event;
use eventpipe_events::DeliveryContext;

use crate::retry::{Classify, ErrorKind};

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with this `event_id` was already present; nothing was written.
    AlreadyExists,
}

/// Any primary-store failure other than the uniqueness conflict.
///
/// None of these are retried by the store. The worker quarantines the message
/// with reason `persistence_error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrimaryStoreError {
    /// Connection refused/lost, pool closed or acquire timed out.
    #[error("primary store unavailable: {0}")]
    Unavailable(String),

    /// Constraint violated by the row itself (other than the `event_id` conflict).
    #[error("primary store rejected row: {0}")]
    Rejected(String),

    #[error("primary store error: {0}")]
    Database(String),
}

impl PrimaryStoreError {
    pub fn reason(&self) -> &'static str {
        "persistence_error"
    }

    pub fn exception_type(&self) -> &'static str {
        "PrimaryPersistenceError"
    }
}

impl Classify for PrimaryStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Connection,
            Self::Rejected(_) => ErrorKind::Integrity,
            Self::Database(_) => ErrorKind::Other,
        }
    }
}

/// System-of-record store keyed by `event_id`.
///
/// Implementations must be safe under concurrent inserts of the same
/// `event_id`: exactly one caller observes [`InsertOutcome::Inserted`].
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn insert_if_absent(
        &self,
        event: &Event,
        ctx: &DeliveryContext,
    ) -> Result<InsertOutcome, PrimaryStoreError>;

    /// Release connections. The store is unusable afterwards: later inserts
    /// fail as `Unavailable`. The worker opens a fresh store per session.
    async fn close(&self);
}

#[async_trait]
impl<S> PrimaryStore for Arc<S>
where
    S: PrimaryStore + ?Sized,
{
    async fn insert_if_absent(
        &self,
        event: &Event,
        ctx: &DeliveryContext,
    ) -> Result<InsertOutcome, PrimaryStoreError> {
        (**self).insert_if_absent(event, ctx).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
