use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use eventpipe_core::Event;

use crate::retry::{Classify, ErrorKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("projection store connection failed: {0}")]
    Connection(String),

    #[error("projection store timed out: {0}")]
    Timeout(String),

    #[error("projection row rejected: {0}")]
    Integrity(String),

    #[error("projection store error: {0}")]
    Database(String),
}

impl Classify for ProjectionError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::Database(_) => ErrorKind::Other,
        }
    }
}

/// Read-side store keyed by `event_id`. Upserts are idempotent.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    async fn upsert(&self, event: &Event) -> Result<(), ProjectionError>;

    async fn close(&self);
}

#[async_trait]
impl<S> ProjectionStore for Arc<S>
where
    S: ProjectionStore + ?Sized,
{
    async fn upsert(&self, event: &Event) -> Result<(), ProjectionError> {
        (**self).upsert(event).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
