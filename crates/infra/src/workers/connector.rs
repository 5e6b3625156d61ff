use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use eventpipe_events::QueueClient;

use super::WorkerError;
use crate::broker::AmqpQueue;
use crate::config::{WorkerConfig, mask_url};
use crate::primary_store::{PostgresPrimaryStore, PrimaryStore};
use crate::projection_store::{MySqlProjectionStore, ProjectionStore};

/// Clients owned by one worker session.
pub struct Connections {
    pub queue: Arc<dyn QueueClient>,
    pub primary: Arc<dyn PrimaryStore>,
    /// `None` runs the session without a projection.
    pub projection: Option<Arc<dyn ProjectionStore>>,
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field("projection", &self.projection.is_some())
            .finish_non_exhaustive()
    }
}

impl Connections {
    /// Close every client. Errors are logged, never returned.
    pub async fn close(&self) {
        if let Err(e) = self.queue.close().await {
            warn!(error = %e, "closing broker connection failed");
        }
        self.primary.close().await;
        if let Some(projection) = &self.projection {
            projection.close().await;
        }
    }
}

/// Opens a fresh set of clients for each worker session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connections, WorkerError>;
}

#[async_trait]
impl<C> Connector for Arc<C>
where
    C: Connector + ?Sized,
{
    async fn connect(&self) -> Result<Connections, WorkerError> {
        (**self).connect().await
    }
}

/// Production connector: RabbitMQ, Postgres and (optionally) MySQL.
///
/// - Broker and primary store failures fail the attempt.
/// - A MySQL failure only disables the projection for this session.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: WorkerConfig,
}

impl AmqpConnector {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    async fn projection(&self) -> Option<Arc<dyn ProjectionStore>> {
        let Some(url) = self.config.mysql_url.as_deref() else {
            warn!("MYSQL_URL is empty; projection disabled");
            return None;
        };

        match MySqlProjectionStore::connect(url, self.config.mysql_pool_size).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(url = %mask_url(url), error = %e, "projection store unreachable; projection disabled for this session");
                None
            }
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Connections, WorkerError> {
        let primary = PostgresPrimaryStore::connect(&self.config.postgres_url).await?;
        info!(url = %mask_url(&self.config.postgres_url), "connected to primary store");

        let projection = self.projection().await;

        let queue = match AmqpQueue::connect(&self.config.queue.rabbit_url).await {
            Ok(queue) => queue,
            Err(e) => {
                primary.close().await;
                if let Some(projection) = &projection {
                    projection.close().await;
                }
                return Err(e.into());
            }
        };

        Ok(Connections {
            queue: Arc::new(queue),
            primary: Arc::new(primary),
            projection,
        })
    }
}
