use tracing::{info, warn};

use eventpipe_core::Event;
use eventpipe_events::DeliveryContext;

use super::r#trait::ProjectionStore;
use crate::retry::{RetryPolicy, is_retryable, run_with_retry};

/// A projection store driven through the retry policy.
///
/// `upsert_projection` never fails: it reports whether the row was written.
#[derive(Debug)]
pub struct BestEffortProjection<P> {
    store: P,
    policy: RetryPolicy,
}

impl<P> BestEffortProjection<P>
where
    P: ProjectionStore,
{
    pub fn new(store: P, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Upsert `event`, retrying transient failures within policy.
    ///
    /// Returns `true` when written, `false` when abandoned.
    pub async fn upsert_projection(&self, event: &Event, ctx: &DeliveryContext) -> bool {
        let result = run_with_retry(&self.policy, "upsert_projection", is_retryable, || {
            self.store.upsert(event)
        })
        .await;

        match result {
            Ok(()) => {
                info!(
                    event_id = %event.event_id(),
                    correlation_id = %ctx.correlation_id,
                    "projection upserted"
                );
                true
            }
            Err(err) => {
                warn!(
                    event_id = %event.event_id(),
                    correlation_id = %ctx.correlation_id,
                    transient = is_retryable(&err),
                    error = %err,
                    "projection write abandoned"
                );
                false
            }
        }
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
