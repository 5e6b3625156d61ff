//! Per-delivery processing.
//!
//! ```text
//! RECEIVED -> PARSED -> VALIDATED -> PRIMARY_PERSISTED -> PROJECTED? -> ACKED
//!                 \           \               \
//!                  `-----------`---------------`--> QUARANTINED (nack, no requeue)
//! ```
//!
//! Only the primary store result decides between ack and quarantine. The
//! projection write happens between the primary insert and the ack, but its
//! outcome never changes which of the two is sent.
//!
//! A quarantined message is always rejected without requeue, whether or not
//! its enriched record reached the quarantine queue. The primary queue's
//! dead-letter route catches the bare original in either case.

use std::sync::Arc;

use tracing::{Instrument, debug, field, info, info_span, warn};

use eventpipe_core::{Clock, Event, MissingEventId, parse_and_validate_at};
use eventpipe_events::{Delivery, DeliveryContext, QueueClient, TransportError};

use crate::primary_store::{InsertOutcome, PrimaryStore};
use crate::projection_store::{BestEffortProjection, ProjectionStore};
use crate::quarantine::{ErrorInfo, QuarantinePublisher, QuarantineReason};

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged {
        event_id: String,
        insert: InsertOutcome,
        /// `None` when no projection store is configured.
        projected: Option<bool>,
    },
    Quarantined {
        reason: QuarantineReason,
        /// Whether the quarantine record reached the broker.
        published: bool,
    },
}

/// The session-scoped clients one pipeline runs against.
pub struct Pipeline {
    queue: Arc<dyn QueueClient>,
    primary: Arc<dyn PrimaryStore>,
    projection: Option<BestEffortProjection<Arc<dyn ProjectionStore>>>,
    quarantine: QuarantinePublisher<Arc<dyn QueueClient>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("projection", &self.projection.is_some())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        primary: Arc<dyn PrimaryStore>,
        projection: Option<BestEffortProjection<Arc<dyn ProjectionStore>>>,
        quarantine: QuarantinePublisher<Arc<dyn QueueClient>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            primary,
            projection,
            quarantine,
            clock,
        }
    }

    /// Drive one delivery to exactly one ack or nack.
    ///
    /// Only broker errors are returned; they end the session.
    pub async fn process(&self, delivery: Delivery) -> Result<DeliveryOutcome, TransportError> {
        let ctx = DeliveryContext::for_delivery(&delivery);
        let span = info_span!(
            "delivery",
            delivery_tag = ctx.delivery_tag,
            correlation_id = %ctx.correlation_id,
            redelivered = delivery.redelivered,
            event_id = field::Empty,
        );

        self.process_in_context(delivery, ctx).instrument(span).await
    }

    async fn process_in_context(
        &self,
        delivery: Delivery,
        ctx: DeliveryContext,
    ) -> Result<DeliveryOutcome, TransportError> {
        debug!(bytes = delivery.body.len(), "received");

        let event = match parse_and_validate_at(&delivery.body, self.clock.now(), MissingEventId::Reject) {
            Ok(event) => event,
            Err(failure) => {
                warn!(reason = failure.reason(), error = %failure, "invalid event");
                let info = ErrorInfo::from_validation(&failure, &ctx);
                return self.reject(&delivery, &ctx, info).await;
            }
        };

        let ctx = ctx.with_event_id(event.event_id().clone());
        tracing::Span::current().record("event_id", event.event_id().as_str());

        let insert = match self.primary.insert_if_absent(&event, &ctx).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(reason = err.reason(), error = %err, "primary write failed");
                let info = ErrorInfo::from_persistence(&err, &ctx);
                return self.reject(&delivery, &ctx, info).await;
            }
        };

        let projected = self.project(&event, &ctx).await;

        self.queue.ack(ctx.delivery_tag).await?;
        info!(insert = ?insert, projected = ?projected, "acknowledged");

        Ok(DeliveryOutcome::Acknowledged {
            event_id: event.event_id().to_string(),
            insert,
            projected,
        })
    }

    async fn project(&self, event: &Event, ctx: &DeliveryContext) -> Option<bool> {
        match &self.projection {
            Some(projection) => Some(projection.upsert_projection(event, ctx).await),
            None => None,
        }
    }

    async fn reject(
        &self,
        delivery: &Delivery,
        ctx: &DeliveryContext,
        info: ErrorInfo,
    ) -> Result<DeliveryOutcome, TransportError> {
        let reason = info.reason;
        let published = self.quarantine.quarantine(&delivery.body, info).await;

        // Redelivery cannot fix a defective message; never requeue it.
        self.queue.nack(ctx.delivery_tag, false).await?;

        if !published {
            warn!(reason = %reason, "quarantine record not published; left to broker dead-lettering");
        }

        Ok(DeliveryOutcome::Quarantined { reason, published })
    }
}
