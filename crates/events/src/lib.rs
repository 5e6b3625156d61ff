//! Queue mechanics shared by the ingestion boundary and the delivery worker.
//!
//! Nothing here knows about stores or about what a message means beyond its
//! bytes and headers; the [`QueueClient`] trait is the only seam to the broker.

pub mod envelope;
pub mod headers;
pub mod in_memory_queue;
pub mod queue;

pub use envelope::{Delivery, DeliveryContext, OutboundMessage};
pub use in_memory_queue::{InMemoryBroker, InMemoryQueue, QueuedMessage};
pub use queue::{QueueClient, QueueTopology, TransportError};
