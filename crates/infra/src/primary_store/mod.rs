//! Idempotent primary store boundary.
//!
//! The primary store is the system of record: a delivery is acknowledged only
//! after its event is durably here. Uniqueness on `event_id` makes
//! redelivery harmless.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryPrimaryStore;
pub use postgres::PostgresPrimaryStore;
pub use r#trait::{InsertOutcome, PrimaryStore, PrimaryStoreError};
