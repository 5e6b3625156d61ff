//! Best-effort projection store.
//!
//! The projection is a read-side copy. Its failures are classified, retried
//! within policy, logged, and then forgotten: they never decide whether a
//! delivery is acknowledged.

pub mod best_effort;
pub mod in_memory;
pub mod mysql;
pub mod r#trait;

pub use best_effort::BestEffortProjection;
pub use in_memory::InMemoryProjectionStore;
pub use mysql::MySqlProjectionStore;
pub use r#trait::{ProjectionError, ProjectionStore};
