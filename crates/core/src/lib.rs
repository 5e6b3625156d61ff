//! `eventpipe-core`: the event contract.
//!
//! This crate contains **pure** primitives shared by the ingestion boundary and
//! the delivery worker (no IO, no async). Both sides validate through the same
//! [`parse_and_validate`] entrypoint so that normalization is identical.

pub mod error;
pub mod event;
pub mod id;
pub mod time;

pub use error::{FieldViolation, ValidationFailure};
pub use event::{
    Event, MAX_NAME_LEN, MissingEventId, parse_and_validate, parse_and_validate_at,
    validate_document,
};
pub use id::{CorrelationId, EventId, MAX_CORRELATION_ID_LEN};
pub use time::{
    Clock, FixedClock, MAX_CLOCK_SKEW_SECS, SystemClock, max_clock_skew, normalize_timestamp,
};
