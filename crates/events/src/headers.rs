//! Message header names.

pub const EVENT_ID: &str = "event_id";
pub const EVENT_TYPE: &str = "event_type";
pub const SOURCE: &str = "source";
pub const SCHEMA_VERSION: &str = "schema_version";
pub const CORRELATION_ID: &str = "x-correlation-id";

/// Set on quarantine records by the worker.
pub const DEATH_REASON: &str = "x-death-reason";
pub const ORIGINAL_QUEUE: &str = "x-original-queue";

/// Set by the broker when it dead-letters a rejected message itself.
pub const FIRST_DEATH_REASON: &str = "x-first-death-reason";
pub const FIRST_DEATH_QUEUE: &str = "x-first-death-queue";

pub const CONTENT_TYPE_JSON: &str = "application/json";
