//! HTTP ingestion API: accepts events and publishes them to the primary queue.

pub mod app;
pub mod middleware;
