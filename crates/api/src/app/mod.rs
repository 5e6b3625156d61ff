use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;

use eventpipe_core::Clock;
use eventpipe_events::QueueClient;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Publisher for the primary queue.
    pub queue: Arc<dyn QueueClient>,
    pub queue_name: String,
    pub clock: Arc<dyn Clock>,
}

pub fn build_app(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/events", post(routes::events::ingest))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::correlation_middleware))
                .layer(DefaultBodyLimit::max(max_body_bytes)),
        )
}
