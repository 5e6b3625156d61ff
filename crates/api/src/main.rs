use std::sync::Arc;

use anyhow::Context;

use eventpipe_core::SystemClock;
use eventpipe_infra::broker::AmqpProducer;
use eventpipe_infra::config::{IngestConfig, mask_url};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eventpipe_observability::init();

    let config = IngestConfig::from_env().context("invalid ingestion API configuration")?;
    tracing::info!(
        broker = %mask_url(&config.queue.rabbit_url),
        queue = %config.queue.primary_queue,
        "starting ingestion API"
    );

    // Connects on first publish; the API starts even while the broker is down.
    let producer = AmqpProducer::new(&config.queue.rabbit_url, config.queue.topology());

    let state = eventpipe_api::app::AppState {
        queue: Arc::new(producer),
        queue_name: config.queue.primary_queue.clone(),
        clock: Arc::new(SystemClock),
    };
    let app = eventpipe_api::app::build_app(state, config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(eventpipe_infra::shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}
