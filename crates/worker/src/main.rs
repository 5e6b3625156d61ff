use anyhow::Context;

use eventpipe_infra::config::{WorkerConfig, mask_url};
use eventpipe_infra::{AmqpConnector, DeliveryWorker, WorkerOptions, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eventpipe_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    tracing::info!(
        broker = %mask_url(&config.queue.rabbit_url),
        queue = %config.queue.primary_queue,
        quarantine = %config.queue.quarantine_queue,
        primary_store = %mask_url(&config.postgres_url),
        projection_store = %config.mysql_url.as_deref().map(mask_url).unwrap_or_else(|| "disabled".to_string()),
        prefetch = config.queue.prefetch,
        "starting delivery worker"
    );

    let options = WorkerOptions::from(&config);
    let handle = DeliveryWorker::spawn(AmqpConnector::new(config), options);

    shutdown_signal().await;
    tracing::info!("shutdown requested; finishing in-flight delivery");

    let stats = handle.shutdown().await;
    tracing::info!(
        stats = %serde_json::to_string(&stats).context("failed to encode worker stats")?,
        "delivery worker exited"
    );

    Ok(())
}
