//! Reads (and removes) messages from the quarantine queue, printing one JSON
//! line per message.
//!
//! Usage: `eventpipe-quarantine [LIMIT]` (default 100). Queue and broker come
//! from the same environment as the worker.

use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use eventpipe_events::QueueClient;
use eventpipe_infra::broker::AmqpQueue;
use eventpipe_infra::config::QueueSettings;
use eventpipe_infra::quarantine::drain_quarantine;

const DEFAULT_LIMIT: usize = 100;
const IDLE_WAIT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eventpipe_observability::init();

    let limit = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<usize>()
            .with_context(|| format!("invalid limit '{arg}'"))?,
        None => DEFAULT_LIMIT,
    };

    let settings = QueueSettings::from_lookup(&|key: &str| std::env::var(key).ok())
        .context("invalid queue configuration")?;

    let queue = AmqpQueue::connect(&settings.rabbit_url)
        .await
        .context("failed to connect to broker")?;
    queue
        .declare_topology(&settings.topology())
        .await
        .context("failed to declare queues")?;
    let entries = drain_quarantine(&queue, &settings.quarantine_queue, limit, IDLE_WAIT)
        .await
        .context("failed to read quarantine queue")?;

    for entry in &entries {
        let line = match &entry.record {
            Some(record) => json!({
                "death_reason": entry.death_reason,
                "original_queue": entry.original_queue,
                "record": record,
            }),
            None => json!({
                "death_reason": entry.death_reason,
                "original_queue": entry.original_queue,
                "raw": entry.raw,
            }),
        };
        println!("{line}");
    }

    tracing::info!(count = entries.len(), queue = %settings.quarantine_queue, "quarantine drained");
    queue.close().await.context("failed to close broker connection")?;
    Ok(())
}
