use std::sync::Arc;

use mom_sync::{Dispatcher, QueueBuilder, RelayConfig, Result, Worker};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // PUSH_QUEUE_URL / RECEIVE_QUEUE_URL select the queues; both default to
    // in-process ones.
    let config = Arc::new(RelayConfig::from_env().unwrap_or_else(|_| {
        RelayConfig::new("memory://loopback-push", "memory://loopback-replies").with_region("local")
    }));

    let dispatcher = Dispatcher::connect(config.clone()).await?;

    let inbound = QueueBuilder::new()
        .uri(config.push_queue_url.as_str())
        .name(config.push_queue_name())
        .build()
        .await?;
    let replies = QueueBuilder::new()
        .uri(config.receive_queue_url.as_str())
        .name(config.receive_queue_name())
        .build()
        .await?;
    let worker = Worker::new(config.clone(), replies).spawn(inbound);

    let body = std::env::args()
        .nth(1)
        .unwrap_or_else(|| r#"{"runId":"loopback","messageBodyBytes":256}"#.to_string());
    let reply = dispatcher.handle_api(&body, None).await;

    println!("{} {}", reply.status_code, reply.body);

    worker.shutdown().await?;
    Ok(())
}
