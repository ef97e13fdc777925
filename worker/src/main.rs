//! Inventory event worker.
//!
//! Subscribes to `product.created`, `product.updated` and `product.deleted`
//! and prints every event. Keeps consuming across broker outages until
//! Ctrl+C / SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! RABBITMQ_HOST=localhost cargo run --bin inventory-worker
//! ```

use anyhow::Context;
use inventory_events_core::environment::{Clock, SystemClock};
use inventory_events_rabbitmq::RabbitMqBroker;
use inventory_events_runtime::{CircuitBreaker, ConnectionManager, ConsumerHost, MessagingConfig, MetricsServer};
use inventory_worker::{handlers, init_tracing, shutdown_signal};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing("info,inventory_worker=debug,lapin=warn");

    info!("Starting inventory worker");

    let config = MessagingConfig::from_env().context("Invalid configuration")?;
    info!(
        host = %config.broker.host,
        port = config.broker.port,
        exchange = %config.broker.exchange_name,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr).start().context("Failed to start metrics server")?;
    }

    let breaker = CircuitBreaker::new(config.resilience.circuit_breaker_config()).named("rabbitmq-connection");
    let connections = Arc::new(ConnectionManager::from_settings(
        Arc::new(RabbitMqBroker::new()),
        &config.broker,
        breaker,
    ));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(handlers::registry(&clock).context("Failed to register handlers")?);

    let (mut host, shutdown) = ConsumerHost::from_config(Arc::clone(&connections), registry, &config);
    let host_task = tokio::spawn(async move { host.run().await });

    shutdown_signal().await;
    let _ = shutdown.send(true);
    host_task.await.context("Consumer host task failed")?;

    if let Err(e) = connections.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }

    info!("Worker stopped");
    Ok(())
}
