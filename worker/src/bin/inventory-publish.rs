//! Publish a single product event.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin inventory-publish -- created '{"id":1,"name":"widget"}'
//! cargo run --bin inventory-publish -- deleted '{"id":1}'
//! ```

use anyhow::Context;
use clap::{Parser, ValueEnum};
use inventory_events_core::product::Product;
use inventory_events_core::routing::RoutingKey;
use inventory_events_rabbitmq::RabbitMqBroker;
use inventory_events_runtime::{CircuitBreaker, ConnectionManager, EventPublisher, MessagingConfig};
use inventory_worker::init_tracing;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "inventory-publish")]
#[command(about = "Publish a product event to the inventory exchange")]
struct Args {
    /// Which lifecycle event to publish
    #[arg(value_enum)]
    event: Event,

    /// Product as JSON; `deleted` needs only the id
    product: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Event {
    Created,
    Updated,
    Deleted,
}

impl From<Event> for RoutingKey {
    fn from(event: Event) -> Self {
        match event {
            Event::Created => Self::ProductCreated,
            Event::Updated => Self::ProductUpdated,
            Event::Deleted => Self::ProductDeleted,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing("warn,inventory_events_runtime=info");

    let args = Args::parse();
    let product: Product = serde_json::from_str(&args.product).context("Product must be JSON with at least an id")?;

    let config = MessagingConfig::from_env().context("Invalid configuration")?;
    let breaker = CircuitBreaker::new(config.resilience.circuit_breaker_config()).named("rabbitmq-connection");
    let connections = Arc::new(ConnectionManager::from_settings(
        Arc::new(RabbitMqBroker::new()),
        &config.broker,
        breaker,
    ));
    let publisher = EventPublisher::from_config(Arc::clone(&connections), &config);

    let result = publisher.publish(&product, args.event.into()).await;
    let _ = connections.close().await;
    let receipt = result.context("Publish failed")?;

    println!(
        "Published {} (message id {}, {} attempt{})",
        receipt.routing_key,
        receipt.message_id,
        receipt.attempts,
        if receipt.attempts == 1 { "" } else { "s" }
    );
    Ok(())
}
