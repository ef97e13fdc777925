//! # Inventory Events Runtime
//!
//! Resilient publishing and consumption of inventory events.
//!
//! ## Core Components
//!
//! - **[`CircuitBreaker`]**: fails fast while a dependency is known to be down
//! - **[`ConnectionManager`]**: one shared broker connection, recreated on demand
//! - **[`EventPublisher`]**: JSON publish with fixed-delay retry behind a breaker
//! - **[`EventConsumer`]**: queue topology, subscriptions and handler dispatch
//! - **[`ConsumerHost`]**: keeps a consumer running with cooldowns between restarts
//! - **[`MessagingConfig`]**: environment-driven configuration
//!
//! ## Example
//!
//! ```ignore
//! use inventory_events_runtime::{CircuitBreaker, ConnectionManager, EventPublisher, MessagingConfig};
//! use inventory_events_core::routing::RoutingKey;
//! use std::sync::Arc;
//!
//! let config = MessagingConfig::from_env()?;
//! let breaker = CircuitBreaker::new(config.resilience.circuit_breaker_config()).named("rabbitmq-connection");
//! let connections = Arc::new(ConnectionManager::from_settings(broker, &config.broker, breaker));
//!
//! let publisher = EventPublisher::from_config(Arc::clone(&connections), &config);
//! publisher.publish(&product, RoutingKey::ProductCreated).await?;
//! ```

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Environment-driven configuration
pub mod config;

/// Shared broker connection
pub mod connection;

/// Queue subscriptions and handler dispatch
pub mod consumer;

/// Long-running consumer host
pub mod host;

/// Prometheus metrics for observability
pub mod metrics;

/// Event publishing with retry
pub mod publisher;

/// Fixed-delay retry
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, State};
pub use config::{ConfigError, MessagingConfig};
pub use connection::{ConnectionError, ConnectionManager};
pub use consumer::{ConsumeError, ConsumerStats, EventConsumer};
pub use host::{ConsumerHost, HostSettings};
pub use metrics::MetricsServer;
pub use publisher::{EventPublisher, PublishAttemptError, PublishError, PublishReceipt};
pub use retry::{RetryExhausted, RetryPolicy};
