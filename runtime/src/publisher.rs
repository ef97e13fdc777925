//! Publishes inventory events to the topic exchange with retry and circuit breaking.
//!
//! # Attempt Pipeline
//!
//! ```text
//! publish(msg, key)
//!   └─ serialize once (serde_json)
//!   └─ retry_fixed(max_attempts, delay)
//!        └─ breaker.call
//!             └─ connection() ─► open_channel ─► declare exchange ─► publish ─► close channel
//! ```
//!
//! Every attempt opens its own channel and stamps a fresh message id and
//! timestamp, so a retried message is a new message from the broker's point of
//! view. Delivery is fire-and-forget: success means the channel accepted the
//! publish, not that any consumer saw it.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::MessagingConfig;
use crate::connection::{ConnectionError, ConnectionManager};
use crate::metrics::PublisherMetrics;
use crate::retry::{RetryPolicy, retry_fixed};
use inventory_events_core::broker::{BrokerError, ExchangeKind, ExchangeOptions};
use inventory_events_core::envelope::{EnvelopeError, OutgoingMessage, unix_seconds};
use inventory_events_core::environment::{Clock, SystemClock};
use inventory_events_core::routing::{RoutingKey, RoutingKeyError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

/// Why a single publish attempt failed.
#[derive(Error, Debug, Clone)]
pub enum PublishAttemptError {
    /// The publisher's circuit breaker rejected the attempt
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// No connection could be obtained
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The broker failed while opening a channel, declaring or publishing
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl PublishAttemptError {
    /// Whether a breaker (the publisher's or the connection's) rejected the attempt.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen | Self::Connection(ConnectionError::CircuitOpen { .. })
        )
    }
}

/// Errors from [`EventPublisher`].
#[derive(Error, Debug)]
pub enum PublishError {
    /// The routing key is not one of the known tokens
    #[error("Invalid routing key: {0}")]
    InvalidRoutingKey(#[source] RoutingKeyError),

    /// The message could not be serialized
    #[error("Failed to serialize message: {0}")]
    Serialization(#[source] EnvelopeError),

    /// Every attempt failed
    #[error("Failed to publish message to '{routing_key}' after {attempts} attempts: {source}")]
    Failed {
        /// Routing key of the message
        routing_key: RoutingKey,
        /// Attempts made
        attempts: usize,
        /// Cause of the final attempt's failure
        #[source]
        source: PublishAttemptError,
    },
}

impl PublishError {
    /// Whether the final attempt was rejected by an open circuit.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::Failed { source, .. } if source.is_circuit_open())
    }
}

/// What the broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Message id of the successful attempt
    pub message_id: String,
    /// Routing key the message was published with
    pub routing_key: RoutingKey,
    /// Unix seconds stamped on the message
    pub timestamp: u64,
    /// Attempts it took
    pub attempts: usize,
}

/// Publishes inventory events.
///
/// Safe to share between tasks: the connection and breaker are internally
/// synchronized and each attempt uses its own channel.
pub struct EventPublisher {
    connections: Arc<ConnectionManager>,
    exchange: String,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl EventPublisher {
    /// Create a publisher on `exchange`.
    ///
    /// `breaker` guards publish attempts and is separate from the connection
    /// manager's breaker.
    #[must_use]
    pub fn new(
        connections: Arc<ConnectionManager>,
        exchange: impl Into<String>,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            connections,
            exchange: exchange.into(),
            breaker,
            retry,
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a publisher from configuration.
    #[must_use]
    pub fn from_config(connections: Arc<ConnectionManager>, config: &MessagingConfig) -> Self {
        Self::new(
            connections,
            config.broker.exchange_name.clone(),
            CircuitBreaker::new(config.resilience.circuit_breaker_config()).named("rabbitmq-publish"),
            config.resilience.retry_policy(),
        )
    }

    /// Use `clock` for message timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The publisher's circuit breaker.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The exchange messages are published to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publish with a raw routing key, validated against the known tokens.
    ///
    /// # Errors
    ///
    /// [`PublishError::InvalidRoutingKey`] for an unknown key (nothing is sent),
    /// otherwise as [`publish`](Self::publish).
    pub async fn publish_with_key<T>(&self, message: &T, routing_key: &str) -> Result<PublishReceipt, PublishError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let routing_key = routing_key.parse::<RoutingKey>().map_err(|err| {
            tracing::error!(routing_key, "Refusing to publish with unknown routing key");
            PublishError::InvalidRoutingKey(err)
        })?;
        self.publish(message, routing_key).await
    }

    /// Serialize `message` as JSON and publish it with `routing_key`.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Serialization`] if `message` cannot be encoded (no attempt is made)
    /// - [`PublishError::Failed`] once every attempt has failed
    pub async fn publish<T>(&self, message: &T, routing_key: RoutingKey) -> Result<PublishReceipt, PublishError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let template = OutgoingMessage::json(message, String::new(), self.clock.now())
            .map_err(PublishError::Serialization)?;
        let max_attempts = self.retry.effective_attempts();
        let started = Instant::now();

        let result = retry_fixed(&self.retry, |attempt| {
            let template = &template;
            async move {
                match self.breaker.call(|| self.send(routing_key, template)).await {
                    Ok((message_id, timestamp)) => Ok(PublishReceipt {
                        message_id,
                        routing_key,
                        timestamp,
                        attempts: attempt,
                    }),
                    Err(CircuitBreakerError::Open) => {
                        tracing::warn!(
                            %routing_key,
                            attempt,
                            max_attempts,
                            "Circuit breaker is open, publish attempt rejected"
                        );
                        Err(PublishAttemptError::CircuitOpen)
                    }
                    Err(CircuitBreakerError::Inner(err)) => {
                        if err.is_circuit_open() {
                            tracing::warn!(%routing_key, attempt, max_attempts, error = %err, "Publish attempt rejected");
                        } else {
                            tracing::error!(%routing_key, attempt, max_attempts, error = %err, "Publish attempt failed");
                        }
                        Err(err)
                    }
                }
            }
        })
        .await;

        match result {
            Ok(receipt) => {
                PublisherMetrics::record_publish(routing_key, started.elapsed());
                tracing::info!(
                    %routing_key,
                    exchange = %self.exchange,
                    message_id = %receipt.message_id,
                    attempts = receipt.attempts,
                    "Message published"
                );
                Ok(receipt)
            }
            Err(exhausted) => {
                PublisherMetrics::record_publish_error(routing_key);
                tracing::error!(
                    %routing_key,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Failed to publish message after all attempts"
                );
                Err(PublishError::Failed {
                    routing_key,
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                })
            }
        }
    }

    /// One attempt: fresh channel, exchange declaration, publish, channel close.
    async fn send(&self, routing_key: RoutingKey, template: &OutgoingMessage) -> Result<(String, u64), PublishAttemptError> {
        let connection = self.connections.connection().await?;
        let channel = connection.open_channel().await?;

        let message = OutgoingMessage {
            message_id: Uuid::new_v4().to_string(),
            timestamp: unix_seconds(self.clock.now()),
            ..template.clone()
        };
        let receipt = (message.message_id.clone(), message.timestamp);

        let outcome = async {
            channel
                .declare_exchange(&self.exchange, ExchangeKind::Topic, ExchangeOptions::durable())
                .await?;
            channel.publish(&self.exchange, routing_key.as_str(), message).await
        }
        .await;

        if let Err(err) = channel.close().await {
            tracing::debug!(error = %err, "Failed to close publish channel");
        }

        outcome?;
        Ok(receipt)
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("exchange", &self.exchange)
            .field("breaker", &self.breaker.name())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
