//! Shared, lazily (re)created broker connection.
//!
//! The [`ConnectionManager`] hands out one long-lived connection to every
//! publisher and consumer in the process. A connection is created on first use
//! and recreated whenever the cached one reports it is no longer open. Creation
//! goes through a [`CircuitBreaker`], so an unreachable broker is not hammered
//! with connection attempts.
//!
//! ```text
//! connection() ──► cached & open? ──yes──► clone of cached handle
//!                        │
//!                        no
//!                        ▼
//!                 breaker.call(connect) ──► Ok: cache + return
//!                                       ├─► Open: ConnectionError::CircuitOpen
//!                                       └─► Err: ConnectionError::Connect
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::BrokerSettings;
use inventory_events_core::broker::{Broker, BrokerConnection, BrokerError, ConnectionParams};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors obtaining a broker connection.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// The connection breaker is open; no attempt was made
    #[error("Circuit breaker is open, not connecting to {host}:{port}")]
    CircuitOpen {
        /// Broker host
        host: String,
        /// Broker port
        port: u16,
    },

    /// The broker could not be reached
    #[error("Failed to create broker connection to {host}:{port}: {source}")]
    Connect {
        /// Broker host
        host: String,
        /// Broker port
        port: u16,
        /// Underlying broker error
        #[source]
        source: BrokerError,
    },
}

impl ConnectionError {
    /// Whether the connection breaker rejected the attempt.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// Owns the process-wide broker connection.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    params: ConnectionParams,
    breaker: CircuitBreaker,
    current: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    /// Create a manager that connects with `params` through `breaker`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, params: ConnectionParams, breaker: CircuitBreaker) -> Self {
        Self {
            broker,
            params,
            breaker,
            current: Mutex::new(None),
        }
    }

    /// Create a manager from broker settings.
    #[must_use]
    pub fn from_settings(broker: Arc<dyn Broker>, settings: &BrokerSettings, breaker: CircuitBreaker) -> Self {
        Self::new(broker, settings.connection_params(), breaker)
    }

    /// The breaker guarding connection attempts.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Parameters used for every connection attempt.
    #[must_use]
    pub const fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Get the shared connection, creating it if needed.
    ///
    /// Concurrent callers wait for a single in-flight connect instead of racing.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::CircuitOpen`] if the breaker rejects the attempt
    /// - [`ConnectionError::Connect`] if the broker cannot be reached
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>, ConnectionError> {
        let mut current = self.current.lock().await;

        if let Some(connection) = current.as_ref() {
            if connection.is_open() {
                return Ok(Arc::clone(connection));
            }
            tracing::warn!(host = %self.params.host, "Broker connection is closed, reconnecting");
        }

        tracing::info!(
            host = %self.params.host,
            port = self.params.port,
            virtual_host = %self.params.virtual_host,
            "Creating broker connection"
        );

        match self.breaker.call(|| self.broker.connect(&self.params)).await {
            Ok(connection) => {
                tracing::info!(connection_name = %self.params.connection_name, "Broker connection established");
                *current = Some(Arc::clone(&connection));
                Ok(connection)
            }
            Err(CircuitBreakerError::Open) => {
                *current = None;
                Err(ConnectionError::CircuitOpen {
                    host: self.params.host.clone(),
                    port: self.params.port,
                })
            }
            Err(CircuitBreakerError::Inner(source)) => {
                tracing::error!(
                    host = %self.params.host,
                    port = self.params.port,
                    error = %source,
                    "Failed to create broker connection"
                );
                *current = None;
                Err(ConnectionError::Connect {
                    host: self.params.host.clone(),
                    port: self.params.port,
                    source,
                })
            }
        }
    }

    /// Whether a cached connection exists and is open.
    pub async fn is_connected(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|connection| connection.is_open())
    }

    /// Close and forget the cached connection.
    ///
    /// The next [`connection`](Self::connection) call reconnects.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if the close handshake fails; the connection
    /// is forgotten either way.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let Some(connection) = self.current.lock().await.take() else {
            return Ok(());
        };

        tracing::info!(host = %self.params.host, "Closing broker connection");
        connection.close().await
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("params", &self.params)
            .field("breaker", &self.breaker.name())
            .finish_non_exhaustive()
    }
}
