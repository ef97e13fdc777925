//! Long-running host that keeps a consumer alive.
//!
//! The host starts an [`EventConsumer`] through its own circuit breaker, idles
//! while it runs and restarts it when startup fails or the connection drops:
//!
//! ```text
//! loop
//!   start consumer (breaker)
//!     ├─ Ok        → idle until shutdown / consumer stopped / connection lost
//!     ├─ Open      → cooldown (open_circuit_cooldown, default 30s)
//!     └─ Err       → cooldown (failure_cooldown, default 5s; 30s if a breaker rejected it)
//! ```
//!
//! Shutdown is signalled through a `watch` channel and interrupts both the idle
//! wait and any cooldown.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::{ConsumerSettings, MessagingConfig};
use crate::connection::ConnectionManager;
use crate::consumer::EventConsumer;
use inventory_events_core::environment::{Clock, SystemClock};
use inventory_events_core::handler::HandlerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Host timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSettings {
    /// Wait after a breaker rejected startup
    pub open_circuit_cooldown: Duration,
    /// Wait after any other startup failure or a lost connection
    pub failure_cooldown: Duration,
    /// How often a running consumer's connection is checked
    pub health_check_interval: Duration,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            open_circuit_cooldown: Duration::from_secs(30),
            failure_cooldown: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(10),
        }
    }
}

/// Why the idle wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Shutdown,
    ConsumerStopped,
    ConnectionLost,
}

/// Keeps one consumer running until shutdown.
pub struct ConsumerHost {
    connections: Arc<ConnectionManager>,
    registry: Arc<HandlerRegistry>,
    exchange: String,
    consumer_settings: ConsumerSettings,
    settings: HostSettings,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
    starts: u64,
}

impl ConsumerHost {
    /// Create a host and the sender that stops it.
    ///
    /// Send `true` (or drop the sender) to shut down.
    #[must_use]
    pub fn new(
        connections: Arc<ConnectionManager>,
        registry: Arc<HandlerRegistry>,
        exchange: impl Into<String>,
        consumer_settings: ConsumerSettings,
        settings: HostSettings,
        breaker: CircuitBreaker,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let host = Self {
            connections,
            registry,
            exchange: exchange.into(),
            consumer_settings,
            settings,
            breaker,
            clock: Arc::new(SystemClock),
            shutdown: shutdown_rx,
            starts: 0,
        };
        (host, shutdown_tx)
    }

    /// Create a host from configuration.
    #[must_use]
    pub fn from_config(
        connections: Arc<ConnectionManager>,
        registry: Arc<HandlerRegistry>,
        config: &MessagingConfig,
    ) -> (Self, watch::Sender<bool>) {
        Self::new(
            connections,
            registry,
            config.broker.exchange_name.clone(),
            config.consumer.clone(),
            config.host.settings(),
            CircuitBreaker::new(config.resilience.circuit_breaker_config()).named("consumer-host"),
        )
    }

    /// Use `clock` for consumers started by this host.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Successful consumer starts so far.
    #[must_use]
    pub const fn starts(&self) -> u64 {
        self.starts
    }

    /// Run until shutdown is signalled.
    pub async fn run(&mut self) {
        tracing::info!(exchange = %self.exchange, "Consumer host starting");

        while !self.shutdown_requested() {
            let mut consumer = EventConsumer::new(
                Arc::clone(&self.connections),
                self.exchange.clone(),
                self.consumer_settings.clone(),
            )
            .with_clock(Arc::clone(&self.clock));

            let registry = Arc::clone(&self.registry);
            let started = self.breaker.call(|| consumer.start_consuming(registry)).await;

            let cooldown = match started {
                Ok(()) => {
                    self.starts += 1;
                    tracing::info!("Worker started and listening for messages");
                    let wake = self.idle(&consumer).await;
                    consumer.shutdown().await;
                    match wake {
                        Wake::Shutdown => break,
                        Wake::ConsumerStopped => {
                            tracing::warn!("Consumer stopped unexpectedly, restarting");
                            self.settings.failure_cooldown
                        }
                        Wake::ConnectionLost => {
                            tracing::warn!("Broker connection lost, restarting consumer");
                            self.settings.failure_cooldown
                        }
                    }
                }
                Err(CircuitBreakerError::Open) => {
                    consumer.shutdown().await;
                    tracing::warn!(
                        cooldown_secs = self.settings.open_circuit_cooldown.as_secs(),
                        "Circuit breaker is open, waiting before retrying"
                    );
                    self.settings.open_circuit_cooldown
                }
                Err(CircuitBreakerError::Inner(err)) => {
                    consumer.shutdown().await;
                    let cooldown = if err.is_circuit_open() {
                        self.settings.open_circuit_cooldown
                    } else {
                        self.settings.failure_cooldown
                    };
                    tracing::error!(
                        error = %err,
                        cooldown_secs = cooldown.as_secs(),
                        "Failed to start consumer"
                    );
                    cooldown
                }
            };

            if self.sleep_or_shutdown(cooldown).await {
                break;
            }
        }

        tracing::info!(starts = self.starts, "Consumer host stopped");
    }

    /// `true` once shutdown was sent or the sender is gone.
    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Wait while the consumer runs.
    async fn idle(&mut self, consumer: &EventConsumer) -> Wake {
        let period = self.settings.health_check_interval.max(Duration::from_millis(1));
        let mut health = tokio::time::interval(period);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        health.tick().await;

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Wake::Shutdown;
                    }
                }
                () = consumer.stopped() => return Wake::ConsumerStopped,
                _ = health.tick() => {
                    if !self.connections.is_connected().await {
                        return Wake::ConnectionLost;
                    }
                }
            }
        }
    }

    /// Sleep for `duration`; returns `true` if shutdown was requested meanwhile.
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        if self.shutdown_requested() {
            return true;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => self.shutdown_requested(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }
}

impl std::fmt::Debug for ConsumerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHost")
            .field("exchange", &self.exchange)
            .field("settings", &self.settings)
            .field("starts", &self.starts)
            .finish_non_exhaustive()
    }
}
