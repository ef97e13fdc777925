//! Consumes inventory events and dispatches them to handlers.
//!
//! # Topology
//!
//! For every routing key in the registry the consumer declares a durable queue
//! named after the key's token and binds it to the topic exchange with that
//! exact token.
//!
//! # Dispatch Model
//!
//! ```text
//! queue product.created ──► forward task ─┐
//! queue product.updated ──► forward task ─┼─► mpsc (bounded) ──► dispatch task ──► HandlerRegistry
//! queue product.deleted ──► forward task ─┘
//! ```
//!
//! Forwarding tasks decode bodies as UTF-8 and stamp the receipt time. The
//! single dispatch task runs handlers one message at a time.
//!
//! # Delivery Guarantees
//!
//! Subscriptions use auto-ack: the broker considers a message delivered as soon
//! as it is pushed to this process. A handler failure, a decode failure or a
//! crash before dispatch loses the message. Handler errors and panics are
//! logged and counted, and never stop the loop.

use crate::config::ConsumerSettings;
use crate::connection::{ConnectionError, ConnectionManager};
use crate::metrics::ConsumerMetrics;
use futures::{FutureExt, StreamExt};
use inventory_events_core::broker::{
    BrokerChannel, BrokerError, ConsumeOptions, DeliveryStream, ExchangeKind, ExchangeOptions, QueueOptions,
};
use inventory_events_core::envelope::Envelope;
use inventory_events_core::environment::{Clock, SystemClock};
use inventory_events_core::handler::HandlerRegistry;
use inventory_events_core::routing::RoutingKey;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Errors starting a consumer.
#[derive(Error, Debug, Clone)]
pub enum ConsumeError {
    /// `start_consuming` was already called on this consumer
    #[error("Consumer has already been started")]
    AlreadyStarted,

    /// The connection breaker is open
    #[error("Circuit breaker is open, cannot start consuming")]
    CircuitOpen,

    /// No connection could be obtained
    #[error(transparent)]
    Connection(ConnectionError),

    /// Channel, topology or subscription setup failed
    #[error("Failed to set up consumer: {0}")]
    Broker(#[from] BrokerError),
}

impl From<ConnectionError> for ConsumeError {
    fn from(err: ConnectionError) -> Self {
        if err.is_circuit_open() {
            Self::CircuitOpen
        } else {
            Self::Connection(err)
        }
    }
}

impl ConsumeError {
    /// Whether startup was rejected by an open circuit.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }
}

/// Snapshot of consumer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerStats {
    /// Deliveries taken off the queues
    pub received: u64,
    /// Messages whose handler succeeded
    pub dispatched: u64,
    /// Messages whose handler failed or panicked
    pub failed: u64,
    /// Deliveries dropped because the body was not UTF-8
    pub undecodable: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
    undecodable: AtomicU64,
}

/// Subscribes to every handler's queue and feeds messages to the registry.
///
/// One instance consumes once: after [`shutdown`](Self::shutdown), create a new
/// consumer to start again.
pub struct EventConsumer {
    connections: Arc<ConnectionManager>,
    exchange: String,
    settings: ConsumerSettings,
    clock: Arc<dyn Clock>,
    started: bool,
    channel: Option<Box<dyn BrokerChannel>>,
    forwarders: Vec<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    stopped: Option<watch::Receiver<bool>>,
    counters: Arc<Counters>,
}

impl EventConsumer {
    /// Create a consumer on `exchange`.
    #[must_use]
    pub fn new(connections: Arc<ConnectionManager>, exchange: impl Into<String>, settings: ConsumerSettings) -> Self {
        Self {
            connections,
            exchange: exchange.into(),
            settings,
            clock: Arc::new(SystemClock),
            started: false,
            channel: None,
            forwarders: Vec::new(),
            dispatcher: None,
            stopped: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Use `clock` to stamp receipt times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Declare topology and start dispatching messages to `registry`.
    ///
    /// Returns once every queue is subscribed; messages are processed in the
    /// background until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// - [`ConsumeError::AlreadyStarted`] on a second call
    /// - [`ConsumeError::CircuitOpen`] / [`ConsumeError::Connection`] if no connection is available
    /// - [`ConsumeError::Broker`] if channel, topology or subscription setup fails
    ///
    /// After an error, call [`shutdown`](Self::shutdown) to release whatever
    /// was set up.
    pub async fn start_consuming(&mut self, registry: Arc<HandlerRegistry>) -> Result<(), ConsumeError> {
        if self.started {
            return Err(ConsumeError::AlreadyStarted);
        }
        self.started = true;

        let connection = self.connections.connection().await?;
        let channel = &**self.channel.insert(connection.open_channel().await?);

        channel
            .declare_exchange(&self.exchange, ExchangeKind::Topic, ExchangeOptions::durable())
            .await?;

        let (tx, rx) = mpsc::channel(self.settings.buffer_size.max(1));

        for routing_key in registry.routing_keys() {
            let queue = routing_key.queue_name();
            channel.declare_queue(queue, QueueOptions::durable()).await?;
            channel.bind_queue(queue, &self.exchange, routing_key.as_str()).await?;

            let options = ConsumeOptions {
                consumer_tag: format!("{}-{queue}", self.settings.consumer_tag_prefix),
                auto_ack: true,
            };
            let deliveries = channel.consume(queue, options).await?;

            tracing::info!(queue, exchange = %self.exchange, "Subscribed to queue");
            self.forwarders.push(tokio::spawn(forward(
                routing_key,
                deliveries,
                tx.clone(),
                Arc::clone(&self.clock),
                Arc::clone(&self.counters),
            )));
        }
        drop(tx);

        let (stopped_tx, stopped_rx) = watch::channel(false);
        self.stopped = Some(stopped_rx);
        self.dispatcher = Some(tokio::spawn(dispatch(
            rx,
            registry,
            Arc::clone(&self.counters),
            stopped_tx,
        )));

        tracing::info!(
            queues = self.forwarders.len(),
            exchange = %self.exchange,
            "Consumer started"
        );
        Ok(())
    }

    /// Whether the dispatch loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.stopped.as_ref().is_some_and(|stopped| !*stopped.borrow())
    }

    /// Resolves once the dispatch loop has ended, which happens when every
    /// delivery stream has closed (for example after the connection dropped).
    ///
    /// Resolves immediately if the consumer never started.
    pub async fn stopped(&self) {
        let Some(mut stopped) = self.stopped.clone() else {
            return;
        };
        // An error means the dispatcher is gone, which is also "stopped"
        let _ = stopped.wait_for(|done| *done).await;
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            undecodable: self.counters.undecodable.load(Ordering::Relaxed),
        }
    }

    /// Stop consuming and close the channel.
    ///
    /// Messages already handed to the dispatcher are processed before this
    /// returns. Safe to call after a failed start and more than once. The
    /// connection stays open; it belongs to the [`ConnectionManager`].
    pub async fn shutdown(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }

        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                tracing::warn!(error = %err, "Failed to close consumer channel");
            }
        }

        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(err) = dispatcher.await {
                tracing::error!(error = %err, "Dispatch task ended abnormally");
            }
            tracing::info!(stats = ?self.stats(), "Consumer stopped");
        }
    }
}

impl Drop for EventConsumer {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}

impl std::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("exchange", &self.exchange)
            .field("settings", &self.settings)
            .field("started", &self.started)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Decode deliveries from one queue and hand them to the dispatcher.
async fn forward(
    routing_key: RoutingKey,
    mut deliveries: DeliveryStream,
    tx: mpsc::Sender<Envelope>,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
) {
    let queue = routing_key.queue_name();

    while let Some(next) = deliveries.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(err) => {
                ConsumerMetrics::record_receive_error(routing_key);
                tracing::error!(queue, error = %err, "Error receiving message");
                continue;
            }
        };

        counters.received.fetch_add(1, Ordering::Relaxed);
        ConsumerMetrics::record_received(routing_key);

        match Envelope::decode(routing_key, delivery, clock.now()) {
            Ok(envelope) => {
                tracing::debug!(
                    queue,
                    message_id = envelope.message_id.as_deref().unwrap_or("-"),
                    received_at = %envelope.received_at,
                    "Message received"
                );
                if tx.send(envelope).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                counters.undecodable.fetch_add(1, Ordering::Relaxed);
                ConsumerMetrics::record_decode_error(routing_key);
                tracing::error!(queue, error = %err, "Dropping undecodable message");
            }
        }
    }

    tracing::debug!(queue, "Delivery stream ended");
}

/// Run handlers one message at a time until every forwarder is gone.
async fn dispatch(
    mut rx: mpsc::Receiver<Envelope>,
    registry: Arc<HandlerRegistry>,
    counters: Arc<Counters>,
    stopped: watch::Sender<bool>,
) {
    while let Some(envelope) = rx.recv().await {
        let routing_key = envelope.routing_key;
        let message_id = envelope.message_id.as_deref().unwrap_or("-");
        let started = Instant::now();

        let outcome = AssertUnwindSafe(registry.dispatch(routing_key, &envelope.body))
            .catch_unwind()
            .await;
        ConsumerMetrics::record_handled(started.elapsed());

        match outcome {
            Ok(Ok(())) => {
                counters.dispatched.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(queue = routing_key.queue_name(), message_id, "Message processed");
            }
            Ok(Err(err)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                ConsumerMetrics::record_handler_error(routing_key);
                tracing::error!(
                    queue = routing_key.queue_name(),
                    message_id,
                    error = %err,
                    "Error processing message"
                );
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                ConsumerMetrics::record_handler_error(routing_key);
                tracing::error!(queue = routing_key.queue_name(), message_id, "Handler panicked");
            }
        }
    }

    stopped.send_replace(true);
}
