//! In-memory broker with topic-exchange semantics.
//!
//! Provides a fast, deterministic stand-in for RabbitMQ:
//! - exchanges, durable queues and bindings with `*` / `#` topic matching
//! - queues buffer messages until a consumer subscribes
//! - several consumers on one queue receive messages round-robin
//! - fault injection for connects, channel opens, declarations and publishes
//! - interaction counters and a log of everything published
//!
//! State is shared by every connection made from one [`InMemoryBroker`], so a
//! publisher and a consumer built on the same broker see each other's messages.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use futures::Stream;
use inventory_events_core::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ConnectionParams, ConsumeOptions, DeliveryStream,
    ExchangeKind, ExchangeOptions, QueueOptions,
};
use inventory_events_core::envelope::{Delivery, OutgoingMessage};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A message accepted by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Exchange it was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// The message as handed to the channel
    pub message: OutgoingMessage,
}

impl PublishedMessage {
    /// Body as UTF-8 text.
    #[must_use]
    pub fn body(&self) -> String {
        String::from_utf8_lossy(&self.message.payload).into_owned()
    }
}

/// A queue binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Bound queue
    pub queue: String,
    /// Source exchange
    pub exchange: String,
    /// Binding pattern
    pub pattern: String,
}

/// A consumer subscription as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Queue consumed from
    pub queue: String,
    /// Options the consumer asked for
    pub options: ConsumeOptions,
}

#[derive(Debug, Default)]
struct Faults {
    fail_all_connects: bool,
    failing_connects: usize,
    failing_channel_opens: usize,
    failing_publishes: usize,
    failing_queue_declares: usize,
    connect_delay: Option<Duration>,
}

struct Consumer {
    channel_id: u64,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

#[derive(Default)]
struct Queue {
    options: QueueOptions,
    buffered: VecDeque<Delivery>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

impl Queue {
    /// Hand `delivery` to the next live consumer, or buffer it.
    fn deliver(&mut self, delivery: Delivery) {
        self.consumers.retain(|consumer| !consumer.sender.is_closed());
        if self.consumers.is_empty() {
            self.buffered.push_back(delivery);
            return;
        }
        let index = self.next_consumer % self.consumers.len();
        self.next_consumer = self.next_consumer.wrapping_add(1);
        if let Err(mpsc::error::SendError(Ok(delivery))) = self.consumers[index].sender.send(Ok(delivery)) {
            self.buffered.push_back(delivery);
        }
    }
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct State {
    topology: Mutex<Topology>,
    faults: Mutex<Faults>,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<Subscription>>,
    connections: Mutex<Vec<Arc<AtomicBool>>>,
    connect_attempts: AtomicUsize,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    publish_attempts: AtomicUsize,
    next_channel_id: AtomicU64,
}

impl State {
    fn take_fault(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    fn route(&self, exchange: &str, delivery: &Delivery) -> Result<usize, BrokerError> {
        let mut topology = self.topology.lock().unwrap();
        let Some(kind) = topology.exchanges.get(exchange).copied() else {
            return Err(BrokerError::PublishFailed {
                routing_key: delivery.routing_key.clone(),
                reason: format!("no exchange '{exchange}'"),
            });
        };

        let mut targets: Vec<String> = topology
            .bindings
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .filter(|binding| match kind {
                ExchangeKind::Topic => topic_matches(&binding.pattern, &delivery.routing_key),
                ExchangeKind::Direct => binding.pattern == delivery.routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|binding| binding.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for queue in &targets {
            if let Some(queue) = topology.queues.get_mut(queue) {
                queue.deliver(delivery.clone());
            }
        }
        Ok(targets.len())
    }

    fn drop_consumers(&self, channel_id: u64) {
        let mut topology = self.topology.lock().unwrap();
        for queue in topology.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.channel_id != channel_id);
        }
    }
}

/// Whether a topic binding `pattern` matches `routing_key`.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || key.split_first().is_some_and(|(_, key_rest)| matches(pattern, key_rest))
            }
            (Some((&"*", rest)), Some((_, key_rest))) => matches(rest, key_rest),
            (Some((word, rest)), Some((key_word, key_rest))) => word == key_word && matches(rest, key_rest),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// In-memory broker for fast, deterministic testing.
///
/// # Example
///
/// ```
/// use inventory_events_testing::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// broker.fail_next_connects(2);
///
/// assert_eq!(broker.connect_attempts(), 0);
/// assert!(broker.published().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<State>,
}

impl InMemoryBroker {
    /// Create a new empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // Fault injection

    /// Make every connect attempt fail until [`heal`](Self::heal) is called.
    pub fn fail_connects(&self) {
        self.state.faults.lock().unwrap().fail_all_connects = true;
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.faults.lock().unwrap().failing_connects = count;
    }

    /// Make the next `count` channel opens fail.
    pub fn fail_next_channel_opens(&self, count: usize) {
        self.state.faults.lock().unwrap().failing_channel_opens = count;
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.faults.lock().unwrap().failing_publishes = count;
    }

    /// Make the next `count` queue declarations fail.
    pub fn fail_next_queue_declares(&self, count: usize) {
        self.state.faults.lock().unwrap().failing_queue_declares = count;
    }

    /// Delay every connect attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.faults.lock().unwrap().connect_delay = Some(delay);
    }

    /// Clear every injected fault.
    pub fn heal(&self) {
        *self.state.faults.lock().unwrap() = Faults::default();
    }

    /// Close every open connection, ending all consumer streams.
    pub fn drop_connections(&self) {
        for open in self.state.connections.lock().unwrap().drain(..) {
            open.store(false, Ordering::SeqCst);
        }
        let mut topology = self.state.topology.lock().unwrap();
        for queue in topology.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    // Direct access

    /// Route a raw delivery through `exchange` as if a client had published it.
    ///
    /// Returns the number of queues it reached.
    pub fn inject(&self, exchange: &str, delivery: Delivery) -> Result<usize, BrokerError> {
        self.state.route(exchange, &delivery)
    }

    // Inspection

    /// Connect attempts, failed ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Channels opened successfully.
    #[must_use]
    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }

    /// Channels closed.
    #[must_use]
    pub fn channels_closed(&self) -> usize {
        self.state.channels_closed.load(Ordering::SeqCst)
    }

    /// Publish calls, failed ones included.
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.state.publish_attempts.load(Ordering::SeqCst)
    }

    /// Every message accepted so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().unwrap().clone()
    }

    /// Open connections.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|open| open.load(Ordering::SeqCst))
            .count()
    }

    /// Kind of a declared exchange.
    #[must_use]
    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state.topology.lock().unwrap().exchanges.get(name).copied()
    }

    /// Options a queue was declared with.
    #[must_use]
    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state.topology.lock().unwrap().queues.get(name).map(|queue| queue.options)
    }

    /// Messages waiting in a queue for a consumer.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state
            .topology
            .lock()
            .unwrap()
            .queues
            .get(name)
            .map_or(0, |queue| queue.buffered.len())
    }

    /// Live consumers on a queue.
    #[must_use]
    pub fn consumer_count(&self, name: &str) -> usize {
        self.state
            .topology
            .lock()
            .unwrap()
            .queues
            .get(name)
            .map_or(0, |queue| queue.consumers.iter().filter(|c| !c.sender.is_closed()).count())
    }

    /// Every binding, in declaration order.
    #[must_use]
    pub fn bindings(&self) -> Vec<Binding> {
        self.state.topology.lock().unwrap().bindings.clone()
    }

    /// Every subscription ever made, in order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state.subscriptions.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("connect_attempts", &self.connect_attempts())
            .field("published", &self.state.published.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl Broker for InMemoryBroker {
    fn connect(&self, params: &ConnectionParams) -> BoxFuture<'_, Result<Arc<dyn BrokerConnection>, BrokerError>> {
        let host = params.host.clone();
        let port = params.port;
        Box::pin(async move {
            self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

            let (fail, delay) = {
                let mut faults = self.state.faults.lock().unwrap();
                let fail = faults.fail_all_connects || State::take_fault(&mut faults.failing_connects);
                (fail, faults.connect_delay)
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return Err(BrokerError::ConnectionFailed(format!("connection refused by {host}:{port}")));
            }

            let open = Arc::new(AtomicBool::new(true));
            self.state.connections.lock().unwrap().push(Arc::clone(&open));
            let connection: Arc<dyn BrokerConnection> = Arc::new(InMemoryConnection {
                state: Arc::clone(&self.state),
                open,
            });
            Ok(connection)
        })
    }
}

/// Connection handed out by [`InMemoryBroker`].
struct InMemoryConnection {
    state: Arc<State>,
    open: Arc<AtomicBool>,
}

impl BrokerConnection for InMemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn open_channel(&self) -> BoxFuture<'_, Result<Box<dyn BrokerChannel>, BrokerError>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(BrokerError::ConnectionClosed);
            }
            if State::take_fault(&mut self.state.faults.lock().unwrap().failing_channel_opens) {
                return Err(BrokerError::Channel("channel open refused".to_string()));
            }

            self.state.channels_opened.fetch_add(1, Ordering::SeqCst);
            let channel: Box<dyn BrokerChannel> = Box::new(InMemoryChannel {
                id: self.state.next_channel_id.fetch_add(1, Ordering::SeqCst),
                state: Arc::clone(&self.state),
                connection_open: Arc::clone(&self.open),
                open: AtomicBool::new(true),
            });
            Ok(channel)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Channel handed out by [`InMemoryConnection`].
struct InMemoryChannel {
    id: u64,
    state: Arc<State>,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("channel is closed".to_string()));
        }
        Ok(())
    }
}

impl BrokerChannel for InMemoryChannel {
    fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeOptions,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        let name = name.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            let mut topology = self.state.topology.lock().unwrap();
            match topology.exchanges.get(&name) {
                Some(existing) if *existing != kind => Err(BrokerError::Topology {
                    name,
                    reason: format!("exchange already declared as {existing:?}"),
                }),
                Some(_) => Ok(()),
                None => {
                    topology.exchanges.insert(name, kind);
                    Ok(())
                }
            }
        })
    }

    fn declare_queue(&self, name: &str, options: QueueOptions) -> BoxFuture<'_, Result<(), BrokerError>> {
        let name = name.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            if State::take_fault(&mut self.state.faults.lock().unwrap().failing_queue_declares) {
                return Err(BrokerError::Topology {
                    name,
                    reason: "queue declaration refused".to_string(),
                });
            }
            let mut topology = self.state.topology.lock().unwrap();
            match topology.queues.get(&name) {
                Some(existing) if existing.options != options => Err(BrokerError::Topology {
                    name,
                    reason: "queue already declared with different options".to_string(),
                }),
                Some(_) => Ok(()),
                None => {
                    topology.queues.insert(
                        name,
                        Queue {
                            options,
                            ..Queue::default()
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BoxFuture<'_, Result<(), BrokerError>> {
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: routing_key.to_string(),
        };
        Box::pin(async move {
            self.ensure_open()?;
            let mut topology = self.state.topology.lock().unwrap();
            if !topology.queues.contains_key(&binding.queue) {
                return Err(BrokerError::Topology {
                    name: binding.queue,
                    reason: "no such queue".to_string(),
                });
            }
            if !topology.exchanges.contains_key(&binding.exchange) {
                return Err(BrokerError::Topology {
                    name: binding.exchange,
                    reason: "no such exchange".to_string(),
                });
            }
            if !topology.bindings.contains(&binding) {
                topology.bindings.push(binding);
            }
            Ok(())
        })
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        Box::pin(async move {
            self.state.publish_attempts.fetch_add(1, Ordering::SeqCst);
            self.ensure_open()?;
            if State::take_fault(&mut self.state.faults.lock().unwrap().failing_publishes) {
                return Err(BrokerError::PublishFailed {
                    routing_key,
                    reason: "publish refused".to_string(),
                });
            }

            let delivery = Delivery {
                routing_key: routing_key.clone(),
                payload: message.payload.clone(),
                message_id: Some(message.message_id.clone()),
                timestamp: Some(message.timestamp),
                content_type: Some(message.content_type.clone()),
                redelivered: false,
            };
            self.state.route(&exchange, &delivery)?;

            self.state.published.lock().unwrap().push(PublishedMessage {
                exchange,
                routing_key,
                message,
            });
            Ok(())
        })
    }

    fn consume(&self, queue: &str, options: ConsumeOptions) -> BoxFuture<'_, Result<DeliveryStream, BrokerError>> {
        let queue = queue.to_string();
        Box::pin(async move {
            self.ensure_open()?;
            let (sender, receiver) = mpsc::unbounded_channel();
            {
                let mut topology = self.state.topology.lock().unwrap();
                let Some(state) = topology.queues.get_mut(&queue) else {
                    return Err(BrokerError::ConsumeFailed {
                        queue,
                        reason: "no such queue".to_string(),
                    });
                };
                for delivery in state.buffered.drain(..) {
                    let _ = sender.send(Ok(delivery));
                }
                state.consumers.push(Consumer {
                    channel_id: self.id,
                    sender,
                });
            }
            self.state.subscriptions.lock().unwrap().push(Subscription { queue, options });
            Ok(delivery_stream(receiver))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if self.open.swap(false, Ordering::SeqCst) {
                self.state.channels_closed.fetch_add(1, Ordering::SeqCst);
                self.state.drop_consumers(self.id);
            }
            Ok(())
        })
    }
}

fn delivery_stream(
    mut receiver: mpsc::UnboundedReceiver<Result<Delivery, BrokerError>>,
) -> DeliveryStream {
    let stream = async_stream::stream! {
        while let Some(item) = receiver.recv().await {
            yield item;
        }
    };
    Box::pin(stream) as Pin<Box<dyn Stream<Item = _> + Send>>
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn delivery(routing_key: &str, body: &str) -> Delivery {
        Delivery {
            routing_key: routing_key.to_string(),
            payload: body.as_bytes().to_vec(),
            message_id: None,
            timestamp: None,
            content_type: None,
            redelivered: false,
        }
    }

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: "memory".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            connection_name: "test".to_string(),
            automatic_recovery: true,
            recovery_interval: Duration::from_secs(10),
        }
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("product.created", "product.created"));
        assert!(!topic_matches("product.created", "product.updated"));
        assert!(topic_matches("product.*", "product.deleted"));
        assert!(!topic_matches("product.*", "product.deleted.soft"));
        assert!(topic_matches("product.#", "product.deleted.soft"));
        assert!(topic_matches("product.#", "product"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "order.created"));
        assert!(!topic_matches("*.created", "created"));
    }

    #[tokio::test]
    async fn buffered_messages_reach_late_consumer() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect(&params()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();

        channel
            .declare_exchange("events", ExchangeKind::Topic, ExchangeOptions::durable())
            .await
            .unwrap();
        channel.declare_queue("all", QueueOptions::durable()).await.unwrap();
        channel.bind_queue("all", "events", "product.#").await.unwrap();

        assert_eq!(broker.inject("events", delivery("product.created", "one")).unwrap(), 1);
        assert_eq!(broker.inject("events", delivery("order.created", "two")).unwrap(), 0);
        assert_eq!(broker.queue_depth("all"), 1);

        let options = ConsumeOptions {
            consumer_tag: "t".to_string(),
            auto_ack: true,
        };
        let mut stream = channel.consume("all", options).await.unwrap();
        let received = stream.next().await.unwrap().unwrap();

        assert_eq!(received.payload, b"one".to_vec());
        assert_eq!(broker.queue_depth("all"), 0);
    }

    #[tokio::test]
    async fn closing_channel_ends_stream() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect(&params()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel.declare_queue("q", QueueOptions::durable()).await.unwrap();

        let options = ConsumeOptions {
            consumer_tag: "t".to_string(),
            auto_ack: true,
        };
        let mut stream = channel.consume("q", options).await.unwrap();
        assert_eq!(broker.consumer_count("q"), 1);

        channel.close().await.unwrap();

        assert!(stream.next().await.is_none());
        assert_eq!(broker.channels_closed(), 1);
    }

    #[tokio::test]
    async fn injected_connect_faults_are_consumed() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);

        assert!(broker.connect(&params()).await.is_err());
        assert!(broker.connect(&params()).await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn dropped_connection_rejects_channels() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect(&params()).await.unwrap();

        broker.drop_connections();

        assert!(!connection.is_open());
        assert!(matches!(
            connection.open_channel().await,
            Err(BrokerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn publish_to_missing_exchange_fails() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect(&params()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();

        let message = OutgoingMessage {
            payload: b"{}".to_vec(),
            content_type: "application/json".to_string(),
            message_id: "m".to_string(),
            timestamp: 0,
            persistent: true,
        };
        let result = channel.publish("missing", "product.created", message).await;

        assert!(matches!(result, Err(BrokerError::PublishFailed { .. })));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn direct_and_fanout_exchanges_route_by_kind() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect(&params()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();

        channel
            .declare_exchange("exact", ExchangeKind::Direct, ExchangeOptions::durable())
            .await
            .unwrap();
        channel
            .declare_exchange("broadcast", ExchangeKind::Fanout, ExchangeOptions::durable())
            .await
            .unwrap();
        for queue in ["wild", "created", "audit-a", "audit-b"] {
            channel.declare_queue(queue, QueueOptions::durable()).await.unwrap();
        }
        channel.bind_queue("wild", "exact", "product.*").await.unwrap();
        channel.bind_queue("created", "exact", "product.created").await.unwrap();
        channel.bind_queue("audit-a", "broadcast", "ignored").await.unwrap();
        channel.bind_queue("audit-b", "broadcast", "").await.unwrap();

        // Direct bindings compare literally, so wildcards never match
        assert_eq!(broker.inject("exact", delivery("product.created", "one")).unwrap(), 1);
        assert_eq!(broker.queue_depth("created"), 1);
        assert_eq!(broker.queue_depth("wild"), 0);

        assert_eq!(broker.inject("broadcast", delivery("product.deleted", "two")).unwrap(), 2);
        assert_eq!(broker.queue_depth("audit-a"), 1);
        assert_eq!(broker.queue_depth("audit-b"), 1);
        assert_eq!(broker.exchange_kind("broadcast"), Some(ExchangeKind::Fanout));
    }
}
