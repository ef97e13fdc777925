//! Broker port: the narrow surface the publisher and consumer need from a message broker.
//!
//! The runtime never talks to AMQP directly. It drives three object-safe traits:
//!
//! ```text
//! ┌──────────┐ connect ┌──────────────────┐ open_channel ┌───────────────┐
//! │  Broker  │────────►│ BrokerConnection │─────────────►│ BrokerChannel │
//! └──────────┘         └──────────────────┘              └───────┬───────┘
//!                                                                │
//!                         declare_exchange / declare_queue / bind_queue
//!                         publish / consume (stream of deliveries)
//! ```
//!
//! # Ownership
//!
//! - A connection is long-lived and shared as `Arc<dyn BrokerConnection>`. Only the
//!   connection manager replaces or closes it.
//! - Channels are cheap and owned by whoever opened them. The publisher opens one per
//!   publish attempt; the consumer keeps one for its whole lifetime.
//!
//! # Implementations
//!
//! - `RabbitMqBroker` in `inventory-events-rabbitmq`: production, backed by `lapin`
//! - `InMemoryBroker` in `inventory-events-testing`: topic-exchange semantics with
//!   fault injection, for tests
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the traits
//! can be used as trait objects (`Arc<dyn Broker>`). Returned futures borrow only
//! `self`; implementations copy any `&str` arguments they need before the `async`
//! block.

use crate::envelope::{Delivery, OutgoingMessage};
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by broker implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Could not establish a connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection is no longer usable
    #[error("Connection closed")]
    ConnectionClosed,

    /// Opening or using a channel failed
    #[error("Channel error: {0}")]
    Channel(String),

    /// Declaring or binding an exchange/queue failed
    #[error("Topology declaration failed for '{name}': {reason}")]
    Topology {
        /// Exchange or queue name
        name: String,
        /// The reason for failure
        reason: String,
    },

    /// The broker rejected or dropped a publish
    #[error("Publish failed for routing key '{routing_key}': {reason}")]
    PublishFailed {
        /// Routing key of the message
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Starting or running a consumer failed
    #[error("Consume failed for queue '{queue}': {reason}")]
    ConsumeFailed {
        /// Queue name
        queue: String,
        /// The reason for failure
        reason: String,
    },
}

/// Everything needed to open a broker connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Broker host name
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Virtual host
    pub virtual_host: String,
    /// User name
    pub username: String,
    /// Password
    pub password: String,
    /// Name reported to the broker for this connection
    pub connection_name: String,
    /// Let the client re-establish dropped connections on its own
    pub automatic_recovery: bool,
    /// Delay between recovery attempts
    pub recovery_interval: Duration,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("connection_name", &self.connection_name)
            .field("automatic_recovery", &self.automatic_recovery)
            .field("recovery_interval", &self.recovery_interval)
            .finish()
    }
}

/// Exchange types used by this system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route by pattern match on the routing key
    Topic,
    /// Route by exact routing key
    Direct,
    /// Route to every bound queue
    Fanout,
}

/// Exchange declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeOptions {
    /// Survive broker restarts
    pub durable: bool,
    /// Delete when the last queue is unbound
    pub auto_delete: bool,
}

impl ExchangeOptions {
    /// Durable, never auto-deleted.
    #[must_use]
    pub const fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survive broker restarts
    pub durable: bool,
    /// Restrict to the declaring connection
    pub exclusive: bool,
    /// Delete when the last consumer goes away
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared, never auto-deleted.
    #[must_use]
    pub const fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Consumer subscription options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Consumer tag reported to the broker
    pub consumer_tag: String,
    /// Acknowledge each message as soon as it is delivered
    pub auto_ack: bool,
}

/// Stream of deliveries from one queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Connection factory for a broker.
pub trait Broker: Send + Sync {
    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the broker cannot be reached or
    /// rejects the credentials.
    fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BrokerConnection>, BrokerError>> + Send + '_>>;
}

/// A live broker connection.
pub trait BrokerConnection: Send + Sync {
    /// Whether the connection can still be used.
    fn is_open(&self) -> bool;

    /// Open a channel on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionClosed`] or [`BrokerError::Channel`].
    fn open_channel(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn BrokerChannel>, BrokerError>> + Send + '_>>;

    /// Close the connection and every channel on it.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the close handshake fails.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}

/// A channel: the unit on which topology, publishing and consuming happen.
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange. Idempotent for identical arguments.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Topology`] on failure.
    fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Declare a queue. Idempotent for identical arguments.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Topology`] on failure.
    fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Bind `queue` to `exchange` with a binding pattern.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Topology`] if either side does not exist.
    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Publish a message to an exchange.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker does not accept it.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Start consuming from a queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumeFailed`] if the subscription is refused.
    fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>>;

    /// Close the channel. Consumers on it stop receiving.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the close handshake fails.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}
