//! # Inventory Events Core
//!
//! Types shared by every part of the inventory event pipeline.
//!
//! The inventory service announces product lifecycle changes on a durable AMQP topic
//! exchange. This crate defines the vocabulary both sides agree on, without any
//! broker client or runtime:
//!
//! - [`routing`]: the closed set of routing keys and the actions they map to
//! - [`envelope`]: outgoing messages, raw deliveries and decoded envelopes
//! - [`broker`]: the object-safe broker port implemented by adapters
//! - [`handler`]: message handlers and the total [`HandlerRegistry`]
//! - [`product`]: the product payload
//! - [`environment`]: injectable clock
//!
//! ## Data Flow
//!
//! ```text
//! publish:  command handler ──► EventPublisher ──► BrokerChannel::publish
//! consume:  BrokerChannel::consume ──► EventConsumer ──► HandlerRegistry ──► MessageHandler
//! ```
//!
//! The publisher and consumer live in `inventory-events-runtime`.

pub mod broker;
pub mod envelope;
pub mod handler;
pub mod product;
pub mod routing;

// Re-export commonly used types
pub use broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, ConnectionParams};
pub use chrono::{DateTime, Utc};
pub use envelope::{Delivery, Envelope, EnvelopeError, OutgoingMessage};
pub use handler::{HandlerError, HandlerRegistry, MessageHandler, RegistryError};
pub use product::Product;
pub use routing::{MessageAction, RoutingKey, RoutingKeyError};

/// Environment module - injectable dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The publisher stamps messages and the consumer stamps receipts through a
    /// `Clock`, so tests can pin both to a known instant.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
