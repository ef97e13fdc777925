//! Message handlers and the registry that routes decoded messages to them.
//!
//! A [`MessageHandler`] owns one routing key (and therefore one queue). The
//! [`HandlerRegistry`] is built once at startup and must cover every
//! [`RoutingKey`]; a missing or duplicated handler is a configuration error reported
//! by [`HandlerRegistryBuilder::build`], before any message is consumed.
//!
//! # Example
//!
//! ```
//! use inventory_events_core::handler::{HandlerError, HandlerRegistry, MessageHandler};
//! use inventory_events_core::routing::{MessageAction, RoutingKey};
//! use std::future::Future;
//! use std::pin::Pin;
//!
//! struct LogHandler(RoutingKey);
//!
//! impl MessageHandler for LogHandler {
//!     fn routing_key(&self) -> RoutingKey {
//!         self.0
//!     }
//!
//!     fn handle<'a>(
//!         &'a self,
//!         message: &'a str,
//!     ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
//!         Box::pin(async move {
//!             println!("{}: {message}", self.0);
//!             Ok(())
//!         })
//!     }
//! }
//!
//! let registry = HandlerRegistry::builder()
//!     .register(LogHandler(RoutingKey::ProductCreated))
//!     .register(LogHandler(RoutingKey::ProductUpdated))
//!     .register(LogHandler(RoutingKey::ProductDeleted))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(registry.resolve(MessageAction::Delete).routing_key(), RoutingKey::ProductDeleted);
//! ```

use crate::routing::{MessageAction, RoutingKey};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by handlers while processing a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The message body is not what the handler expects
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Processing failed
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Errors building a [`HandlerRegistry`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No handler was registered for a routing key
    #[error("No handler registered for routing key '{0}'")]
    MissingHandler(RoutingKey),

    /// Two handlers claim the same routing key
    #[error("More than one handler registered for routing key '{0}'")]
    DuplicateHandler(RoutingKey),
}

/// A handler for the messages of one routing key.
pub trait MessageHandler: Send + Sync {
    /// The routing key this handler consumes.
    fn routing_key(&self) -> RoutingKey;

    /// Queue this handler reads from.
    fn queue_name(&self) -> &'static str {
        self.routing_key().queue_name()
    }

    /// Process one decoded message body.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] when the message cannot be processed. The consumer
    /// logs it and moves on; the message is not redelivered.
    fn handle<'a>(
        &'a self,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

/// Total mapping from routing key to handler.
#[derive(Clone)]
pub struct HandlerRegistry {
    /// Indexed by [`RoutingKey::index`]
    handlers: [Arc<dyn MessageHandler>; 3],
}

impl HandlerRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// The handler responsible for `action`.
    #[must_use]
    pub fn resolve(&self, action: MessageAction) -> &Arc<dyn MessageHandler> {
        self.handler_for(RoutingKey::from(action))
    }

    /// The handler bound to `routing_key`.
    #[must_use]
    pub fn handler_for(&self, routing_key: RoutingKey) -> &Arc<dyn MessageHandler> {
        &self.handlers[routing_key.index()]
    }

    /// Routing keys served by this registry (all of them).
    pub fn routing_keys(&self) -> impl Iterator<Item = RoutingKey> + '_ {
        self.handlers.iter().map(|handler| handler.routing_key())
    }

    /// Route a decoded message body to its handler.
    ///
    /// # Errors
    ///
    /// Propagates the handler's [`HandlerError`].
    pub async fn dispatch(&self, routing_key: RoutingKey, message: &str) -> Result<(), HandlerError> {
        self.handler_for(routing_key).handle(message).await
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routing_keys", &self.routing_keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register a handler.
    #[must_use]
    pub fn register<H>(mut self, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Register a shared handler.
    #[must_use]
    pub fn register_arc(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Validate and build the registry.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateHandler`] if a routing key is claimed twice
    /// - [`RegistryError::MissingHandler`] if a routing key has no handler
    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        let mut slots: [Option<Arc<dyn MessageHandler>>; 3] = [None, None, None];

        for handler in self.handlers {
            let key = handler.routing_key();
            let slot = &mut slots[key.index()];
            if slot.is_some() {
                return Err(RegistryError::DuplicateHandler(key));
            }
            *slot = Some(handler);
        }

        let [created, updated, deleted] = slots;
        Ok(HandlerRegistry {
            handlers: [
                created.ok_or(RegistryError::MissingHandler(RoutingKey::ProductCreated))?,
                updated.ok_or(RegistryError::MissingHandler(RoutingKey::ProductUpdated))?,
                deleted.ok_or(RegistryError::MissingHandler(RoutingKey::ProductDeleted))?,
            ],
        })
    }
}
