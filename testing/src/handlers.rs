//! Message handlers that record what they receive.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::panic)] // `RecordingHandler::panicking` panics on purpose

use inventory_events_core::handler::{HandlerError, HandlerRegistry, MessageHandler};
use inventory_events_core::routing::RoutingKey;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// What a [`RecordingHandler`] does after recording a message.
#[derive(Debug, Clone, Default)]
enum Behavior {
    #[default]
    Succeed,
    Fail(HandlerError),
    FailOn(String),
    Panic,
}

/// Handler that records every message body it is given.
///
/// # Example
///
/// ```
/// use inventory_events_testing::RecordingHandler;
/// use inventory_events_core::routing::RoutingKey;
///
/// let handler = RecordingHandler::new(RoutingKey::ProductCreated);
/// assert!(handler.messages().is_empty());
/// ```
#[derive(Debug)]
pub struct RecordingHandler {
    routing_key: RoutingKey,
    behavior: Behavior,
    delay: Option<Duration>,
    messages: Mutex<Vec<String>>,
    notify: Notify,
}

impl RecordingHandler {
    /// A handler that accepts every message.
    #[must_use]
    pub fn new(routing_key: RoutingKey) -> Self {
        Self {
            routing_key,
            behavior: Behavior::Succeed,
            delay: None,
            messages: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Fail every message with `error` (after recording it).
    #[must_use]
    pub fn failing(mut self, error: HandlerError) -> Self {
        self.behavior = Behavior::Fail(error);
        self
    }

    /// Fail only messages whose body equals `body`.
    #[must_use]
    pub fn failing_on(mut self, body: impl Into<String>) -> Self {
        self.behavior = Behavior::FailOn(body.into());
        self
    }

    /// Panic on every message (after recording it).
    #[must_use]
    pub fn panicking(mut self) -> Self {
        self.behavior = Behavior::Panic;
        self
    }

    /// Sleep for `delay` before finishing each message.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Bodies received so far, in order.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    /// Number of bodies received so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Wait until at least `count` messages have been recorded.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

impl MessageHandler for RecordingHandler {
    fn routing_key(&self) -> RoutingKey {
        self.routing_key
    }

    fn handle<'a>(&'a self, message: &'a str) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.messages.lock().unwrap().push(message.to_string());
            self.notify.notify_waiters();

            match &self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail(error) => Err(error.clone()),
                Behavior::FailOn(body) if body == message => {
                    Err(HandlerError::Failed(format!("refused '{message}'")))
                }
                Behavior::FailOn(_) => Ok(()),
                Behavior::Panic => panic!("handler for {} panicked", self.routing_key),
            }
        })
    }
}

/// Recording handlers for all three routing keys, in [`RoutingKey::ALL`] order.
#[derive(Debug, Clone)]
pub struct RecordingHandlers {
    /// Handler for `product.created`
    pub created: Arc<RecordingHandler>,
    /// Handler for `product.updated`
    pub updated: Arc<RecordingHandler>,
    /// Handler for `product.deleted`
    pub deleted: Arc<RecordingHandler>,
}

impl RecordingHandlers {
    /// Three accepting handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::from_handlers(
            RecordingHandler::new(RoutingKey::ProductCreated),
            RecordingHandler::new(RoutingKey::ProductUpdated),
            RecordingHandler::new(RoutingKey::ProductDeleted),
        )
    }

    /// Wrap three handlers.
    #[must_use]
    pub fn from_handlers(created: RecordingHandler, updated: RecordingHandler, deleted: RecordingHandler) -> Self {
        Self {
            created: Arc::new(created),
            updated: Arc::new(updated),
            deleted: Arc::new(deleted),
        }
    }

    /// The handler for `routing_key`.
    #[must_use]
    pub fn get(&self, routing_key: RoutingKey) -> &Arc<RecordingHandler> {
        match routing_key {
            RoutingKey::ProductCreated => &self.created,
            RoutingKey::ProductUpdated => &self.updated,
            RoutingKey::ProductDeleted => &self.deleted,
        }
    }

    /// A registry over these handlers.
    #[must_use]
    pub fn registry(&self) -> Arc<HandlerRegistry> {
        let registry = HandlerRegistry::builder()
            .register_arc(Arc::clone(&self.created) as Arc<dyn MessageHandler>)
            .register_arc(Arc::clone(&self.updated) as Arc<dyn MessageHandler>)
            .register_arc(Arc::clone(&self.deleted) as Arc<dyn MessageHandler>)
            .build()
            .unwrap();
        Arc::new(registry)
    }

    /// Messages received across all handlers.
    #[must_use]
    pub fn total(&self) -> usize {
        self.created.count() + self.updated.count() + self.deleted.count()
    }
}

impl Default for RecordingHandlers {
    fn default() -> Self {
        Self::new()
    }
}
