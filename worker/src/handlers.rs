//! Product event handlers that print each event to stdout.
//!
//! Every handler renders the message as a block:
//!
//! ```text
//! === Product Created Event ===
//! Timestamp: 2025-01-01 00:00:00
//! Product Data:
//! {
//!   "id": 1,
//!   "name": "widget"
//! }
//! ===========================
//! ```
//!
//! Bodies that are not JSON are printed as-is.

use chrono::{DateTime, Utc};
use inventory_events_core::environment::Clock;
use inventory_events_core::handler::{HandlerError, HandlerRegistry, MessageHandler, RegistryError};
use inventory_events_core::routing::RoutingKey;
use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

const RULE: &str = "===========================";

/// Prints product events for one routing key.
pub struct ProductEventHandler {
    routing_key: RoutingKey,
    clock: Arc<dyn Clock>,
}

impl ProductEventHandler {
    /// Create a handler for `routing_key`.
    #[must_use]
    pub fn new(routing_key: RoutingKey, clock: Arc<dyn Clock>) -> Self {
        Self { routing_key, clock }
    }

    /// Event title used in the printed header.
    #[must_use]
    pub const fn title(&self) -> &'static str {
        title(self.routing_key)
    }
}

impl MessageHandler for ProductEventHandler {
    fn routing_key(&self) -> RoutingKey {
        self.routing_key
    }

    fn handle<'a>(&'a self, message: &'a str) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            let title = self.title();
            tracing::info!(routing_key = %self.routing_key, "Processing {} event", title.to_lowercase());

            let (block, is_json) = render(title, message, self.clock.now());
            if !is_json {
                tracing::warn!(routing_key = %self.routing_key, "Message is not JSON, printing raw body");
            }
            println!("{block}");
            Ok(())
        })
    }
}

impl std::fmt::Debug for ProductEventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductEventHandler")
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}

/// A registry with a [`ProductEventHandler`] for every routing key.
///
/// # Errors
///
/// Never in practice; propagated from [`HandlerRegistryBuilder::build`](inventory_events_core::handler::HandlerRegistryBuilder::build).
pub fn registry(clock: &Arc<dyn Clock>) -> Result<HandlerRegistry, RegistryError> {
    RoutingKey::ALL
        .into_iter()
        .fold(HandlerRegistry::builder(), |builder, key| {
            builder.register(ProductEventHandler::new(key, Arc::clone(clock)))
        })
        .build()
}

const fn title(routing_key: RoutingKey) -> &'static str {
    match routing_key {
        RoutingKey::ProductCreated => "Product Created",
        RoutingKey::ProductUpdated => "Product Updated",
        RoutingKey::ProductDeleted => "Product Deleted",
    }
}

/// Render the printed block. The flag is `false` when the body was not JSON
/// and is printed raw.
fn render(title: &str, message: &str, now: DateTime<Utc>) -> (String, bool) {
    let mut block = format!("\n=== {title} Event ===\n");

    let pretty = serde_json::from_str::<serde_json::Value>(message)
        .and_then(|value| serde_json::to_string_pretty(&value));
    let is_json = pretty.is_ok();

    match pretty {
        Ok(json) => {
            let _ = writeln!(block, "Timestamp: {}", now.format("%Y-%m-%d %H:%M:%S"));
            let _ = writeln!(block, "Product Data:");
            let _ = writeln!(block, "{json}");
        }
        Err(_) => {
            let _ = writeln!(block, "{message}");
        }
    }
    let _ = writeln!(block, "{RULE}");

    (block, is_json)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use inventory_events_testing::test_clock;

    fn now() -> DateTime<Utc> {
        test_clock().now()
    }

    #[test]
    fn json_is_pretty_printed_with_timestamp() {
        let (block, is_json) = render("Product Created", r#"{"id":1,"name":"widget"}"#, now());

        assert!(is_json);
        assert!(block.starts_with("\n=== Product Created Event ===\n"));
        assert!(block.contains("Timestamp: 2025-01-01 00:00:00\n"));
        assert!(block.contains("Product Data:\n"));
        assert!(block.contains("  \"id\": 1,\n"));
        assert!(block.contains("  \"name\": \"widget\"\n"));
        assert!(block.ends_with("===========================\n"));
    }

    #[test]
    fn non_json_falls_back_to_raw_text() {
        let (block, is_json) = render("Product Deleted", "not json", now());

        assert!(!is_json);
        assert!(block.contains("not json\n"));
        assert!(!block.contains("Timestamp:"));
        assert!(block.ends_with("===========================\n"));
    }

    #[test]
    fn titles_follow_routing_keys() {
        assert_eq!(title(RoutingKey::ProductCreated), "Product Created");
        assert_eq!(title(RoutingKey::ProductUpdated), "Product Updated");
        assert_eq!(title(RoutingKey::ProductDeleted), "Product Deleted");
    }

    #[test]
    fn registry_covers_every_key() {
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        let registry = registry(&clock).unwrap();

        for key in RoutingKey::ALL {
            assert_eq!(registry.handler_for(key).routing_key(), key);
        }
    }

    #[tokio::test]
    async fn handlers_accept_any_body() {
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        let registry = registry(&clock).unwrap();

        tokio_test::assert_ok!(registry.dispatch(RoutingKey::ProductUpdated, r#"{"id":2}"#).await);
        tokio_test::assert_ok!(registry.dispatch(RoutingKey::ProductDeleted, "\u{1f4a5}").await);
    }
}
