//! # Inventory Events Testing
//!
//! Testing utilities for the inventory event pipeline.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: topic-exchange broker with fault injection
//! - [`RecordingHandler`] / [`RecordingHandlers`]: handlers that capture message bodies
//! - [`FixedClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use inventory_events_testing::{InMemoryBroker, RecordingHandlers};
//!
//! #[tokio::test]
//! async fn test_created_event_reaches_handler() {
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let handlers = RecordingHandlers::new();
//!
//!     let mut consumer = EventConsumer::new(connections, "inventory.events", ConsumerSettings::default());
//!     consumer.start_consuming(handlers.registry()).await?;
//!
//!     publisher.publish(&product, RoutingKey::ProductCreated).await?;
//!     assert!(handlers.created.wait_for(1, Duration::from_secs(1)).await);
//! }
//! ```

use chrono::{DateTime, Utc};
use inventory_events_core::environment::Clock;

/// In-memory broker
pub mod broker;

/// Recording message handlers
pub mod handlers;

/// Property-based testing utilities using proptest.
pub mod properties {
    use inventory_events_core::product::Product;
    use inventory_events_core::routing::RoutingKey;
    use proptest::prelude::*;

    /// Any routing key.
    pub fn routing_key() -> impl Strategy<Value = RoutingKey> {
        prop::sample::select(RoutingKey::ALL.to_vec())
    }

    /// Plausible products.
    pub fn product() -> impl Strategy<Value = Product> {
        (1..i64::MAX, "[A-Za-z0-9 ]{0,24}", ".{0,64}", 0.0..10_000.0f64, 0..10_000i32).prop_map(
            |(id, name, description, price, stock)| Product {
                id,
                name,
                description,
                price,
                stock,
            },
        )
    }
}

/// Test helpers and utilities.
pub mod helpers {
    /// Install a `tracing` subscriber that writes through the test harness.
    ///
    /// Honors `RUST_LOG`; safe to call from every test.
    pub fn init_tracing() {
        use tracing_subscriber::EnvFilter;

        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    }
}

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use inventory_events_testing::mocks::FixedClock;
    /// use inventory_events_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use broker::{Binding, InMemoryBroker, PublishedMessage, Subscription, topic_matches};
pub use handlers::{RecordingHandler, RecordingHandlers};
pub use helpers::init_tracing;
pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
        assert_eq!(time1.timestamp(), 1_735_689_600);
    }
}
