//! Publisher retry, validation and circuit breaking against the in-memory broker.

#![allow(clippy::unwrap_used, clippy::panic)]

use inventory_events_core::broker::{Broker, BrokerError, ExchangeKind, QueueOptions};
use inventory_events_core::envelope::JSON_CONTENT_TYPE;
use inventory_events_core::product::Product;
use inventory_events_core::routing::RoutingKey;
use inventory_events_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
use inventory_events_runtime::config::BrokerSettings;
use inventory_events_runtime::connection::ConnectionManager;
use inventory_events_runtime::publisher::{EventPublisher, PublishAttemptError, PublishError};
use inventory_events_runtime::retry::RetryPolicy;
use inventory_events_testing::{InMemoryBroker, init_tracing, test_clock};
use serde::ser::{Serialize, Serializer};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const EXCHANGE: &str = "inventory.events";

fn breaker(name: &str, threshold: usize) -> CircuitBreaker {
    CircuitBreaker::new(
        CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .reset_timeout(Duration::from_secs(60))
            .build(),
    )
    .named(name)
}

fn publisher(broker: &InMemoryBroker, max_attempts: usize, delay: Duration) -> EventPublisher {
    let connections = Arc::new(ConnectionManager::from_settings(
        Arc::new(broker.clone()),
        &BrokerSettings::default(),
        breaker("test-connection", 3),
    ));
    EventPublisher::new(
        connections,
        EXCHANGE,
        breaker("test-publish", 3),
        RetryPolicy::builder().max_attempts(max_attempts).delay(delay).build(),
    )
    .with_clock(Arc::new(test_clock()))
}

#[tokio::test]
async fn publishes_persistent_json_with_properties() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 3, Duration::from_millis(10));

    let receipt = publisher
        .publish(&Product::new(1, "widget"), RoutingKey::ProductCreated)
        .await
        .unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    let message = &published[0];
    assert_eq!(message.exchange, EXCHANGE);
    assert_eq!(message.routing_key, "product.created");
    assert!(message.message.persistent);
    assert_eq!(message.message.content_type, JSON_CONTENT_TYPE);
    assert_eq!(message.message.message_id, receipt.message_id);
    assert_eq!(message.message.timestamp, 1_735_689_600);
    assert_eq!(receipt.timestamp, 1_735_689_600);
    assert_eq!(receipt.attempts, 1);

    let body: serde_json::Value = serde_json::from_slice(&message.message.payload).unwrap();
    assert_eq!(body["id"], 1);
    assert_eq!(body["name"], "widget");

    assert_eq!(broker.exchange_kind(EXCHANGE), Some(ExchangeKind::Topic));
    // One channel per attempt, always closed
    assert_eq!(broker.channels_opened(), 1);
    assert_eq!(broker.channels_closed(), 1);
}

#[tokio::test]
async fn every_publish_gets_a_fresh_message_id() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 3, Duration::from_millis(10));

    for id in 0..5 {
        publisher
            .publish(&json!({ "id": id }), RoutingKey::ProductUpdated)
            .await
            .unwrap();
    }

    let ids: HashSet<String> = broker
        .published()
        .into_iter()
        .map(|message| message.message.message_id)
        .collect();
    assert_eq!(ids.len(), 5);
}

#[tokio::test]
async fn unknown_routing_key_touches_nothing() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 3, Duration::from_millis(10));

    let err = publisher
        .publish_with_key(&json!({"id": 1}), "product.archived")
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::InvalidRoutingKey(_)));
    assert_eq!(broker.connect_attempts(), 0);
    assert_eq!(broker.channels_opened(), 0);
    assert_eq!(broker.publish_attempts(), 0);
}

#[tokio::test]
async fn known_raw_key_is_accepted() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 3, Duration::from_millis(10));

    let receipt = publisher
        .publish_with_key(&json!({"id": 9}), "product.deleted")
        .await
        .unwrap();

    assert_eq!(receipt.routing_key, RoutingKey::ProductDeleted);
    assert_eq!(broker.published()[0].routing_key, "product.deleted");
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let broker = InMemoryBroker::new();
    broker.fail_next_publishes(2);
    let publisher = publisher(&broker, 3, Duration::from_millis(10));

    let receipt = publisher
        .publish(&json!({"id": 2}), RoutingKey::ProductCreated)
        .await
        .unwrap();

    assert_eq!(receipt.attempts, 3);
    assert_eq!(broker.publish_attempts(), 3);
    assert_eq!(broker.published().len(), 1);
    assert_eq!(broker.channels_opened(), 3);
    assert_eq!(broker.channels_closed(), 3);
}

#[tokio::test]
async fn retry_budget_is_exact_and_wraps_last_cause() {
    let broker = InMemoryBroker::new();
    broker.fail_next_publishes(10);
    let publisher = EventPublisher::new(
        Arc::new(ConnectionManager::from_settings(
            Arc::new(broker.clone()),
            &BrokerSettings::default(),
            breaker("test-connection", 3),
        )),
        EXCHANGE,
        // High threshold so the publisher's breaker stays closed
        breaker("test-publish", 100),
        RetryPolicy::builder().max_attempts(4).delay(Duration::from_millis(20)).build(),
    );
    let started = Instant::now();

    let err = publisher
        .publish(&json!({"id": 3}), RoutingKey::ProductUpdated)
        .await
        .unwrap_err();

    match err {
        PublishError::Failed {
            routing_key,
            attempts,
            source: PublishAttemptError::Broker(cause),
        } => {
            assert_eq!(routing_key, RoutingKey::ProductUpdated);
            assert_eq!(attempts, 4);
            assert!(cause.to_string().contains("publish refused"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.publish_attempts(), 4);
    // Three pauses between four attempts
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn channel_open_failures_are_retried() {
    let broker = InMemoryBroker::new();
    broker.fail_next_channel_opens(1);
    let publisher = publisher(&broker, 3, Duration::from_millis(10));

    let receipt = publisher
        .publish(&json!({"id": 4}), RoutingKey::ProductDeleted)
        .await
        .unwrap();

    assert_eq!(receipt.attempts, 2);
    assert_eq!(broker.channels_opened(), 1);
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn channel_open_failures_exhaust_the_budget() {
    let broker = InMemoryBroker::new();
    broker.fail_next_channel_opens(3);
    let publisher = publisher(&broker, 3, Duration::from_millis(10));

    let err = publisher
        .publish(&json!({"id": 5}), RoutingKey::ProductCreated)
        .await
        .unwrap_err();

    match err {
        PublishError::Failed {
            attempts,
            source: PublishAttemptError::Broker(BrokerError::Channel(reason)),
            ..
        } => {
            assert_eq!(attempts, 3);
            assert!(reason.contains("channel open refused"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // One connection reused, nothing reached the exchange
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.channels_opened(), 0);
    assert_eq!(broker.publish_attempts(), 0);
}

#[tokio::test]
async fn open_publish_breaker_fails_fast_without_connecting() {
    let broker = InMemoryBroker::new();
    broker.fail_connects();
    let publisher = publisher(&broker, 3, Duration::from_millis(10));

    let first = publisher
        .publish(&json!({"id": 1, "name": "widget"}), RoutingKey::ProductCreated)
        .await
        .unwrap_err();
    assert!(matches!(
        first,
        PublishError::Failed {
            attempts: 3,
            source: PublishAttemptError::Connection(_),
            ..
        }
    ));
    assert_eq!(broker.connect_attempts(), 3);
    assert_eq!(publisher.breaker().state(), State::Open);

    let second = publisher
        .publish(&json!({"id": 1, "name": "widget"}), RoutingKey::ProductCreated)
        .await
        .unwrap_err();
    assert!(second.is_circuit_open());
    assert!(matches!(
        second,
        PublishError::Failed {
            source: PublishAttemptError::CircuitOpen,
            ..
        }
    ));
    assert_eq!(broker.connect_attempts(), 3);
}

struct Unserializable;

impl Serialize for Unserializable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("not representable"))
    }
}

#[tokio::test]
async fn serialization_failure_is_not_retried() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 3, Duration::from_millis(10));

    let err = publisher
        .publish(&Unserializable, RoutingKey::ProductCreated)
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Serialization(_)));
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test]
async fn published_message_waits_in_bound_queue() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker, 3, Duration::from_millis(10));

    // Declare the exchange through a first publish, then bind a queue by hand
    publisher.publish(&json!({"id": 0}), RoutingKey::ProductDeleted).await.unwrap();
    let connection = broker
        .connect(&BrokerSettings::default().connection_params())
        .await
        .ok()
        .unwrap();
    let channel = connection.open_channel().await.unwrap();
    channel.declare_queue("audit", QueueOptions::durable()).await.unwrap();
    channel.bind_queue("audit", EXCHANGE, "product.*").await.unwrap();

    publisher.publish(&json!({"id": 1}), RoutingKey::ProductDeleted).await.unwrap();

    assert_eq!(broker.queue_depth("audit"), 1);
}
