//! Consumer topology, dispatch and shutdown against the in-memory broker.

#![allow(clippy::unwrap_used, clippy::panic)]

use inventory_events_core::broker::QueueOptions;
use inventory_events_core::envelope::Delivery;
use inventory_events_core::handler::HandlerError;
use inventory_events_core::routing::RoutingKey;
use inventory_events_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use inventory_events_runtime::config::{BrokerSettings, ConsumerSettings};
use inventory_events_runtime::connection::ConnectionManager;
use inventory_events_runtime::consumer::{ConsumeError, ConsumerStats, EventConsumer};
use inventory_events_testing::{Binding, InMemoryBroker, RecordingHandler, RecordingHandlers, init_tracing, test_clock};
use std::sync::Arc;
use std::time::Duration;

const EXCHANGE: &str = "inventory.events";
const WAIT: Duration = Duration::from_secs(2);

fn connections(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::builder()
            .failure_threshold(3)
            .reset_timeout(Duration::from_secs(60))
            .build(),
    )
    .named("test-connection");
    Arc::new(ConnectionManager::from_settings(
        Arc::new(broker.clone()),
        &BrokerSettings::default(),
        breaker,
    ))
}

fn consumer(broker: &InMemoryBroker) -> EventConsumer {
    EventConsumer::new(connections(broker), EXCHANGE, ConsumerSettings::default()).with_clock(Arc::new(test_clock()))
}

fn delivery(routing_key: RoutingKey, payload: &[u8]) -> Delivery {
    Delivery {
        routing_key: routing_key.as_str().to_string(),
        payload: payload.to_vec(),
        message_id: Some("msg-1".to_string()),
        timestamp: Some(1_735_689_600),
        content_type: Some("application/json".to_string()),
        redelivered: false,
    }
}

#[tokio::test]
async fn declares_durable_queues_bound_by_exact_token() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let handlers = RecordingHandlers::new();
    let mut consumer = consumer(&broker);

    consumer.start_consuming(handlers.registry()).await.unwrap();
    assert!(consumer.is_running());

    for key in RoutingKey::ALL {
        assert_eq!(broker.queue_options(key.queue_name()), Some(QueueOptions::durable()));
        assert_eq!(broker.consumer_count(key.queue_name()), 1);
    }

    let mut bindings = broker.bindings();
    bindings.sort_by(|a, b| a.queue.cmp(&b.queue));
    assert_eq!(
        bindings,
        vec![
            Binding {
                queue: "product.created".to_string(),
                exchange: EXCHANGE.to_string(),
                pattern: "product.created".to_string(),
            },
            Binding {
                queue: "product.deleted".to_string(),
                exchange: EXCHANGE.to_string(),
                pattern: "product.deleted".to_string(),
            },
            Binding {
                queue: "product.updated".to_string(),
                exchange: EXCHANGE.to_string(),
                pattern: "product.updated".to_string(),
            },
        ]
    );

    let subscriptions = broker.subscriptions();
    assert_eq!(subscriptions.len(), 3);
    for subscription in &subscriptions {
        assert!(subscription.options.auto_ack);
        assert_eq!(
            subscription.options.consumer_tag,
            format!("inventory-worker-{}", subscription.queue)
        );
    }

    consumer.shutdown().await;
}

#[tokio::test]
async fn each_message_reaches_only_its_handler() {
    let broker = InMemoryBroker::new();
    let handlers = RecordingHandlers::new();
    let mut consumer = consumer(&broker);
    consumer.start_consuming(handlers.registry()).await.unwrap();

    broker
        .inject(EXCHANGE, delivery(RoutingKey::ProductUpdated, br#"{"id":7}"#))
        .unwrap();
    broker
        .inject(EXCHANGE, delivery(RoutingKey::ProductDeleted, br#"{"id":8}"#))
        .unwrap();

    assert!(handlers.updated.wait_for(1, WAIT).await);
    assert!(handlers.deleted.wait_for(1, WAIT).await);
    assert_eq!(handlers.updated.messages(), vec![r#"{"id":7}"#.to_string()]);
    assert_eq!(handlers.deleted.messages(), vec![r#"{"id":8}"#.to_string()]);
    assert_eq!(handlers.created.count(), 0);

    consumer.shutdown().await;
    assert_eq!(
        consumer.stats(),
        ConsumerStats {
            received: 2,
            dispatched: 2,
            failed: 0,
            undecodable: 0,
        }
    );
}

#[tokio::test]
async fn messages_waiting_before_start_are_delivered() {
    let broker = InMemoryBroker::new();
    let handlers = RecordingHandlers::new();

    let mut first = consumer(&broker);
    first.start_consuming(handlers.registry()).await.unwrap();
    first.shutdown().await;

    // Queues survive the consumer; messages wait for the next one
    broker
        .inject(EXCHANGE, delivery(RoutingKey::ProductCreated, br#"{"id":1,"name":"widget"}"#))
        .unwrap();
    assert_eq!(broker.queue_depth("product.created"), 1);

    let mut second = consumer(&broker);
    second.start_consuming(handlers.registry()).await.unwrap();

    assert!(handlers.created.wait_for(1, WAIT).await);
    assert_eq!(handlers.created.messages(), vec![r#"{"id":1,"name":"widget"}"#.to_string()]);
    second.shutdown().await;
}

#[tokio::test]
async fn handler_failures_do_not_stop_the_loop() {
    let broker = InMemoryBroker::new();
    let handlers = RecordingHandlers::from_handlers(
        RecordingHandler::new(RoutingKey::ProductCreated).failing_on("bad"),
        RecordingHandler::new(RoutingKey::ProductUpdated).panicking(),
        RecordingHandler::new(RoutingKey::ProductDeleted).failing(HandlerError::Failed("gone".to_string())),
    );
    let mut consumer = consumer(&broker);
    consumer.start_consuming(handlers.registry()).await.unwrap();

    for body in ["bad", "good"] {
        broker
            .inject(EXCHANGE, delivery(RoutingKey::ProductCreated, body.as_bytes()))
            .unwrap();
    }
    broker
        .inject(EXCHANGE, delivery(RoutingKey::ProductUpdated, b"boom"))
        .unwrap();
    broker
        .inject(EXCHANGE, delivery(RoutingKey::ProductDeleted, b"{}"))
        .unwrap();
    // Still alive after the panic
    broker
        .inject(EXCHANGE, delivery(RoutingKey::ProductUpdated, b"again"))
        .unwrap();

    assert!(handlers.created.wait_for(2, WAIT).await);
    assert!(handlers.updated.wait_for(2, WAIT).await);
    assert!(handlers.deleted.wait_for(1, WAIT).await);
    assert!(consumer.is_running());

    consumer.shutdown().await;
    let stats = consumer.stats();
    assert_eq!(stats.received, 5);
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.failed, 4);
}

#[tokio::test]
async fn invalid_utf8_is_dropped_and_counted() {
    let broker = InMemoryBroker::new();
    let handlers = RecordingHandlers::new();
    let mut consumer = consumer(&broker);
    consumer.start_consuming(handlers.registry()).await.unwrap();

    broker
        .inject(EXCHANGE, delivery(RoutingKey::ProductCreated, &[0xff, 0xfe, 0x00]))
        .unwrap();
    broker
        .inject(EXCHANGE, delivery(RoutingKey::ProductCreated, b"ok"))
        .unwrap();

    assert!(handlers.created.wait_for(1, WAIT).await);
    consumer.shutdown().await;

    assert_eq!(handlers.created.messages(), vec!["ok".to_string()]);
    let stats = consumer.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.undecodable, 1);
    assert_eq!(stats.dispatched, 1);
}

#[tokio::test]
async fn second_start_is_rejected() {
    let broker = InMemoryBroker::new();
    let handlers = RecordingHandlers::new();
    let mut consumer = consumer(&broker);

    consumer.start_consuming(handlers.registry()).await.unwrap();
    let err = consumer.start_consuming(handlers.registry()).await.unwrap_err();

    assert!(matches!(err, ConsumeError::AlreadyStarted));
    assert_eq!(broker.subscriptions().len(), 3);
    consumer.shutdown().await;
}

#[tokio::test]
async fn open_connection_breaker_maps_to_circuit_open() {
    let broker = InMemoryBroker::new();
    broker.fail_connects();
    let connections = connections(&broker);

    for _ in 0..3 {
        let _ = connections.connection().await;
    }

    let mut consumer = EventConsumer::new(connections, EXCHANGE, ConsumerSettings::default());
    let err = consumer
        .start_consuming(RecordingHandlers::new().registry())
        .await
        .unwrap_err();

    assert!(err.is_circuit_open());
    assert_eq!(broker.connect_attempts(), 3);
    consumer.shutdown().await;
}

#[tokio::test]
async fn connect_failure_is_reported() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(1);
    let mut consumer = consumer(&broker);

    let err = consumer
        .start_consuming(RecordingHandlers::new().registry())
        .await
        .unwrap_err();

    assert!(matches!(err, ConsumeError::Connection(_)));
    assert!(!consumer.is_running());
}

#[tokio::test]
async fn shutdown_after_failed_setup_releases_channel() {
    let broker = InMemoryBroker::new();
    broker.fail_next_queue_declares(1);
    let mut consumer = consumer(&broker);

    let err = consumer
        .start_consuming(RecordingHandlers::new().registry())
        .await
        .unwrap_err();
    assert!(matches!(err, ConsumeError::Broker(_)));

    consumer.shutdown().await;
    consumer.shutdown().await;

    assert_eq!(broker.channels_opened(), 1);
    assert_eq!(broker.channels_closed(), 1);
    assert!(!consumer.is_running());
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let broker = InMemoryBroker::new();
    let mut consumer = consumer(&broker);
    consumer.start_consuming(RecordingHandlers::new().registry()).await.unwrap();

    consumer.shutdown().await;
    consumer.shutdown().await;

    assert!(!consumer.is_running());
    assert_eq!(broker.channels_closed(), 1);
    for key in RoutingKey::ALL {
        assert_eq!(broker.consumer_count(key.queue_name()), 0);
    }
}

#[tokio::test]
async fn shutdown_before_start_is_a_no_op() {
    let broker = InMemoryBroker::new();
    let mut consumer = consumer(&broker);

    consumer.shutdown().await;

    assert_eq!(broker.connect_attempts(), 0);
    // Never started, so already stopped
    consumer.stopped().await;
}

#[tokio::test]
async fn stopped_resolves_when_connection_drops() {
    let broker = InMemoryBroker::new();
    let mut consumer = consumer(&broker);
    consumer.start_consuming(RecordingHandlers::new().registry()).await.unwrap();

    broker.drop_connections();

    tokio::time::timeout(WAIT, consumer.stopped()).await.unwrap();
    assert!(!consumer.is_running());
    consumer.shutdown().await;
}
