//! Connection manager behavior against the in-memory broker.

#![allow(clippy::unwrap_used, clippy::panic)]

use inventory_events_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
use inventory_events_runtime::config::BrokerSettings;
use inventory_events_runtime::connection::{ConnectionError, ConnectionManager};
use inventory_events_testing::InMemoryBroker;
use std::sync::Arc;
use std::time::Duration;

fn manager(broker: &InMemoryBroker, threshold: usize, reset_timeout: Duration) -> ConnectionManager {
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .reset_timeout(reset_timeout)
            .build(),
    )
    .named("test-connection");
    ConnectionManager::from_settings(Arc::new(broker.clone()), &BrokerSettings::default(), breaker)
}

#[tokio::test]
async fn reuses_open_connection() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, 3, Duration::from_secs(30));

    let first = manager.connection().await.unwrap();
    let second = manager.connection().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(broker.connect_attempts(), 1);
    assert!(manager.is_connected().await);
}

#[tokio::test]
async fn reconnects_after_connection_drops() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, 3, Duration::from_secs(30));

    let first = manager.connection().await.unwrap();
    broker.drop_connections();
    assert!(!manager.is_connected().await);

    let second = manager.connection().await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.is_open());
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test]
async fn connect_failure_carries_host_and_cause() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(1);
    let manager = manager(&broker, 3, Duration::from_secs(30));

    let err = manager.connection().await.err().unwrap();

    match err {
        ConnectionError::Connect { host, port, source } => {
            assert_eq!(host, "localhost");
            assert_eq!(port, 5672);
            assert!(source.to_string().contains("connection refused"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn open_breaker_stops_connect_attempts() {
    let broker = InMemoryBroker::new();
    broker.fail_connects();
    let manager = manager(&broker, 3, Duration::from_secs(60));

    for _ in 0..3 {
        assert!(matches!(
            manager.connection().await,
            Err(ConnectionError::Connect { .. })
        ));
    }
    assert_eq!(manager.breaker().state(), State::Open);

    for _ in 0..5 {
        let err = manager.connection().await.err().unwrap();
        assert!(err.is_circuit_open());
    }
    assert_eq!(broker.connect_attempts(), 3);
}

#[tokio::test]
async fn recovers_after_reset_timeout() {
    let broker = InMemoryBroker::new();
    broker.fail_connects();
    let manager = manager(&broker, 2, Duration::from_millis(50));

    for _ in 0..2 {
        let _ = manager.connection().await;
    }
    assert_eq!(manager.breaker().state(), State::Open);

    broker.heal();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(manager.connection().await.is_ok());
    assert_eq!(manager.breaker().state(), State::Closed);
    assert_eq!(manager.breaker().failure_count(), 0);
}

#[tokio::test]
async fn concurrent_callers_share_one_connect() {
    let broker = InMemoryBroker::new();
    broker.set_connect_delay(Duration::from_millis(30));
    let manager = Arc::new(manager(&broker, 3, Duration::from_secs(30)));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connection().await.map(|_| ()) })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn close_forgets_connection() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, 3, Duration::from_secs(30));

    let connection = manager.connection().await.unwrap();
    manager.close().await.unwrap();

    assert!(!connection.is_open());
    assert!(!manager.is_connected().await);
    // Closing twice is fine
    manager.close().await.unwrap();
}
