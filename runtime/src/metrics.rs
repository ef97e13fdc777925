//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the event pipeline:
//! - Publisher attempts, outcomes and latency
//! - Consumer receipts, decode failures and handler failures
//! - Circuit breaker state and call outcomes, labelled by breaker name
//! - Retry attempts
//!
//! Recorders are free functions over the global `metrics` recorder, so they are
//! no-ops until [`MetricsServer::start`] installs the Prometheus exporter.
//!
//! # Example
//!
//! ```rust,no_run
//! use inventory_events_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::State;
use inventory_events_core::routing::RoutingKey;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
#[derive(Debug, Clone, Copy)]
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// The address scraped by Prometheus.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Install the Prometheus recorder and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or a recorder is already installed.
    pub fn start(&self) -> Result<(), MetricsError> {
        register_metrics();

        builder()?
            .with_http_listener(self.addr)
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }
}

/// Install the Prometheus recorder without an HTTP listener and return a handle
/// for rendering.
///
/// # Errors
///
/// Returns error if the exporter cannot be built or a recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    register_metrics();
    builder()?
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))
}

fn builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        // Configure histogram buckets for latency measurements
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Register all metric descriptions.
fn register_metrics() {
    // Publisher Metrics
    describe_counter!(
        "publisher_messages_published_total",
        "Total number of messages accepted by the broker"
    );
    describe_counter!(
        "publisher_publish_errors_total",
        "Total number of publishes that failed after all attempts"
    );
    describe_histogram!(
        "publisher_publish_duration_seconds",
        "Time taken to publish a message, retries included"
    );

    // Consumer Metrics
    describe_counter!(
        "consumer_messages_received_total",
        "Total number of deliveries received"
    );
    describe_counter!(
        "consumer_decode_errors_total",
        "Total number of deliveries dropped because the body was not UTF-8"
    );
    describe_counter!(
        "consumer_receive_errors_total",
        "Total number of errors reported by delivery streams"
    );
    describe_counter!(
        "consumer_handler_errors_total",
        "Total number of messages whose handler failed"
    );
    describe_histogram!(
        "consumer_handler_duration_seconds",
        "Time taken by handlers to process a message"
    );

    // Circuit Breaker Metrics
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_calls_total",
        "Total number of calls through circuit breaker"
    );
    describe_counter!(
        "circuit_breaker_successes_total",
        "Total number of successful calls"
    );
    describe_counter!(
        "circuit_breaker_failures_total",
        "Total number of failed calls"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Total number of rejected calls (circuit open)"
    );

    // Retry Metrics
    describe_counter!("retry_attempts_total", "Total number of attempts made");
    describe_counter!(
        "retry_successes_total",
        "Total number of operations that succeeded after a retry"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that used up every attempt"
    );
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a message accepted by the broker.
    pub fn record_publish(routing_key: RoutingKey, duration: Duration) {
        counter!("publisher_messages_published_total", "routing_key" => routing_key.as_str()).increment(1);
        histogram!("publisher_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a publish that failed after every attempt.
    pub fn record_publish_error(routing_key: RoutingKey) {
        counter!("publisher_publish_errors_total", "routing_key" => routing_key.as_str()).increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a delivery.
    pub fn record_received(routing_key: RoutingKey) {
        counter!("consumer_messages_received_total", "routing_key" => routing_key.as_str()).increment(1);
    }

    /// Record a delivery whose body could not be decoded.
    pub fn record_decode_error(routing_key: RoutingKey) {
        counter!("consumer_decode_errors_total", "routing_key" => routing_key.as_str()).increment(1);
    }

    /// Record an error reported by a delivery stream.
    pub fn record_receive_error(routing_key: RoutingKey) {
        counter!("consumer_receive_errors_total", "routing_key" => routing_key.as_str()).increment(1);
    }

    /// Record a handler run.
    pub fn record_handled(duration: Duration) {
        histogram!("consumer_handler_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a handler failure.
    pub fn record_handler_error(routing_key: RoutingKey) {
        counter!("consumer_handler_errors_total", "routing_key" => routing_key.as_str()).increment(1);
    }
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record circuit breaker state.
    ///
    /// 0 = Closed, 1 = `HalfOpen`, 2 = Open
    pub fn record_state(breaker: &str, state: State) {
        gauge!("circuit_breaker_state", "breaker" => breaker.to_string()).set(state.as_gauge());
    }

    /// Record a call attempt.
    pub fn record_call(breaker: &str) {
        counter!("circuit_breaker_calls_total", "breaker" => breaker.to_string()).increment(1);
    }

    /// Record a successful call.
    pub fn record_success(breaker: &str) {
        counter!("circuit_breaker_successes_total", "breaker" => breaker.to_string()).increment(1);
    }

    /// Record a failed call.
    pub fn record_failure(breaker: &str) {
        counter!("circuit_breaker_failures_total", "breaker" => breaker.to_string()).increment(1);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection(breaker: &str) {
        counter!("circuit_breaker_rejections_total", "breaker" => breaker.to_string()).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record an attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a success that needed at least one retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}
