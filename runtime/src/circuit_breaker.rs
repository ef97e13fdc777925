//! Circuit breaker pattern for preventing cascading failures.
//!
//! A circuit breaker monitors operations and "opens" (stops allowing requests) when
//! failures reach a threshold, so a broker that is known to be down is not hammered
//! with connection attempts.
//!
//! # States
//!
//! - **Closed**: Normal operation. Requests pass through. Failures are counted.
//! - **Open**: Threshold reached. Requests fail immediately until the reset timeout
//!   has elapsed since the last failure.
//! - **HalfOpen**: After the timeout, exactly one trial request is let through.
//!   Success closes the circuit and clears the failure count; failure reopens it.
//!
//! ```text
//! Closed ──(failures >= threshold)──► Open ──(elapsed > reset_timeout)──► HalfOpen
//!   ▲                                  ▲                                    │
//!   └───────────(trial succeeds)───────┼────────────────────────────────────┤
//!                                      └───────────(trial fails)────────────┘
//! ```
//!
//! Successes while Closed leave the failure count untouched; only a successful
//! trial resets it. While a trial is in flight other callers are rejected. There is
//! no jitter on the reset timeout.
//!
//! # Example
//!
//! ```rust
//! use inventory_events_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(3)
//!     .reset_timeout(Duration::from_secs(30))
//!     .build();
//!
//! let breaker = CircuitBreaker::new(config).named("rabbitmq-publish");
//!
//! match breaker.call(|| async {
//!     // Your fallible operation
//!     Ok::<_, String>(42)
//! }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::metrics::CircuitBreakerMetrics as BreakerRecorder;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: usize,
    /// How long the circuit stays Open after the last failure before a trial is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            reset_timeout: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    reset_timeout: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    ///
    /// Circuit opens once this many failures have been recorded.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the reset timeout.
    ///
    /// How long to wait in Open state before trying `HalfOpen`.
    #[must_use]
    pub const fn reset_timeout(mut self, duration: Duration) -> Self {
        self.reset_timeout = Some(duration);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            reset_timeout: self.reset_timeout.unwrap_or(defaults.reset_timeout),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl State {
    /// Gauge value exported for this state (0 = closed, 1 = half-open, 2 = open).
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected without running the operation
    #[error("Circuit breaker is open")]
    Open,
    /// Operation failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected by an open circuit.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Internal state of the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerState {
    state: State,
    failure_count: usize,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Circuit breaker for preventing cascading failures.
///
/// Cloning is cheap and clones share state, so one breaker per protected
/// dependency can be handed to every caller.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
    // Metrics
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            name: "default".to_string(),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState {
                state: State::Closed,
                failure_count: 0,
                last_failure_time: None,
                trial_in_flight: false,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Name the breaker for logs and metric labels.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The breaker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker's configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker.
    #[must_use]
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Failures recorded since the circuit last closed.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.lock().failure_count
    }

    /// Call an operation through the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open (the operation is
    /// not invoked). Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        BreakerRecorder::record_call(&self.name);

        let Some(admission) = self.try_acquire() else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            BreakerRecorder::record_rejection(&self.name);
            tracing::warn!(breaker = %self.name, "Circuit breaker is OPEN, rejecting request");
            return Err(CircuitBreakerError::Open);
        };

        let mut trial = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        match operation().await {
            Ok(result) => {
                trial.armed = false;
                self.on_success(admission);
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                BreakerRecorder::record_success(&self.name);
                Ok(result)
            }
            Err(err) => {
                trial.armed = false;
                self.on_failure(admission);
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                BreakerRecorder::record_failure(&self.name);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a call may run, moving Open -> `HalfOpen` when the timeout has passed.
    fn try_acquire(&self) -> Option<Admission> {
        let mut state = self.lock();

        match state.state {
            State::Closed => Some(Admission::Normal),
            State::Open => {
                let expired = state
                    .last_failure_time
                    .is_some_and(|last| last.elapsed() > self.config.reset_timeout);
                if !expired {
                    return None;
                }
                tracing::info!(breaker = %self.name, "Circuit breaker transitioning OPEN -> HALF_OPEN");
                state.state = State::HalfOpen;
                state.trial_in_flight = true;
                BreakerRecorder::record_state(&self.name, State::HalfOpen);
                Some(Admission::Trial)
            }
            State::HalfOpen => {
                if state.trial_in_flight {
                    None
                } else {
                    // A previous trial was abandoned before it finished
                    state.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            }
        }
    }

    /// Handle successful operation.
    fn on_success(&self, admission: Admission) {
        if admission == Admission::Normal {
            return;
        }

        let mut state = self.lock();
        tracing::info!(breaker = %self.name, "Circuit breaker transitioning HALF_OPEN -> CLOSED");
        state.state = State::Closed;
        state.failure_count = 0;
        state.last_failure_time = None;
        state.trial_in_flight = false;
        BreakerRecorder::record_state(&self.name, State::Closed);
    }

    /// Handle failed operation.
    fn on_failure(&self, admission: Admission) {
        let mut state = self.lock();
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        match admission {
            Admission::Trial => {
                tracing::warn!(
                    breaker = %self.name,
                    "Circuit breaker transitioning HALF_OPEN -> OPEN (recovery failed)"
                );
                state.state = State::Open;
                state.trial_in_flight = false;
                BreakerRecorder::record_state(&self.name, State::Open);
            }
            Admission::Normal => {
                if state.state == State::Closed && state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = state.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker transitioning CLOSED -> OPEN"
                    );
                    state.state = State::Open;
                    BreakerRecorder::record_state(&self.name, State::Open);
                }
            }
        }
    }

    /// Get circuit breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Reset the circuit breaker to closed state.
    ///
    /// Useful for testing or manual intervention.
    pub fn reset(&self) {
        let mut state = self.lock();
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset to CLOSED");
        state.state = State::Closed;
        state.failure_count = 0;
        state.last_failure_time = None;
        state.trial_in_flight = false;
        BreakerRecorder::record_state(&self.name, State::Closed);
    }
}

/// Releases the half-open trial slot if the trial future is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

/// Metrics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}
