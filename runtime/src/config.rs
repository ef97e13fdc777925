//! Configuration for the publisher, consumer and worker host.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Unlike a silent fallback, a variable that is set but does not parse is an
//! error: a typo in `PUBLISH_MAX_RETRIES` should stop startup rather than run
//! with the default.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::host::HostSettings;
use crate::retry::RetryPolicy;
use inventory_events_core::broker::ConnectionParams;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Interval the client waits between automatic recovery attempts.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("Invalid value '{value}' for {var}")]
    Parse {
        /// Variable name
        var: String,
        /// Raw value
        value: String,
    },

    /// The configuration is syntactically valid but unusable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Messaging configuration loaded from environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Broker connection and exchange
    pub broker: BrokerSettings,
    /// Circuit breaker and publish retry
    pub resilience: ResilienceSettings,
    /// Consumer tuning
    pub consumer: ConsumerSettings,
    /// Worker host cooldowns
    pub host: HostConfig,
    /// Prometheus exporter address; no exporter when unset
    pub metrics_addr: Option<SocketAddr>,
}

/// Broker connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Broker host name
    pub host: String,
    /// AMQP port
    pub port: u16,
    /// Virtual host
    pub virtual_host: String,
    /// User name
    pub username: String,
    /// Password
    pub password: String,
    /// Topic exchange carrying inventory events
    pub exchange_name: String,
    /// Connection name shown in the broker's management UI
    pub connection_name: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            exchange_name: "inventory.events".to_string(),
            connection_name: "inventory-events".to_string(),
        }
    }
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("exchange_name", &self.exchange_name)
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

impl BrokerSettings {
    /// Connection parameters with automatic recovery enabled.
    #[must_use]
    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            host: self.host.clone(),
            port: self.port,
            virtual_host: self.virtual_host.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            connection_name: self.connection_name.clone(),
            automatic_recovery: true,
            recovery_interval: RECOVERY_INTERVAL,
        }
    }
}

/// Circuit breaker and retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilienceSettings {
    /// Failures before a breaker opens
    pub failure_threshold: usize,
    /// Seconds a breaker stays open
    pub reset_timeout_secs: u64,
    /// Publish attempts, including the first
    pub max_retries: usize,
    /// Pause between publish attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 2000,
        }
    }
}

impl ResilienceSettings {
    /// Breaker configuration for these settings.
    #[must_use]
    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.failure_threshold)
            .reset_timeout(Duration::from_secs(self.reset_timeout_secs))
            .build()
    }

    /// Publish retry policy for these settings.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_retries)
            .delay(Duration::from_millis(self.retry_delay_ms))
            .build()
    }
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Capacity of the channel between delivery streams and the dispatcher
    pub buffer_size: usize,
    /// Prefix for per-queue consumer tags
    pub consumer_tag_prefix: String,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            consumer_tag_prefix: "inventory-worker".to_string(),
        }
    }
}

/// Worker host cooldowns, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Wait after the circuit breaker rejected startup
    pub open_circuit_cooldown_secs: u64,
    /// Wait after any other startup failure
    pub failure_cooldown_secs: u64,
    /// How often a running consumer checks its connection
    pub health_check_interval_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            open_circuit_cooldown_secs: 30,
            failure_cooldown_secs: 5,
            health_check_interval_secs: RECOVERY_INTERVAL.as_secs(),
        }
    }
}

impl HostConfig {
    /// Host settings as durations.
    #[must_use]
    pub const fn settings(&self) -> HostSettings {
        HostSettings {
            open_circuit_cooldown: Duration::from_secs(self.open_circuit_cooldown_secs),
            failure_cooldown: Duration::from_secs(self.failure_cooldown_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
        }
    }
}

impl MessagingConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable does not parse or the result fails
    /// [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a value does not parse or the result fails
    /// [`validate`](Self::validate).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);

        let config = Self {
            broker: BrokerSettings {
                host: string("RABBITMQ_HOST", defaults.broker.host),
                port: parse(&lookup, "RABBITMQ_PORT", defaults.broker.port)?,
                virtual_host: string("RABBITMQ_VHOST", defaults.broker.virtual_host),
                username: string("RABBITMQ_USERNAME", defaults.broker.username),
                password: string("RABBITMQ_PASSWORD", defaults.broker.password),
                exchange_name: string("RABBITMQ_EXCHANGE", defaults.broker.exchange_name),
                connection_name: string("RABBITMQ_CONNECTION_NAME", defaults.broker.connection_name),
            },
            resilience: ResilienceSettings {
                failure_threshold: parse(
                    &lookup,
                    "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                    defaults.resilience.failure_threshold,
                )?,
                reset_timeout_secs: parse(
                    &lookup,
                    "CIRCUIT_BREAKER_RESET_TIMEOUT_SECS",
                    defaults.resilience.reset_timeout_secs,
                )?,
                max_retries: parse(&lookup, "PUBLISH_MAX_RETRIES", defaults.resilience.max_retries)?,
                retry_delay_ms: parse(&lookup, "PUBLISH_RETRY_DELAY_MS", defaults.resilience.retry_delay_ms)?,
            },
            consumer: ConsumerSettings {
                buffer_size: parse(&lookup, "CONSUMER_BUFFER_SIZE", defaults.consumer.buffer_size)?,
                consumer_tag_prefix: string("CONSUMER_TAG_PREFIX", defaults.consumer.consumer_tag_prefix),
            },
            host: HostConfig {
                open_circuit_cooldown_secs: parse(
                    &lookup,
                    "WORKER_OPEN_CIRCUIT_COOLDOWN_SECS",
                    defaults.host.open_circuit_cooldown_secs,
                )?,
                failure_cooldown_secs: parse(
                    &lookup,
                    "WORKER_FAILURE_COOLDOWN_SECS",
                    defaults.host.failure_cooldown_secs,
                )?,
                health_check_interval_secs: parse(
                    &lookup,
                    "WORKER_HEALTH_CHECK_INTERVAL_SECS",
                    defaults.host.health_check_interval_secs,
                )?,
            },
            metrics_addr: lookup("METRICS_ADDR")
                .map(|value| {
                    value.parse().map_err(|_| ConfigError::Parse {
                        var: "METRICS_ADDR".to_string(),
                        value,
                    })
                })
                .transpose()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.broker.host.trim().is_empty() {
            return invalid("broker host must not be empty");
        }
        if self.broker.port == 0 {
            return invalid("broker port must be non-zero");
        }
        if self.broker.exchange_name.trim().is_empty() {
            return invalid("exchange name must not be empty");
        }
        if self.resilience.failure_threshold == 0 {
            return invalid("circuit breaker failure threshold must be at least 1");
        }
        if self.resilience.max_retries == 0 {
            return invalid("publish max retries must be at least 1");
        }
        if self.consumer.buffer_size == 0 {
            return invalid("consumer buffer size must be at least 1");
        }
        if self.host.health_check_interval_secs == 0 {
            return invalid("worker health check interval must be at least 1 second");
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Parse {
            var: var.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = MessagingConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.broker.exchange_name, "inventory.events");
        assert_eq!(config.resilience, ResilienceSettings::default());
        assert_eq!(config.consumer.buffer_size, 256);
        assert_eq!(config.host.open_circuit_cooldown_secs, 30);
        assert_eq!(config.host.failure_cooldown_secs, 5);
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = MessagingConfig::from_lookup(lookup(&[
            ("RABBITMQ_HOST", "rabbit.internal"),
            ("RABBITMQ_PORT", "5673"),
            ("PUBLISH_MAX_RETRIES", "5"),
            ("PUBLISH_RETRY_DELAY_MS", "250"),
            ("METRICS_ADDR", "0.0.0.0:9464"),
        ]))
        .unwrap();

        assert_eq!(config.broker.host, "rabbit.internal");
        assert_eq!(config.broker.port, 5673);
        assert_eq!(
            config.resilience.retry_policy(),
            RetryPolicy::builder().max_attempts(5).delay(Duration::from_millis(250)).build()
        );
        assert_eq!(config.metrics_addr, Some("0.0.0.0:9464".parse().unwrap()));
    }

    #[test]
    fn unparseable_value_is_an_error() {
        let err = MessagingConfig::from_lookup(lookup(&[("RABBITMQ_PORT", "amqp")])).unwrap_err();

        assert_eq!(
            err,
            ConfigError::Parse {
                var: "RABBITMQ_PORT".to_string(),
                value: "amqp".to_string(),
            }
        );
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = MessagingConfig::from_lookup(lookup(&[("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn empty_exchange_is_rejected() {
        let mut config = MessagingConfig::default();
        config.broker.exchange_name = "  ".to_string();
        tokio_test::assert_err!(config.validate());
    }

    #[test]
    fn connection_params_enable_recovery() {
        let params = BrokerSettings::default().connection_params();

        assert!(params.automatic_recovery);
        assert_eq!(params.recovery_interval, Duration::from_secs(10));
        assert_eq!(params.virtual_host, "/");
    }

    #[test]
    fn debug_output_hides_password() {
        let settings = BrokerSettings {
            password: "s3cret".to_string(),
            ..BrokerSettings::default()
        };
        assert!(!format!("{settings:?}").contains("s3cret"));
    }
}
