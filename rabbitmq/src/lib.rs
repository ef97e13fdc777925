//! RabbitMQ broker adapter for inventory events.
//!
//! This crate implements the broker port from `inventory-events-core`
//! ([`Broker`], [`BrokerConnection`], [`BrokerChannel`]) on top of
//! [`lapin`], an AMQP 0-9-1 client.
//!
//! # Mapping
//!
//! | Port operation     | AMQP                                                 |
//! |--------------------|------------------------------------------------------|
//! | `connect`          | `Connection::connect_uri` with a named connection    |
//! | `open_channel`     | `channel.open`                                       |
//! | `declare_exchange` | `exchange.declare`                                   |
//! | `declare_queue`    | `queue.declare`                                      |
//! | `bind_queue`       | `queue.bind`                                         |
//! | `publish`          | `basic.publish` with message id, timestamp, content type and delivery mode |
//! | `consume`          | `basic.consume`, `no_ack` set from `auto_ack`        |
//!
//! # Delivery Semantics
//!
//! Publishing is fire-and-forget: the channel is not in confirm mode, so a
//! successful publish means the frame was written, not that a queue holds it.
//! Consumers are expected to subscribe with auto-ack.
//!
//! # Recovery
//!
//! lapin does not re-establish dropped connections. A dropped connection
//! reports `is_open() == false`, its delivery streams end, and the
//! `ConnectionManager` in `inventory-events-runtime` opens a new one on the
//! next request.
//!
//! # Example
//!
//! ```no_run
//! use inventory_events_core::broker::Broker;
//! use inventory_events_rabbitmq::RabbitMqBroker;
//! # use inventory_events_core::broker::ConnectionParams;
//!
//! # async fn example(params: ConnectionParams) -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RabbitMqBroker::new();
//! let connection = broker.connect(&params).await?;
//! let channel = connection.open_channel().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::StreamExt;
use inventory_events_core::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ConnectionParams, ConsumeOptions, DeliveryStream,
    ExchangeKind, ExchangeOptions, QueueOptions,
};
use inventory_events_core::envelope::{Delivery, OutgoingMessage};
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Delivery mode that asks the broker to write the message to disk.
const PERSISTENT: u8 = 2;

/// Delivery mode for messages kept in memory only.
const TRANSIENT: u8 = 1;

/// Connection factory for a RabbitMQ server.
///
/// Stateless: every [`connect`](Broker::connect) opens a new AMQP connection.
/// Share the result through a `ConnectionManager` rather than calling this
/// per operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RabbitMqBroker;

impl RabbitMqBroker {
    /// Create a broker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Broker for RabbitMqBroker {
    fn connect(&self, params: &ConnectionParams) -> BoxFuture<'_, Result<Arc<dyn BrokerConnection>, BrokerError>> {
        let uri = amqp_uri(params);
        let properties = ConnectionProperties::default().with_connection_name(params.connection_name.clone().into());
        let host = params.host.clone();
        let port = params.port;
        let connection_name = params.connection_name.clone();
        let automatic_recovery = params.automatic_recovery;

        Box::pin(async move {
            let connection = Connection::connect_uri(uri, properties).await.map_err(|e| {
                tracing::debug!(%host, port, error = %e, "AMQP connect failed");
                BrokerError::ConnectionFailed(e.to_string())
            })?;

            tracing::info!(
                %host,
                port,
                connection_name = %connection_name,
                automatic_recovery,
                "Connected to RabbitMQ"
            );

            let connection: Arc<dyn BrokerConnection> = Arc::new(RabbitMqConnection { connection });
            Ok(connection)
        })
    }
}

/// An open AMQP connection.
pub struct RabbitMqConnection {
    connection: Connection,
}

impl BrokerConnection for RabbitMqConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    fn open_channel(&self) -> BoxFuture<'_, Result<Box<dyn BrokerChannel>, BrokerError>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(BrokerError::ConnectionClosed);
            }
            let channel = self
                .connection
                .create_channel()
                .await
                .map_err(|e| BrokerError::Channel(e.to_string()))?;

            tracing::trace!(channel_id = channel.id(), "Channel opened");
            let channel: Box<dyn BrokerChannel> = Box::new(RabbitMqChannel { channel });
            Ok(channel)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if !self.is_open() {
                return Ok(());
            }
            self.connection
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to close connection: {e}")))
        })
    }
}

impl std::fmt::Debug for RabbitMqConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqConnection")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// An AMQP channel.
pub struct RabbitMqChannel {
    channel: Channel,
}

impl BrokerChannel for RabbitMqChannel {
    fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        let name = name.to_string();
        Box::pin(async move {
            self.channel
                .exchange_declare(
                    &name,
                    exchange_kind(kind),
                    ExchangeDeclareOptions {
                        durable: options.durable,
                        auto_delete: options.auto_delete,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Topology {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(exchange = %name, ?kind, durable = options.durable, "Exchange declared");
            Ok(())
        })
    }

    fn declare_queue(&self, name: &str, options: QueueOptions) -> BoxFuture<'_, Result<(), BrokerError>> {
        let name = name.to_string();
        Box::pin(async move {
            let queue = self
                .channel
                .queue_declare(
                    &name,
                    QueueDeclareOptions {
                        durable: options.durable,
                        exclusive: options.exclusive,
                        auto_delete: options.auto_delete,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Topology {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(
                queue = %name,
                durable = options.durable,
                messages = queue.message_count(),
                consumers = queue.consumer_count(),
                "Queue declared"
            );
            Ok(())
        })
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BoxFuture<'_, Result<(), BrokerError>> {
        let queue = queue.to_string();
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        Box::pin(async move {
            self.channel
                .queue_bind(
                    &queue,
                    &exchange,
                    &routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Topology {
                    name: queue.clone(),
                    reason: format!("Failed to bind to '{exchange}' with '{routing_key}': {e}"),
                })?;

            tracing::debug!(%queue, %exchange, %routing_key, "Queue bound");
            Ok(())
        })
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        Box::pin(async move {
            let properties = publish_properties(&message);
            let publish_failed = |e: lapin::Error| BrokerError::PublishFailed {
                routing_key: routing_key.clone(),
                reason: e.to_string(),
            };

            let confirm = self
                .channel
                .basic_publish(
                    &exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &message.payload,
                    properties,
                )
                .await
                .map_err(publish_failed)?;
            // Resolves immediately unless the channel is in confirm mode
            confirm.await.map_err(publish_failed)?;

            tracing::trace!(
                %exchange,
                %routing_key,
                message_id = %message.message_id,
                bytes = message.payload.len(),
                "Frame published"
            );
            Ok(())
        })
    }

    fn consume(&self, queue: &str, options: ConsumeOptions) -> BoxFuture<'_, Result<DeliveryStream, BrokerError>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let mut consumer = self
                .channel
                .basic_consume(
                    &queue,
                    &options.consumer_tag,
                    BasicConsumeOptions {
                        no_ack: options.auto_ack,
                        ..BasicConsumeOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::ConsumeFailed {
                    queue: queue.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(%queue, consumer_tag = %options.consumer_tag, auto_ack = options.auto_ack, "Consumer registered");

            let stream = async_stream::stream! {
                while let Some(next) = consumer.next().await {
                    match next {
                        Ok(delivery) => yield Ok(into_delivery(delivery)),
                        Err(e) => yield Err(BrokerError::ConsumeFailed {
                            queue: queue.clone(),
                            reason: e.to_string(),
                        }),
                    }
                }
                tracing::debug!(%queue, "Consumer stream ended");
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if !self.channel.status().connected() {
                return Ok(());
            }
            self.channel
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|e| BrokerError::Channel(format!("Failed to close channel: {e}")))
        })
    }
}

impl std::fmt::Debug for RabbitMqChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqChannel")
            .field("id", &self.channel.id())
            .finish_non_exhaustive()
    }
}

/// Build the AMQP URI for `params`.
fn amqp_uri(params: &ConnectionParams) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: params.username.clone(),
                password: params.password.clone(),
            },
            host: params.host.clone(),
            port: params.port,
        },
        vhost: params.virtual_host.clone(),
        ..AMQPUri::default()
    }
}

const fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

/// AMQP properties for an outgoing message.
fn publish_properties(message: &OutgoingMessage) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(message.content_type.clone().into())
        .with_message_id(message.message_id.clone().into())
        .with_timestamp(message.timestamp)
        .with_delivery_mode(if message.persistent { PERSISTENT } else { TRANSIENT })
}

/// Convert a lapin delivery into the port's delivery.
fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    from_parts(
        delivery.routing_key.as_str(),
        delivery.redelivered,
        &delivery.properties,
        delivery.data,
    )
}

fn from_parts(routing_key: &str, redelivered: bool, properties: &BasicProperties, payload: Vec<u8>) -> Delivery {
    Delivery {
        routing_key: routing_key.to_string(),
        payload,
        message_id: properties.message_id().as_ref().map(|id| id.as_str().to_string()),
        timestamp: *properties.timestamp(),
        content_type: properties.content_type().as_ref().map(|ct| ct.as_str().to_string()),
        redelivered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: "rabbit.internal".to_string(),
            port: 5673,
            virtual_host: "/".to_string(),
            username: "inventory".to_string(),
            password: "s3cret".to_string(),
            connection_name: "inventory-worker".to_string(),
            automatic_recovery: true,
            recovery_interval: Duration::from_secs(10),
        }
    }

    #[test]
    fn uri_carries_every_connection_field() {
        let uri = amqp_uri(&params());

        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "inventory");
        assert_eq!(uri.authority.userinfo.password, "s3cret");
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn exchange_kinds_map_one_to_one() {
        assert_eq!(exchange_kind(ExchangeKind::Topic), lapin::ExchangeKind::Topic);
        assert_eq!(exchange_kind(ExchangeKind::Direct), lapin::ExchangeKind::Direct);
        assert_eq!(exchange_kind(ExchangeKind::Fanout), lapin::ExchangeKind::Fanout);
    }

    #[test]
    fn persistent_message_properties() {
        let message = OutgoingMessage {
            payload: br#"{"id":1}"#.to_vec(),
            content_type: "application/json".to_string(),
            message_id: "abc".to_string(),
            timestamp: 1_735_689_600,
            persistent: true,
        };

        let properties = publish_properties(&message);

        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT));
        assert_eq!(properties.message_id().as_ref().map(|id| id.as_str()), Some("abc"));
        assert_eq!(*properties.timestamp(), Some(1_735_689_600));
        assert_eq!(
            properties.content_type().as_ref().map(|ct| ct.as_str()),
            Some("application/json")
        );
    }

    #[test]
    fn transient_message_properties() {
        let message = OutgoingMessage {
            payload: Vec::new(),
            content_type: "text/plain".to_string(),
            message_id: "x".to_string(),
            timestamp: 0,
            persistent: false,
        };

        assert_eq!(*publish_properties(&message).delivery_mode(), Some(TRANSIENT));
    }

    #[test]
    fn delivery_keeps_properties() {
        let properties = BasicProperties::default()
            .with_message_id("m-1".into())
            .with_timestamp(42);

        let delivery = from_parts("product.updated", true, &properties, b"{}".to_vec());

        assert_eq!(delivery.routing_key, "product.updated");
        assert_eq!(delivery.message_id.as_deref(), Some("m-1"));
        assert_eq!(delivery.timestamp, Some(42));
        assert_eq!(delivery.content_type, None);
        assert!(delivery.redelivered);
        assert_eq!(delivery.payload, b"{}");
    }

    #[test]
    fn adapter_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<RabbitMqBroker>();
        assert_send_sync::<RabbitMqConnection>();
        assert_send_sync::<RabbitMqChannel>();
    }
}
