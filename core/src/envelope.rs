//! Message envelopes exchanged with the broker.
//!
//! - [`OutgoingMessage`]: what the publisher hands to a broker channel. Built once per
//!   publish attempt with a fresh message id and timestamp.
//! - [`Delivery`]: a raw message as it comes off a queue.
//! - [`Envelope`]: a delivery whose body was decoded as UTF-8, ready for dispatch.
//!
//! Payloads are canonical JSON (`serde_json`) encoded as UTF-8. Timestamps on the
//! wire are Unix seconds, matching the AMQP `timestamp` property.

use crate::routing::RoutingKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::string::FromUtf8Error;
use thiserror::Error;

/// Content type attached to every published message.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors building or decoding envelopes.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The payload could not be serialized to JSON
    #[error("Failed to serialize payload: {0}")]
    Serialization(#[source] serde_json::Error),

    /// The delivery body is not valid UTF-8
    #[error("Message on '{routing_key}' is not valid UTF-8: {source}")]
    InvalidUtf8 {
        /// Queue the delivery came from
        routing_key: RoutingKey,
        /// Decoder error
        #[source]
        source: FromUtf8Error,
    },

    /// The body is not valid JSON for the requested type
    #[error("Failed to deserialize payload: {0}")]
    Deserialization(#[source] serde_json::Error),
}

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// UTF-8 JSON body
    pub payload: Vec<u8>,
    /// MIME type of the payload
    pub content_type: String,
    /// Unique id for this publish attempt
    pub message_id: String,
    /// Unix seconds at which the message was built
    pub timestamp: u64,
    /// Ask the broker to persist the message (delivery mode 2)
    pub persistent: bool,
}

impl OutgoingMessage {
    /// Serialize `message` to JSON and wrap it with delivery properties.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Serialization`] if `message` cannot be encoded.
    pub fn json<T>(
        message: &T,
        message_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message).map_err(EnvelopeError::Serialization)?;
        Ok(Self {
            payload,
            content_type: JSON_CONTENT_TYPE.to_string(),
            message_id: message_id.into(),
            timestamp: unix_seconds(timestamp),
            persistent: true,
        })
    }
}

/// A raw message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Routing key the message was published with
    pub routing_key: String,
    /// Raw body
    pub payload: Vec<u8>,
    /// Message id property, if set by the publisher
    pub message_id: Option<String>,
    /// Timestamp property (Unix seconds), if set by the publisher
    pub timestamp: Option<u64>,
    /// Content type property, if set by the publisher
    pub content_type: Option<String>,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
}

/// A decoded delivery handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Routing key of the queue the message arrived on
    pub routing_key: RoutingKey,
    /// UTF-8 decoded body
    pub body: String,
    /// Publisher-assigned message id
    pub message_id: Option<String>,
    /// Publish time, when the publisher set one
    pub published_at: Option<DateTime<Utc>>,
    /// When this process received the message
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    /// Decode a delivery taken from the queue bound to `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidUtf8`] if the body is not UTF-8.
    pub fn decode(
        routing_key: RoutingKey,
        delivery: Delivery,
        received_at: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        let body = String::from_utf8(delivery.payload)
            .map_err(|source| EnvelopeError::InvalidUtf8 { routing_key, source })?;

        let published_at = delivery
            .timestamp
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        Ok(Self {
            routing_key,
            body,
            message_id: delivery.message_id,
            published_at,
            received_at,
        })
    }

    /// Deserialize the JSON body into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Deserialization`] if the body does not match `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_str(&self.body).map_err(EnvelopeError::Deserialization)
    }
}

/// Unix seconds for `time`, clamped at the epoch.
#[must_use]
pub fn unix_seconds(time: DateTime<Utc>) -> u64 {
    u64::try_from(time.timestamp()).unwrap_or(0)
}
