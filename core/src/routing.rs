//! Routing keys for product lifecycle events.
//!
//! Every event published by the inventory service carries exactly one routing key
//! from a closed set. The key doubles as the AMQP routing key on the topic exchange
//! and as the name of the durable queue a consumer binds for it.
//!
//! | Variant          | Token             | Action   |
//! |------------------|-------------------|----------|
//! | `ProductCreated` | `product.created` | `Create` |
//! | `ProductUpdated` | `product.updated` | `Update` |
//! | `ProductDeleted` | `product.deleted` | `Delete` |
//!
//! Conversions in both directions are exhaustive `match`es. Parsing an unknown
//! token is a [`RoutingKeyError`], never a silent default.
//!
//! # Example
//!
//! ```
//! use inventory_events_core::routing::{MessageAction, RoutingKey};
//!
//! let key: RoutingKey = "product.created".parse().unwrap();
//! assert_eq!(key, RoutingKey::ProductCreated);
//! assert_eq!(key.as_str(), "product.created");
//! assert_eq!(MessageAction::from(key), MessageAction::Create);
//!
//! assert!("product.archived".parse::<RoutingKey>().is_err());
//! ```

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Token for [`RoutingKey::ProductCreated`].
pub const PRODUCT_CREATED: &str = "product.created";
/// Token for [`RoutingKey::ProductUpdated`].
pub const PRODUCT_UPDATED: &str = "product.updated";
/// Token for [`RoutingKey::ProductDeleted`].
pub const PRODUCT_DELETED: &str = "product.deleted";

/// Errors decoding a routing key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingKeyError {
    /// The token is not one of the known routing keys
    #[error("Unknown routing key: '{0}'")]
    Unknown(String),
}

/// A product lifecycle routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoutingKey {
    /// A product was created
    ProductCreated,
    /// A product was updated
    ProductUpdated,
    /// A product was deleted
    ProductDeleted,
}

impl RoutingKey {
    /// Every routing key, in declaration order.
    pub const ALL: [Self; 3] = [Self::ProductCreated, Self::ProductUpdated, Self::ProductDeleted];

    /// The stable wire token for this key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProductCreated => PRODUCT_CREATED,
            Self::ProductUpdated => PRODUCT_UPDATED,
            Self::ProductDeleted => PRODUCT_DELETED,
        }
    }

    /// Name of the durable queue bound to this key.
    ///
    /// Queues are named after the routing key token.
    #[must_use]
    pub const fn queue_name(self) -> &'static str {
        self.as_str()
    }

    /// The handler action this key maps to.
    #[must_use]
    pub const fn action(self) -> MessageAction {
        match self {
            Self::ProductCreated => MessageAction::Create,
            Self::ProductUpdated => MessageAction::Update,
            Self::ProductDeleted => MessageAction::Delete,
        }
    }

    /// Position of this key in [`RoutingKey::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::ProductCreated => 0,
            Self::ProductUpdated => 1,
            Self::ProductDeleted => 2,
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingKey {
    type Err = RoutingKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            PRODUCT_CREATED => Ok(Self::ProductCreated),
            PRODUCT_UPDATED => Ok(Self::ProductUpdated),
            PRODUCT_DELETED => Ok(Self::ProductDeleted),
            other => Err(RoutingKeyError::Unknown(other.to_string())),
        }
    }
}

impl TryFrom<&str> for RoutingKey {
    type Error = RoutingKeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for RoutingKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoutingKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        token.parse().map_err(de::Error::custom)
    }
}

/// The kind of work a handler performs, derived from a routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageAction {
    /// Handle a newly created product
    Create,
    /// Handle an updated product
    Update,
    /// Handle a deleted product
    Delete,
}

impl From<RoutingKey> for MessageAction {
    fn from(key: RoutingKey) -> Self {
        key.action()
    }
}

impl From<MessageAction> for RoutingKey {
    fn from(action: MessageAction) -> Self {
        match action {
            MessageAction::Create => Self::ProductCreated,
            MessageAction::Update => Self::ProductUpdated,
            MessageAction::Delete => Self::ProductDeleted,
        }
    }
}

impl fmt::Display for MessageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}
