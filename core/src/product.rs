//! Product payload carried by inventory events.

use serde::{Deserialize, Serialize};

/// A product as published on `product.*` routing keys.
///
/// The publisher sends the full product for `created`/`updated` events and at least
/// the id for `deleted` events, so every field except `id` is optional on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Database identifier
    pub id: i64,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Unit price
    #[serde(default)]
    pub price: f64,
    /// Units in stock
    #[serde(default)]
    pub stock: i32,
}

impl Product {
    /// Create a product with only an id and a name.
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            price: 0.0,
            stock: 0,
        }
    }
}
