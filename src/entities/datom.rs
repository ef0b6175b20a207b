//! Datoms: single facts or retractions about an entity attribute

use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute naming the record kind of an entity
pub const KIND_ATTR: &str = "db/Kind";

/// Attribute holding the fully qualified `{feed}:{entity}` id
pub const ID_ATTR: &str = "db/ID";

/// Attribute holding the fingerprint of the feed that wrote the entity
pub const FEED_ID_ATTR: &str = "db/FeedID";

/// Attributes derived on apply rather than written by users
pub fn is_system_attribute(attribute: &str) -> bool {
    attribute == ID_ATTR || attribute == FEED_ID_ATTR
}

/// Scalar value of a datom
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{}", i),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// A fact (`added = true`) or its retraction (`added = false`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datom {
    /// Entity id, scoped to the feed carrying the datom
    pub entity_id: String,
    pub attribute: String,
    pub value: Value,
    pub added: bool,
}

impl Datom {
    pub fn assert(entity_id: impl Into<String>, attribute: impl Into<String>, value: Value) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute: attribute.into(),
            value,
            added: true,
        }
    }

    pub fn retract(entity_id: impl Into<String>, attribute: impl Into<String>, value: Value) -> Self {
        Self {
            entity_id: entity_id.into(),
            attribute: attribute.into(),
            value,
            added: false,
        }
    }
}
