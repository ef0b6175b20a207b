//! Record schemas
//!
//! Each storable record kind describes its fields once: name, value kind and
//! accessors. The entity store uses the descriptor to turn a record into
//! datoms and to rebuild a record from index entries.

use super::datom::Value;
use crate::error::EntityError;

/// How a field's index text is parsed back into a [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Bool,
}

impl FieldKind {
    pub fn parse(&self, raw: &str) -> Option<Value> {
        match self {
            FieldKind::Text => Some(Value::Text(raw.to_string())),
            FieldKind::Integer => raw.parse().ok().map(Value::Integer),
            FieldKind::Bool => raw.parse().ok().map(Value::Bool),
        }
    }
}

/// One named field of a record kind
pub struct Field<T> {
    pub name: &'static str,
    pub kind: FieldKind,
    pub get: fn(&T) -> Value,
    pub set: fn(&mut T, Value),
}

impl<T> Field<T> {
    pub fn new(name: &'static str, kind: FieldKind, get: fn(&T) -> Value, set: fn(&mut T, Value)) -> Self {
        Self { name, kind, get, set }
    }

    /// Namespaced attribute, e.g. `Bookmark/url`
    pub fn attribute(&self, record_kind: &str) -> String {
        format!("{}/{}", record_kind, self.name)
    }

    /// Parse `raw` index text and store it into `record`.
    pub fn decode_into(&self, record: &mut T, raw: &str) -> Result<(), EntityError> {
        let value = self.kind.parse(raw).ok_or_else(|| EntityError::TypeMismatch {
            field: self.name.to_string(),
            value: raw.to_string(),
        })?;
        (self.set)(record, value);
        Ok(())
    }
}

/// A record kind the entity store can hold
pub trait Record: Default + Sized {
    /// Value of the entity's `db/Kind` datom
    const KIND: &'static str;

    fn fields() -> Vec<Field<Self>>;
}

/// A record read back from the store together with its system attributes
#[derive(Debug, Clone, PartialEq)]
pub struct Entity<T> {
    /// Qualified `{feed}:{entity}` id
    pub id: String,
    /// Fingerprint of the feed that wrote the entity
    pub feed_id: String,
    pub record: T,
}

/// Text of a value for fields declared as [`FieldKind::Text`]
pub fn text(value: Value) -> String {
    match value {
        Value::Text(s) => s,
        other => other.to_string(),
    }
}

pub fn integer(value: Value) -> i64 {
    match value {
        Value::Integer(i) => i,
        Value::Bool(b) => b as i64,
        Value::Text(s) => s.parse().unwrap_or_default(),
    }
}

pub fn boolean(value: Value) -> bool {
    match value {
        Value::Bool(b) => b,
        Value::Integer(i) => i != 0,
        Value::Text(s) => s == "true",
    }
}
