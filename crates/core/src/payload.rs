//! Explicit, serializable operation payloads.
//!
//! Handlers receive request data as a [`Payload`]: a map from field name to a
//! [`PayloadValue`]. Maps are ordered by key at every nesting level, so the
//! serialized form is canonical by construction. Idempotency keys hash that
//! canonical form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DomainError;

/// A single payload value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
}

impl PayloadValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PayloadValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PayloadValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            PayloadValue::Null => JsonValue::Null,
            PayloadValue::Bool(v) => JsonValue::Bool(*v),
            PayloadValue::Integer(v) => JsonValue::from(*v),
            // Non-finite floats have no JSON form.
            PayloadValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            PayloadValue::Text(v) => JsonValue::String(v.clone()),
            PayloadValue::List(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
            PayloadValue::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<JsonValue> for PayloadValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => PayloadValue::Null,
            JsonValue::Bool(v) => PayloadValue::Bool(v),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => PayloadValue::Integer(i),
                None => n.as_f64().map(PayloadValue::Float).unwrap_or(PayloadValue::Null),
            },
            JsonValue::String(s) => PayloadValue::Text(s),
            JsonValue::Array(items) => {
                PayloadValue::List(items.into_iter().map(PayloadValue::from).collect())
            }
            JsonValue::Object(map) => PayloadValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, PayloadValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        PayloadValue::Bool(value)
    }
}

impl From<i32> for PayloadValue {
    fn from(value: i32) -> Self {
        PayloadValue::Integer(value.into())
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        PayloadValue::Integer(value)
    }
}

impl From<u32> for PayloadValue {
    fn from(value: u32) -> Self {
        PayloadValue::Integer(value.into())
    }
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        PayloadValue::Float(value)
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        PayloadValue::Text(value)
    }
}

impl From<Vec<PayloadValue>> for PayloadValue {
    fn from(value: Vec<PayloadValue>) -> Self {
        PayloadValue::List(value)
    }
}

impl From<Payload> for PayloadValue {
    fn from(value: Payload) -> Self {
        PayloadValue::Map(value.0)
    }
}

impl<T: Into<PayloadValue>> From<Option<T>> for PayloadValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(PayloadValue::Null)
    }
}

/// Top-level operation payload (always a map).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, PayloadValue>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(
        &mut self,
        field: impl Into<String>,
        value: impl Into<PayloadValue>,
    ) -> Option<PayloadValue> {
        self.0.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&PayloadValue> {
        self.0.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<PayloadValue> {
        self.0.remove(field)
    }

    pub fn contains_key(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PayloadValue)> {
        self.0.iter()
    }

    /// Copy of this payload without the given top-level fields.
    pub fn without<'a, I>(&self, fields: I) -> Payload
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut copy = self.clone();
        for field in fields {
            copy.0.remove(field);
        }
        copy
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Compact JSON with keys sorted at every level.
    pub fn canonical_json(&self) -> String {
        self.to_json().to_string()
    }
}

impl TryFrom<JsonValue> for Payload {
    type Error = DomainError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        match PayloadValue::from(value) {
            PayloadValue::Map(map) => Ok(Payload(map)),
            other => Err(DomainError::validation(format!(
                "payload must be a JSON object, got {}",
                other.to_json()
            ))),
        }
    }
}

impl From<Payload> for JsonValue {
    fn from(value: Payload) -> Self {
        value.to_json()
    }
}

impl FromIterator<(String, PayloadValue)> for Payload {
    fn from_iter<T: IntoIterator<Item = (String, PayloadValue)>>(iter: T) -> Self {
        Payload(iter.into_iter().collect())
    }
}
