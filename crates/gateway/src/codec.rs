//! Conversion between `serde` types and the store's item format.
//!
//! Values pass through `serde_json::Value`: strings become `S`, numbers `N`,
//! booleans `Bool`, `null` becomes `Null`, arrays `L` and objects `M`. On the
//! way back, `B`, `Ss` and `Ns` are also accepted (as byte arrays, string
//! arrays and number arrays).
//!
//! `serde_json` is built with `arbitrary_precision`, so an `N` string keeps
//! its exact digits through a `Value`; only the target type's own range
//! can narrow it.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Number, Value};

use crate::{
    error::{ClassifiedError, GatewayResult},
    types::{AttributeValue, Item},
};

/// Marshals `value` into an item. `value` must serialize to a JSON object.
///
/// # Errors
///
/// Returns a serialization error if `value` does not serialize to an object.
pub fn to_item<T: Serialize + ?Sized>(value: &T) -> GatewayResult<Item> {
    let json = serde_json::to_value(value)
        .map_err(|e| ClassifiedError::serialization(format!("(Marshal Item) {e}")))?;
    match json {
        Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (k, to_attribute(v))).collect()),
        other => Err(ClassifiedError::serialization(format!(
            "(Marshal Item) expected a struct or map, got {}",
            json_type(&other)
        ))),
    }
}

/// Marshals every value in `values`.
///
/// # Errors
///
/// Returns the first marshaling failure.
pub fn to_items<T: Serialize>(values: &[T]) -> GatewayResult<Vec<Item>> {
    values.iter().map(to_item).collect()
}

/// Unmarshals `item` into `T`.
///
/// # Errors
///
/// Returns a serialization error when the item does not fit `T`.
pub fn from_item<T: DeserializeOwned>(item: Item) -> GatewayResult<T> {
    let map: Map<String, Value> =
        item.into_iter().map(|(k, v)| from_attribute(v).map(|v| (k, v))).collect::<Result<_, _>>()?;
    serde_json::from_value(Value::Object(map))
        .map_err(|e| ClassifiedError::serialization(format!("(Unmarshal Result Item) {e}")))
}

/// Unmarshals every item in `items`.
///
/// # Errors
///
/// Returns the first unmarshaling failure.
pub fn from_items<T: DeserializeOwned>(items: Vec<Item>) -> GatewayResult<Vec<T>> {
    items.into_iter().map(from_item).collect()
}

fn to_attribute(value: Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null,
        Value::Bool(b) => AttributeValue::Bool(b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s),
        Value::Array(values) => AttributeValue::L(values.into_iter().map(to_attribute).collect()),
        Value::Object(map) => {
            AttributeValue::M(map.into_iter().map(|(k, v)| (k, to_attribute(v))).collect())
        },
    }
}

fn from_attribute(value: AttributeValue) -> GatewayResult<Value> {
    Ok(match value {
        AttributeValue::Null => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(b),
        AttributeValue::N(n) => Value::Number(parse_number(&n)?),
        AttributeValue::S(s) => Value::String(s),
        AttributeValue::B(bytes) => {
            Value::Array(bytes.iter().map(|b| Value::Number(Number::from(*b))).collect())
        },
        AttributeValue::L(values) => {
            Value::Array(values.into_iter().map(from_attribute).collect::<Result<_, _>>()?)
        },
        AttributeValue::M(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| from_attribute(v).map(|v| (k, v)))
                .collect::<Result<_, _>>()?,
        ),
        AttributeValue::Ss(values) => Value::Array(values.into_iter().map(Value::String).collect()),
        AttributeValue::Ns(values) => Value::Array(
            values.iter().map(|n| parse_number(n).map(Value::Number)).collect::<Result<_, _>>()?,
        ),
    })
}

fn parse_number(raw: &str) -> GatewayResult<Number> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Number(n)) => Ok(n),
        _ => Err(ClassifiedError::serialization(format!(
            "(Unmarshal Result Item) invalid number attribute {raw:?}"
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
