//! Caller queries and their normalized form for cache keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::{Category, ValidationError};

const FLOAT_SCALE: f64 = 1_000_000.0;

/// A provider-agnostic query such as `{"lat": 37.77, "lon": -122.41}`.
///
/// Field names are stored trimmed and lowercased, the same form the cache key uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(Map<String, Value>);

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(map) => Ok(Self(
                map.into_iter()
                    .map(|(key, value)| (field_name(&key), value))
                    .collect(),
            )),
            _ => Err(ValidationError::QueryNotObject),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field_name(&key.into()), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(&field_name(key))
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical form: keys trimmed and lowercased, nulls dropped, strings trimmed,
    /// floats rounded to six decimals. Object keys come out sorted.
    pub fn normalized(&self) -> Value {
        normalize_object(&self.0)
    }

    /// Hex SHA-256 of the canonical JSON form.
    pub fn fingerprint(&self) -> String {
        let canonical = self.normalized().to_string();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Cache key: `<category>:<query fingerprint>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(category: &Category, query: &Query) -> Self {
        Self(format!("{category}:{}", query.fingerprint()))
    }

    /// Glob matching every key of one category.
    pub fn category_pattern(category: &Category) -> String {
        format!("{category}:*")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

fn field_name(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

fn normalize_object(map: &Map<String, Value>) -> Value {
    let mut normalized = Map::new();
    for (key, value) in map {
        if value.is_null() {
            continue;
        }
        normalized.insert(field_name(key), normalize_value(value));
    }
    Value::Object(normalized)
}

fn normalize_value(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(text.trim().to_owned()),
        Value::Number(number) => normalize_number(number),
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        Value::Object(map) => normalize_object(map),
        Value::Bool(_) | Value::Null => value.clone(),
    }
}

fn normalize_number(number: &Number) -> Value {
    if number.is_i64() || number.is_u64() {
        return Value::Number(number.clone());
    }

    match number.as_f64() {
        Some(float) => {
            let rounded = (float * FLOAT_SCALE).round() / FLOAT_SCALE;
            Number::from_f64(rounded)
                .map(Value::Number)
                .unwrap_or_else(|| Value::Number(number.clone()))
        }
        None => Value::Number(number.clone()),
    }
}
