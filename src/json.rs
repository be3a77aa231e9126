//! Schema-less access to JSON documents returned by the API.
//!
//! Query results are handed out as [`JsonMap`] values: a JSON object with typed
//! accessors. Absent keys and explicit `null`s read as `None`; a present value
//! of the wrong shape yields [`Error::TypeMismatch`].

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Ordered sequence of documents, as produced by `get_all`.
pub type JsonList = Vec<JsonMap>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonMap(Map<String, Value>);

impl JsonMap {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Raw value lookup, `None` for absent keys.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Deserializes the value at `key` into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] when the value exists but cannot be
    /// converted into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::deserialize(value)
                .map(Some)
                .map_err(|_| Error::TypeMismatch {
                    key: key.to_string(),
                    expected: std::any::type_name::<T>(),
                }),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(mismatch(key, "a string")),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| mismatch(key, "an integer")),
            Some(_) => Err(mismatch(key, "an integer")),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(mismatch(key, "a boolean")),
        }
    }

    pub fn get_map(&self, key: &str) -> Result<Option<JsonMap>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) => Ok(Some(JsonMap(map.clone()))),
            Some(_) => Err(mismatch(key, "an object")),
        }
    }

    pub fn get_list(&self, key: &str) -> Result<Option<JsonList>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(JsonMap(map.clone())),
                    _ => Err(mismatch(key, "a list of objects")),
                })
                .collect::<Result<JsonList>>()
                .map(Some),
            Some(_) => Err(mismatch(key, "a list")),
        }
    }

    /// Follows a dotted path (`"summary.severity"`) through nested objects.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Renders a scalar value as a string, so numeric ids and string ids read
    /// the same way. Objects, arrays and nulls yield `None`.
    pub fn get_string_lossy(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn mismatch(key: &str, expected: &'static str) -> Error {
    Error::TypeMismatch {
        key: key.to_string(),
        expected,
    }
}

impl From<Map<String, Value>> for JsonMap {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for JsonMap {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(mismatch("$", "an object")),
        }
    }
}

impl fmt::Display for JsonMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string_pretty(&self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

/// Converts a JSON array of objects into a [`JsonList`].
pub(crate) fn list_from_value(key: &str, value: Value) -> Result<JsonList> {
    match value {
        Value::Array(items) => items.into_iter().map(JsonMap::try_from).collect(),
        Value::Null => Ok(Vec::new()),
        _ => Err(mismatch(key, "a list")),
    }
}
