//! Core traits and types for the local store.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Primary key of a record inside a partition.
///
/// Only integers and strings are valid keys, mirroring what a browser
/// object store accepts for the cases we use.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
  Int(i64),
  Text(String),
}

impl Key {
  /// Read a key out of a JSON value.
  pub fn from_json(value: &Value) -> Option<Self> {
    match value {
      Value::Number(n) => n.as_i64().map(Key::Int),
      Value::String(s) => Some(Key::Text(s.clone())),
      _ => None,
    }
  }

  pub fn to_json(&self) -> Value {
    match self {
      Key::Int(i) => Value::from(*i),
      Key::Text(s) => Value::from(s.as_str()),
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Key::Int(i) => Some(*i),
      Key::Text(_) => None,
    }
  }
}

impl From<i64> for Key {
  fn from(value: i64) -> Self {
    Key::Int(value)
  }
}

impl From<&str> for Key {
  fn from(value: &str) -> Self {
    Key::Text(value.to_string())
  }
}

impl From<String> for Key {
  fn from(value: String) -> Self {
    Key::Text(value)
  }
}

impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Key::Int(i) => write!(f, "{}", i),
      Key::Text(s) => f.write_str(s),
    }
  }
}

/// A versioned key-value database split into named partitions.
///
/// Every operation is an independent transaction scoped to one partition.
/// Records are JSON objects; the partition's key path names the field that
/// holds the record's key.
pub trait LocalStore: Send + Sync {
  /// Database name (used in log and error messages).
  fn name(&self) -> &str;

  /// Get a record by key.
  fn get(&self, partition: &str, key: &Key) -> Result<Option<Value>>;

  /// Insert or replace a record.
  ///
  /// An explicit `key` is written into the record's key path. When neither is
  /// present the partition must be auto-incrementing and a key is assigned.
  fn put(&self, partition: &str, key: Option<Key>, value: Value) -> Result<Key>;

  /// All records in ascending key order.
  fn get_all(&self, partition: &str) -> Result<Vec<Value>>;

  /// All records whose indexed field equals `query`, in ascending key order.
  fn get_all_by_index(&self, partition: &str, index: &str, query: &Value) -> Result<Vec<Value>>;

  /// Delete a record. Deleting a missing key is not an error.
  fn delete(&self, partition: &str, key: &Key) -> Result<()>;

  /// Number of records in a partition.
  fn count(&self, partition: &str) -> Result<usize>;

  /// Read-modify-write one record as a single transaction.
  ///
  /// `f` receives the current record and returns its replacement, or `None`
  /// to leave it untouched. Returns whether anything was written.
  fn update(
    &self,
    partition: &str,
    key: &Key,
    f: &mut dyn FnMut(Option<Value>) -> Result<Option<Value>>,
  ) -> Result<bool>;

  /// Store `value` in partition `to` and delete `key` from `from`, both in
  /// one transaction.
  fn transfer(&self, from: &str, key: &Key, to: &str, value: Value) -> Result<Key>;
}

/// Store that doesn't keep anything.
/// Substituted when a database cannot be opened so callers degrade to
/// running without offline support.
pub struct NoopStore {
  name: String,
}

impl NoopStore {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }
}

impl LocalStore for NoopStore {
  fn name(&self) -> &str {
    &self.name
  }

  fn get(&self, _partition: &str, _key: &Key) -> Result<Option<Value>> {
    Ok(None) // Always miss
  }

  fn put(&self, _partition: &str, key: Option<Key>, _value: Value) -> Result<Key> {
    Ok(key.unwrap_or(Key::Int(0))) // Discard
  }

  fn get_all(&self, _partition: &str) -> Result<Vec<Value>> {
    Ok(Vec::new())
  }

  fn get_all_by_index(&self, _partition: &str, _index: &str, _query: &Value) -> Result<Vec<Value>> {
    Ok(Vec::new())
  }

  fn delete(&self, _partition: &str, _key: &Key) -> Result<()> {
    Ok(())
  }

  fn count(&self, _partition: &str) -> Result<usize> {
    Ok(0)
  }

  fn update(
    &self,
    _partition: &str,
    _key: &Key,
    f: &mut dyn FnMut(Option<Value>) -> Result<Option<Value>>,
  ) -> Result<bool> {
    Ok(f(None)?.is_some()) // Discard
  }

  fn transfer(&self, _from: &str, key: &Key, _to: &str, _value: Value) -> Result<Key> {
    Ok(key.clone())
  }
}

/// Serialize a typed record for storage.
pub fn to_record<T: Serialize>(record: &T) -> Result<Value> {
  serde_json::to_value(record).map_err(|e| eyre!("Failed to serialize record: {}", e))
}

/// Deserialize a stored record.
pub fn from_record<T: DeserializeOwned>(value: Value) -> Result<T> {
  serde_json::from_value(value).map_err(|e| eyre!("Failed to deserialize record: {}", e))
}
