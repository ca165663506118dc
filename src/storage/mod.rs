//! Durable key-value storage, namespaced by collection.
//!
//! Backends only persist values; TTL semantics live in the cache layer.
//! Every failure is reported as a [`StorageError`] and callers are expected
//! to keep working without persistence.

mod memory;
mod sqlite;

use serde_json::Value;

use crate::error::StorageError;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Trait for key-value storage backends.
pub trait KeyValueStore: Send + Sync {
  /// Insert or replace a value. Replacing keeps the key's insertion position.
  fn put(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StorageError>;

  /// Get a value by key.
  fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StorageError>;

  /// Delete a value. Deleting a missing key is not an error.
  fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError>;

  /// All entries of a namespace in insertion order.
  fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>, StorageError>;

  /// Remove every entry of a namespace.
  fn clear(&self, namespace: &str) -> Result<(), StorageError>;

  /// Names of the namespaces that currently hold entries.
  fn namespaces(&self) -> Result<Vec<String>, StorageError>;
}

/// Storage implementation that doesn't store anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl KeyValueStore for NoopStore {
  fn put(&self, _namespace: &str, _key: &str, _value: &Value) -> Result<(), StorageError> {
    Ok(()) // Discard
  }

  fn get(&self, _namespace: &str, _key: &str) -> Result<Option<Value>, StorageError> {
    Ok(None) // Always miss
  }

  fn delete(&self, _namespace: &str, _key: &str) -> Result<(), StorageError> {
    Ok(())
  }

  fn list(&self, _namespace: &str) -> Result<Vec<(String, Value)>, StorageError> {
    Ok(Vec::new())
  }

  fn clear(&self, _namespace: &str) -> Result<(), StorageError> {
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>, StorageError> {
    Ok(Vec::new())
  }
}
