//! In-process key-value store.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::KeyValueStore;
use crate::error::StorageError;

#[derive(Default)]
struct Namespace {
  next_seq: u64,
  /// key -> (insertion sequence, encoded value)
  entries: HashMap<String, (u64, Vec<u8>)>,
}

#[derive(Default)]
struct Inner {
  namespaces: HashMap<String, Namespace>,
  bytes: usize,
}

/// Key-value store held in memory, with an optional byte budget.
///
/// Values are stored encoded so the budget and serialization failures behave
/// like a browser's local storage quota.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
  max_bytes: Option<usize>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_max_bytes(max_bytes: usize) -> Self {
    Self {
      inner: Mutex::default(),
      max_bytes: Some(max_bytes),
    }
  }

  /// Bytes currently stored.
  pub fn used_bytes(&self) -> usize {
    self.lock().map(|inner| inner.bytes).unwrap_or(0)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
    self
      .inner
      .lock()
      .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))
  }
}

impl KeyValueStore for MemoryStore {
  fn put(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StorageError> {
    let data = serde_json::to_vec(value)?;
    let mut inner = self.lock()?;

    let replaced = inner
      .namespaces
      .get(namespace)
      .and_then(|ns| ns.entries.get(key))
      .map(|(_, old)| old.len())
      .unwrap_or(0);
    let after = inner.bytes - replaced + data.len();
    if let Some(max_bytes) = self.max_bytes {
      if after > max_bytes {
        return Err(StorageError::Full(format!(
          "writing {}/{} needs {} bytes, budget is {}",
          namespace, key, after, max_bytes
        )));
      }
    }
    inner.bytes = after;

    let ns = inner.namespaces.entry(namespace.to_string()).or_default();
    match ns.entries.get_mut(key) {
      Some(entry) => entry.1 = data,
      None => {
        ns.next_seq += 1;
        let seq = ns.next_seq;
        ns.entries.insert(key.to_string(), (seq, data));
      }
    }
    Ok(())
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StorageError> {
    let inner = self.lock()?;
    match inner.namespaces.get(namespace).and_then(|ns| ns.entries.get(key)) {
      Some((_, data)) => Ok(Some(serde_json::from_slice(data)?)),
      None => Ok(None),
    }
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
    let mut inner = self.lock()?;
    let removed = inner
      .namespaces
      .get_mut(namespace)
      .and_then(|ns| ns.entries.remove(key))
      .map(|(_, data)| data.len())
      .unwrap_or(0);
    inner.bytes -= removed;
    Ok(())
  }

  fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>, StorageError> {
    let inner = self.lock()?;
    let Some(ns) = inner.namespaces.get(namespace) else {
      return Ok(Vec::new());
    };

    let mut entries: Vec<(&String, &(u64, Vec<u8>))> = ns.entries.iter().collect();
    entries.sort_by_key(|(_, (seq, _))| *seq);

    entries
      .into_iter()
      .map(|(key, (_, data))| Ok((key.clone(), serde_json::from_slice(data)?)))
      .collect()
  }

  fn clear(&self, namespace: &str) -> Result<(), StorageError> {
    let mut inner = self.lock()?;
    if let Some(ns) = inner.namespaces.remove(namespace) {
      let freed: usize = ns.entries.values().map(|(_, data)| data.len()).sum();
      inner.bytes -= freed;
    }
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>, StorageError> {
    let inner = self.lock()?;
    let mut names: Vec<String> = inner
      .namespaces
      .iter()
      .filter(|(_, ns)| !ns.entries.is_empty())
      .map(|(name, _)| name.clone())
      .collect();
    names.sort();
    Ok(names)
  }
}
