//! SQLite key-value store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

use super::KeyValueStore;
use crate::error::StorageError;

/// SQLite-based key-value store.
///
/// Entries keep a per-namespace sequence number assigned on first insert, so
/// `list` returns them in insertion order even after updates.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  /// Upper bound on the summed size of stored values, if any.
  max_bytes: Option<u64>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  /// Limit the total size of stored values; writes beyond it fail with
  /// [`StorageError::Full`].
  pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
    self.max_bytes = Some(max_bytes);
    self
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      max_bytes: None,
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))
  }

  /// Reject a write that would push the store past its byte budget.
  fn check_capacity(
    &self,
    conn: &Connection,
    namespace: &str,
    key: &str,
    incoming: usize,
  ) -> Result<(), StorageError> {
    let Some(max_bytes) = self.max_bytes else {
      return Ok(());
    };

    let total: i64 = conn.query_row(
      "SELECT COALESCE(SUM(length(data)), 0) FROM kv_store",
      [],
      |row| row.get(0),
    )?;
    let replaced: i64 = conn
      .query_row(
        "SELECT length(data) FROM kv_store WHERE namespace = ? AND key = ?",
        params![namespace, key],
        |row| row.get(0),
      )
      .optional()?
      .unwrap_or(0);

    let after = (total - replaced).max(0) as u64 + incoming as u64;
    if after > max_bytes {
      return Err(StorageError::Full(format!(
        "writing {}/{} needs {} bytes, budget is {}",
        namespace, key, after, max_bytes
      )));
    }
    Ok(())
  }
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    seq INTEGER NOT NULL,
    data BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_kv_store_seq ON kv_store(namespace, seq);
"#;

impl KeyValueStore for SqliteStore {
  fn put(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StorageError> {
    let data = serde_json::to_vec(value)?;
    let conn = self.lock()?;

    self.check_capacity(&conn, namespace, key, data.len())?;

    conn.execute(
      "INSERT INTO kv_store (namespace, key, seq, data, written_at)
       VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM kv_store WHERE namespace = ?1), ?3, datetime('now'))
       ON CONFLICT(namespace, key) DO UPDATE SET data = excluded.data, written_at = excluded.written_at",
      params![namespace, key, data],
    )?;

    Ok(())
  }

  fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StorageError> {
    let conn = self.lock()?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM kv_store WHERE namespace = ? AND key = ?",
        params![namespace, key],
        |row| row.get(0),
      )
      .optional()?;

    match data {
      Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
      None => Ok(None),
    }
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM kv_store WHERE namespace = ? AND key = ?",
      params![namespace, key],
    )?;
    Ok(())
  }

  fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>, StorageError> {
    let conn = self.lock()?;

    let mut stmt =
      conn.prepare("SELECT key, data FROM kv_store WHERE namespace = ? ORDER BY seq")?;

    let rows: Vec<(String, Vec<u8>)> = stmt
      .query_map(params![namespace], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<_, _>>()?;

    rows
      .into_iter()
      .map(|(key, data)| Ok((key, serde_json::from_slice(&data)?)))
      .collect()
  }

  fn clear(&self, namespace: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM kv_store WHERE namespace = ?", params![namespace])?;
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT DISTINCT namespace FROM kv_store ORDER BY namespace")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }
}
