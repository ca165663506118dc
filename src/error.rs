//! Error types for the cache and sync engine.
//!
//! Storage and transport failures are recovered inside the engine and only
//! logged. Remote failures and rejected mutations reach the caller as
//! [`SyncError`] values so the UI can show a message.

use std::time::Duration;

use crate::record::Collection;

/// Failure of the local key-value store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
  /// The store hit its byte or record budget.
  #[error("STORAGE_FULL: {0}")]
  Full(String),

  /// A value could not be encoded or decoded.
  #[error("STORAGE_SERIALIZATION: {0}")]
  Serialization(String),

  /// Any other backend failure (I/O, locked database, ...).
  #[error("STORAGE_BACKEND: {0}")]
  Backend(String),
}

impl From<serde_json::Error> for StorageError {
  fn from(err: serde_json::Error) -> Self {
    Self::Serialization(err.to_string())
  }
}

impl From<rusqlite::Error> for StorageError {
  fn from(err: rusqlite::Error) -> Self {
    match &err {
      rusqlite::Error::SqliteFailure(code, _) if code.code == rusqlite::ErrorCode::DiskFull => {
        Self::Full(err.to_string())
      }
      _ => Self::Backend(err.to_string()),
    }
  }
}

/// Failure reported by the remote data source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
  /// Network unreachable, connection reset, 5xx.
  #[error("NETWORK: {0}")]
  Network(String),

  /// The server refused the request (validation, conflict, permission).
  #[error("REJECTED: {0}")]
  Rejected(String),

  /// The requested record or procedure does not exist.
  #[error("NOT_FOUND: {0}")]
  NotFound(String),
}

/// Error surfaced by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
  /// Local persistence unavailable or full.
  #[error("storage failure: {0}")]
  Storage(#[from] StorageError),

  /// Network or server error while reading.
  #[error("remote failure: {0}")]
  Remote(RemoteError),

  /// The server rejected a write; the optimistic value was rolled back.
  #[error("mutation rejected: {0}")]
  MutationRejected(String),

  /// The real-time channel is down.
  #[error("real-time transport dropped")]
  TransportDropped,

  /// The remote call did not finish within the configured timeout.
  #[error("remote call timed out after {0:?}")]
  Timeout(Duration),

  /// A newer request for the same query replaced this one.
  #[error("request superseded by a newer one")]
  Superseded,

  /// The record is not in the cache and the remote source has no such id.
  #[error("{collection} record {id} not found")]
  NotFound { collection: Collection, id: String },
}

impl From<RemoteError> for SyncError {
  fn from(err: RemoteError) -> Self {
    Self::Remote(err)
  }
}

impl SyncError {
  /// Reinterpret a remote failure of a write call.
  pub(crate) fn into_mutation_error(self) -> Self {
    match self {
      Self::Remote(RemoteError::Rejected(msg)) => Self::MutationRejected(msg),
      other => other,
    }
  }
}
