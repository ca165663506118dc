//! Result types describing where cached data came from.

use chrono::{DateTime, Utc};

use crate::error::SyncError;

/// Result from a cache-aware read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was fetched from the network (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Failure that forced a stale or empty answer
  pub error: Option<SyncError>,
}

impl<T> CacheResult<T> {
  /// Data just returned by the remote source.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      error: None,
    }
  }

  /// Data served from the cache without a remote call.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
      error: None,
    }
  }

  /// Last-known data served because the network call failed.
  pub fn stale(data: T, cached_at: DateTime<Utc>, error: SyncError) -> Self {
    Self {
      data,
      source: CacheSource::CacheStale,
      cached_at: Some(cached_at),
      error: Some(error),
    }
  }

  /// Cached or last-known data served while offline.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
      error: None,
    }
  }

  /// Nothing cached and the network failed.
  pub fn unavailable(data: T, error: SyncError) -> Self {
    Self {
      data,
      source: CacheSource::Unavailable,
      cached_at: None,
      error: Some(error),
    }
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Returned by the remote source just now
  Network,
  /// Within its TTL
  CacheFresh,
  /// Data from cache past its TTL, served because the network failed
  CacheStale,
  /// Offline mode - network not attempted, serving cached data
  Offline,
  /// No data at all; see `error`
  Unavailable,
}
