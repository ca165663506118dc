//! Remote data source consumed by the engine.
//!
//! The backend is collection oriented: CRUD with filter predicates, opaque
//! remote procedures returning record sets, and a push channel carrying
//! change events for the collections the client listens to.

mod memory;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::RemoteError;
use crate::record::{ChangeEvent, Collection, Filter, Query, Record};

pub use memory::{MemoryRemote, RemoteStats};

/// Signal delivered by the real-time transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
  /// A change to one record.
  Change(ChangeEvent),
  /// The connection was lost; events may be missed until `Reconnected`.
  Dropped,
  /// The connection is back. Missed events are not replayed.
  Reconnected,
}

/// Trait for remote backends.
pub trait RemoteSource: Send + Sync {
  /// Records of a collection matching `query`.
  fn select<'a>(
    &'a self,
    collection: Collection,
    query: &'a Query,
  ) -> BoxFuture<'a, Result<Vec<Record>, RemoteError>>;

  /// Create a record; the returned record is canonical (it may carry a
  /// server-assigned id, version and computed fields).
  fn insert(
    &self,
    collection: Collection,
    record: Record,
  ) -> BoxFuture<'_, Result<Record, RemoteError>>;

  /// Replace a record; returns the canonical value.
  fn update(
    &self,
    collection: Collection,
    record: Record,
  ) -> BoxFuture<'_, Result<Record, RemoteError>>;

  fn delete<'a>(
    &'a self,
    collection: Collection,
    id: &'a str,
  ) -> BoxFuture<'a, Result<(), RemoteError>>;

  /// Call a remote procedure (e.g. `get_user_feed`).
  fn call<'a>(
    &'a self,
    procedure: &'a str,
    args: &'a Value,
  ) -> BoxFuture<'a, Result<Vec<Record>, RemoteError>>;

  /// Open the server-side channel for a collection and optional filter.
  fn listen(&self, collection: Collection, filter: Option<&Filter>) -> Result<(), RemoteError>;

  /// Close a channel opened with [`listen`](Self::listen).
  fn unlisten(&self, collection: Collection, filter: Option<&Filter>);

  /// The shared transport connection. A new stream is requested after the
  /// previous one ends.
  fn changes(&self) -> BoxStream<'static, TransportSignal>;
}
