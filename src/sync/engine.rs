use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::coordinator::QueryRegistry;
use super::router::SubscriptionRegistry;
use super::tracker::MutationTracker;
use crate::cache::ExpiringCache;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{RemoteError, SyncError};
use crate::record::{Collection, Record};
use crate::remote::RemoteSource;
use crate::social::Entity;
use crate::storage::KeyValueStore;

/// Everything guarded by the engine lock.
pub(super) struct EngineState {
  pub(super) cache: ExpiringCache,
  pub(super) pending: MutationTracker,
  pub(super) subscriptions: SubscriptionRegistry,
  pub(super) queries: QueryRegistry,
  pub(super) online: bool,
  /// Set while the transport is down; cleared on reconnect.
  pub(super) transport_degraded: bool,
}

pub(super) struct Settings {
  pub(super) remote_timeout: Duration,
  pub(super) stale_fraction: Option<f64>,
  pub(super) reconnect_backoff: Duration,
}

pub(super) struct Core {
  state: Mutex<EngineState>,
  pub(super) remote: Arc<dyn RemoteSource>,
  pub(super) settings: Settings,
  pub(super) pump: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
  /// Lock the engine state. A panic while the lock was held leaves the
  /// cache consistent at operation granularity, so poisoning is ignored.
  pub(super) fn lock(&self) -> MutexGuard<'_, EngineState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run a remote call under the configured timeout.
  pub(super) async fn call_remote<T, F>(&self, call: F) -> Result<T, SyncError>
  where
    F: Future<Output = Result<T, RemoteError>>,
  {
    match tokio::time::timeout(self.settings.remote_timeout, call).await {
      Ok(result) => result.map_err(SyncError::from),
      Err(_) => Err(SyncError::Timeout(self.settings.remote_timeout)),
    }
  }
}

impl Drop for Core {
  fn drop(&mut self) {
    let pump = self.pump.get_mut().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = pump.take() {
      handle.abort();
    }
  }
}

/// Client-side cache and sync engine.
///
/// One instance per session; clones share state. Reads are synchronous and
/// see every optimistic write issued before them.
#[derive(Clone)]
pub struct SyncEngine {
  pub(super) core: Arc<Core>,
}

impl SyncEngine {
  pub fn new(
    config: &Config,
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteSource>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let mut cache = ExpiringCache::new(store, clock);
    for collection in Collection::ALL {
      cache = cache.with_ttl(collection, config.ttl_for(collection));
    }
    info!(
      storage_failures = cache.storage_failures(),
      "sync engine ready"
    );

    let state = EngineState {
      cache,
      pending: MutationTracker::default(),
      subscriptions: SubscriptionRegistry::default(),
      queries: QueryRegistry::default(),
      online: true,
      transport_degraded: false,
    };

    Self {
      core: Arc::new(Core {
        state: Mutex::new(state),
        remote,
        settings: Settings {
          remote_timeout: config.remote_timeout(),
          stale_fraction: config.stale_fraction,
          reconnect_backoff: config.reconnect_backoff(),
        },
        pump: Mutex::new(None),
      }),
    }
  }

  /// Fresh records of a collection.
  pub fn get(&self, collection: Collection) -> Vec<Record> {
    self.core.lock().cache.get(collection)
  }

  pub fn get_one(&self, collection: Collection, id: &str) -> Option<Record> {
    self.core.lock().cache.get_one(collection, id)
  }

  /// Fresh record decoded as `T`. Undecodable records are logged and
  /// treated as absent.
  pub fn read<T: Entity>(&self, id: &str) -> Option<T> {
    let record = self.get_one(T::collection(), id)?;
    decode(&record)
  }

  pub fn read_all<T: Entity>(&self) -> Vec<T> {
    self
      .get(T::collection())
      .iter()
      .filter_map(decode)
      .collect()
  }

  /// Write records directly with the collection TTL.
  pub fn set(&self, collection: Collection, records: Vec<Record>) {
    let mut state = self.core.lock();
    let ttl = state.cache.ttl(collection);
    state.cache.set(collection, records, ttl);
  }

  /// Expire a collection so the next fetch goes to the network.
  pub fn invalidate(&self, collection: Collection) {
    self.core.lock().cache.invalidate(collection);
  }

  /// Drop every cached collection, in memory and on disk.
  pub fn clear_all(&self) {
    self.core.lock().cache.clear_all();
  }

  pub fn ttl(&self, collection: Collection) -> Duration {
    self.core.lock().cache.ttl(collection)
  }

  /// Store operations that failed and were absorbed by the in-memory cache.
  pub fn storage_failures(&self) -> u64 {
    self.core.lock().cache.storage_failures()
  }

  pub fn is_online(&self) -> bool {
    self.core.lock().online
  }

  /// True while the real-time transport is down and events may be missed.
  pub fn transport_degraded(&self) -> bool {
    self.core.lock().transport_degraded
  }
}

fn decode<T: Entity>(record: &Record) -> Option<T> {
  match T::from_record(record) {
    Ok(value) => Some(value),
    Err(err) => {
      warn!(collection = %T::collection(), id = %record.id, error = %err, "undecodable record");
      None
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::remote::MemoryRemote;
  use crate::social::Post;
  use crate::storage::MemoryStore;
  use serde_json::json;

  pub(crate) struct Harness {
    pub engine: SyncEngine,
    pub remote: Arc<MemoryRemote>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
  }

  pub(crate) fn harness() -> Harness {
    harness_with(Config::default())
  }

  pub(crate) fn harness_with(config: Config) -> Harness {
    let remote = Arc::new(MemoryRemote::new());
    let clock = Arc::new(ManualClock::fixed());
    let store = Arc::new(MemoryStore::new());
    let engine = SyncEngine::new(&config, store.clone(), remote.clone(), clock.clone());
    Harness {
      engine,
      remote,
      clock,
      store,
    }
  }

  pub(crate) fn post(id: &str, version: i64, likes: u64, liked: bool) -> Record {
    Record::new(
      id,
      version,
      json!({
        "id": id,
        "content": format!("post {}", id),
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-01-01T00:00:00Z",
        "user_id": "u1",
        "likes_count": likes,
        "comments_count": 0,
        "is_liked": liked,
      }),
    )
  }

  #[test]
  fn test_config_ttls_reach_cache() {
    let config = Config::from_yaml("ttl:\n  posts: 10\n").unwrap();
    let h = harness_with(config);
    assert_eq!(h.engine.ttl(Collection::Posts), Duration::from_secs(10));
    assert_eq!(h.engine.ttl(Collection::Groups), Duration::from_secs(600));
  }

  #[test]
  fn test_typed_reads() {
    let h = harness();
    h.engine.set(
      Collection::Posts,
      vec![post("p1", 1, 2, false), Record::new("bad", 1, json!({ "id": "bad" }))],
    );

    let post: Post = h.engine.read("p1").unwrap();
    assert_eq!(post.likes_count, 2);
    assert!(h.engine.read::<Post>("bad").is_none());
    assert_eq!(h.engine.read_all::<Post>().len(), 1);
  }

  #[test]
  fn test_invalidate_hides_records() {
    let h = harness();
    h.engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);
    h.engine.invalidate(Collection::Posts);
    assert!(h.engine.get(Collection::Posts).is_empty());
  }

  #[test]
  fn test_clear_all_empties_store() {
    let h = harness();
    h.engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);
    h.engine.clear_all();
    assert!(h.engine.get(Collection::Posts).is_empty());
    assert!(h.store.namespaces().unwrap().is_empty());
  }

  #[test]
  fn test_storage_failures_are_absorbed() {
    let remote = Arc::new(MemoryRemote::new());
    let store = Arc::new(MemoryStore::with_max_bytes(0));
    let engine = SyncEngine::new(
      &Config::default(),
      store,
      remote,
      Arc::new(ManualClock::fixed()),
    );

    engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);
    assert_eq!(engine.get(Collection::Posts).len(), 1);
    assert!(engine.storage_failures() > 0);
  }
}
