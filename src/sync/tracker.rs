//! Optimistic mutations.
//!
//! A mutation is applied to the cache at once (pinned, so it cannot expire
//! while unconfirmed) and its remote call runs in a spawned task. Mutations
//! on the same record form a chain: each one is visible immediately, but its
//! remote call waits for the previous one to resolve.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::engine::{Core, EngineState, SyncEngine};
use crate::cache::{ExpiringCache, Snapshot};
use crate::error::{StorageError, SyncError};
use crate::record::{Collection, Operation, Record};
use crate::social::{Entity, Post};

type Outcome = Result<Option<Record>, SyncError>;
type Key = (Collection, String);

/// A local write.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  /// Create a record. An empty id is replaced by a temporary `local-N` id
  /// until the server assigns one.
  Create(Record),
  Update(Record),
  Delete(String),
}

impl Mutation {
  pub fn operation(&self) -> Operation {
    match self {
      Self::Create(_) => Operation::Create,
      Self::Update(_) => Operation::Update,
      Self::Delete(_) => Operation::Delete,
    }
  }

  pub fn id(&self) -> &str {
    match self {
      Self::Create(record) | Self::Update(record) => &record.id,
      Self::Delete(id) => id,
    }
  }

  /// Value shown locally while the mutation is pending.
  fn optimistic(&self) -> Option<&Record> {
    match self {
      Self::Create(record) | Self::Update(record) => Some(record),
      Self::Delete(_) => None,
    }
  }

  fn set_id(&mut self, to: &str) {
    match self {
      Self::Create(record) | Self::Update(record) => {
        record.id = to.to_string();
        if let Some(obj) = record.data.as_object_mut() {
          obj.insert("id".into(), Value::String(to.to_string()));
        }
      }
      Self::Delete(id) => *id = to.to_string(),
    }
  }
}

/// Handle to a pending mutation.
#[derive(Debug)]
pub struct MutationHandle {
  pub pending_id: u64,
  pub collection: Collection,
  /// Record id the mutation was issued for (temporary for creates).
  pub id: String,
  rx: oneshot::Receiver<Outcome>,
}

impl MutationHandle {
  /// Wait for the server.
  ///
  /// `Ok(Some(record))` is the canonical value now in the cache, `Ok(None)`
  /// a confirmed delete or a mutation overtaken by a remote delete. On
  /// error the optimistic value has already been rolled back.
  pub async fn outcome(self) -> Result<Option<Record>, SyncError> {
    match self.rx.await {
      Ok(outcome) => outcome,
      // Engine dropped before the mutation resolved
      Err(_) => Err(SyncError::Superseded),
    }
  }
}

struct PendingMutation {
  pending_id: u64,
  mutation: Mutation,
  /// Rollback target
  original: Snapshot,
  responder: Option<oneshot::Sender<Outcome>>,
}

impl PendingMutation {
  fn respond(&mut self, outcome: Outcome) {
    if let Some(tx) = self.responder.take() {
      // Caller may have dropped the handle
      let _ = tx.send(outcome);
    }
  }
}

/// Pending mutation chains plus change events held back while a chain is
/// in flight.
#[derive(Default)]
pub(crate) struct MutationTracker {
  next_id: u64,
  chains: HashMap<Key, VecDeque<PendingMutation>>,
  deferred: HashMap<Key, Record>,
}

impl MutationTracker {
  pub(crate) fn is_pending(&self, collection: Collection, id: &str) -> bool {
    self
      .chains
      .get(&(collection, id.to_string()))
      .is_some_and(|chain| !chain.is_empty())
  }

  pub(crate) fn len(&self) -> usize {
    self.chains.values().map(VecDeque::len).sum()
  }

  /// Hold an update event until the chain for its record resolves. Only the
  /// highest version is kept.
  pub(crate) fn defer(&mut self, collection: Collection, record: Record) {
    let key = (collection, record.id.clone());
    match self.deferred.get(&key) {
      Some(held) if held.version >= record.version => {}
      _ => {
        self.deferred.insert(key, record);
      }
    }
  }

  /// Drop every pending mutation for a record deleted on the server. Their
  /// callers get `Ok(None)`. Returns how many were cancelled.
  pub(crate) fn cancel(&mut self, collection: Collection, id: &str) -> usize {
    let key = (collection, id.to_string());
    self.deferred.remove(&key);
    let Some(chain) = self.chains.remove(&key) else {
      return 0;
    };

    let cancelled = chain.len();
    for mut pending in chain {
      pending.respond(Ok(None));
    }
    cancelled
  }

  fn has_successors(&self, key: &Key) -> bool {
    self.chains.get(key).is_some_and(|chain| !chain.is_empty())
  }

  /// Move a chain to the id the server assigned to its create.
  fn rekey(&mut self, collection: Collection, from: &str, to: &str) {
    let from_key = (collection, from.to_string());
    let to_key = (collection, to.to_string());

    if let Some(mut chain) = self.chains.remove(&from_key) {
      for pending in &mut chain {
        pending.mutation.set_id(to);
      }
      self.chains.entry(to_key.clone()).or_default().extend(chain);
    }
    if let Some(mut held) = self.deferred.remove(&from_key) {
      held.id = to.to_string();
      self.deferred.insert(to_key, held);
    }
  }
}

impl EngineState {
  /// Apply a mutation locally and append it to its record's chain. Returns
  /// the pending id, the record id and whether the chain was idle (so the
  /// caller must start its remote call).
  pub(super) fn enqueue(
    &mut self,
    collection: Collection,
    mut mutation: Mutation,
    responder: oneshot::Sender<Outcome>,
  ) -> (u64, String, bool) {
    self.pending.next_id += 1;
    let pending_id = self.pending.next_id;

    if matches!(&mutation, Mutation::Create(record) if record.id.is_empty()) {
      mutation.set_id(&format!("local-{}", pending_id));
    }

    let id = mutation.id().to_string();
    let original = self.cache.snapshot(collection, &id);
    match &mutation {
      Mutation::Create(record) | Mutation::Update(record) => {
        self.cache.pin(collection, record.clone());
      }
      Mutation::Delete(id) => {
        self.cache.remove_item(collection, id);
      }
    }

    debug!(%collection, %id, pending_id, operation = ?mutation.operation(), "optimistic write");
    let chain = self.pending.chains.entry((collection, id.clone())).or_default();
    chain.push_back(PendingMutation {
      pending_id,
      mutation,
      original,
      responder: Some(responder),
    });

    (pending_id, id, chain.len() == 1)
  }

  fn head_request(&self, collection: Collection, id: &str) -> Option<(u64, Mutation)> {
    let chain = self.pending.chains.get(&(collection, id.to_string()))?;
    let head = chain.front()?;
    Some((head.pending_id, head.mutation.clone()))
  }

  /// Resolve the head of a chain with the remote result. Returns the id of
  /// the chain to continue with, if more mutations are queued.
  fn settle(
    &mut self,
    collection: Collection,
    id: &str,
    pending_id: u64,
    result: Outcome,
  ) -> Option<String> {
    let key = (collection, id.to_string());
    let chain = self.pending.chains.get_mut(&key)?;
    // Cancelled by a remote delete while the call was in flight
    if chain.front().map(|m| m.pending_id) != Some(pending_id) {
      debug!(%collection, %id, pending_id, "dropping result of cancelled mutation");
      return None;
    }
    let mut head = chain.pop_front()?;

    match result {
      Ok(canonical) => {
        let next = self.confirm(collection, id, canonical.clone());
        head.respond(Ok(canonical));
        next
      }
      Err(err) => {
        let err = err.into_mutation_error();
        warn!(%collection, %id, pending_id, error = %err, "mutation failed, rolling back");
        let next = self.roll_back(collection, id, head.original.clone());
        head.respond(Err(err));
        next
      }
    }
  }

  fn confirm(
    &mut self,
    collection: Collection,
    id: &str,
    canonical: Option<Record>,
  ) -> Option<String> {
    let mut current = id.to_string();
    let mut rekeyed = false;
    if let Some(server) = &canonical {
      if server.id != id {
        debug!(%collection, temp = %id, id = %server.id, "server assigned id");
        self.cache.remove_item(collection, id);
        self.pending.rekey(collection, id, &server.id);
        current = server.id.clone();
        rekeyed = true;
      }
    }
    let key = (collection, current.clone());

    if self.pending.has_successors(&key) {
      // The next mutation now rolls back to what the server holds
      let base = match canonical {
        Some(server) => Snapshot::of(self.cache.stamped(collection, server)),
        None => Snapshot::absent(),
      };
      let chain = self.pending.chains.get_mut(&key)?;
      if let Some(next) = chain.front_mut() {
        next.original = base;
      }
      if rekeyed {
        let visible = chain.back().map(|m| m.mutation.optimistic().cloned());
        match visible {
          Some(Some(record)) => self.cache.pin(collection, record),
          Some(None) => {
            self.cache.remove_item(collection, &current);
          }
          None => {}
        }
      }
      return Some(current);
    }

    self.pending.chains.remove(&key);
    let held = self.pending.deferred.remove(&key);
    match canonical {
      Some(server) => {
        let version = server.version;
        let ttl = self.cache.ttl(collection);
        self.cache.add_item(collection, server, ttl);
        if let Some(event) = held.filter(|event| event.version > version) {
          debug!(%collection, id = %current, version = event.version, "applying deferred update");
          self.cache.add_item(collection, event, ttl);
        }
      }
      // Confirmed delete: whatever arrived meanwhile predates it
      None => {
        self.cache.remove_item(collection, &current);
      }
    }
    None
  }

  fn roll_back(&mut self, collection: Collection, id: &str, original: Snapshot) -> Option<String> {
    let key = (collection, id.to_string());

    if self.pending.has_successors(&key) {
      // The successor keeps its intent but inherits the rollback target
      let chain = self.pending.chains.get_mut(&key)?;
      if let Some(next) = chain.front_mut() {
        next.original = original;
      }
      return Some(id.to_string());
    }

    self.pending.chains.remove(&key);
    self.cache.restore(collection, id, &original);
    if let Some(event) = self.pending.deferred.remove(&key) {
      if original.version().map_or(true, |v| event.version > v) {
        debug!(%collection, %id, version = event.version, "applying deferred update");
        let ttl = self.cache.ttl(collection);
        self.cache.add_item(collection, event, ttl);
      }
    }
    None
  }
}

impl Core {
  /// Send the queued remote calls of one chain until it is empty.
  async fn drive(self: Arc<Self>, collection: Collection, mut id: String) {
    loop {
      let head = {
        let state = self.lock();
        state.head_request(collection, &id)
      };
      let Some((pending_id, mutation)) = head else {
        return;
      };

      let result = self.send(collection, mutation).await;

      let next = {
        let mut state = self.lock();
        state.settle(collection, &id, pending_id, result)
      };
      match next {
        Some(next) => id = next,
        None => return,
      }
    }
  }

  async fn send(&self, collection: Collection, mutation: Mutation) -> Outcome {
    match mutation {
      Mutation::Create(record) => self
        .call_remote(self.remote.insert(collection, record))
        .await
        .map(Some),
      Mutation::Update(record) => self
        .call_remote(self.remote.update(collection, record))
        .await
        .map(Some),
      Mutation::Delete(id) => self
        .call_remote(self.remote.delete(collection, &id))
        .await
        .map(|_| None),
    }
  }
}

impl SyncEngine {
  /// Apply a mutation locally and send it to the server.
  ///
  /// The optimistic value is visible to every read issued after this
  /// returns. Must be called from within a tokio runtime.
  pub fn mutate(&self, collection: Collection, mutation: Mutation) -> MutationHandle {
    let (tx, rx) = oneshot::channel();
    let (pending_id, id, start) = self.core.lock().enqueue(collection, mutation, tx);
    self.start_chain(collection, &id, start);
    MutationHandle {
      pending_id,
      collection,
      id,
      rx,
    }
  }

  /// Build a mutation from the current cached value of a record, atomically
  /// with respect to other writers.
  pub fn mutate_with<F>(
    &self,
    collection: Collection,
    id: &str,
    build: F,
  ) -> Result<MutationHandle, SyncError>
  where
    F: FnOnce(&Record) -> Result<Mutation, SyncError>,
  {
    let (tx, rx) = oneshot::channel();
    let (pending_id, id, start) = {
      let mut state = self.core.lock();
      let current = state
        .cache
        .entry(collection, id)
        .map(|entry| entry.record.clone())
        .ok_or_else(|| SyncError::NotFound {
          collection,
          id: id.to_string(),
        })?;
      let mutation = build(&current)?;
      state.enqueue(collection, mutation, tx)
    };
    self.start_chain(collection, &id, start);
    Ok(MutationHandle {
      pending_id,
      collection,
      id,
      rx,
    })
  }

  /// Like or unlike a post: flag and counter change in one update.
  pub fn toggle_like(&self, post_id: &str) -> Result<MutationHandle, SyncError> {
    self.mutate_with(Collection::Posts, post_id, |current| {
      let mut post = Post::from_record(current)?;
      post.toggle_like();
      Ok(Mutation::Update(Record::new(
        current.id.clone(),
        current.version,
        serde_json::to_value(&post).map_err(StorageError::from)?,
      )))
    })
  }

  /// Build several mutations from one view of the cache and apply them
  /// together. Each record keeps its own chain and rollback.
  pub(super) fn mutate_batch<F>(
    &self,
    collection: Collection,
    build: F,
  ) -> Result<Vec<MutationHandle>, SyncError>
  where
    F: FnOnce(&ExpiringCache) -> Result<Vec<Mutation>, SyncError>,
  {
    let mut starts = Vec::new();
    let handles = {
      let mut state = self.core.lock();
      let mutations = build(&state.cache)?;
      mutations
        .into_iter()
        .map(|mutation| {
          let (tx, rx) = oneshot::channel();
          let (pending_id, id, start) = state.enqueue(collection, mutation, tx);
          starts.push((id.clone(), start));
          MutationHandle {
            pending_id,
            collection,
            id,
            rx,
          }
        })
        .collect::<Vec<_>>()
    };
    for (id, start) in &starts {
      self.start_chain(collection, id, *start);
    }
    Ok(handles)
  }

  /// Mutations not yet confirmed or rolled back.
  pub fn pending_mutations(&self) -> usize {
    self.core.lock().pending.len()
  }

  pub fn is_pending(&self, collection: Collection, id: &str) -> bool {
    self.core.lock().pending.is_pending(collection, id)
  }

  fn start_chain(&self, collection: Collection, id: &str, start: bool) {
    if start {
      tokio::spawn(self.core.clone().drive(collection, id.to_string()));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::super::engine::tests::{harness, harness_with, post};
  use super::*;
  use crate::config::Config;
  use crate::error::RemoteError;
  use serde_json::json;
  use std::time::Duration;

  #[tokio::test]
  async fn test_update_is_visible_then_confirmed() {
    let h = harness();
    h.remote.seed(Collection::Posts, vec![post("p1", 1, 0, false)]);
    h.engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);

    let handle = h
      .engine
      .mutate(Collection::Posts, Mutation::Update(post("p1", 1, 5, false)));
    assert_eq!(h.engine.get_one(Collection::Posts, "p1").unwrap().data["likes_count"], 5);
    assert!(h.engine.is_pending(Collection::Posts, "p1"));

    let confirmed = handle.outcome().await.unwrap().unwrap();
    assert_eq!(confirmed.version, 2);
    assert_eq!(h.engine.get_one(Collection::Posts, "p1"), Some(confirmed));
    assert_eq!(h.engine.pending_mutations(), 0);
    let entry = h.engine.core.lock().cache.entry(Collection::Posts, "p1").cloned().unwrap();
    assert!(!entry.is_pinned());
  }

  #[tokio::test]
  async fn test_failed_update_restores_exact_state() {
    let h = harness();
    let records = vec![post("p1", 1, 0, false), post("p2", 1, 3, false), post("p3", 1, 0, false)];
    h.remote.seed(Collection::Posts, records.clone());
    h.engine.set(Collection::Posts, records);
    let before = h.engine.core.lock().cache.entries(Collection::Posts).to_vec();

    h.remote.fail_next(RemoteError::Rejected("row level security".into()));
    let handle = h
      .engine
      .mutate(Collection::Posts, Mutation::Update(post("p2", 1, 4, true)));
    let err = handle.outcome().await.unwrap_err();

    assert_eq!(err, SyncError::MutationRejected("row level security".into()));
    assert_eq!(
      h.engine.core.lock().cache.entries(Collection::Posts),
      before.as_slice()
    );
  }

  #[tokio::test]
  async fn test_failed_delete_puts_record_back_in_place() {
    let h = harness();
    let records = vec![post("p1", 1, 0, false), post("p2", 1, 0, false)];
    h.remote.seed(Collection::Posts, records.clone());
    h.engine.set(Collection::Posts, records);

    h.remote.fail_next(RemoteError::Network("reset".into()));
    let handle = h
      .engine
      .mutate(Collection::Posts, Mutation::Delete("p1".into()));
    assert!(h.engine.get_one(Collection::Posts, "p1").is_none());

    assert!(handle.outcome().await.is_err());
    let ids: Vec<String> = h.engine.get(Collection::Posts).into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["p1", "p2"]);
  }

  #[tokio::test]
  async fn test_create_gets_server_id() {
    let h = harness();
    let handle = h.engine.mutate(
      Collection::Messages,
      Mutation::Create(Record::new("", 0, json!({ "content": "hi", "receiver_id": "u2" }))),
    );
    assert_eq!(handle.id, format!("local-{}", handle.pending_id));
    assert!(h.engine.get_one(Collection::Messages, &handle.id).is_some());
    let temp = handle.id.clone();

    let created = handle.outcome().await.unwrap().unwrap();
    assert_eq!(created.id, "srv-1");
    assert!(h.engine.get_one(Collection::Messages, &temp).is_none());
    assert_eq!(h.engine.get_one(Collection::Messages, "srv-1"), Some(created));
  }

  #[tokio::test]
  async fn test_failed_create_removes_record() {
    let h = harness();
    h.remote.fail_next(RemoteError::Rejected("too long".into()));
    let handle = h.engine.mutate(
      Collection::Messages,
      Mutation::Create(Record::new("", 0, json!({ "content": "hi" }))),
    );
    assert!(handle.outcome().await.is_err());
    assert!(h.engine.get(Collection::Messages).is_empty());
  }

  #[tokio::test]
  async fn test_update_of_unconfirmed_create_follows_server_id() {
    let h = harness();
    let create = h.engine.mutate(
      Collection::Groups,
      Mutation::Create(Record::new("", 0, json!({ "name": "rust" }))),
    );
    let temp = create.id.clone();
    let rename = h.engine.mutate(
      Collection::Groups,
      Mutation::Update(Record::new(temp.clone(), 0, json!({ "id": temp, "name": "rustaceans" }))),
    );

    let created = create.outcome().await.unwrap().unwrap();
    let renamed = rename.outcome().await.unwrap().unwrap();
    assert_eq!(renamed.id, created.id);
    assert_eq!(h.remote.rows(Collection::Groups)[0].data["name"], "rustaceans");
    assert_eq!(h.engine.get(Collection::Groups), vec![renamed]);
  }

  #[tokio::test]
  async fn test_queued_mutations_are_sent_in_order() {
    let h = harness();
    h.remote.seed(Collection::Posts, vec![post("p1", 1, 0, false)]);
    h.engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);

    let first = h
      .engine
      .mutate(Collection::Posts, Mutation::Update(post("p1", 1, 1, false)));
    let second = h
      .engine
      .mutate(Collection::Posts, Mutation::Update(post("p1", 1, 2, false)));
    assert_eq!(h.engine.pending_mutations(), 2);
    assert_eq!(h.engine.get_one(Collection::Posts, "p1").unwrap().data["likes_count"], 2);

    first.outcome().await.unwrap();
    // The earlier confirmation must not clobber the newer optimistic value
    assert_eq!(h.engine.get_one(Collection::Posts, "p1").unwrap().data["likes_count"], 2);
    second.outcome().await.unwrap();

    assert_eq!(h.remote.stats().updates, 2);
    assert_eq!(h.remote.rows(Collection::Posts)[0].data["likes_count"], 2);
    assert_eq!(h.engine.get_one(Collection::Posts, "p1").unwrap().version, 3);
  }

  #[tokio::test]
  async fn test_failed_head_rebases_successor() {
    let h = harness();
    h.remote.seed(Collection::Posts, vec![post("p1", 1, 0, false)]);
    h.engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);
    let before = h.engine.core.lock().cache.snapshot(Collection::Posts, "p1");

    h.remote.fail_next(RemoteError::Network("reset".into()));
    h.remote.fail_next(RemoteError::Network("reset".into()));
    let first = h
      .engine
      .mutate(Collection::Posts, Mutation::Update(post("p1", 1, 1, false)));
    let second = h
      .engine
      .mutate(Collection::Posts, Mutation::Update(post("p1", 1, 2, false)));

    assert!(first.outcome().await.is_err());
    // Successor still visible while its own call is pending or resolving
    assert!(second.outcome().await.is_err());
    assert_eq!(h.engine.core.lock().cache.snapshot(Collection::Posts, "p1"), before);
  }

  #[tokio::test]
  async fn test_timeout_rolls_back() {
    let config = Config {
      remote_timeout_ms: 20,
      ..Config::default()
    };
    let h = harness_with(config);
    h.remote.seed(Collection::Posts, vec![post("p1", 1, 0, false)]);
    h.engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);
    h.remote.set_latency(Duration::from_millis(500));

    let handle = h.engine.toggle_like("p1").unwrap();
    assert_eq!(
      handle.outcome().await.unwrap_err(),
      SyncError::Timeout(Duration::from_millis(20))
    );
    let post = h.engine.get_one(Collection::Posts, "p1").unwrap();
    assert_eq!(post.data["is_liked"], false);
    assert_eq!(post.data["likes_count"], 0);
  }

  #[tokio::test]
  async fn test_toggle_like_unknown_post() {
    let h = harness();
    assert!(matches!(
      h.engine.toggle_like("missing"),
      Err(SyncError::NotFound { .. })
    ));
  }

  #[tokio::test]
  async fn test_confirmed_delete_drops_rows_landed_meanwhile() {
    let h = harness();
    h.remote.seed(Collection::Posts, vec![post("p1", 1, 0, false)]);
    h.engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);

    h.remote.set_latency(Duration::from_millis(30));
    let handle = h
      .engine
      .mutate(Collection::Posts, Mutation::Delete("p1".into()));
    {
      let mut state = h.engine.core.lock();
      let ttl = state.cache.ttl(Collection::Posts);
      state.cache.add_item(Collection::Posts, post("p1", 1, 0, false), ttl);
    }
    assert!(h.engine.get_one(Collection::Posts, "p1").is_some());

    assert_eq!(handle.outcome().await.unwrap(), None);
    assert!(h.engine.get_one(Collection::Posts, "p1").is_none());
    assert!(h.remote.rows(Collection::Posts).is_empty());
  }

  #[test]
  fn test_cancel_answers_every_caller() {
    let mut tracker = MutationTracker::default();
    let (tx, mut rx) = oneshot::channel();
    tracker.chains.entry((Collection::Posts, "p1".into())).or_default().push_back(
      PendingMutation {
        pending_id: 1,
        mutation: Mutation::Delete("p1".into()),
        original: Snapshot::absent(),
        responder: Some(tx),
      },
    );
    tracker.defer(Collection::Posts, post("p1", 4, 0, false));

    assert_eq!(tracker.cancel(Collection::Posts, "p1"), 1);
    assert_eq!(rx.try_recv().unwrap(), Ok(None));
    assert!(tracker.deferred.is_empty());
  }

  #[test]
  fn test_defer_keeps_highest_version() {
    let mut tracker = MutationTracker::default();
    tracker.defer(Collection::Posts, post("p1", 5, 0, false));
    tracker.defer(Collection::Posts, post("p1", 3, 0, false));
    let held = &tracker.deferred[&(Collection::Posts, "p1".to_string())];
    assert_eq!(held.version, 5);
  }
}
