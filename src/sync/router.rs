//! Real-time change events.
//!
//! One transport connection feeds every subscription. Each event is
//! reconciled into the cache once, then fanned out to the handles whose
//! collection and filter match it.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::engine::{Core, EngineState, SyncEngine};
use crate::error::SyncError;
use crate::record::{ChangeEvent, ChangeKind, Collection, Filter, Record};
use crate::remote::{RemoteSource, TransportSignal};

const CHANNEL_CAPACITY: usize = 64;

struct Channel {
  collection: Collection,
  filter: Option<Filter>,
  refs: usize,
  sender: broadcast::Sender<ChangeEvent>,
}

impl Channel {
  /// `record` is `None` for a delete of a record we never cached.
  fn wants(&self, record: Option<&Record>) -> bool {
    match (&self.filter, record) {
      (None, _) => true,
      (Some(filter), Some(record)) => filter.matches(record),
      (Some(_), None) => true,
    }
  }
}

/// Open channels keyed by collection and filter.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
  channels: HashMap<String, Channel>,
}

impl SubscriptionRegistry {
  pub(crate) fn refs(&self, collection: Collection, filter: Option<&Filter>) -> usize {
    self
      .channels
      .get(&channel_key(collection, filter))
      .map_or(0, |channel| channel.refs)
  }

  /// Collections with at least one open channel.
  pub(crate) fn collections(&self) -> Vec<Collection> {
    let mut collections: Vec<Collection> = self.channels.values().map(|c| c.collection).collect();
    collections.sort();
    collections.dedup();
    collections
  }

  fn fan_out(&self, event: &ChangeEvent, record: Option<&Record>) -> usize {
    let mut delivered = 0;
    for channel in self.channels.values() {
      if channel.collection == event.collection && channel.wants(record) {
        // A handle may be mid-drop; nothing to deliver to then
        if channel.sender.send(event.clone()).is_ok() {
          delivered += 1;
        }
      }
    }
    delivered
  }
}

fn channel_key(collection: Collection, filter: Option<&Filter>) -> String {
  match filter {
    Some(filter) => format!("{}:{}", collection, filter.describe()),
    None => format!("{}:*", collection),
  }
}

/// Interest in the change events of one collection (and filter).
///
/// Handles for the same collection and filter share one server-side
/// channel; dropping the last one closes it.
pub struct SubscriptionHandle {
  core: Arc<Core>,
  key: String,
  collection: Collection,
  filter: Option<Filter>,
  receiver: broadcast::Receiver<ChangeEvent>,
}

impl SubscriptionHandle {
  pub fn collection(&self) -> Collection {
    self.collection
  }

  pub fn filter(&self) -> Option<&Filter> {
    self.filter.as_ref()
  }

  /// `Err(TransportDropped)` while the real-time transport is down and
  /// events for this handle may be lost.
  pub fn health(&self) -> Result<(), SyncError> {
    if self.core.lock().transport_degraded {
      Err(SyncError::TransportDropped)
    } else {
      Ok(())
    }
  }

  /// Next reconciled event. Events missed because this handle fell behind
  /// are skipped with a warning; callers should refetch if they care.
  pub async fn recv(&mut self) -> Option<ChangeEvent> {
    loop {
      match self.receiver.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          warn!(channel = %self.key, missed, "subscriber lagged, events skipped");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Next event if one is already queued.
  pub fn try_recv(&mut self) -> Option<ChangeEvent> {
    loop {
      match self.receiver.try_recv() {
        Ok(event) => return Some(event),
        Err(broadcast::error::TryRecvError::Lagged(missed)) => {
          warn!(channel = %self.key, missed, "subscriber lagged, events skipped");
        }
        Err(_) => return None,
      }
    }
  }
}

impl Drop for SubscriptionHandle {
  fn drop(&mut self) {
    self.core.release(&self.key);
  }
}

enum Reconciled {
  Applied,
  Deferred,
  Ignored,
}

impl EngineState {
  fn reconcile(&mut self, event: &ChangeEvent) -> Reconciled {
    let collection = event.collection;
    let record = &event.record;

    match event.kind {
      ChangeKind::Insert => {
        if self.pending.is_pending(collection, &record.id) {
          debug!(%collection, id = %record.id, "insert deferred behind pending mutation");
          self.pending.defer(collection, record.clone());
          return Reconciled::Deferred;
        }
        if self.cache.get_one(collection, &record.id).is_some() {
          debug!(%collection, id = %record.id, "insert of known record ignored");
          return Reconciled::Ignored;
        }
        let ttl = self.cache.ttl(collection);
        self.cache.add_item(collection, record.clone(), ttl);
        Reconciled::Applied
      }
      ChangeKind::Update => {
        if self.pending.is_pending(collection, &record.id) {
          debug!(%collection, id = %record.id, version = record.version, "update deferred behind pending mutation");
          self.pending.defer(collection, record.clone());
          return Reconciled::Deferred;
        }
        if let Some(cached) = self.cache.entry(collection, &record.id) {
          if cached.record.version > record.version {
            debug!(
              %collection,
              id = %record.id,
              cached = cached.record.version,
              incoming = record.version,
              "older update discarded by last-write-wins"
            );
            return Reconciled::Ignored;
          }
        }
        let ttl = self.cache.ttl(collection);
        self.cache.add_item(collection, record.clone(), ttl);
        Reconciled::Applied
      }
      ChangeKind::Delete => {
        let cancelled = self.pending.cancel(collection, &record.id);
        if cancelled > 0 {
          info!(%collection, id = %record.id, cancelled, "record deleted remotely, pending mutations dropped");
        }
        self.cache.remove_item(collection, &record.id);
        Reconciled::Applied
      }
    }
  }
}

impl Core {
  /// Reconcile one event and notify matching subscribers.
  pub(super) fn route(&self, event: ChangeEvent) {
    let mut state = self.lock();
    let prior = state
      .cache
      .entry(event.collection, &event.record.id)
      .map(|entry| entry.record.clone());

    let outcome = state.reconcile(&event);
    match outcome {
      Reconciled::Applied | Reconciled::Deferred => {
        let record = match event.kind {
          ChangeKind::Delete => prior.as_ref(),
          _ => Some(&event.record),
        };
        state.subscriptions.fan_out(&event, record);
      }
      Reconciled::Ignored => {}
    }
  }

  fn release(&self, key: &str) {
    let mut state = self.lock();
    let Some(channel) = state.subscriptions.channels.get_mut(key) else {
      return;
    };
    channel.refs = channel.refs.saturating_sub(1);
    if channel.refs > 0 {
      return;
    }

    if let Some(channel) = state.subscriptions.channels.remove(key) {
      self.remote.unlisten(channel.collection, channel.filter.as_ref());
      info!(channel = %key, "channel closed");
    }
  }

  fn transport_dropped(&self) {
    self.lock().transport_degraded = true;
    warn!("real-time transport dropped, events may be missed until reconnect");
  }

  /// Events sent while disconnected are lost, so refetch what is on screen.
  fn transport_reconnected(self: &Arc<Self>) {
    self.lock().transport_degraded = false;
    info!("real-time transport reconnected, refreshing active queries");

    let core = Arc::clone(self);
    tokio::spawn(async move {
      core.refresh_active().await;
    });
  }
}

/// Feed transport signals into the engine until it is dropped.
async fn pump(engine: Weak<Core>, remote: Arc<dyn RemoteSource>, backoff: Duration) {
  let mut reconnecting = false;
  loop {
    let mut signals = remote.changes();
    if reconnecting {
      let Some(core) = engine.upgrade() else {
        return;
      };
      core.transport_reconnected();
    }

    while let Some(signal) = signals.next().await {
      let Some(core) = engine.upgrade() else {
        return;
      };
      match signal {
        TransportSignal::Change(event) => core.route(event),
        TransportSignal::Dropped => core.transport_dropped(),
        TransportSignal::Reconnected => core.transport_reconnected(),
      }
    }

    match engine.upgrade() {
      Some(core) => core.transport_dropped(),
      None => return,
    }
    warn!(?backoff, "transport stream ended, reconnecting");
    tokio::time::sleep(backoff).await;
    reconnecting = true;
  }
}

impl SyncEngine {
  /// Start consuming the real-time transport. Calling it again restarts
  /// the consumer.
  pub fn start(&self) {
    let task = tokio::spawn(pump(
      Arc::downgrade(&self.core),
      self.core.remote.clone(),
      self.core.settings.reconnect_backoff,
    ));
    let previous = self
      .core
      .pump
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(task);
    if let Some(previous) = previous {
      previous.abort();
    }
  }

  /// Stop consuming the transport. Open subscriptions stay registered.
  pub fn shutdown(&self) {
    let task = self
      .core
      .pump
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(task) = task {
      task.abort();
    }
  }

  /// Register interest in a collection, optionally narrowed by a filter.
  pub fn subscribe(
    &self,
    collection: Collection,
    filter: Option<Filter>,
  ) -> Result<SubscriptionHandle, SyncError> {
    let key = channel_key(collection, filter.as_ref());
    let mut state = self.core.lock();

    let receiver = match state.subscriptions.channels.get_mut(&key) {
      Some(channel) => {
        channel.refs += 1;
        channel.sender.subscribe()
      }
      None => {
        self.core.remote.listen(collection, filter.as_ref())?;
        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        state.subscriptions.channels.insert(
          key.clone(),
          Channel {
            collection,
            filter: filter.clone(),
            refs: 1,
            sender,
          },
        );
        info!(channel = %key, "channel opened");
        receiver
      }
    };
    drop(state);

    Ok(SubscriptionHandle {
      core: self.core.clone(),
      key,
      collection,
      filter,
      receiver,
    })
  }

  /// Handles currently open for a collection and filter.
  pub fn active_subscriptions(&self, collection: Collection, filter: Option<&Filter>) -> usize {
    self.core.lock().subscriptions.refs(collection, filter)
  }
}

#[cfg(test)]
mod tests {
  use super::super::engine::tests::{harness, post};
  use super::super::tracker::Mutation;
  use super::*;
  use serde_json::json;

  fn message(id: &str, receiver: &str) -> Record {
    Record::new(id, 1, json!({ "id": id, "receiver_id": receiver, "content": "hey" }))
  }

  #[tokio::test]
  async fn test_insert_only_if_absent() {
    let h = harness();
    h.engine.set(Collection::Posts, vec![post("p1", 5, 0, false)]);

    h.engine.core.route(ChangeEvent::insert(Collection::Posts, post("p1", 1, 9, false)));
    h.engine.core.route(ChangeEvent::insert(Collection::Posts, post("p2", 1, 0, false)));

    assert_eq!(h.engine.get_one(Collection::Posts, "p1").unwrap().version, 5);
    assert!(h.engine.get_one(Collection::Posts, "p2").is_some());
  }

  #[tokio::test]
  async fn test_insert_during_pending_delete_is_held() {
    let h = harness();
    h.remote.seed(Collection::Posts, vec![post("p1", 1, 0, false)]);
    h.engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);

    h.remote.set_latency(Duration::from_millis(30));
    let handle = h
      .engine
      .mutate(Collection::Posts, Mutation::Delete("p1".into()));
    h.engine.core.route(ChangeEvent::insert(Collection::Posts, post("p1", 1, 0, false)));
    assert!(h.engine.get_one(Collection::Posts, "p1").is_none());

    assert_eq!(handle.outcome().await.unwrap(), None);
    assert!(h.engine.get_one(Collection::Posts, "p1").is_none());
  }

  #[tokio::test]
  async fn test_update_last_write_wins() {
    let h = harness();
    h.engine.core.route(ChangeEvent::update(Collection::Posts, post("p1", 3, 3, false)));
    h.engine.core.route(ChangeEvent::update(Collection::Posts, post("p1", 2, 2, false)));

    let p1 = h.engine.get_one(Collection::Posts, "p1").unwrap();
    assert_eq!(p1.version, 3);
    assert_eq!(p1.data["likes_count"], 3);
  }

  #[tokio::test]
  async fn test_delete_wins_over_pending_mutation() {
    let h = harness();
    h.remote.seed(Collection::Posts, vec![post("p1", 1, 0, false)]);
    h.engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);

    let handle = h
      .engine
      .mutate(Collection::Posts, Mutation::Update(post("p1", 1, 1, true)));
    h.engine.core.route(ChangeEvent::delete(Collection::Posts, "p1"));

    assert_eq!(handle.outcome().await, Ok(None));
    assert!(h.engine.get_one(Collection::Posts, "p1").is_none());
    // Let the abandoned remote call come back
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.engine.get_one(Collection::Posts, "p1").is_none());
    assert_eq!(h.engine.pending_mutations(), 0);
  }

  #[tokio::test]
  async fn test_update_deferred_until_mutation_resolves() {
    let h = harness();
    h.remote.seed(Collection::Posts, vec![post("p1", 1, 0, false)]);
    h.engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);

    h.remote.fail_next(crate::error::RemoteError::Network("reset".into()));
    let handle = h
      .engine
      .mutate(Collection::Posts, Mutation::Update(post("p1", 1, 1, true)));
    h.engine.core.route(ChangeEvent::update(Collection::Posts, post("p1", 5, 7, false)));
    // Still the optimistic value
    assert_eq!(h.engine.get_one(Collection::Posts, "p1").unwrap().data["likes_count"], 1);

    assert!(handle.outcome().await.is_err());
    let p1 = h.engine.get_one(Collection::Posts, "p1").unwrap();
    assert_eq!(p1.version, 5);
    assert_eq!(p1.data["likes_count"], 7);
  }

  #[tokio::test]
  async fn test_subscriptions_share_one_channel() {
    let h = harness();
    let filter = Filter::equals("receiver_id", "u1");

    let first = h
      .engine
      .subscribe(Collection::Messages, Some(filter.clone()))
      .unwrap();
    let second = h
      .engine
      .subscribe(Collection::Messages, Some(filter.clone()))
      .unwrap();
    assert_eq!(h.remote.listeners(Collection::Messages, Some(&filter)), 1);
    assert_eq!(h.engine.active_subscriptions(Collection::Messages, Some(&filter)), 2);

    drop(first);
    assert_eq!(h.remote.listeners(Collection::Messages, Some(&filter)), 1);
    drop(second);
    assert_eq!(h.remote.listeners(Collection::Messages, Some(&filter)), 0);
    assert_eq!(h.engine.active_subscriptions(Collection::Messages, Some(&filter)), 0);
  }

  #[tokio::test]
  async fn test_events_fan_out_by_filter() {
    let h = harness();
    let mut mine = h
      .engine
      .subscribe(Collection::Messages, Some(Filter::equals("receiver_id", "u1")))
      .unwrap();
    let mut theirs = h
      .engine
      .subscribe(Collection::Messages, Some(Filter::equals("receiver_id", "u2")))
      .unwrap();
    let mut everything = h.engine.subscribe(Collection::Messages, None).unwrap();
    let mut posts = h.engine.subscribe(Collection::Posts, None).unwrap();

    h.engine.core.route(ChangeEvent::insert(Collection::Messages, message("m1", "u1")));

    assert_eq!(mine.try_recv().unwrap().record.id, "m1");
    assert!(theirs.try_recv().is_none());
    assert_eq!(everything.recv().await.unwrap().record.id, "m1");
    assert!(posts.try_recv().is_none());

    // Delete is matched against the record it removes
    h.engine.core.route(ChangeEvent::delete(Collection::Messages, "m1"));
    assert_eq!(mine.try_recv().unwrap().kind, ChangeKind::Delete);
    assert!(theirs.try_recv().is_none());
  }

  #[tokio::test]
  async fn test_listen_failure_is_surfaced() {
    let h = harness();
    h.remote.set_offline(true);
    assert!(matches!(
      h.engine.subscribe(Collection::Groups, None),
      Err(SyncError::Remote(_))
    ));
    assert_eq!(h.engine.active_subscriptions(Collection::Groups, None), 0);
  }

  #[tokio::test]
  async fn test_pump_applies_pushed_changes() {
    let h = harness();
    h.engine.start();
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.remote.external_update(Collection::Profiles, Record::new("u1", 0, json!({ "id": "u1" })));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.engine.get_one(Collection::Profiles, "u1").is_some());

    h.remote.drop_transport();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.engine.transport_degraded());

    h.remote.reconnect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!h.engine.transport_degraded());
    h.engine.shutdown();
  }

  #[tokio::test]
  async fn test_handle_reports_dropped_transport() {
    let h = harness();
    let feed = h.engine.subscribe(Collection::Posts, None).unwrap();
    h.engine.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(feed.health(), Ok(()));

    h.remote.drop_transport();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(feed.health(), Err(SyncError::TransportDropped));

    h.remote.reconnect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(feed.health(), Ok(()));
    h.engine.shutdown();
  }
}
