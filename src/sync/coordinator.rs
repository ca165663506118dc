//! Cache-then-network loading.
//!
//! Each (collection, query) pair has a small state machine:
//!
//! ```text
//! Idle -> Loading -> Ready
//!                 \-> Failed
//! Ready -> Refreshing -> Ready          (success)
//!                     \-> Ready(stale)  (error)
//! ```
//!
//! Every request bumps the query's generation. A result only updates the
//! state if it belongs to the latest generation, and only reaches the cache
//! if nothing newer landed first.

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::engine::{Core, EngineState, SyncEngine};
use crate::cache::CacheResult;
use crate::error::SyncError;
use crate::record::{Collection, Query, Record};

/// Loading state of one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
  /// Never requested
  Idle,
  /// First load in progress, nothing cached
  Loading,
  /// Cached result available; `stale` after a failed background refresh
  Ready { stale: bool },
  /// Cached result shown while a refresh runs
  Refreshing,
  /// Last load failed
  Failed(String),
}

impl FetchState {
  pub fn is_in_flight(&self) -> bool {
    matches!(self, Self::Loading | Self::Refreshing)
  }
}

struct QuerySlot {
  collection: Collection,
  query: Query,
  state: FetchState,
  /// Bumped by every request.
  generation: u64,
  /// Generation whose result is in the cache.
  landed: u64,
  /// Results of this generation or older are dropped.
  cancelled: u64,
}

/// Queries requested during this session.
#[derive(Default)]
pub(crate) struct QueryRegistry {
  slots: HashMap<String, QuerySlot>,
}

impl QueryRegistry {
  fn slot(&mut self, collection: Collection, query: &Query) -> &mut QuerySlot {
    self
      .slots
      .entry(query.cache_key(collection))
      .or_insert_with(|| QuerySlot {
        collection,
        query: query.clone(),
        state: FetchState::Idle,
        generation: 0,
        landed: 0,
        cancelled: 0,
      })
  }

  fn state(&self, collection: Collection, query: &Query) -> FetchState {
    self
      .slots
      .get(&query.cache_key(collection))
      .map_or(FetchState::Idle, |slot| slot.state.clone())
  }

  /// Move every idle query of `collections` to `Refreshing`.
  fn start_refresh(&mut self, collections: &[Collection]) -> Vec<(Collection, Query, u64)> {
    let mut started = Vec::new();
    for slot in self.slots.values_mut() {
      if !collections.contains(&slot.collection) || slot.state.is_in_flight() {
        continue;
      }
      slot.generation += 1;
      slot.state = FetchState::Refreshing;
      started.push((slot.collection, slot.query.clone(), slot.generation));
    }
    started
  }
}

enum Plan {
  Serve(CacheResult<Vec<Record>>),
  ServeAndRefresh(CacheResult<Vec<Record>>, u64),
  Network(u64),
}

impl EngineState {
  fn plan_fetch(
    &mut self,
    collection: Collection,
    query: &Query,
    stale_fraction: Option<f64>,
  ) -> Plan {
    let now = self.cache.now();

    if let Some(hit) = self.cache.get_query(collection, query) {
      let age = (now - hit.fetched_at).to_std().unwrap_or_default();
      let aging = stale_fraction.is_some_and(|f| age >= self.cache.ttl(collection).mul_f64(f));
      let result = CacheResult::from_cache(hit.records, hit.fetched_at, false);

      let slot = self.queries.slot(collection, query);
      if slot.state.is_in_flight() {
        return Plan::Serve(result);
      }
      if aging && self.online {
        slot.generation += 1;
        slot.state = FetchState::Refreshing;
        debug!(%collection, age_secs = age.as_secs(), "cached result aging, refreshing in background");
        return Plan::ServeAndRefresh(result, slot.generation);
      }
      slot.state = FetchState::Ready { stale: false };
      return Plan::Serve(result);
    }

    if !self.online {
      let result = match self.cache.last_known_query(collection, query) {
        Some(hit) => CacheResult::offline(hit.records, Some(hit.fetched_at)),
        None => CacheResult::offline(Vec::new(), None),
      };
      return Plan::Serve(result);
    }

    let slot = self.queries.slot(collection, query);
    slot.generation += 1;
    slot.state = FetchState::Loading;
    Plan::Network(slot.generation)
  }

  /// Apply the result of one request.
  fn land(
    &mut self,
    collection: Collection,
    query: &Query,
    generation: u64,
    result: Result<Vec<Record>, SyncError>,
  ) -> Result<Vec<Record>, SyncError> {
    let slot = self.queries.slot(collection, query);
    let abandoned = generation <= slot.cancelled;
    let current = !abandoned && generation == slot.generation;

    match result {
      Ok(records) => {
        let fallback = records.clone();
        if abandoned || generation <= slot.landed {
          debug!(%collection, generation, "discarding outdated fetch result");
        } else {
          slot.landed = generation;
          if current {
            slot.state = FetchState::Ready { stale: false };
          }
          let held = self.hold_pending(collection, &records);
          let ttl = self.cache.ttl(collection);
          self
            .cache
            .put_query_holding(collection, query, records, ttl, &held);
        }

        if !current {
          return Err(SyncError::Superseded);
        }
        // Read back so kept optimistic records are included
        Ok(
          self
            .cache
            .get_query(collection, query)
            .map(|hit| hit.records)
            .unwrap_or(fallback),
        )
      }
      Err(err) => {
        if !current {
          return Err(SyncError::Superseded);
        }
        warn!(%collection, query = %query.description(collection), error = %err, "fetch failed");
        slot.state = match slot.state {
          FetchState::Refreshing => FetchState::Ready { stale: true },
          _ => FetchState::Failed(err.to_string()),
        };
        Err(err)
      }
    }
  }

  /// Ids of fetched records with a mutation in flight. Their server rows
  /// wait in the tracker like update events so the optimistic value (or
  /// optimistic absence) stays visible.
  fn hold_pending(&mut self, collection: Collection, records: &[Record]) -> HashSet<String> {
    let mut held = HashSet::new();
    for record in records {
      if self.pending.is_pending(collection, &record.id) {
        debug!(%collection, id = %record.id, version = record.version, "fetched row deferred behind pending mutation");
        self.pending.defer(collection, record.clone());
        held.insert(record.id.clone());
      }
    }
    held
  }

  /// Stale-serve after a failed load.
  fn fallback(&self, collection: Collection, query: &Query, err: SyncError) -> CacheResult<Vec<Record>> {
    match self.cache.last_known_query(collection, query) {
      Some(hit) => CacheResult::stale(hit.records, hit.fetched_at, err),
      None => CacheResult::unavailable(Vec::new(), err),
    }
  }
}

impl Core {
  async fn run_fetch(
    &self,
    collection: Collection,
    query: &Query,
    generation: u64,
  ) -> Result<Vec<Record>, SyncError> {
    let result = match &query.procedure {
      Some(call) => self.call_remote(self.remote.call(&call.name, &call.args)).await,
      None => self.call_remote(self.remote.select(collection, query)).await,
    };
    self.lock().land(collection, query, generation, result)
  }

  /// Refresh every query of every collection with an open subscription.
  /// Returns how many refreshes succeeded.
  pub(super) async fn refresh_active(&self) -> usize {
    let targets = {
      let mut state = self.lock();
      if !state.online {
        return 0;
      }
      let collections = state.subscriptions.collections();
      state.queries.start_refresh(&collections)
    };
    if targets.is_empty() {
      return 0;
    }

    info!(count = targets.len(), "refreshing active queries");
    let results = join_all(
      targets
        .iter()
        .map(|(collection, query, generation)| self.run_fetch(*collection, query, *generation)),
    )
    .await;
    results.iter().filter(|result| result.is_ok()).count()
  }
}

impl SyncEngine {
  /// Cache-then-network read of a query.
  ///
  /// A fresh cached result is returned at once, with a background refresh
  /// once it is older than the staleness threshold. Otherwise the remote
  /// source is asked; if that fails the last known result (or nothing) is
  /// returned with the error attached. The only `Err` is
  /// [`SyncError::Superseded`], when a newer request for the same query or
  /// a [`cancel`](Self::cancel) overtook this one.
  pub async fn fetch(
    &self,
    collection: Collection,
    query: Query,
  ) -> Result<CacheResult<Vec<Record>>, SyncError> {
    let plan = {
      let mut state = self.core.lock();
      state.plan_fetch(collection, &query, self.core.settings.stale_fraction)
    };

    match plan {
      Plan::Serve(result) => Ok(result),
      Plan::ServeAndRefresh(result, generation) => {
        let core = self.core.clone();
        tokio::spawn(async move {
          // Failures are logged and recorded in the query state
          let _ = core.run_fetch(collection, &query, generation).await;
        });
        Ok(result)
      }
      Plan::Network(generation) => {
        match self.core.run_fetch(collection, &query, generation).await {
          Ok(records) => Ok(CacheResult::from_network(records)),
          Err(SyncError::Superseded) => Err(SyncError::Superseded),
          Err(err) => Ok(self.core.lock().fallback(collection, &query, err)),
        }
      }
    }
  }

  /// Abandon in-flight work for a query. Its callers get
  /// [`SyncError::Superseded`] and its result is not cached.
  pub fn cancel(&self, collection: Collection, query: &Query) {
    let mut state = self.core.lock();
    let has_data = state.cache.last_known_query(collection, query).is_some();
    let slot = state.queries.slot(collection, query);
    if !slot.state.is_in_flight() {
      return;
    }

    slot.cancelled = slot.generation;
    slot.state = if has_data {
      FetchState::Ready { stale: false }
    } else {
      FetchState::Idle
    };
    debug!(%collection, generation = slot.generation, "fetch cancelled");
  }

  /// Cache-then-network read of a single record.
  pub async fn fetch_one(
    &self,
    collection: Collection,
    id: &str,
  ) -> Result<CacheResult<Option<Record>>, SyncError> {
    let cached = {
      let state = self.core.lock();
      let now = state.cache.now();
      let cached = state.cache.entry(collection, id).cloned();
      if let Some(entry) = cached.as_ref().filter(|e| e.is_fresh(now)) {
        return Ok(CacheResult::from_cache(
          Some(entry.record.clone()),
          entry.written_at,
          false,
        ));
      }
      if !state.online {
        let written_at = cached.as_ref().map(|e| e.written_at);
        return Ok(CacheResult::offline(cached.map(|e| e.record), written_at));
      }
      cached
    };

    let query = Query::by_id(id);
    let result = self
      .core
      .call_remote(self.core.remote.select(collection, &query))
      .await;

    let mut state = self.core.lock();
    match result {
      Ok(records) => match records.into_iter().find(|r| r.id == id) {
        Some(record) if state.pending.is_pending(collection, id) => {
          state.pending.defer(collection, record);
          let local = state.cache.entry(collection, id).cloned();
          Ok(match local {
            Some(entry) => CacheResult::from_cache(Some(entry.record), entry.written_at, false),
            // Deleted locally, the delete is still in flight
            None => CacheResult::from_network(None),
          })
        }
        Some(record) => {
          let ttl = state.cache.ttl(collection);
          state.cache.add_item(collection, record.clone(), ttl);
          Ok(CacheResult::from_network(Some(record)))
        }
        None => {
          if !state.pending.is_pending(collection, id) {
            state.cache.remove_item(collection, id);
          }
          Err(SyncError::NotFound {
            collection,
            id: id.to_string(),
          })
        }
      },
      Err(err) => {
        warn!(%collection, %id, error = %err, "record fetch failed");
        Ok(match cached {
          Some(entry) => CacheResult::stale(Some(entry.record), entry.written_at, err),
          None => CacheResult::unavailable(None, err),
        })
      }
    }
  }

  /// Force one refresh of every query of every subscribed collection.
  pub async fn refresh_active(&self) -> usize {
    self.core.refresh_active().await
  }

  /// Switch offline mode. Coming back online refreshes active queries.
  pub async fn set_online(&self, online: bool) {
    let came_online = {
      let mut state = self.core.lock();
      let was_online = state.online;
      state.online = online;
      online && !was_online
    };

    info!(online, "connectivity changed");
    if came_online {
      self.core.refresh_active().await;
    }
  }

  pub fn state(&self, collection: Collection, query: &Query) -> FetchState {
    self.core.lock().queries.state(collection, query)
  }
}

#[cfg(test)]
mod tests {
  use super::super::engine::tests::{harness, harness_with, post};
  use super::super::tracker::Mutation;
  use super::*;
  use crate::cache::CacheSource;
  use crate::config::Config;
  use crate::error::RemoteError;
  use serde_json::json;
  use std::time::Duration;

  fn refreshing_harness() -> super::super::engine::tests::Harness {
    harness_with(Config {
      stale_fraction: Some(0.5),
      ..Config::default()
    })
  }

  fn seed_posts(h: &super::super::engine::tests::Harness, count: usize) {
    let posts = (1..=count)
      .map(|i| post(&format!("p{}", i), i as i64, 0, false))
      .collect();
    h.remote.seed(Collection::Posts, posts);
  }

  #[tokio::test]
  async fn test_miss_then_fresh_hit() {
    let h = harness();
    seed_posts(&h, 3);
    let query = Query::all().limit(2);

    let first = h.engine.fetch(Collection::Posts, query.clone()).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.data.len(), 2);
    assert_eq!(h.engine.state(Collection::Posts, &query), FetchState::Ready { stale: false });

    let second = h.engine.fetch(Collection::Posts, query).await.unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data, first.data);
    assert_eq!(h.remote.stats().selects, 1);
  }

  #[tokio::test]
  async fn test_aging_hit_refreshes_in_background() {
    let h = refreshing_harness();
    seed_posts(&h, 1);
    h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();

    h.clock.advance(Duration::from_secs(151));
    let hit = h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();
    assert_eq!(hit.source, CacheSource::CacheFresh);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.remote.stats().selects, 2);
    assert_eq!(
      h.engine.state(Collection::Posts, &Query::all()),
      FetchState::Ready { stale: false }
    );
  }

  #[tokio::test]
  async fn test_failed_background_refresh_marks_stale() {
    let h = refreshing_harness();
    seed_posts(&h, 1);
    h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();

    h.clock.advance(Duration::from_secs(200));
    h.remote.fail_next(RemoteError::Network("reset".into()));
    h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
      h.engine.state(Collection::Posts, &Query::all()),
      FetchState::Ready { stale: true }
    );
  }

  #[tokio::test]
  async fn test_fresh_hit_without_stale_fraction_stays_local() {
    let h = harness();
    seed_posts(&h, 1);
    h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();

    h.clock.advance(Duration::from_secs(240));
    let hit = h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();
    assert_eq!(hit.source, CacheSource::CacheFresh);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.remote.stats().selects, 1);
  }

  #[tokio::test]
  async fn test_fetch_during_pending_update_keeps_local_value() {
    let h = harness();
    h.remote.seed(Collection::Posts, vec![post("p1", 1, 4, false), post("p2", 1, 0, false)]);
    h.engine.set(Collection::Posts, vec![post("p1", 1, 4, false)]);

    h.remote.set_latency(Duration::from_millis(100));
    let handle = h
      .engine
      .mutate(Collection::Posts, Mutation::Update(post("p1", 1, 5, true)));
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.remote.set_latency(Duration::ZERO);

    let result = h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();
    let p1 = result.data.iter().find(|r| r.id == "p1").unwrap();
    assert_eq!(p1.data["likes_count"], 5);
    assert_eq!(result.data.len(), 2);
    assert_eq!(h.engine.get_one(Collection::Posts, "p1").unwrap().data["likes_count"], 5);

    handle.outcome().await.unwrap();
    assert_eq!(h.engine.get_one(Collection::Posts, "p1").unwrap().data["likes_count"], 5);
  }

  #[tokio::test]
  async fn test_fetch_during_pending_delete_does_not_resurrect() {
    let h = harness();
    seed_posts(&h, 2);
    h.engine.set(Collection::Posts, vec![post("p1", 1, 0, false)]);

    h.remote.set_latency(Duration::from_millis(100));
    let handle = h
      .engine
      .mutate(Collection::Posts, Mutation::Delete("p1".into()));
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.remote.set_latency(Duration::ZERO);

    let result = h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();
    assert!(result.data.iter().all(|r| r.id != "p1"));
    assert!(h.engine.get_one(Collection::Posts, "p1").is_none());

    let single = h.engine.fetch_one(Collection::Posts, "p1").await.unwrap();
    assert!(single.data.is_none());
    assert!(h.engine.get_one(Collection::Posts, "p1").is_none());

    assert_eq!(handle.outcome().await.unwrap(), None);
    assert!(h.engine.get_one(Collection::Posts, "p1").is_none());
    assert_eq!(h.engine.get(Collection::Posts).len(), 1);
  }

  #[tokio::test]
  async fn test_failure_serves_last_known() {
    let h = harness();
    seed_posts(&h, 2);
    h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();

    h.clock.advance(Duration::from_secs(301));
    h.remote.fail_next(RemoteError::Network("unreachable".into()));
    let result = h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();

    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data.len(), 2);
    assert!(matches!(result.error, Some(SyncError::Remote(RemoteError::Network(_)))));
    assert!(matches!(
      h.engine.state(Collection::Posts, &Query::all()),
      FetchState::Failed(_)
    ));
  }

  #[tokio::test]
  async fn test_failure_without_cache_is_empty() {
    let h = harness();
    h.remote.fail_next(RemoteError::Network("unreachable".into()));
    let result = h.engine.fetch(Collection::Groups, Query::all()).await.unwrap();
    assert_eq!(result.source, CacheSource::Unavailable);
    assert!(result.data.is_empty());
    assert!(result.is_error());
  }

  #[tokio::test]
  async fn test_newer_request_supersedes_older() {
    let h = harness();
    seed_posts(&h, 2);
    h.remote.set_latency(Duration::from_millis(50));

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.fetch(Collection::Posts, Query::all()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();

    assert_eq!(first.await.unwrap().unwrap_err(), SyncError::Superseded);
    assert_eq!(second.data.len(), 2);
    assert_eq!(h.engine.get(Collection::Posts).len(), 2);
  }

  #[tokio::test]
  async fn test_cancel_discards_result() {
    let h = harness();
    seed_posts(&h, 2);
    h.remote.set_latency(Duration::from_millis(30));

    let engine = h.engine.clone();
    let pending = tokio::spawn(async move { engine.fetch(Collection::Posts, Query::all()).await });
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.engine.state(Collection::Posts, &Query::all()), FetchState::Loading);

    h.engine.cancel(Collection::Posts, &Query::all());
    assert_eq!(pending.await.unwrap().unwrap_err(), SyncError::Superseded);
    assert!(h.engine.get(Collection::Posts).is_empty());
    assert_eq!(h.engine.state(Collection::Posts, &Query::all()), FetchState::Idle);
  }

  #[tokio::test]
  async fn test_offline_serves_cache_without_network() {
    let h = harness();
    seed_posts(&h, 1);
    h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();
    h.clock.advance(Duration::from_secs(600));

    h.engine.set_online(false).await;
    let result = h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.len(), 1);

    let nothing = h.engine.fetch(Collection::Groups, Query::all()).await.unwrap();
    assert_eq!(nothing.source, CacheSource::Offline);
    assert!(nothing.data.is_empty());
    assert_eq!(h.remote.stats().selects, 1);
  }

  #[tokio::test]
  async fn test_fetch_one() {
    let h = harness();
    h.remote.seed(Collection::Profiles, vec![Record::new("u1", 1, json!({ "id": "u1" }))]);

    let miss = h.engine.fetch_one(Collection::Profiles, "u1").await.unwrap();
    assert_eq!(miss.source, CacheSource::Network);
    let hit = h.engine.fetch_one(Collection::Profiles, "u1").await.unwrap();
    assert_eq!(hit.source, CacheSource::CacheFresh);
    assert_eq!(hit.data.unwrap().id, "u1");
    assert_eq!(h.remote.stats().selects, 1);

    assert!(matches!(
      h.engine.fetch_one(Collection::Profiles, "ghost").await,
      Err(SyncError::NotFound { .. })
    ));
  }

  #[tokio::test]
  async fn test_procedure_query() {
    let h = harness();
    seed_posts(&h, 3);
    h.remote.register_procedure("get_user_feed", Collection::Posts, |rows, args| {
      let limit = args["feed_limit"].as_u64().unwrap_or(20) as usize;
      rows.iter().rev().take(limit).cloned().collect()
    });

    let feed = Query::procedure("get_user_feed", json!({ "feed_limit": 2 }));
    let result = h.engine.fetch(Collection::Posts, feed).await.unwrap();
    let ids: Vec<&str> = result.data.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["p3", "p2"]);
    assert_eq!(h.remote.stats().calls, 1);
    assert_eq!(h.remote.stats().selects, 0);
  }

  #[tokio::test]
  async fn test_refresh_active_only_touches_subscribed_collections() {
    let h = harness();
    seed_posts(&h, 1);
    h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();
    h.engine.fetch(Collection::Groups, Query::all()).await.unwrap();

    assert_eq!(h.engine.refresh_active().await, 0);

    let _feed = h.engine.subscribe(Collection::Posts, None).unwrap();
    assert_eq!(h.engine.refresh_active().await, 1);
    assert_eq!(h.remote.stats().selects, 3);
  }

  #[tokio::test]
  async fn test_coming_online_refreshes() {
    let h = harness();
    seed_posts(&h, 1);
    let _feed = h.engine.subscribe(Collection::Posts, None).unwrap();
    h.engine.fetch(Collection::Posts, Query::all()).await.unwrap();

    h.engine.set_online(false).await;
    h.engine.set_online(true).await;
    assert_eq!(h.remote.stats().selects, 2);
  }
}
