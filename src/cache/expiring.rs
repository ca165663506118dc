//! TTL-aware cache of records per collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::record::{Collection, Query, Record};
use crate::storage::KeyValueStore;

/// A cached record with its expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
  pub record: Record,
  /// `None` pins the record: it never expires until it is rewritten.
  pub expires_at: Option<DateTime<Utc>>,
  pub written_at: DateTime<Utc>,
}

impl CacheRecord {
  pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.map_or(true, |expires_at| expires_at > now)
  }

  pub fn is_pinned(&self) -> bool {
    self.expires_at.is_none()
  }
}

/// Ordered result ids of one query plus when they were fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry {
  pub query: Query,
  pub ids: Vec<String>,
  pub fetched_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

/// Records of a cached query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
  pub records: Vec<Record>,
  pub fetched_at: DateTime<Utc>,
  pub expired: bool,
}

/// Exact state of one cache slot, for rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
  pub entry: Option<CacheRecord>,
  position: Option<usize>,
}

impl Snapshot {
  /// Snapshot of a slot that held nothing.
  pub fn absent() -> Self {
    Self {
      entry: None,
      position: None,
    }
  }

  /// Snapshot holding `entry` with no recorded position (restored at the end).
  pub fn of(entry: CacheRecord) -> Self {
    Self {
      entry: Some(entry),
      position: None,
    }
  }

  pub fn version(&self) -> Option<i64> {
    self.entry.as_ref().map(|e| e.record.version)
  }
}

#[derive(Debug, Default)]
struct CollectionData {
  /// Insertion ordered.
  records: Vec<CacheRecord>,
  queries: HashMap<String, QueryEntry>,
}

impl CollectionData {
  fn position(&self, id: &str) -> Option<usize> {
    self.records.iter().position(|e| e.record.id == id)
  }

  fn get(&self, id: &str) -> Option<&CacheRecord> {
    self.records.iter().find(|e| e.record.id == id)
  }
}

/// Expiring cache over a [`KeyValueStore`].
///
/// Reads are served from an in-memory mirror that is hydrated from the store
/// on construction; every write goes through to the store. A failing store
/// is logged and counted, and the cache keeps working from memory.
pub struct ExpiringCache {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  ttls: HashMap<Collection, Duration>,
  collections: HashMap<Collection, CollectionData>,
  storage_failures: u64,
}

impl ExpiringCache {
  /// Create a cache and load whatever the store already holds.
  pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
    let mut cache = Self {
      store,
      clock,
      ttls: Collection::ALL
        .into_iter()
        .map(|c| (c, c.default_ttl()))
        .collect(),
      collections: HashMap::new(),
      storage_failures: 0,
    };
    cache.hydrate();
    cache
  }

  /// Override the TTL of a collection.
  pub fn with_ttl(mut self, collection: Collection, ttl: Duration) -> Self {
    self.ttls.insert(collection, ttl);
    self
  }

  pub fn ttl(&self, collection: Collection) -> Duration {
    self
      .ttls
      .get(&collection)
      .copied()
      .unwrap_or_else(|| collection.default_ttl())
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Number of store operations that failed since construction.
  pub fn storage_failures(&self) -> u64 {
    self.storage_failures
  }

  // ==========================================================================
  // Collection-level operations
  // ==========================================================================

  /// Stamp every record with `now + ttl` and persist it.
  ///
  /// Records already cached keep their position. Expired records not part
  /// of `records` are evicted.
  pub fn set(&mut self, collection: Collection, records: Vec<Record>, ttl: Duration) {
    let now = self.clock.now();
    let expires_at = stamp(now, ttl);

    let mut written = HashSet::new();
    for record in records {
      written.insert(record.id.clone());
      self.write(
        collection,
        CacheRecord {
          record,
          expires_at: Some(expires_at),
          written_at: now,
        },
      );
    }

    self.evict_expired(collection, now, &written);
  }

  /// Fresh records of a collection, in insertion order.
  pub fn get(&self, collection: Collection) -> Vec<Record> {
    let now = self.clock.now();
    self
      .collections
      .get(&collection)
      .map(|data| {
        data
          .records
          .iter()
          .filter(|e| e.is_fresh(now))
          .map(|e| e.record.clone())
          .collect()
      })
      .unwrap_or_default()
  }

  /// All cached entries of a collection, expired ones included.
  pub fn entries(&self, collection: Collection) -> &[CacheRecord] {
    self
      .collections
      .get(&collection)
      .map(|data| data.records.as_slice())
      .unwrap_or(&[])
  }

  /// Expire every record and query of a collection. Data stays available
  /// for stale-serve until it is replaced or evicted.
  pub fn invalidate(&mut self, collection: Collection) {
    let now = self.clock.now();
    let Some(data) = self.collections.get_mut(&collection) else {
      return;
    };

    let mut touched_records = Vec::new();
    for entry in &mut data.records {
      if let Some(expires_at) = entry.expires_at {
        let expired_at = now.max(entry.written_at);
        if expires_at > expired_at {
          entry.expires_at = Some(expired_at);
          touched_records.push(entry.clone());
        }
      }
    }

    let mut touched_queries = Vec::new();
    for (key, entry) in &mut data.queries {
      if entry.expires_at > now {
        entry.expires_at = now.max(entry.fetched_at);
        touched_queries.push((key.clone(), entry.clone()));
      }
    }

    for entry in &touched_records {
      self.persist_record(collection, entry);
    }
    for (key, entry) in &touched_queries {
      self.persist_query(collection, key, entry);
    }
    debug!(%collection, "invalidated");
  }

  /// Drop a collection from memory and from the store.
  pub fn clear(&mut self, collection: Collection) {
    self.collections.remove(&collection);

    let result = self
      .store
      .clear(collection.name())
      .and_then(|_| self.store.clear(&queries_namespace(collection)));
    self.capture("clear", collection, result);
  }

  pub fn clear_all(&mut self) {
    for collection in Collection::ALL {
      self.clear(collection);
    }
  }

  /// Evict expired records and queries now. Returns the number of records
  /// removed.
  pub fn purge_expired(&mut self, collection: Collection) -> usize {
    let now = self.clock.now();
    let removed = self.evict_expired(collection, now, &HashSet::new());

    let expired_queries: Vec<String> = self
      .collections
      .get(&collection)
      .map(|data| {
        data
          .queries
          .iter()
          .filter(|(_, q)| q.expires_at <= now)
          .map(|(key, _)| key.clone())
          .collect()
      })
      .unwrap_or_default();

    for key in expired_queries {
      if let Some(data) = self.collections.get_mut(&collection) {
        data.queries.remove(&key);
      }
      let result = self.store.delete(&queries_namespace(collection), &key);
      self.capture("purge", collection, result);
    }

    removed
  }

  // ==========================================================================
  // Single-record operations
  // ==========================================================================

  /// A fresh record by id.
  pub fn get_one(&self, collection: Collection, id: &str) -> Option<Record> {
    let now = self.clock.now();
    self
      .entry(collection, id)
      .filter(|e| e.is_fresh(now))
      .map(|e| e.record.clone())
  }

  /// The cached entry for an id regardless of expiry.
  pub fn entry(&self, collection: Collection, id: &str) -> Option<&CacheRecord> {
    self.collections.get(&collection)?.get(id)
  }

  /// Upsert one record stamped with `now + ttl`, and add it to every cached
  /// first-page query it matches.
  pub fn add_item(&mut self, collection: Collection, record: Record, ttl: Duration) {
    let now = self.clock.now();
    let entry = CacheRecord {
      expires_at: Some(stamp(now, ttl)),
      written_at: now,
      record,
    };
    self.link_to_queries(collection, &entry.record);
    self.write(collection, entry);
  }

  /// Upsert one record without expiry. Used for optimistic writes, which
  /// are the most current known truth until the server confirms them.
  pub fn pin(&mut self, collection: Collection, record: Record) {
    let entry = CacheRecord {
      record,
      expires_at: None,
      written_at: self.clock.now(),
    };
    self.link_to_queries(collection, &entry.record);
    self.write(collection, entry);
  }

  /// The entry `add_item` would write for `record` right now.
  pub fn stamped(&self, collection: Collection, record: Record) -> CacheRecord {
    let now = self.clock.now();
    CacheRecord {
      record,
      expires_at: Some(stamp(now, self.ttl(collection))),
      written_at: now,
    }
  }

  /// Remove one record. Query indexes keep the id so a restored record
  /// reappears in place.
  pub fn remove_item(&mut self, collection: Collection, id: &str) -> Option<CacheRecord> {
    let data = self.collections.get_mut(&collection)?;
    let position = data.position(id)?;
    let removed = data.records.remove(position);

    let result = self.store.delete(collection.name(), id);
    self.capture("remove", collection, result);
    Some(removed)
  }

  /// Capture the exact state of one slot.
  pub fn snapshot(&self, collection: Collection, id: &str) -> Snapshot {
    let Some(data) = self.collections.get(&collection) else {
      return Snapshot::absent();
    };
    match data.position(id) {
      Some(position) => Snapshot {
        entry: Some(data.records[position].clone()),
        position: Some(position),
      },
      None => Snapshot::absent(),
    }
  }

  /// Put a slot back exactly as captured by [`snapshot`](Self::snapshot).
  pub fn restore(&mut self, collection: Collection, id: &str, snapshot: &Snapshot) {
    let Some(entry) = snapshot.entry.clone() else {
      self.remove_item(collection, id);
      return;
    };

    let data = self.collections.entry(collection).or_default();
    if entry.record.id != id {
      if let Some(position) = data.position(id) {
        data.records.remove(position);
      }
    }
    match data.position(&entry.record.id) {
      Some(position) => data.records[position] = entry.clone(),
      None => {
        let at = snapshot
          .position
          .unwrap_or(data.records.len())
          .min(data.records.len());
        data.records.insert(at, entry.clone());
      }
    }

    if entry.record.id != id {
      let result = self.store.delete(collection.name(), id);
      self.capture("restore", collection, result);
    }
    self.persist_record(collection, &entry);
  }

  // ==========================================================================
  // Query index
  // ==========================================================================

  /// Record the result of a query and upsert its records.
  ///
  /// Pinned records the previous result held are kept. Records that dropped
  /// out of the result and belong to no other query are removed.
  pub fn put_query(
    &mut self,
    collection: Collection,
    query: &Query,
    records: Vec<Record>,
    ttl: Duration,
  ) {
    self.put_query_holding(collection, query, records, ttl, &HashSet::new());
  }

  /// Like [`put_query`](Self::put_query), but records whose id is in `held`
  /// only take their place in the result; their cached entry (or absence)
  /// is left alone.
  pub fn put_query_holding(
    &mut self,
    collection: Collection,
    query: &Query,
    records: Vec<Record>,
    ttl: Duration,
    held: &HashSet<String>,
  ) {
    let now = self.clock.now();
    let expires_at = stamp(now, ttl);
    let key = query.cache_key(collection);

    let previous: Vec<String> = self
      .collections
      .get(&collection)
      .and_then(|data| data.queries.get(&key))
      .map(|entry| entry.ids.clone())
      .unwrap_or_default();

    let mut ids: Vec<String> = Vec::with_capacity(records.len());
    let mut written = HashSet::new();
    for record in records {
      if written.insert(record.id.clone()) {
        ids.push(record.id.clone());
      }
      if held.contains(&record.id) {
        continue;
      }
      self.write(
        collection,
        CacheRecord {
          record,
          expires_at: Some(expires_at),
          written_at: now,
        },
      );
    }

    let mut orphans = Vec::new();
    for id in previous {
      if written.contains(&id) {
        continue;
      }
      match self.entry(collection, &id) {
        Some(entry) if entry.is_pinned() => ids.push(id),
        Some(_) => orphans.push(id),
        None => {}
      }
    }

    let entry = QueryEntry {
      query: query.clone(),
      ids,
      fetched_at: now,
      expires_at,
    };
    self
      .collections
      .entry(collection)
      .or_default()
      .queries
      .insert(key.clone(), entry.clone());
    self.persist_query(collection, &key, &entry);

    for id in orphans {
      let referenced = self
        .collections
        .get(&collection)
        .map(|data| data.queries.values().any(|q| q.ids.contains(&id)))
        .unwrap_or(false);
      if !referenced {
        debug!(%collection, %id, "dropping record no longer returned by query");
        self.remove_item(collection, &id);
      }
    }

    self.evict_expired(collection, now, &written);
  }

  /// Fresh result of a query: `None` if never fetched or past its TTL.
  pub fn get_query(&self, collection: Collection, query: &Query) -> Option<QueryHit> {
    let now = self.clock.now();
    let data = self.collections.get(&collection)?;
    let entry = data.queries.get(&query.cache_key(collection))?;
    if entry.expires_at <= now {
      return None;
    }

    let records = entry
      .ids
      .iter()
      .filter_map(|id| data.get(id))
      .filter(|e| e.is_fresh(now))
      .map(|e| e.record.clone())
      .collect();

    Some(QueryHit {
      records,
      fetched_at: entry.fetched_at,
      expired: false,
    })
  }

  /// Last known result of a query, expired records included.
  pub fn last_known_query(&self, collection: Collection, query: &Query) -> Option<QueryHit> {
    let now = self.clock.now();
    let data = self.collections.get(&collection)?;
    let entry = data.queries.get(&query.cache_key(collection))?;

    let records = entry
      .ids
      .iter()
      .filter_map(|id| data.get(id))
      .map(|e| e.record.clone())
      .collect();

    Some(QueryHit {
      records,
      fetched_at: entry.fetched_at,
      expired: entry.expires_at <= now,
    })
  }

  /// Queries with an index entry for a collection.
  pub fn queries(&self, collection: Collection) -> Vec<Query> {
    self
      .collections
      .get(&collection)
      .map(|data| data.queries.values().map(|e| e.query.clone()).collect())
      .unwrap_or_default()
  }

  // ==========================================================================
  // Internals
  // ==========================================================================

  fn write(&mut self, collection: Collection, entry: CacheRecord) {
    let data = self.collections.entry(collection).or_default();
    match data.position(&entry.record.id) {
      Some(position) => data.records[position] = entry.clone(),
      None => data.records.push(entry.clone()),
    }
    self.persist_record(collection, &entry);
  }

  /// Append a record id to first-page queries it matches.
  fn link_to_queries(&mut self, collection: Collection, record: &Record) {
    let Some(data) = self.collections.get_mut(&collection) else {
      return;
    };

    let mut touched = Vec::new();
    for (key, entry) in &mut data.queries {
      if entry.query.offset == 0
        && entry.query.matches(record)
        && !entry.ids.contains(&record.id)
      {
        entry.ids.push(record.id.clone());
        touched.push((key.clone(), entry.clone()));
      }
    }

    for (key, entry) in &touched {
      self.persist_query(collection, key, entry);
    }
  }

  fn evict_expired(
    &mut self,
    collection: Collection,
    now: DateTime<Utc>,
    keep: &HashSet<String>,
  ) -> usize {
    let Some(data) = self.collections.get_mut(&collection) else {
      return 0;
    };

    let mut evicted = Vec::new();
    data.records.retain(|e| {
      if e.is_fresh(now) || keep.contains(&e.record.id) {
        true
      } else {
        evicted.push(e.record.id.clone());
        false
      }
    });

    for id in &evicted {
      let result = self.store.delete(collection.name(), id);
      self.capture("evict", collection, result);
    }
    if !evicted.is_empty() {
      debug!(%collection, count = evicted.len(), "evicted expired records");
    }
    evicted.len()
  }

  fn persist_record(&mut self, collection: Collection, entry: &CacheRecord) {
    let result = serde_json::to_value(entry)
      .map_err(StorageError::from)
      .and_then(|value| self.store.put(collection.name(), &entry.record.id, &value));
    self.capture("write", collection, result);
  }

  fn persist_query(&mut self, collection: Collection, key: &str, entry: &QueryEntry) {
    let result = serde_json::to_value(entry)
      .map_err(StorageError::from)
      .and_then(|value| self.store.put(&queries_namespace(collection), key, &value));
    self.capture("write query", collection, result);
  }

  /// Log and count a storage failure; the in-memory state stays authoritative.
  fn capture(&mut self, op: &str, collection: Collection, result: Result<(), StorageError>) {
    if let Err(err) = result {
      self.storage_failures += 1;
      warn!(%collection, op, error = %err, "cache storage failed, continuing without persistence");
    }
  }

  fn hydrate(&mut self) {
    for collection in Collection::ALL {
      let mut data = CollectionData::default();

      match self.store.list(collection.name()) {
        Ok(entries) => {
          for (id, value) in entries {
            match serde_json::from_value::<CacheRecord>(value) {
              // Unconfirmed optimistic writes from a previous session
              Ok(entry) if entry.is_pinned() => {
                debug!(%collection, %id, "discarding unconfirmed optimistic record");
                let result = self.store.delete(collection.name(), &id);
                self.capture("hydrate", collection, result);
              }
              Ok(entry) => data.records.push(entry),
              Err(err) => warn!(%collection, %id, error = %err, "skipping undecodable cache entry"),
            }
          }
        }
        Err(err) => self.capture("hydrate", collection, Err(err)),
      }

      match self.store.list(&queries_namespace(collection)) {
        Ok(entries) => {
          for (key, value) in entries {
            match serde_json::from_value::<QueryEntry>(value) {
              Ok(entry) => {
                data.queries.insert(key, entry);
              }
              Err(err) => warn!(%collection, %key, error = %err, "skipping undecodable query entry"),
            }
          }
        }
        Err(err) => self.capture("hydrate", collection, Err(err)),
      }

      if !data.records.is_empty() || !data.queries.is_empty() {
        self.collections.insert(collection, data);
      }
    }
  }
}

fn queries_namespace(collection: Collection) -> String {
  format!("{}.queries", collection.name())
}

/// `now + ttl`, saturating.
fn stamp(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
  chrono::Duration::from_std(ttl)
    .ok()
    .and_then(|ttl| now.checked_add_signed(ttl))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
