//! In-process backend used by tests and local development.

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

use super::{RemoteSource, TransportSignal};
use crate::error::RemoteError;
use crate::record::{ChangeEvent, Collection, Filter, Query, Record};

/// A server-side procedure over one collection's rows.
type ProcedureFn = Arc<dyn Fn(&[Record], &Value) -> Vec<Record> + Send + Sync>;

/// Call counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStats {
  pub selects: usize,
  pub inserts: usize,
  pub updates: usize,
  pub deletes: usize,
  pub calls: usize,
}

#[derive(Default)]
struct Tables {
  rows: HashMap<Collection, Vec<Record>>,
  version: i64,
  next_id: u64,
  procedures: HashMap<String, (Collection, ProcedureFn)>,
  failures: VecDeque<RemoteError>,
  offline: bool,
  latency: Duration,
  echo: bool,
  listening: HashMap<String, usize>,
  stats: RemoteStats,
}

impl Tables {
  fn next_version(&mut self) -> i64 {
    self.version += 1;
    self.version
  }

  /// Fail the current call if the backend is offline or a failure is queued.
  fn check(&mut self) -> Result<(), RemoteError> {
    if self.offline {
      return Err(RemoteError::Network("backend unreachable".into()));
    }
    match self.failures.pop_front() {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }
}

/// In-memory [`RemoteSource`] with a version counter, injectable failures
/// and latency, and a broadcast transport.
///
/// Writes assign a fresh version; creates whose id is empty or starts with
/// `local-` get a server id. With echo enabled (the default) every write is
/// also pushed to the transport, like a real backend would.
pub struct MemoryRemote {
  tables: Mutex<Tables>,
  signals: broadcast::Sender<TransportSignal>,
}

impl Default for MemoryRemote {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryRemote {
  pub fn new() -> Self {
    let (signals, _) = broadcast::channel(256);
    Self {
      tables: Mutex::new(Tables {
        echo: true,
        ..Tables::default()
      }),
      signals,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Tables> {
    self
      .tables
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
  }

  /// Put rows in place without notifying anyone.
  pub fn seed(&self, collection: Collection, records: Vec<Record>) {
    let mut tables = self.lock();
    let max = records.iter().map(|r| r.version).max().unwrap_or(0);
    tables.version = tables.version.max(max);
    tables.rows.entry(collection).or_default().extend(records);
  }

  pub fn rows(&self, collection: Collection) -> Vec<Record> {
    self.lock().rows.get(&collection).cloned().unwrap_or_default()
  }

  pub fn register_procedure<F>(&self, name: &str, collection: Collection, procedure: F)
  where
    F: Fn(&[Record], &Value) -> Vec<Record> + Send + Sync + 'static,
  {
    self
      .lock()
      .procedures
      .insert(name.to_string(), (collection, Arc::new(procedure)));
  }

  /// Make the next call fail with `err`.
  pub fn fail_next(&self, err: RemoteError) {
    self.lock().failures.push_back(err);
  }

  pub fn set_offline(&self, offline: bool) {
    self.lock().offline = offline;
  }

  pub fn set_latency(&self, latency: Duration) {
    self.lock().latency = latency;
  }

  pub fn set_echo(&self, echo: bool) {
    self.lock().echo = echo;
  }

  /// Set the version counter; the next write gets `version + 1`.
  pub fn set_version(&self, version: i64) {
    self.lock().version = version;
  }

  pub fn stats(&self) -> RemoteStats {
    self.lock().stats
  }

  /// Open channels for a collection and filter.
  pub fn listeners(&self, collection: Collection, filter: Option<&Filter>) -> usize {
    self
      .lock()
      .listening
      .get(&channel_name(collection, filter))
      .copied()
      .unwrap_or(0)
  }

  /// Push a raw transport signal to every connected client.
  pub fn emit(&self, signal: TransportSignal) {
    // No receivers is fine: nobody is connected
    let _ = self.signals.send(signal);
  }

  /// Write made by another client: stored with a new version and pushed.
  pub fn external_update(&self, collection: Collection, mut record: Record) -> Record {
    let mut tables = self.lock();
    record.version = tables.next_version();
    let rows = tables.rows.entry(collection).or_default();
    match rows.iter_mut().find(|r| r.id == record.id) {
      Some(row) => *row = record.clone(),
      None => rows.push(record.clone()),
    }
    drop(tables);
    self.emit(TransportSignal::Change(ChangeEvent::update(
      collection,
      record.clone(),
    )));
    record
  }

  /// Delete made by another client.
  pub fn external_delete(&self, collection: Collection, id: &str) {
    let mut tables = self.lock();
    if let Some(rows) = tables.rows.get_mut(&collection) {
      rows.retain(|r| r.id != id);
    }
    drop(tables);
    self.emit(TransportSignal::Change(ChangeEvent::delete(collection, id)));
  }

  pub fn drop_transport(&self) {
    self.emit(TransportSignal::Dropped);
  }

  pub fn reconnect(&self) {
    self.emit(TransportSignal::Reconnected);
  }

  fn latency(&self) -> Duration {
    self.lock().latency
  }

  fn echo(&self, event: ChangeEvent) {
    if self.lock().echo {
      self.emit(TransportSignal::Change(event));
    }
  }
}

async fn delay(latency: Duration) {
  if !latency.is_zero() {
    tokio::time::sleep(latency).await;
  }
}

fn channel_name(collection: Collection, filter: Option<&Filter>) -> String {
  match filter {
    Some(filter) => format!("{}:{}", collection, filter.describe()),
    None => collection.to_string(),
  }
}

impl RemoteSource for MemoryRemote {
  fn select<'a>(
    &'a self,
    collection: Collection,
    query: &'a Query,
  ) -> BoxFuture<'a, Result<Vec<Record>, RemoteError>> {
    Box::pin(async move {
      delay(self.latency()).await;
      let mut tables = self.lock();
      tables.stats.selects += 1;
      tables.check()?;

      let rows = tables.rows.get(&collection).cloned().unwrap_or_default();
      let matching = rows.into_iter().filter(|r| query.matches(r)).skip(query.offset);
      Ok(match query.limit {
        Some(limit) => matching.take(limit).collect(),
        None => matching.collect(),
      })
    })
  }

  fn insert(
    &self,
    collection: Collection,
    mut record: Record,
  ) -> BoxFuture<'_, Result<Record, RemoteError>> {
    Box::pin(async move {
      delay(self.latency()).await;
      let mut tables = self.lock();
      tables.stats.inserts += 1;
      tables.check()?;

      if record.id.is_empty() || record.id.starts_with("local-") {
        tables.next_id += 1;
        record.id = format!("srv-{}", tables.next_id);
      }
      if tables
        .rows
        .get(&collection)
        .is_some_and(|rows| rows.iter().any(|r| r.id == record.id))
      {
        return Err(RemoteError::Rejected(format!(
          "duplicate key {} in {}",
          record.id, collection
        )));
      }
      if let Some(obj) = record.data.as_object_mut() {
        obj.insert("id".into(), Value::String(record.id.clone()));
      }

      record.version = tables.next_version();
      tables.rows.entry(collection).or_default().push(record.clone());
      drop(tables);

      self.echo(ChangeEvent::insert(collection, record.clone()));
      Ok(record)
    })
  }

  fn update(
    &self,
    collection: Collection,
    mut record: Record,
  ) -> BoxFuture<'_, Result<Record, RemoteError>> {
    Box::pin(async move {
      delay(self.latency()).await;
      let mut tables = self.lock();
      tables.stats.updates += 1;
      tables.check()?;

      let version = tables.next_version();
      let row = tables
        .rows
        .get_mut(&collection)
        .and_then(|rows| rows.iter_mut().find(|r| r.id == record.id))
        .ok_or_else(|| RemoteError::NotFound(format!("{} {}", collection, record.id)))?;
      record.version = version;
      *row = record.clone();
      drop(tables);

      self.echo(ChangeEvent::update(collection, record.clone()));
      Ok(record)
    })
  }

  fn delete<'a>(
    &'a self,
    collection: Collection,
    id: &'a str,
  ) -> BoxFuture<'a, Result<(), RemoteError>> {
    Box::pin(async move {
      delay(self.latency()).await;
      let mut tables = self.lock();
      tables.stats.deletes += 1;
      tables.check()?;

      if let Some(rows) = tables.rows.get_mut(&collection) {
        rows.retain(|r| r.id != id);
      }
      drop(tables);

      self.echo(ChangeEvent::delete(collection, id));
      Ok(())
    })
  }

  fn call<'a>(
    &'a self,
    procedure: &'a str,
    args: &'a Value,
  ) -> BoxFuture<'a, Result<Vec<Record>, RemoteError>> {
    Box::pin(async move {
      delay(self.latency()).await;
      let mut tables = self.lock();
      tables.stats.calls += 1;
      tables.check()?;

      let (collection, f) = tables
        .procedures
        .get(procedure)
        .cloned()
        .ok_or_else(|| RemoteError::NotFound(format!("procedure {}", procedure)))?;
      let rows = tables.rows.get(&collection).cloned().unwrap_or_default();
      Ok(f(&rows, args))
    })
  }

  fn listen(&self, collection: Collection, filter: Option<&Filter>) -> Result<(), RemoteError> {
    let mut tables = self.lock();
    if tables.offline {
      return Err(RemoteError::Network("backend unreachable".into()));
    }
    *tables
      .listening
      .entry(channel_name(collection, filter))
      .or_default() += 1;
    Ok(())
  }

  fn unlisten(&self, collection: Collection, filter: Option<&Filter>) {
    let mut tables = self.lock();
    let name = channel_name(collection, filter);
    if let Some(count) = tables.listening.get_mut(&name) {
      *count = count.saturating_sub(1);
      if *count == 0 {
        tables.listening.remove(&name);
      }
    }
  }

  fn changes(&self) -> BoxStream<'static, TransportSignal> {
    let rx = self.signals.subscribe();
    stream::unfold(rx, |mut rx| async move {
      loop {
        match rx.recv().await {
          Ok(signal) => return Some((signal, rx)),
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => return None,
        }
      }
    })
    .boxed()
  }
}
