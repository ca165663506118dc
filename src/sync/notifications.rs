//! Notification inbox operations on top of optimistic mutations.

use futures::future::join_all;
use tracing::{info, warn};

use super::engine::SyncEngine;
use super::tracker::{Mutation, MutationHandle};
use crate::error::{StorageError, SyncError};
use crate::record::{Collection, Record};
use crate::social::{Entity, Notification};

/// Mutations issued together, one per record.
#[derive(Debug)]
pub struct BatchHandle {
  handles: Vec<MutationHandle>,
}

impl BatchHandle {
  pub fn len(&self) -> usize {
    self.handles.len()
  }

  pub fn is_empty(&self) -> bool {
    self.handles.is_empty()
  }

  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.handles.iter().map(|handle| handle.id.as_str())
  }

  /// Wait for every mutation in the batch. A refused record rolls back on
  /// its own; the first error is reported once all have settled.
  pub async fn outcome(self) -> Result<Vec<Option<Record>>, SyncError> {
    join_all(self.handles.into_iter().map(MutationHandle::outcome))
      .await
      .into_iter()
      .collect()
  }
}

fn mark_read(current: &Record) -> Result<Option<Mutation>, SyncError> {
  let mut notification = Notification::from_record(current)?;
  if notification.read {
    return Ok(None);
  }
  notification.read = true;
  Ok(Some(Mutation::Update(Record::new(
    current.id.clone(),
    current.version,
    serde_json::to_value(&notification).map_err(StorageError::from)?,
  ))))
}

impl SyncEngine {
  pub fn mark_notification_read(&self, id: &str) -> Result<MutationHandle, SyncError> {
    self.mutate_with(Collection::Notifications, id, |current| {
      let mut notification = Notification::from_record(current)?;
      notification.read = true;
      Ok(Mutation::Update(Record::new(
        current.id.clone(),
        current.version,
        serde_json::to_value(&notification).map_err(StorageError::from)?,
      )))
    })
  }

  /// Mark every cached unread notification read in one optimistic step.
  pub fn mark_all_notifications_read(&self) -> Result<BatchHandle, SyncError> {
    let handles = self.mutate_batch(Collection::Notifications, |cache| {
      let mut mutations = Vec::new();
      for record in cache.get(Collection::Notifications) {
        match mark_read(&record) {
          Ok(Some(mutation)) => mutations.push(mutation),
          Ok(None) => {}
          Err(err) => warn!(id = %record.id, error = %err, "skipping undecodable notification"),
        }
      }
      Ok(mutations)
    })?;
    info!(count = handles.len(), "marking notifications read");
    Ok(BatchHandle { handles })
  }

  pub fn delete_notification(&self, id: &str) -> MutationHandle {
    self.mutate(Collection::Notifications, Mutation::Delete(id.to_string()))
  }

  /// Delete every cached notification, expired ones included.
  pub fn clear_all_notifications(&self) -> Result<BatchHandle, SyncError> {
    let handles = self.mutate_batch(Collection::Notifications, |cache| {
      Ok(
        cache
          .entries(Collection::Notifications)
          .iter()
          .map(|entry| Mutation::Delete(entry.record.id.clone()))
          .collect(),
      )
    })?;
    info!(count = handles.len(), "clearing notifications");
    Ok(BatchHandle { handles })
  }

  pub fn unread_count(&self) -> usize {
    self
      .read_all::<Notification>()
      .iter()
      .filter(|n| !n.read)
      .count()
  }
}
