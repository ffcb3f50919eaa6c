//! Persisted FIFO of mutation intents waiting to be replayed.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::storage::{Collection, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
  Create,
  Update,
  Delete,
}

impl fmt::Display for ChangeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    })
  }
}

impl FromStr for ChangeKind {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_lowercase().as_str() {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => Err(eyre!("Unknown change kind: {}", other)),
    }
  }
}

/// A recorded mutation awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
  /// Assigned by the store on enqueue
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<i64>,
  #[serde(rename = "type")]
  pub kind: ChangeKind,
  /// Target table, e.g. "farms"
  pub table: String,
  pub data: Value,
  pub timestamp: DateTime<Utc>,
}

impl PendingChange {
  pub fn new(kind: ChangeKind, table: impl Into<String>, data: Value) -> Self {
    Self {
      id: None,
      kind,
      table: table.into(),
      data,
      timestamp: Utc::now(),
    }
  }
}

/// Pending-change queue over the `pendingChanges` collection.
///
/// Storage is the only source of truth; every read goes back to it so
/// changes enqueued by another handle are never missed.
pub struct PendingChangeQueue<S: Storage> {
  storage: Arc<S>,
}

impl<S: Storage> Clone for PendingChangeQueue<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

impl<S: Storage> PendingChangeQueue<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self { storage }
  }

  /// Persist a change at the tail. Returns it with its assigned id.
  pub fn enqueue(&self, change: PendingChange) -> Result<PendingChange> {
    let record = serde_json::to_value(&change)
      .map_err(|e| eyre!("Failed to serialize change: {}", e))?;
    let key = self.storage.append(Collection::PendingChanges, &record)?;

    let id = key.parse::<i64>().ok();
    Ok(PendingChange { id, ..change })
  }

  /// All queued changes in enqueue order.
  pub fn load(&self) -> Result<Vec<PendingChange>> {
    self
      .storage
      .get_all(Collection::PendingChanges)?
      .into_iter()
      .map(|record| {
        serde_json::from_value(record.data)
          .map_err(|e| eyre!("Malformed pending change {}: {}", record.key, e))
      })
      .collect()
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.storage.get_all(Collection::PendingChanges)?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Remove exactly these changes, leaving anything enqueued since.
  pub fn remove(&self, changes: &[PendingChange]) -> Result<usize> {
    let keys: Vec<String> = changes
      .iter()
      .filter_map(|c| c.id)
      .map(|id| id.to_string())
      .collect();
    self.storage.remove_keys(Collection::PendingChanges, &keys)
  }

  pub fn clear(&self) -> Result<()> {
    self.storage.clear(Collection::PendingChanges)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::SqliteStorage;
  use serde_json::json;

  fn queue() -> PendingChangeQueue<SqliteStorage> {
    PendingChangeQueue::new(Arc::new(SqliteStorage::open_in_memory().unwrap()))
  }

  #[test]
  fn test_enqueue_assigns_increasing_ids() {
    let queue = queue();
    let a = queue
      .enqueue(PendingChange::new(ChangeKind::Create, "farms", json!({"name": "North"})))
      .unwrap();
    let b = queue
      .enqueue(PendingChange::new(ChangeKind::Delete, "crops", json!({"id": 4})))
      .unwrap();
    assert_eq!(a.id, Some(1));
    assert_eq!(b.id, Some(2));
    assert_eq!(queue.len().unwrap(), 2);
  }

  #[test]
  fn test_load_is_fifo_and_round_trips() {
    let queue = queue();
    let kinds = [ChangeKind::Update, ChangeKind::Create, ChangeKind::Delete];
    let enqueued: Vec<PendingChange> = kinds
      .iter()
      .map(|k| {
        queue
          .enqueue(PendingChange::new(*k, "farms", json!({"k": k.to_string()})))
          .unwrap()
      })
      .collect();

    assert_eq!(queue.load().unwrap(), enqueued);
  }

  #[test]
  fn test_remove_keeps_later_changes() {
    let queue = queue();
    let first = queue
      .enqueue(PendingChange::new(ChangeKind::Create, "farms", json!({})))
      .unwrap();
    let snapshot = queue.load().unwrap();
    let later = queue
      .enqueue(PendingChange::new(ChangeKind::Update, "farms", json!({})))
      .unwrap();

    assert_eq!(queue.remove(&snapshot).unwrap(), 1);
    let left = queue.load().unwrap();
    assert_eq!(left, vec![later]);
    assert_ne!(left[0].id, first.id);
  }

  #[test]
  fn test_clear_empties_queue_without_reusing_ids() {
    let queue = queue();
    for kind in [ChangeKind::Create, ChangeKind::Update] {
      queue
        .enqueue(PendingChange::new(kind, "farms", json!({})))
        .unwrap();
    }

    queue.clear().unwrap();
    assert!(queue.is_empty().unwrap());

    let next = queue
      .enqueue(PendingChange::new(ChangeKind::Delete, "farms", json!({})))
      .unwrap();
    assert_eq!(next.id, Some(3));
  }

  #[test]
  fn test_kind_serializes_as_type() {
    let change = PendingChange::new(ChangeKind::Update, "crops", json!({"id": 1}));
    let value = serde_json::to_value(&change).unwrap();
    assert_eq!(value["type"], "update");
    assert_eq!(value["table"], "crops");
    assert!(value.get("id").is_none());
    assert_eq!("DELETE".parse::<ChangeKind>().unwrap(), ChangeKind::Delete);
  }
}
