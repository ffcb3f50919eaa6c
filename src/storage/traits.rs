//! Storage contract shared by the interceptor, the sync queue and the notification store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::notifications::Notification;

/// Named record collections held by the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
  Farms,
  Crops,
  Messages,
  PendingChanges,
}

impl Collection {
  pub const ALL: [Collection; 4] = [
    Collection::Farms,
    Collection::Crops,
    Collection::Messages,
    Collection::PendingChanges,
  ];

  pub fn name(&self) -> &'static str {
    match self {
      Self::Farms => "farms",
      Self::Crops => "crops",
      Self::Messages => "messages",
      Self::PendingChanges => "pendingChanges",
    }
  }

  /// Whether records get a generated key when they carry no `id`.
  pub fn auto_key(&self) -> bool {
    matches!(self, Self::Messages | Self::PendingChanges)
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Collection {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_lowercase().replace(['-', '_'], "").as_str() {
      "farms" => Ok(Self::Farms),
      "crops" => Ok(Self::Crops),
      "messages" => Ok(Self::Messages),
      "pendingchanges" => Ok(Self::PendingChanges),
      other => Err(eyre!("Unknown collection: {}", other)),
    }
  }
}

/// A record read back from a collection, with its primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
  pub key: String,
  pub data: Value,
}

/// A captured response inside a named cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub cache_name: String,
  pub url: String,
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub captured_at: DateTime<Utc>,
}

/// Backend for every piece of offline state.
///
/// One implementation owns records, response caches, notifications and sync
/// metadata so they share a single consistency boundary.
pub trait Storage: Send + Sync + 'static {
  /// Replace the whole collection with `records`, keeping their order.
  fn replace_all(&self, collection: Collection, records: &[Value]) -> Result<()>;

  /// All records of a collection in insertion order.
  fn get_all(&self, collection: Collection) -> Result<Vec<StoredRecord>>;

  /// Primary key lookup.
  fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>>;

  /// Append one record and return its key.
  fn append(&self, collection: Collection, record: &Value) -> Result<String>;

  /// Remove the given keys, returning how many rows went away.
  fn remove_keys(&self, collection: Collection, keys: &[String]) -> Result<usize>;

  fn clear(&self, collection: Collection) -> Result<()>;

  /// Store a response, creating its cache on first use.
  fn cache_put(&self, entry: &CacheEntry) -> Result<()>;

  /// Store several responses in one transaction.
  fn cache_put_all(&self, entries: &[CacheEntry]) -> Result<()>;

  /// Look up a URL in one cache, or in every cache when `cache_name` is None.
  fn cache_match(&self, cache_name: Option<&str>, url: &str) -> Result<Option<CacheEntry>>;

  /// Names of all existing caches.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a cache and its entries. Returns false if it did not exist.
  fn cache_delete(&self, cache_name: &str) -> Result<bool>;

  /// Notifications, newest first.
  fn notifications_load(&self) -> Result<Vec<Notification>>;

  /// Insert or replace a notification and move it to the front.
  fn notification_put_front(&self, notification: &Notification) -> Result<()>;

  /// Mark one notification (or all, for None) as read. Returns rows changed.
  fn notifications_mark_read(&self, id: Option<&str>) -> Result<usize>;

  fn notification_remove(&self, id: &str) -> Result<bool>;

  fn notifications_clear(&self) -> Result<()>;

  fn meta_get(&self, key: &str) -> Result<Option<String>>;

  /// Set or (with None) delete a metadata value.
  fn meta_set(&self, key: &str, value: Option<&str>) -> Result<()>;
}

/// Storage implementation that doesn't keep anything.
/// Used when offline mode is disabled - reads miss, writes are discarded.
pub struct NoopStorage;

impl Storage for NoopStorage {
  fn replace_all(&self, _collection: Collection, _records: &[Value]) -> Result<()> {
    Ok(())
  }

  fn get_all(&self, _collection: Collection) -> Result<Vec<StoredRecord>> {
    Ok(Vec::new())
  }

  fn get(&self, _collection: Collection, _key: &str) -> Result<Option<Value>> {
    Ok(None)
  }

  fn append(&self, _collection: Collection, _record: &Value) -> Result<String> {
    Ok(String::new())
  }

  fn remove_keys(&self, _collection: Collection, _keys: &[String]) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self, _collection: Collection) -> Result<()> {
    Ok(())
  }

  fn cache_put(&self, _entry: &CacheEntry) -> Result<()> {
    Ok(())
  }

  fn cache_put_all(&self, _entries: &[CacheEntry]) -> Result<()> {
    Ok(())
  }

  fn cache_match(&self, _cache_name: Option<&str>, _url: &str) -> Result<Option<CacheEntry>> {
    Ok(None)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn cache_delete(&self, _cache_name: &str) -> Result<bool> {
    Ok(false)
  }

  fn notifications_load(&self) -> Result<Vec<Notification>> {
    Ok(Vec::new())
  }

  fn notification_put_front(&self, _notification: &Notification) -> Result<()> {
    Ok(())
  }

  fn notifications_mark_read(&self, _id: Option<&str>) -> Result<usize> {
    Ok(0)
  }

  fn notification_remove(&self, _id: &str) -> Result<bool> {
    Ok(false)
  }

  fn notifications_clear(&self) -> Result<()> {
    Ok(())
  }

  fn meta_get(&self, _key: &str) -> Result<Option<String>> {
    Ok(None)
  }

  fn meta_set(&self, _key: &str, _value: Option<&str>) -> Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_collection_names_round_trip() {
    for collection in Collection::ALL {
      assert_eq!(collection.name().parse::<Collection>().unwrap(), collection);
    }
    assert_eq!(
      "pending-changes".parse::<Collection>().unwrap(),
      Collection::PendingChanges
    );
    assert!("weather".parse::<Collection>().is_err());
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    storage
      .append(Collection::Farms, &serde_json::json!({"id": "f1"}))
      .unwrap();
    assert!(storage.get_all(Collection::Farms).unwrap().is_empty());
    assert!(storage.cache_match(None, "/index.html").unwrap().is_none());
    assert!(storage.notifications_load().unwrap().is_empty());
  }
}
