//! Local persistent store for offline support.
//!
//! This module keeps every piece of offline state behind one backend:
//! - Named record collections (farms, crops, messages, pending changes)
//! - Named response caches used by the network interceptor
//! - The notification list and small sync metadata values

mod sqlite;
mod traits;

use color_eyre::Result;
use serde::Serialize;
use serde_json::Value;

pub use sqlite::SqliteStorage;
pub use traits::{CacheEntry, Collection, NoopStorage, Storage, StoredRecord};

/// Metadata key holding the last successful sync time.
pub const LAST_SYNC_KEY: &str = "last_sync";

/// Snapshot of the display collections for offline rendering.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OfflineData {
  pub farms: Vec<Value>,
  pub crops: Vec<Value>,
  pub messages: Vec<Value>,
}

impl OfflineData {
  pub fn load<S: Storage + ?Sized>(storage: &S) -> Result<Self> {
    let read = |collection: Collection| -> Result<Vec<Value>> {
      Ok(
        storage
          .get_all(collection)?
          .into_iter()
          .map(|r| r.data)
          .collect(),
      )
    };

    Ok(Self {
      farms: read(Collection::Farms)?,
      crops: read(Collection::Crops)?,
      messages: read(Collection::Messages)?,
    })
  }
}

/// Clear every collection and forget the last sync time.
pub fn clear_offline_data<S: Storage + ?Sized>(storage: &S) -> Result<()> {
  for collection in Collection::ALL {
    storage.clear(collection)?;
  }
  storage.meta_set(LAST_SYNC_KEY, None)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_clear_offline_data_empties_everything() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .append(Collection::Farms, &json!({"id": "f1"}))
      .unwrap();
    storage
      .append(Collection::Messages, &json!({"text": "hi"}))
      .unwrap();
    storage
      .append(Collection::PendingChanges, &json!({"kind": "create"}))
      .unwrap();
    storage.meta_set(LAST_SYNC_KEY, Some("x")).unwrap();

    assert_eq!(OfflineData::load(&storage).unwrap().farms.len(), 1);

    clear_offline_data(&storage).unwrap();

    let data = OfflineData::load(&storage).unwrap();
    assert!(data.farms.is_empty());
    assert!(data.messages.is_empty());
    assert!(storage
      .get_all(Collection::PendingChanges)
      .unwrap()
      .is_empty());
    assert_eq!(storage.meta_get(LAST_SYNC_KEY).unwrap(), None);
  }
}
