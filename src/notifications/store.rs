//! Persisted notification list with read state and unread count.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::model::Notification;
use crate::storage::Storage;

/// Transient popup emitted when a notification is added.
#[derive(Debug, Clone, PartialEq)]
pub struct Toast {
  pub title: String,
  pub description: String,
  pub action: Option<ToastAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToastAction {
  pub label: String,
  pub url: String,
}

impl From<&Notification> for Toast {
  fn from(n: &Notification) -> Self {
    Self {
      title: n.title.clone(),
      description: n.message.clone(),
      action: n.action_url.as_ref().map(|url| ToastAction {
        label: n.action_label.clone().unwrap_or_else(|| "View".to_string()),
        url: url.clone(),
      }),
    }
  }
}

/// Notification store backed by the shared offline storage.
///
/// Storage is the source of truth; the in-memory list is refreshed after
/// every mutation and the unread count is published on a watch channel.
pub struct NotificationStore<S: Storage> {
  storage: Arc<S>,
  items: Mutex<Vec<Notification>>,
  unread_tx: watch::Sender<usize>,
  toast_tx: broadcast::Sender<Toast>,
}

impl<S: Storage> NotificationStore<S> {
  pub fn new(storage: Arc<S>) -> Self {
    let (unread_tx, _) = watch::channel(0);
    let (toast_tx, _) = broadcast::channel(32);

    let store = Self {
      storage,
      items: Mutex::new(Vec::new()),
      unread_tx,
      toast_tx,
    };
    store.load();
    store
  }

  /// Current notifications, newest first.
  ///
  /// A storage failure is logged and the last known list is returned.
  pub fn load(&self) -> Vec<Notification> {
    if let Err(e) = self.refresh() {
      warn!("Failed to load notifications: {}", e);
    }
    self.snapshot()
  }

  /// Prepend a notification and raise a toast for it.
  ///
  /// Adding an id that already exists replaces the old entry.
  pub fn add(&self, notification: Notification) -> Result<()> {
    self.storage.notification_put_front(&notification)?;
    self.refresh()?;

    debug!(id = %notification.id, "notification added");
    // No subscribers is fine
    let _ = self.toast_tx.send(Toast::from(&notification));
    Ok(())
  }

  pub fn mark_read(&self, id: &str) -> Result<()> {
    self.storage.notifications_mark_read(Some(id))?;
    self.refresh()
  }

  pub fn mark_all_read(&self) -> Result<()> {
    self.storage.notifications_mark_read(None)?;
    self.refresh()
  }

  /// Remove one notification. Returns false if the id was unknown.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let removed = self.storage.notification_remove(id)?;
    self.refresh()?;
    Ok(removed)
  }

  pub fn clear(&self) -> Result<()> {
    self.storage.notifications_clear()?;
    self.refresh()
  }

  pub fn unread_count(&self) -> usize {
    *self.unread_tx.borrow()
  }

  /// Watch the unread count as it changes.
  pub fn subscribe_unread(&self) -> watch::Receiver<usize> {
    self.unread_tx.subscribe()
  }

  pub fn subscribe_toasts(&self) -> broadcast::Receiver<Toast> {
    self.toast_tx.subscribe()
  }

  fn snapshot(&self) -> Vec<Notification> {
    self
      .items
      .lock()
      .map(|items| items.clone())
      .unwrap_or_default()
  }

  fn refresh(&self) -> Result<()> {
    let loaded = self.storage.notifications_load()?;
    let unread = loaded.iter().filter(|n| !n.read).count();

    {
      let mut items = self
        .items
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      *items = loaded;
    }

    self.unread_tx.send_replace(unread);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notifications::Severity;
  use crate::storage::SqliteStorage;

  fn store() -> NotificationStore<SqliteStorage> {
    NotificationStore::new(Arc::new(SqliteStorage::open_in_memory().unwrap()))
  }

  fn note(id: &str) -> Notification {
    Notification::new(id, format!("Title {}", id), "message", Severity::Info)
  }

  fn expected_unread(store: &NotificationStore<SqliteStorage>) -> usize {
    store.load().iter().filter(|n| !n.read).count()
  }

  #[test]
  fn test_add_prepends() {
    let store = store();
    store.add(note("a")).unwrap();
    store.add(note("b")).unwrap();
    let ids: Vec<String> = store.load().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, vec!["b", "a"]);
  }

  #[test]
  fn test_duplicate_id_replaces_and_moves_to_front() {
    let store = store();
    store.add(note("a")).unwrap();
    store.add(note("b")).unwrap();
    store
      .add(Notification::new("a", "Updated", "again", Severity::Error))
      .unwrap();

    let items = store.load();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, "a");
    assert_eq!(items[0].title, "Updated");
  }

  #[test]
  fn test_unread_count_tracks_every_mutation() {
    let store = store();
    assert_eq!(store.unread_count(), 0);

    for id in ["a", "b", "c", "d"] {
      store.add(note(id)).unwrap();
      assert_eq!(store.unread_count(), expected_unread(&store));
    }
    assert_eq!(store.unread_count(), 4);

    store.mark_read("b").unwrap();
    assert_eq!(store.unread_count(), 3);
    assert_eq!(store.unread_count(), expected_unread(&store));

    store.mark_read("b").unwrap();
    assert_eq!(store.unread_count(), 3);

    assert!(store.remove("c").unwrap());
    assert_eq!(store.unread_count(), 2);
    assert!(!store.remove("c").unwrap());

    store.mark_all_read().unwrap();
    assert_eq!(store.unread_count(), 0);

    store.add(note("e")).unwrap();
    assert_eq!(store.unread_count(), 1);
    assert_eq!(store.unread_count(), expected_unread(&store));

    store.clear().unwrap();
    assert_eq!(store.unread_count(), 0);
    assert!(store.load().is_empty());
  }

  #[test]
  fn test_add_emits_toast_with_default_label() {
    let store = store();
    let mut toasts = store.subscribe_toasts();
    store
      .add(note("a").with_action("/farms/a", None))
      .unwrap();

    let toast = toasts.try_recv().unwrap();
    assert_eq!(toast.title, "Title a");
    assert_eq!(
      toast.action,
      Some(ToastAction {
        label: "View".to_string(),
        url: "/farms/a".to_string()
      })
    );
  }

  #[test]
  fn test_state_survives_reopen() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    {
      let store = NotificationStore::new(Arc::clone(&storage));
      store.add(note("a")).unwrap();
      store.add(note("b")).unwrap();
      store.mark_read("a").unwrap();
    }
    let store = NotificationStore::new(storage);
    assert_eq!(store.load().len(), 2);
    assert_eq!(store.unread_count(), 1);
  }
}
