//! Realtime alert feed: server-created weather alerts become notifications.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::model::{Notification, Severity};
use super::store::NotificationStore;
use crate::storage::Storage;

/// One inserted row from the `weather_alerts` change feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AlertEvent {
  #[serde(deserialize_with = "string_or_number")]
  pub id: String,
  pub message: String,
  /// Free-form level from the server, e.g. "high", "medium"
  #[serde(default)]
  pub severity: Option<String>,
}

impl AlertEvent {
  /// Extract the event from a change payload of the form `{"new": {...}}`.
  pub fn from_change_payload(payload: &Value) -> Result<Self> {
    let row = payload
      .get("new")
      .ok_or_else(|| eyre!("Alert payload has no 'new' row"))?;

    serde_json::from_value(row.clone()).map_err(|e| eyre!("Malformed alert row: {}", e))
  }

  pub fn severity(&self) -> Severity {
    match self.severity.as_deref() {
      Some(s) if s.eq_ignore_ascii_case("high") => Severity::Error,
      _ => Severity::Warning,
    }
  }

  pub fn into_notification(self) -> Notification {
    let severity = self.severity();
    Notification {
      persistent: true,
      ..Notification::new(self.id, "Weather Alert", self.message, severity)
    }
  }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

/// Forward alert payloads from `feed` into the notification store until the
/// feed closes or shutdown is signalled.
pub fn spawn_alert_listener<S: Storage>(
  store: Arc<NotificationStore<S>>,
  mut feed: mpsc::UnboundedReceiver<Value>,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      tokio::select! {
        payload = feed.recv() => {
          let Some(payload) = payload else { break };
          match AlertEvent::from_change_payload(&payload) {
            Ok(event) => {
              info!(id = %event.id, "weather alert received");
              if let Err(e) = store.add(event.into_notification()) {
                warn!("Failed to store weather alert: {}", e);
              }
            }
            Err(e) => warn!("Ignoring alert payload: {}", e),
          }
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::SqliteStorage;
  use serde_json::json;

  #[test]
  fn test_high_severity_maps_to_error() {
    let event =
      AlertEvent::from_change_payload(&json!({"new": {"id": 7, "message": "Frost tonight", "severity": "high"}}))
        .unwrap();
    assert_eq!(event.id, "7");

    let n = event.into_notification();
    assert_eq!(n.title, "Weather Alert");
    assert_eq!(n.severity, Severity::Error);
    assert!(n.persistent);
    assert!(!n.read);
  }

  #[test]
  fn test_other_severity_maps_to_warning() {
    for severity in [json!("medium"), json!(null)] {
      let event = AlertEvent::from_change_payload(
        &json!({"new": {"id": "a1", "message": "Wind", "severity": severity}}),
      )
      .unwrap();
      assert_eq!(event.severity(), Severity::Warning);
    }
  }

  #[test]
  fn test_payload_without_row_is_rejected() {
    assert!(AlertEvent::from_change_payload(&json!({"old": {}})).is_err());
    assert!(AlertEvent::from_change_payload(&json!({"new": {"message": "x"}})).is_err());
  }

  #[tokio::test]
  async fn test_listener_adds_alerts_until_feed_closes() {
    let store = Arc::new(NotificationStore::new(Arc::new(
      SqliteStorage::open_in_memory().unwrap(),
    )));
    let (tx, rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = spawn_alert_listener(Arc::clone(&store), rx, shutdown_rx);
    tx.send(json!({"new": {"id": "w1", "message": "Storm", "severity": "high"}}))
      .unwrap();
    tx.send(json!({"garbage": true})).unwrap();
    tx.send(json!({"new": {"id": "w2", "message": "Rain", "severity": "low"}}))
      .unwrap();
    drop(tx);
    handle.await.unwrap();

    let items = store.load();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, "w2");
    assert_eq!(store.unread_count(), 2);
  }

  #[tokio::test]
  async fn test_listener_stops_on_shutdown() {
    let store = Arc::new(NotificationStore::new(Arc::new(
      SqliteStorage::open_in_memory().unwrap(),
    )));
    let (_tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = spawn_alert_listener(store, rx, shutdown_rx);
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
  }
}
