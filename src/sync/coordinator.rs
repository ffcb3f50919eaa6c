//! Sync coordinator: drains the pending-change queue when connectivity allows.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::queue::{ChangeKind, PendingChange, PendingChangeQueue};
use super::replay::ChangeReplayer;
use crate::storage::{Storage, LAST_SYNC_KEY};

/// Platform connectivity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Message broadcast to every subscribed client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessage {
  SyncStart,
  SyncComplete,
  SyncError { error: String },
}

/// A change that keeps failing and holds back everything behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedChange {
  pub change_id: Option<i64>,
  pub failures: u32,
  pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub is_online: bool,
  pub last_sync: Option<DateTime<Utc>>,
  pub pending_changes: usize,
  pub sync_in_progress: bool,
  pub blocked: Option<BlockedChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  Offline,
  AlreadyRunning,
  NothingPending,
}

/// Result of one drain attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
  Completed { replayed: usize },
  Failed { error: String },
  Skipped(SkipReason),
}

/// Drives the pending-change queue through a `ChangeReplayer`.
///
/// Drains replay strictly in enqueue order. A failure aborts the drain and
/// leaves the queue exactly as it was; the next trigger starts over from
/// the head. There is no automatic retry.
pub struct SyncCoordinator<S: Storage, R: ChangeReplayer> {
  storage: Arc<S>,
  queue: PendingChangeQueue<S>,
  replayer: Arc<R>,
  in_progress: AtomicBool,
  status_tx: watch::Sender<SyncStatus>,
  messages: broadcast::Sender<SyncMessage>,
  /// (change id, consecutive failures) of the last change that failed
  failures: Mutex<Option<(Option<i64>, u32)>>,
  starvation_threshold: u32,
}

impl<S: Storage, R: ChangeReplayer> SyncCoordinator<S, R> {
  pub fn new(storage: Arc<S>, replayer: Arc<R>, online: bool, starvation_threshold: u32) -> Self {
    let queue = PendingChangeQueue::new(Arc::clone(&storage));

    let last_sync = match storage.meta_get(LAST_SYNC_KEY) {
      Ok(value) => value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc)),
      Err(e) => {
        warn!("Failed to read last sync time: {}", e);
        None
      }
    };
    let pending_changes = queue.len().unwrap_or_else(|e| {
      warn!("Failed to count pending changes: {}", e);
      0
    });

    let (status_tx, _) = watch::channel(SyncStatus {
      is_online: online,
      last_sync,
      pending_changes,
      sync_in_progress: false,
      blocked: None,
    });
    let (messages, _) = broadcast::channel(64);

    Self {
      storage,
      queue,
      replayer,
      in_progress: AtomicBool::new(false),
      status_tx,
      messages,
      failures: Mutex::new(None),
      starvation_threshold: starvation_threshold.max(1),
    }
  }

  pub fn status(&self) -> SyncStatus {
    self.status_tx.borrow().clone()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
    self.status_tx.subscribe()
  }

  /// Subscribe to SYNC_START / SYNC_COMPLETE / SYNC_ERROR messages.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
    self.messages.subscribe()
  }

  pub fn queue(&self) -> &PendingChangeQueue<S> {
    &self.queue
  }

  /// Record a mutation for later replay.
  pub fn enqueue(&self, kind: ChangeKind, table: &str, data: Value) -> Result<PendingChange> {
    let change = self.queue.enqueue(PendingChange::new(kind, table, data))?;
    info!(id = ?change.id, "Queued {} on {}", kind, table);
    self.refresh();
    Ok(change)
  }

  /// Handle an online/offline transition. Going online with work queued
  /// starts a drain.
  pub async fn connectivity_changed(&self, connectivity: Connectivity) -> Option<SyncOutcome> {
    let online = connectivity == Connectivity::Online;
    self.status_tx.send_modify(|s| s.is_online = online);
    self.refresh();

    if !online {
      info!("Connection lost - switching to offline mode");
      return None;
    }

    info!("Connection restored - syncing data...");
    if self.status().pending_changes == 0 {
      return None;
    }
    Some(self.drain().await)
  }

  /// Drain now if online.
  pub async fn force_sync(&self) -> SyncOutcome {
    if !self.status().is_online {
      return SyncOutcome::Skipped(SkipReason::Offline);
    }
    self.drain().await
  }

  /// Recompute the pending count from storage.
  pub fn refresh(&self) {
    match self.queue.len() {
      Ok(pending) => self.status_tx.send_modify(|s| s.pending_changes = pending),
      Err(e) => warn!("Failed to count pending changes: {}", e),
    }
  }

  async fn drain(&self) -> SyncOutcome {
    if self.in_progress.swap(true, Ordering::SeqCst) {
      return SyncOutcome::Skipped(SkipReason::AlreadyRunning);
    }

    let outcome = self.drain_queue().await;

    self.in_progress.store(false, Ordering::SeqCst);
    self.status_tx.send_modify(|s| s.sync_in_progress = false);
    self.refresh();

    outcome
  }

  async fn drain_queue(&self) -> SyncOutcome {
    // Re-read storage so changes enqueued elsewhere are included
    let changes = match self.queue.load() {
      Ok(changes) => changes,
      Err(e) => return self.fail(None, e),
    };
    if changes.is_empty() {
      return SyncOutcome::Skipped(SkipReason::NothingPending);
    }

    self.status_tx.send_modify(|s| {
      s.sync_in_progress = true;
      s.pending_changes = changes.len();
    });
    info!("Syncing {} pending changes...", changes.len());
    self.broadcast(SyncMessage::SyncStart);

    for change in &changes {
      if let Err(e) = self.replayer.replay(change).await {
        return self.fail(Some(change), e);
      }
    }

    if let Err(e) = self.queue.remove(&changes) {
      return self.fail(None, e);
    }

    let now = Utc::now();
    if let Err(e) = self
      .storage
      .meta_set(LAST_SYNC_KEY, Some(&now.to_rfc3339()))
    {
      warn!("Failed to persist last sync time: {}", e);
    }
    if let Ok(mut failures) = self.failures.lock() {
      *failures = None;
    }

    self.status_tx.send_modify(|s| {
      s.last_sync = Some(now);
      s.blocked = None;
    });
    info!("Sync completed successfully");
    self.broadcast(SyncMessage::SyncComplete);

    SyncOutcome::Completed {
      replayed: changes.len(),
    }
  }

  fn fail(&self, change: Option<&PendingChange>, e: color_eyre::Report) -> SyncOutcome {
    let error = match change {
      Some(change) => format!("change {:?} ({} {}): {}", change.id, change.kind, change.table, e),
      None => e.to_string(),
    };
    error!("Sync failed: {}", error);

    if let Some(change) = change {
      if let Some(blocked) = self.track_failure(change, &error) {
        self.status_tx.send_modify(|s| s.blocked = Some(blocked));
      }
    }

    self.broadcast(SyncMessage::SyncError {
      error: error.clone(),
    });
    SyncOutcome::Failed { error }
  }

  /// Count consecutive failures of the same change. Once the threshold is
  /// reached the change is reported as blocking the queue.
  fn track_failure(&self, change: &PendingChange, error: &str) -> Option<BlockedChange> {
    let mut failures = match self.failures.lock() {
      Ok(guard) => guard,
      Err(e) => {
        warn!("Lock poisoned: {}", e);
        return None;
      }
    };

    let count = match *failures {
      Some((id, n)) if id == change.id => n + 1,
      _ => 1,
    };
    *failures = Some((change.id, count));

    if count < self.starvation_threshold {
      return None;
    }

    warn!(
      id = ?change.id,
      failures = count,
      "Pending change keeps failing; later changes are blocked behind it"
    );
    Some(BlockedChange {
      change_id: change.id,
      failures: count,
      error: error.to_string(),
    })
  }

  fn broadcast(&self, message: SyncMessage) {
    // No subscribers is fine
    let _ = self.messages.send(message);
  }
}

/// Periodically recompute the pending count until shutdown.
pub fn spawn_status_poller<S: Storage, R: ChangeReplayer>(
  coordinator: Arc<SyncCoordinator<S, R>>,
  interval: Duration,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    loop {
      tokio::select! {
        _ = ticker.tick() => coordinator.refresh(),
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
  })
}

/// Feed connectivity events into the coordinator until the channel closes
/// or shutdown is signalled.
pub fn spawn_connectivity_listener<S: Storage, R: ChangeReplayer>(
  coordinator: Arc<SyncCoordinator<S, R>>,
  mut events: mpsc::UnboundedReceiver<Connectivity>,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      tokio::select! {
        event = events.recv() => {
          let Some(event) = event else { break };
          if let Some(outcome) = coordinator.connectivity_changed(event).await {
            info!(?outcome, "drain finished");
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

impl SyncMessage {
  /// JSON form sent to clients.
  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string(self).map_err(|e| eyre!("Failed to encode sync message: {}", e))
  }
}
