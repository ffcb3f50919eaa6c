use crate::config::Config;
use crate::interceptor::{FetchError, Fetcher, Interceptor, Request, Response};
use crate::notifications::{spawn_alert_listener, NotificationStore};
use crate::storage::Storage;
use crate::sync::{
  spawn_connectivity_listener, spawn_status_poller, Connectivity, SimulatedReplayer,
  SyncCoordinator,
};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

/// Fetcher that fails every request while the runtime is offline.
pub struct ConnectivityGate<F: Fetcher> {
  inner: F,
  online: Arc<AtomicBool>,
}

impl<F: Fetcher> ConnectivityGate<F> {
  pub fn new(inner: F, online: Arc<AtomicBool>) -> Self {
    Self { inner, online }
  }
}

impl<F: Fetcher> Fetcher for ConnectivityGate<F> {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    if !self.online.load(Ordering::SeqCst) {
      return Err(FetchError::Network("offline".to_string()));
    }
    self.inner.fetch(request).await
  }
}

pub type RuntimeInterceptor<S, F> = Interceptor<S, ConnectivityGate<F>>;
pub type RuntimeCoordinator<S> = SyncCoordinator<S, SimulatedReplayer>;

/// Every offline service, wired once at startup.
///
/// Owns the background tasks (status poller, connectivity listener, alert
/// listener) and stops them on `shutdown`.
pub struct OfflineRuntime<S: Storage, F: Fetcher> {
  pub storage: Arc<S>,
  pub interceptor: Arc<RuntimeInterceptor<S, F>>,
  pub sync: Arc<RuntimeCoordinator<S>>,
  pub notifications: Arc<NotificationStore<S>>,

  /// Shared with the fetcher gate
  online: Arc<AtomicBool>,

  connectivity_tx: mpsc::UnboundedSender<Connectivity>,
  alerts_tx: mpsc::UnboundedSender<Value>,
  shutdown_tx: watch::Sender<bool>,
  tasks: Vec<JoinHandle<()>>,
}

impl<S: Storage, F: Fetcher> OfflineRuntime<S, F> {
  pub fn start(config: &Config, storage: Arc<S>, fetcher: F, online: bool) -> Result<Self> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", config.origin, e))?;

    let online_flag = Arc::new(AtomicBool::new(online));
    let gate = ConnectivityGate::new(fetcher, Arc::clone(&online_flag));
    let interceptor = Arc::new(Interceptor::new(
      Arc::clone(&storage),
      Arc::new(gate),
      origin,
      &config.cache,
    ));

    let replayer = Arc::new(SimulatedReplayer::new(config.sync.replay_delay()));
    let sync = Arc::new(SyncCoordinator::new(
      Arc::clone(&storage),
      replayer,
      online,
      config.sync.starvation_threshold,
    ));
    let notifications = Arc::new(NotificationStore::new(Arc::clone(&storage)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (connectivity_tx, connectivity_rx) = mpsc::unbounded_channel();
    let (alerts_tx, alerts_rx) = mpsc::unbounded_channel();

    let tasks = vec![
      spawn_status_poller(
        Arc::clone(&sync),
        config.sync.poll_interval(),
        shutdown_rx.clone(),
      ),
      spawn_connectivity_listener(Arc::clone(&sync), connectivity_rx, shutdown_rx.clone()),
      spawn_alert_listener(Arc::clone(&notifications), alerts_rx, shutdown_rx),
    ];

    info!(
      static_cache = %interceptor.cache_names().static_name,
      online,
      "offline runtime started"
    );

    Ok(Self {
      storage,
      interceptor,
      sync,
      notifications,
      online: online_flag,
      connectivity_tx,
      alerts_tx,
      shutdown_tx,
      tasks,
    })
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Flip connectivity for both the network and the sync coordinator.
  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
    let event = if online {
      Connectivity::Online
    } else {
      Connectivity::Offline
    };
    if self.connectivity_tx.send(event).is_err() {
      warn!("Connectivity listener is gone");
    }
  }

  /// Hand a realtime `weather_alerts` payload to the alert listener.
  pub fn publish_alert(&self, payload: Value) {
    if self.alerts_tx.send(payload).is_err() {
      warn!("Alert listener is gone");
    }
  }

  /// Stop background tasks and wait for pending cache writes.
  pub async fn shutdown(self) {
    let _ = self.shutdown_tx.send(true);
    for task in self.tasks {
      if let Err(e) = task.await {
        warn!("Background task failed: {}", e);
      }
    }
    self.interceptor.settle().await;
    info!("offline runtime stopped");
  }
}
