//! Replay target for drained changes.

use color_eyre::Result;
use std::future::Future;
use std::time::Duration;
use tracing::info;

use super::queue::PendingChange;

/// Applies one pending change to the durable backend.
///
/// The coordinator depends on this capability but does not define where
/// changes go or how conflicts are settled.
pub trait ChangeReplayer: Send + Sync + 'static {
  fn replay(&self, change: &PendingChange) -> impl Future<Output = Result<()>> + Send;
}

/// Stand-in replayer: waits a little, logs the change, always succeeds.
pub struct SimulatedReplayer {
  delay: Duration,
}

impl SimulatedReplayer {
  pub fn new(delay: Duration) -> Self {
    Self { delay }
  }
}

impl ChangeReplayer for SimulatedReplayer {
  async fn replay(&self, change: &PendingChange) -> Result<()> {
    tokio::time::sleep(self.delay).await;
    info!(id = ?change.id, "Syncing change: {} {}", change.kind, change.table);
    Ok(())
  }
}
