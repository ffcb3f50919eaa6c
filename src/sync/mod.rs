//! Offline mutation queue and its replay on reconnect.

mod coordinator;
mod queue;
mod replay;

pub use coordinator::{
  spawn_connectivity_listener, spawn_status_poller, BlockedChange, Connectivity, SkipReason,
  SyncCoordinator, SyncMessage, SyncOutcome, SyncStatus,
};
pub use queue::{ChangeKind, PendingChange, PendingChangeQueue};
pub use replay::{ChangeReplayer, SimulatedReplayer};
