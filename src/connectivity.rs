//! Online/syncing status shared between the reconciler and its observers.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
  pub is_online: bool,
  pub is_syncing: bool,
}

/// Effect of a connectivity report on the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  WentOnline,
  WentOffline,
  Unchanged,
}

/// Process-wide connectivity state. Not persisted.
pub struct Connectivity {
  tx: watch::Sender<Status>,
}

impl Connectivity {
  /// Start from the platform-reported status.
  pub fn new(is_online: bool) -> Self {
    let (tx, _) = watch::channel(Status {
      is_online,
      is_syncing: false,
    });
    Self { tx }
  }

  pub fn status(&self) -> Status {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.tx.borrow().is_online
  }

  pub fn is_syncing(&self) -> bool {
    self.tx.borrow().is_syncing
  }

  /// Observe every status change.
  pub fn subscribe(&self) -> watch::Receiver<Status> {
    self.tx.subscribe()
  }

  pub fn set_online(&self, is_online: bool) -> Transition {
    let changed = self.tx.send_if_modified(|status| {
      if status.is_online == is_online {
        return false;
      }
      status.is_online = is_online;
      true
    });

    match (changed, is_online) {
      (false, _) => Transition::Unchanged,
      (true, true) => {
        info!("Connectivity restored");
        Transition::WentOnline
      }
      (true, false) => {
        info!("Connectivity lost");
        Transition::WentOffline
      }
    }
  }

  /// Claim the syncing flag, or `None` when a pass is already running.
  ///
  /// The flag is released when the returned guard is dropped.
  pub fn try_begin_sync(self: &Arc<Self>) -> Option<SyncGuard> {
    let claimed = self.tx.send_if_modified(|status| {
      if status.is_syncing {
        return false;
      }
      status.is_syncing = true;
      true
    });

    claimed.then(|| SyncGuard {
      connectivity: Arc::clone(self),
    })
  }
}

/// Holds the syncing flag for the duration of a reconciliation pass.
pub struct SyncGuard {
  connectivity: Arc<Connectivity>,
}

impl Drop for SyncGuard {
  fn drop(&mut self) {
    self.connectivity.tx.send_if_modified(|status| {
      let was_syncing = status.is_syncing;
      status.is_syncing = false;
      was_syncing
    });
  }
}
