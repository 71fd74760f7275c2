//! Replays buffered mutations against the backend once connectivity returns.

use color_eyre::Result;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, RowFilter};
use crate::buffer::{identifier, FailureOutcome, MutationBuffer, OperationKind, PendingMutation};
use crate::connectivity::Connectivity;

/// What caused a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  Reconnected,
  Manual,
  Worker,
}

impl fmt::Display for SyncTrigger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      SyncTrigger::Reconnected => "reconnected",
      SyncTrigger::Manual => "manual",
      SyncTrigger::Worker => "worker",
    })
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub attempted: usize,
  pub synced: usize,
  /// Failed and still pending
  pub failed: usize,
  pub discarded: usize,
  pub dead_lettered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  Completed(SyncReport),
  /// Another pass held the syncing flag
  AlreadyRunning,
  Offline,
}

pub struct Reconciler {
  buffer: Arc<MutationBuffer>,
  backend: Arc<dyn Backend>,
  connectivity: Arc<Connectivity>,
}

impl Reconciler {
  pub fn new(
    buffer: Arc<MutationBuffer>,
    backend: Arc<dyn Backend>,
    connectivity: Arc<Connectivity>,
  ) -> Self {
    Self {
      buffer,
      backend,
      connectivity,
    }
  }

  /// Run one reconciliation pass.
  ///
  /// Pending mutations are replayed one at a time in enqueue order. A failed
  /// replay never stops the pass; the mutation stays pending unless the
  /// exhaustion policy says otherwise.
  pub async fn run(&self, trigger: SyncTrigger) -> Result<SyncOutcome> {
    if !self.connectivity.is_online() {
      debug!(%trigger, "Skipping sync while offline");
      return Ok(SyncOutcome::Offline);
    }

    let Some(_guard) = self.connectivity.try_begin_sync() else {
      debug!(%trigger, "Sync already in progress");
      return Ok(SyncOutcome::AlreadyRunning);
    };

    let pending = self.buffer.list_pending()?;
    info!(%trigger, count = pending.len(), "Starting sync");

    let mut report = SyncReport::default();
    for mutation in &pending {
      report.attempted += 1;

      match self.replay(mutation).await {
        Ok(()) => {
          // Still queued if this fails, so it is not counted as synced
          if let Err(e) = self.buffer.mark_synced(mutation.id) {
            warn!(id = mutation.id, error = %e, "Failed to mark mutation synced");
            report.failed += 1;
            continue;
          }
          report.synced += 1;
          self.settle(mutation).await;
        }
        Err(err) => {
          debug!(id = mutation.id, error = %err, "Replay failed");
          let outcome = self
            .buffer
            .record_failure(mutation.id, &err.to_string(), !err.is_transient());
          match outcome {
            Ok(FailureOutcome::Retained) => report.failed += 1,
            Ok(FailureOutcome::Discarded) => report.discarded += 1,
            Ok(FailureOutcome::DeadLettered) => report.dead_lettered += 1,
            Err(e) => {
              warn!(id = mutation.id, error = %e, "Failed to record replay failure");
              report.failed += 1;
            }
          }
        }
      }
    }

    info!(
      %trigger,
      synced = report.synced,
      failed = report.failed,
      discarded = report.discarded,
      dead_lettered = report.dead_lettered,
      "Sync finished"
    );
    Ok(SyncOutcome::Completed(report))
  }

  async fn replay(&self, mutation: &PendingMutation) -> Result<(), BackendError> {
    let resource = mutation.target_resource.as_str();
    match mutation.operation_kind {
      OperationKind::Insert => self.backend.insert(resource, &mutation.payload).await,
      OperationKind::Update => {
        let filter = self.row_filter(mutation)?;
        self
          .backend
          .update(resource, &filter, &mutation.payload)
          .await
      }
      OperationKind::Delete => {
        let filter = self.row_filter(mutation)?;
        self.backend.delete(resource, &filter).await
      }
    }
  }

  fn row_filter(&self, mutation: &PendingMutation) -> Result<RowFilter, BackendError> {
    let column = self.buffer.resources().key_column(&mutation.target_resource);
    let value = mutation
      .payload
      .get(column)
      .and_then(identifier)
      .ok_or_else(|| {
        BackendError::Invalid(format!(
          "{} on {} has no '{}' identifier",
          mutation.operation_kind, mutation.target_resource, column
        ))
      })?;
    Ok(RowFilter::eq(column, value))
  }

  /// Clear the entity's pending flag once nothing else is queued for it, then
  /// refresh its snapshot from the backend.
  ///
  /// Edits may be enqueued for the same row at any point in here. The
  /// pending flag is restored if one slipped in after the first check, and
  /// the refreshed snapshot is only stored while the entity is not pending.
  async fn settle(&self, mutation: &PendingMutation) {
    let Some((cache, entity_id)) = self.buffer.entity_target(mutation) else {
      return;
    };
    let resource = mutation.target_resource.as_str();

    match self.buffer.has_pending_for(resource, &entity_id) {
      Ok(false) => {}
      Ok(true) => return,
      Err(e) => {
        warn!(error = %e, "Failed to check remaining mutations");
        return;
      }
    }

    if let Err(e) = cache.clear_pending_sync(&entity_id) {
      warn!(entity_id = %entity_id, error = %e, "Failed to clear pending flag");
      return;
    }

    match self.buffer.latest_pending_for(resource, &entity_id) {
      Ok(None) => {}
      Ok(Some(newer)) => {
        debug!(entity_id = %entity_id, id = newer.id, "Edit queued while settling");
        if let Err(e) = cache.mark_pending(&entity_id, &newer.payload) {
          warn!(entity_id = %entity_id, error = %e, "Failed to restore pending flag");
        }
        return;
      }
      Err(e) => {
        warn!(error = %e, "Failed to check remaining mutations");
        return;
      }
    }

    if mutation.operation_kind == OperationKind::Delete {
      return;
    }

    let column = self.buffer.resources().key_column(resource);
    let filter = RowFilter::eq(column, entity_id.as_str());
    match self.backend.select_one(resource, &filter).await {
      Ok(Some(row)) => {
        if let Err(e) = cache.refresh_snapshot(&entity_id, row) {
          warn!(entity_id = %entity_id, error = %e, "Failed to refresh snapshot");
        }
      }
      Ok(None) => {}
      Err(e) => debug!(entity_id = %entity_id, error = %e, "Snapshot refresh failed"),
    }
  }
}
