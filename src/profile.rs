//! User profile reads and writes with offline fallback.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, RowFilter};
use crate::buffer::{MutationBuffer, OperationKind, PendingMutation};
use crate::connectivity::Connectivity;
use crate::entity::{CacheResult, CachedEntity, EntityCache};

/// Backend table holding user profiles.
pub const PROFILE_RESOURCE: &str = "user_profiles";

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
  /// Confirmed by the backend; carries the merged profile
  Saved(Value),
  /// Buffered for the next sync
  Queued(PendingMutation),
}

/// Profile access that keeps working without a network.
///
/// Reads go to the backend when possible and fall back to the cached
/// snapshot. Writes made offline are buffered and applied locally so the
/// next read sees them.
#[derive(Clone)]
pub struct ProfileService {
  backend: Arc<dyn Backend>,
  cache: EntityCache,
  buffer: Arc<MutationBuffer>,
  connectivity: Arc<Connectivity>,
}

impl ProfileService {
  pub fn new(
    backend: Arc<dyn Backend>,
    cache: EntityCache,
    buffer: Arc<MutationBuffer>,
    connectivity: Arc<Connectivity>,
  ) -> Self {
    Self {
      backend,
      cache,
      buffer,
      connectivity,
    }
  }

  fn filter(&self, user_id: &str) -> RowFilter {
    RowFilter::eq(self.buffer.resources().key_column(PROFILE_RESOURCE), user_id)
  }

  /// Get a profile, preferring unconfirmed local edits over the backend.
  pub async fn read(&self, user_id: &str) -> Result<CacheResult<Option<Value>>> {
    let cached = self.cache.get(user_id)?;

    if let Some(entity) = &cached {
      if entity.pending_sync {
        debug!(user_id, "Serving profile with pending edits");
        return Ok(CacheResult::from_cache(
          Some(entity.payload.clone()),
          entity.timestamp,
        ));
      }
    }

    let fallback = |cached: Option<CachedEntity>| match cached {
      Some(entity) => CacheResult::offline(Some(entity.payload), Some(entity.timestamp)),
      None => CacheResult::offline(None, None),
    };

    if !self.connectivity.is_online() {
      return Ok(fallback(cached));
    }

    match self
      .backend
      .select_one(PROFILE_RESOURCE, &self.filter(user_id))
      .await
    {
      Ok(Some(row)) => match self.cache.refresh_snapshot(user_id, row.clone()) {
        Ok(true) => Ok(CacheResult::from_network(Some(row))),
        Ok(false) => {
          // Edited locally while the fetch was in flight
          let entity = self
            .cache
            .get(user_id)?
            .ok_or_else(|| eyre!("Profile {} vanished from the cache", user_id))?;
          Ok(CacheResult::from_cache(Some(entity.payload), entity.timestamp))
        }
        Err(e) => {
          warn!(user_id, error = %e, "Failed to cache profile");
          Ok(CacheResult::from_network(Some(row)))
        }
      },
      Ok(None) => Ok(CacheResult::from_network(None)),
      Err(e) if e.is_transient() => {
        debug!(user_id, error = %e, "Profile fetch failed, using cache");
        Ok(fallback(cached))
      }
      Err(e) => Err(eyre!("Failed to load profile {}: {}", user_id, e)),
    }
  }

  /// Save profile changes, queueing them when the backend is out of reach.
  ///
  /// Writes are also queued while earlier edits for the same user are still
  /// pending, so they reach the backend in order.
  pub async fn write(&self, user_id: &str, updates: &Value) -> Result<WriteOutcome> {
    let mut changes = updates.clone();
    let fields = changes
      .as_object_mut()
      .ok_or_else(|| eyre!("Profile updates must be a JSON object"))?;
    fields.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
    fields.insert(
      self.buffer.resources().key_column(PROFILE_RESOURCE).into(),
      Value::String(user_id.to_string()),
    );

    if !self.connectivity.is_online() || self.buffer.has_pending_for(PROFILE_RESOURCE, user_id)? {
      return self.queue(changes);
    }

    match self
      .backend
      .update(PROFILE_RESOURCE, &self.filter(user_id), &changes)
      .await
    {
      Ok(()) => {
        info!(user_id, "Profile saved");
        let profile = match self.cache.apply_confirmed(user_id, &changes) {
          Ok(Some(entity)) => entity.payload,
          Ok(None) => changes,
          Err(e) => {
            warn!(user_id, error = %e, "Failed to cache profile");
            changes
          }
        };
        Ok(WriteOutcome::Saved(profile))
      }
      Err(e) if e.is_transient() => {
        debug!(user_id, error = %e, "Profile save failed, queueing");
        self.queue(changes)
      }
      Err(e) => Err(eyre!("Failed to save profile {}: {}", user_id, e)),
    }
  }

  fn queue(&self, changes: Value) -> Result<WriteOutcome> {
    self
      .buffer
      .enqueue(PROFILE_RESOURCE, changes, OperationKind::Update)
      .map(WriteOutcome::Queued)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::SyncConfig;
  use crate::entity::CacheSource;
  use crate::reconciler::{Reconciler, SyncOutcome, SyncTrigger};
  use crate::testing::{test_buffer, BackendCall, FakeBackend, FakeFailure};
  use serde_json::json;

  struct Fixture {
    service: ProfileService,
    backend: Arc<FakeBackend>,
    buffer: Arc<MutationBuffer>,
    connectivity: Arc<Connectivity>,
  }

  fn fixture() -> Fixture {
    fixture_with(FakeBackend::new())
  }

  fn fixture_with(backend: FakeBackend) -> Fixture {
    let backend = Arc::new(backend);
    let (buffer, profile) = test_buffer(SyncConfig::default());
    let connectivity = Arc::new(Connectivity::new(true));
    let service = ProfileService::new(
      backend.clone(),
      profile,
      buffer.clone(),
      connectivity.clone(),
    );
    Fixture {
      service,
      backend,
      buffer,
      connectivity,
    }
  }

  #[tokio::test]
  async fn test_online_read_caches_snapshot() {
    let f = fixture();
    f.backend
      .set_row(PROFILE_RESOURCE, "u1", json!({"user_id": "u1", "full_name": "A"}));

    let result = f.service.read("u1").await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.unwrap()["full_name"], "A");

    f.connectivity.set_online(false);
    let result = f.service.read("u1").await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert!(result.cached_at.is_some());
    assert_eq!(result.data.unwrap()["full_name"], "A");
  }

  #[tokio::test]
  async fn test_transient_read_failure_falls_back_to_cache() {
    let f = fixture();
    f.backend
      .set_row(PROFILE_RESOURCE, "u1", json!({"user_id": "u1", "full_name": "A"}));
    f.service.read("u1").await.unwrap();

    f.backend.set_offline(true);
    let result = f.service.read("u1").await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.unwrap()["full_name"], "A");
  }

  #[tokio::test]
  async fn test_rejected_read_is_an_error() {
    let f = fixture();
    f.backend.fail_call(0, FakeFailure::Reject(401));
    assert!(f.service.read("u1").await.is_err());
  }

  #[tokio::test]
  async fn test_offline_read_without_cache_is_empty() {
    let f = fixture();
    f.connectivity.set_online(false);
    let result = f.service.read("ghost").await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert!(result.data.is_none());
    assert!(f.backend.calls().is_empty());
  }

  #[tokio::test]
  async fn test_online_write_is_saved() {
    let f = fixture();
    let outcome = f
      .service
      .write("u1", &json!({"full_name": "B"}))
      .await
      .unwrap();

    let WriteOutcome::Saved(profile) = outcome else {
      panic!("expected saved profile, got {:?}", outcome);
    };
    assert_eq!(profile["full_name"], "B");
    assert_eq!(profile["user_id"], "u1");
    assert!(profile["updated_at"].is_string());
    assert!(f.buffer.list_pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_transient_write_failure_is_queued() {
    let f = fixture();
    f.backend.set_offline(true);
    let outcome = f
      .service
      .write("u1", &json!({"full_name": "B"}))
      .await
      .unwrap();
    assert!(matches!(outcome, WriteOutcome::Queued(_)));
    assert_eq!(f.buffer.list_pending().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_rejected_write_surfaces() {
    let f = fixture();
    f.backend.fail_call(0, FakeFailure::Reject(403));
    assert!(f
      .service
      .write("u1", &json!({"full_name": "B"}))
      .await
      .is_err());
    assert!(f.buffer.list_pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offline_edit_is_read_back_then_synced() {
    let f = fixture();
    f.backend
      .set_row(PROFILE_RESOURCE, "u1", json!({"user_id": "u1", "full_name": "A"}));
    f.service.read("u1").await.unwrap();

    f.connectivity.set_online(false);
    let outcome = f
      .service
      .write("u1", &json!({"full_name": "B"}))
      .await
      .unwrap();
    let WriteOutcome::Queued(mutation) = outcome else {
      panic!("expected queued write, got {:?}", outcome);
    };
    assert_eq!(mutation.operation_kind, OperationKind::Update);
    assert_eq!(mutation.payload["full_name"], "B");
    // Nothing reached the backend except the initial read
    assert_eq!(f.backend.calls().len(), 1);

    let local = f.service.read("u1").await.unwrap();
    assert_eq!(local.data.unwrap()["full_name"], "B");

    f.connectivity.set_online(true);
    let reconciler = Reconciler::new(f.buffer.clone(), f.backend.clone(), f.connectivity.clone());
    let outcome = reconciler.run(SyncTrigger::Reconnected).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed(report) if report.synced == 1));

    assert!(f.buffer.list_pending().unwrap().is_empty());
    assert!(f.backend.calls().iter().any(|call| matches!(
      call,
      BackendCall::Update { changes, .. } if changes["full_name"] == "B"
    )));

    let synced = f.service.read("u1").await.unwrap();
    assert_eq!(synced.source, CacheSource::Network);
    assert_eq!(synced.data.unwrap()["full_name"], "B");
  }

  #[tokio::test]
  async fn test_write_queues_behind_pending_edits() {
    let f = fixture();
    f.connectivity.set_online(false);
    f.service
      .write("u1", &json!({"full_name": "B"}))
      .await
      .unwrap();

    f.connectivity.set_online(true);
    let outcome = f
      .service
      .write("u1", &json!({"full_name": "C"}))
      .await
      .unwrap();
    assert!(matches!(outcome, WriteOutcome::Queued(_)));
    assert!(f.backend.calls().is_empty());
  }

  async fn wait_for_backend(backend: &FakeBackend) {
    while backend.waiting() == 0 {
      tokio::task::yield_now().await;
    }
  }

  fn queue_local_edit(buffer: &MutationBuffer, full_name: &str) {
    buffer
      .enqueue(
        PROFILE_RESOURCE,
        json!({"user_id": "u1", "full_name": full_name}),
        OperationKind::Update,
      )
      .unwrap();
  }

  #[tokio::test]
  async fn test_edit_during_read_wins_over_fetched_row() {
    let f = fixture_with(FakeBackend::gated());
    f.backend
      .set_row(PROFILE_RESOURCE, "u1", json!({"user_id": "u1", "full_name": "A"}));

    let read = {
      let service = f.service.clone();
      tokio::spawn(async move { service.read("u1").await })
    };
    wait_for_backend(&f.backend).await;

    queue_local_edit(&f.buffer, "C");
    f.backend.release(1);
    let result = read.await.unwrap().unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.unwrap()["full_name"], "C");
    let entity = f.service.cache.get("u1").unwrap().unwrap();
    assert!(entity.pending_sync);
    assert_eq!(entity.payload["full_name"], "C");
  }

  #[tokio::test]
  async fn test_edit_during_confirmed_write_stays_pending() {
    let f = fixture_with(FakeBackend::gated());

    let write = {
      let service = f.service.clone();
      tokio::spawn(async move { service.write("u1", &json!({"full_name": "B"})).await })
    };
    wait_for_backend(&f.backend).await;

    queue_local_edit(&f.buffer, "C");
    f.backend.release(1);
    let outcome = write.await.unwrap().unwrap();

    let WriteOutcome::Saved(profile) = outcome else {
      panic!("expected saved profile, got {:?}", outcome);
    };
    assert_eq!(profile["full_name"], "C");
    let entity = f.service.cache.get("u1").unwrap().unwrap();
    assert!(entity.pending_sync);
    assert_eq!(entity.payload["full_name"], "C");
    assert_eq!(f.buffer.list_pending().unwrap().len(), 1);
  }
}
