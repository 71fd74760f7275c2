//! Entry point tying the stores, mutation buffer and reconciler together.

use color_eyre::Result;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::buffer::{MutationBuffer, OperationKind, PendingMutation, Resources};
use crate::config::Config;
use crate::connectivity::{Connectivity, Status, Transition};
use crate::entity::{CacheResult, CachedEntity, EntityCache, EntityRegistry};
use crate::profile::{ProfileService, WriteOutcome};
use crate::reconciler::{Reconciler, SyncOutcome, SyncTrigger};
use crate::store::{
  open_or_degrade, LocalStore, SqliteStore, HISTORY_DB, LOCATIONS, OFFLINE_DB, PROFILE, USER_DB,
};
use crate::worker::WorkerMessage;

/// The three local databases.
pub struct Stores {
  pub offline: Arc<dyn LocalStore>,
  pub user: Arc<dyn LocalStore>,
  pub history: Arc<dyn LocalStore>,
}

impl Stores {
  /// Open every database under `dir`. One that fails to open is replaced by
  /// a store that keeps nothing.
  pub fn open(dir: &Path) -> Self {
    Self {
      offline: open_or_degrade(dir, &OFFLINE_DB),
      user: open_or_degrade(dir, &USER_DB),
      history: open_or_degrade(dir, &HISTORY_DB),
    }
  }

  pub fn in_memory() -> Result<Self> {
    Ok(Self {
      offline: Arc::new(SqliteStore::open_in_memory(&OFFLINE_DB)?),
      user: Arc::new(SqliteStore::open_in_memory(&USER_DB)?),
      history: Arc::new(SqliteStore::open_in_memory(&HISTORY_DB)?),
    })
  }
}

pub struct OfflineSync {
  connectivity: Arc<Connectivity>,
  buffer: Arc<MutationBuffer>,
  reconciler: Arc<Reconciler>,
  entities: EntityRegistry,
  profile: ProfileService,
}

impl OfflineSync {
  pub fn new(config: &Config, stores: Stores, backend: Arc<dyn Backend>, is_online: bool) -> Self {
    let connectivity = Arc::new(Connectivity::new(is_online));

    let profile_cache = EntityCache::new(stores.user, PROFILE);
    let mut entities = EntityRegistry::new();
    entities.register(profile_cache.clone());
    entities.register(EntityCache::new(stores.history, LOCATIONS));

    let buffer = Arc::new(MutationBuffer::new(
      stores.offline,
      entities.clone(),
      Resources::new(config.resources.clone()),
      config.sync.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
      buffer.clone(),
      backend.clone(),
      connectivity.clone(),
    ));
    let profile = ProfileService::new(backend, profile_cache, buffer.clone(), connectivity.clone());

    Self {
      connectivity,
      buffer,
      reconciler,
      entities,
      profile,
    }
  }

  pub fn status(&self) -> Status {
    self.connectivity.status()
  }

  pub fn subscribe(&self) -> watch::Receiver<Status> {
    self.connectivity.subscribe()
  }

  pub fn connectivity(&self) -> Arc<Connectivity> {
    self.connectivity.clone()
  }

  pub fn entities(&self) -> &EntityRegistry {
    &self.entities
  }

  /// Record a connectivity report. Coming back online starts a sync pass in
  /// the background and returns its handle.
  pub fn on_connectivity_change(&self, is_online: bool) -> Option<JoinHandle<Result<SyncOutcome>>> {
    match self.connectivity.set_online(is_online) {
      Transition::WentOnline => {
        let reconciler = self.reconciler.clone();
        Some(tokio::spawn(async move {
          reconciler.run(SyncTrigger::Reconnected).await
        }))
      }
      Transition::WentOffline | Transition::Unchanged => None,
    }
  }

  pub async fn request_sync(&self) -> Result<SyncOutcome> {
    self.reconciler.run(SyncTrigger::Manual).await
  }

  pub async fn request_profile_read(&self, user_id: &str) -> Result<CacheResult<Option<Value>>> {
    self.profile.read(user_id).await
  }

  pub async fn request_profile_write(&self, user_id: &str, updates: &Value) -> Result<WriteOutcome> {
    self.profile.write(user_id, updates).await
  }

  /// Buffer a mutation for the next sync and apply it locally.
  pub fn save_offline_data(
    &self,
    resource: &str,
    payload: Value,
    operation: OperationKind,
  ) -> Result<PendingMutation> {
    self.buffer.enqueue(resource, payload, operation)
  }

  pub fn get_cached_entity(&self, partition: &str, key: &str) -> Result<Option<CachedEntity>> {
    self.entities.require(partition)?.get(key)
  }

  pub fn pending_mutations(&self) -> Result<Vec<PendingMutation>> {
    self.buffer.list_pending()
  }

  pub fn failed_mutations(&self) -> Result<Vec<PendingMutation>> {
    self.buffer.list_failed()
  }

  pub async fn handle_message(&self, message: WorkerMessage) -> Result<()> {
    match message {
      WorkerMessage::StoreOfflineRequest(request) => {
        let mutation = request.to_mutation()?;
        self.save_offline_data(&mutation.resource, mutation.payload, mutation.kind)?;
      }
      WorkerMessage::PerformSync => {
        let outcome = self.reconciler.run(SyncTrigger::Worker).await?;
        debug!(?outcome, "Worker-requested sync finished");
      }
      WorkerMessage::SyncStarted => info!("Background sync started"),
      WorkerMessage::SkipWaiting => debug!("Ignoring worker-bound message"),
    }
    Ok(())
  }

  /// Process worker messages until the worker side hangs up.
  pub fn listen(self: &Arc<Self>, mut messages: mpsc::UnboundedReceiver<WorkerMessage>) -> JoinHandle<()> {
    let this = Arc::clone(self);
    tokio::spawn(async move {
      while let Some(message) = messages.recv().await {
        if let Err(e) = this.handle_message(message).await {
          warn!(error = %e, "Failed to handle worker message");
        }
      }
      debug!("Worker message channel closed");
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{BackendCall, FakeBackend};
  use crate::worker::OfflineRequest;
  use serde_json::json;

  fn offline_sync(is_online: bool) -> (Arc<OfflineSync>, Arc<FakeBackend>) {
    let backend = Arc::new(FakeBackend::new());
    let config = Config::with_backend("https://xyz.supabase.co");
    let sync = OfflineSync::new(&config, Stores::in_memory().unwrap(), backend.clone(), is_online);
    (Arc::new(sync), backend)
  }

  #[tokio::test]
  async fn test_cached_entity_reads_are_idempotent() {
    let (sync, _) = offline_sync(false);
    sync
      .save_offline_data(
        "user_profiles",
        json!({"user_id": "u1", "full_name": "B"}),
        OperationKind::Update,
      )
      .unwrap();

    let first = sync.get_cached_entity(PROFILE, "u1").unwrap();
    let second = sync.get_cached_entity(PROFILE, "u1").unwrap();
    assert!(first.is_some());
    assert_eq!(first, second);
    assert!(sync.get_cached_entity("nope", "u1").is_err());
  }

  #[tokio::test]
  async fn test_reconnect_triggers_sync() {
    let (sync, backend) = offline_sync(false);
    sync
      .save_offline_data("scans", json!({"result": "TABLE-7"}), OperationKind::Insert)
      .unwrap();

    assert!(sync.on_connectivity_change(false).is_none());
    let handle = sync.on_connectivity_change(true).unwrap();
    let outcome = handle.await.unwrap().unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed(report) if report.synced == 1));

    assert!(sync.pending_mutations().unwrap().is_empty());
    assert_eq!(backend.calls().len(), 1);
    assert!(!sync.status().is_syncing);
  }

  #[tokio::test]
  async fn test_manual_sync_while_offline_is_skipped() {
    let (sync, _) = offline_sync(false);
    assert_eq!(sync.request_sync().await.unwrap(), SyncOutcome::Offline);
  }

  #[tokio::test]
  async fn test_worker_messages_are_queued_then_synced() {
    let (sync, backend) = offline_sync(true);
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = sync.listen(rx);

    tx.send(WorkerMessage::StoreOfflineRequest(OfflineRequest {
      url: "https://xyz.supabase.co/rest/v1/user_profiles?user_id=eq.u1".into(),
      method: "PATCH".into(),
      body: Some(r#"{"full_name": "B"}"#.into()),
    }))
    .unwrap();
    tx.send(WorkerMessage::SyncStarted).unwrap();
    tx.send(WorkerMessage::PerformSync).unwrap();
    drop(tx);
    listener.await.unwrap();

    assert!(sync.pending_mutations().unwrap().is_empty());
    assert!(matches!(
      &backend.calls()[0],
      BackendCall::Update { resource, filter, .. }
        if resource == "user_profiles" && filter.value == "u1"
    ));
    let entity = sync.get_cached_entity(PROFILE, "u1").unwrap().unwrap();
    assert!(!entity.pending_sync);
    assert_eq!(entity.payload["full_name"], "B");
  }

  #[tokio::test]
  async fn test_unusable_data_dir_degrades_to_noop() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let stores = Stores::open(file.path());
    let config = Config::with_backend("https://xyz.supabase.co");
    let sync = OfflineSync::new(&config, stores, Arc::new(FakeBackend::new()), false);

    sync
      .save_offline_data("scans", json!({"n": 1}), OperationKind::Insert)
      .unwrap();
    assert!(sync.pending_mutations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_profile_requests_route_through_service() {
    let (sync, backend) = offline_sync(true);
    backend.set_row("user_profiles", "u1", json!({"user_id": "u1", "full_name": "A"}));

    let read = sync.request_profile_read("u1").await.unwrap();
    assert_eq!(read.data.unwrap()["full_name"], "A");

    sync.on_connectivity_change(false);
    let outcome = sync
      .request_profile_write("u1", &json!({"full_name": "B"}))
      .await
      .unwrap();
    assert!(matches!(outcome, WriteOutcome::Queued(_)));
    assert_eq!(sync.pending_mutations().unwrap().len(), 1);
  }
}
