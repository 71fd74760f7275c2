//! Fakes shared by the unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::backend::{Backend, BackendError, RowFilter};
use crate::buffer::{MutationBuffer, Resources};
use crate::config::{Config, SyncConfig};
use crate::entity::{merge_payload, EntityCache, EntityRegistry};
use crate::store::{DatabaseSpec, Key, LocalStore, SqliteStore, OFFLINE_DB, PROFILE, USER_DB};
use crate::worker::{Network, NetworkError, Request, Response, ResponseKind};

/// Mutation buffer over in-memory stores with the profile partition bound.
pub fn test_buffer(policy: SyncConfig) -> (Arc<MutationBuffer>, EntityCache) {
  let offline = Arc::new(SqliteStore::open_in_memory(&OFFLINE_DB).unwrap());
  let user = Arc::new(SqliteStore::open_in_memory(&USER_DB).unwrap());
  let profile = EntityCache::new(user, PROFILE);

  let mut entities = EntityRegistry::new();
  entities.register(profile.clone());

  let config = Config::with_backend("https://xyz.supabase.co");
  let buffer = MutationBuffer::new(offline, entities, Resources::new(config.resources), policy);
  (Arc::new(buffer), profile)
}

/// In-memory store whose deletes can be made to fail.
pub struct FlakyStore {
  inner: SqliteStore,
  fail_deletes: AtomicBool,
}

impl FlakyStore {
  pub fn new(spec: &'static DatabaseSpec) -> Self {
    Self {
      inner: SqliteStore::open_in_memory(spec).unwrap(),
      fail_deletes: AtomicBool::new(false),
    }
  }

  pub fn fail_deletes(&self, fail: bool) {
    self.fail_deletes.store(fail, Ordering::SeqCst);
  }
}

impl LocalStore for FlakyStore {
  fn name(&self) -> &str {
    self.inner.name()
  }

  fn get(&self, partition: &str, key: &Key) -> color_eyre::Result<Option<Value>> {
    self.inner.get(partition, key)
  }

  fn put(&self, partition: &str, key: Option<Key>, value: Value) -> color_eyre::Result<Key> {
    self.inner.put(partition, key, value)
  }

  fn get_all(&self, partition: &str) -> color_eyre::Result<Vec<Value>> {
    self.inner.get_all(partition)
  }

  fn get_all_by_index(
    &self,
    partition: &str,
    index: &str,
    query: &Value,
  ) -> color_eyre::Result<Vec<Value>> {
    self.inner.get_all_by_index(partition, index, query)
  }

  fn delete(&self, partition: &str, key: &Key) -> color_eyre::Result<()> {
    if self.fail_deletes.load(Ordering::SeqCst) {
      return Err(color_eyre::eyre::eyre!("disk I/O error"));
    }
    self.inner.delete(partition, key)
  }

  fn count(&self, partition: &str) -> color_eyre::Result<usize> {
    self.inner.count(partition)
  }

  fn update(
    &self,
    partition: &str,
    key: &Key,
    f: &mut dyn FnMut(Option<Value>) -> color_eyre::Result<Option<Value>>,
  ) -> color_eyre::Result<bool> {
    self.inner.update(partition, key, f)
  }

  fn transfer(&self, from: &str, key: &Key, to: &str, value: Value) -> color_eyre::Result<Key> {
    self.inner.transfer(from, key, to, value)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
  Insert {
    resource: String,
    row: Value,
  },
  Update {
    resource: String,
    filter: RowFilter,
    changes: Value,
  },
  Delete {
    resource: String,
    filter: RowFilter,
  },
  Select {
    resource: String,
    filter: RowFilter,
  },
}

#[derive(Debug, Clone, Copy)]
pub enum FakeFailure {
  Offline,
  Reject(u16),
}

impl FakeFailure {
  fn error(self) -> BackendError {
    match self {
      FakeFailure::Offline => BackendError::Network("connection refused".into()),
      FakeFailure::Reject(status) => BackendError::Rejected {
        status,
        message: "rejected".into(),
      },
    }
  }
}

/// Backend that records calls and fails on demand.
#[derive(Default)]
pub struct FakeBackend {
  calls: Mutex<Vec<BackendCall>>,
  failures: Mutex<HashMap<usize, FakeFailure>>,
  rows: Mutex<HashMap<(String, String), Value>>,
  offline: AtomicBool,
  gate: Option<Semaphore>,
  waiting: AtomicUsize,
}

impl FakeBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every call waits for a permit from [`FakeBackend::release`].
  pub fn gated() -> Self {
    Self {
      gate: Some(Semaphore::new(0)),
      ..Self::default()
    }
  }

  pub fn release(&self, permits: usize) {
    if let Some(gate) = &self.gate {
      gate.add_permits(permits);
    }
  }

  /// Fail the call with this zero-based index.
  pub fn fail_call(&self, index: usize, failure: FakeFailure) {
    self.failures.lock().unwrap().insert(index, failure);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_row(&self, resource: &str, id: &str, row: Value) {
    self
      .rows
      .lock()
      .unwrap()
      .insert((resource.to_string(), id.to_string()), row);
  }

  pub fn calls(&self) -> Vec<BackendCall> {
    self.calls.lock().unwrap().clone()
  }

  /// Calls currently held at the gate.
  pub fn waiting(&self) -> usize {
    self.waiting.load(Ordering::SeqCst)
  }

  async fn record(&self, call: BackendCall) -> Result<(), BackendError> {
    if let Some(gate) = &self.gate {
      self.waiting.fetch_add(1, Ordering::SeqCst);
      gate.acquire().await.unwrap().forget();
      self.waiting.fetch_sub(1, Ordering::SeqCst);
    }

    let index = {
      let mut calls = self.calls.lock().unwrap();
      calls.push(call);
      calls.len() - 1
    };

    if self.offline.load(Ordering::SeqCst) {
      return Err(FakeFailure::Offline.error());
    }
    match self.failures.lock().unwrap().get(&index) {
      Some(failure) => Err(failure.error()),
      None => Ok(()),
    }
  }
}

#[async_trait]
impl Backend for FakeBackend {
  async fn insert(&self, resource: &str, row: &Value) -> Result<(), BackendError> {
    self
      .record(BackendCall::Insert {
        resource: resource.into(),
        row: row.clone(),
      })
      .await
  }

  async fn update(
    &self,
    resource: &str,
    filter: &RowFilter,
    changes: &Value,
  ) -> Result<(), BackendError> {
    self
      .record(BackendCall::Update {
        resource: resource.into(),
        filter: filter.clone(),
        changes: changes.clone(),
      })
      .await?;

    let key = (resource.to_string(), filter.value.clone());
    if let Some(row) = self.rows.lock().unwrap().get_mut(&key) {
      merge_payload(row, changes);
    }
    Ok(())
  }

  async fn delete(&self, resource: &str, filter: &RowFilter) -> Result<(), BackendError> {
    self
      .record(BackendCall::Delete {
        resource: resource.into(),
        filter: filter.clone(),
      })
      .await
  }

  async fn select_one(
    &self,
    resource: &str,
    filter: &RowFilter,
  ) -> Result<Option<Value>, BackendError> {
    self
      .record(BackendCall::Select {
        resource: resource.into(),
        filter: filter.clone(),
      })
      .await?;

    Ok(
      self
        .rows
        .lock()
        .unwrap()
        .get(&(resource.to_string(), filter.value.clone()))
        .cloned(),
    )
  }
}

/// Network answering from a route table.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  fallback: Mutex<Option<Response>>,
  delay: Mutex<Option<Duration>>,
  requests: Mutex<Vec<Request>>,
  offline: AtomicBool,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  /// Answer for URLs without a route (404 when unset).
  pub fn set_fallback(&self, response: Response) {
    *self.fallback.lock().unwrap() = Some(response);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub fn request_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
    self.requests.lock().unwrap().push(request.clone());

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(NetworkError::Transport("network unreachable".into()));
    }

    let routed = self
      .routes
      .lock()
      .unwrap()
      .get(request.url.as_str())
      .cloned();
    let response = routed
      .or_else(|| self.fallback.lock().unwrap().clone())
      .unwrap_or_else(|| Response::new(404, "not found", ResponseKind::Cors));
    Ok(response)
  }
}
