//! Cached snapshots of remote records.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::store::{from_record, to_record, Key, LocalStore};

/// A snapshot of a remote record, possibly carrying unconfirmed local edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity {
  pub entity_id: String,
  pub payload: Value,
  /// When the snapshot was captured
  pub timestamp: DateTime<Utc>,
  /// True while a local mutation has not been confirmed remotely
  #[serde(default)]
  pub pending_sync: bool,
  /// Last unconfirmed partial update
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub offline_updates: Option<Value>,
}

/// Result of a read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Cached data served while online, e.g. because local edits are pending.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the backend
  Network,
  /// Local data preferred over the backend
  Cache,
  /// Backend unreachable, serving whatever is cached
  Offline,
}

/// Shallow-merge the top-level fields of `updates` into `base`.
///
/// A non-object `base` is replaced by `updates`.
pub fn merge_payload(base: &mut Value, updates: &Value) {
  match (base.as_object_mut(), updates.as_object()) {
    (Some(base), Some(updates)) => {
      for (field, value) in updates {
        base.insert(field.clone(), value.clone());
      }
    }
    _ => *base = updates.clone(),
  }
}

/// Entity snapshots stored in one partition of a local store.
#[derive(Clone)]
pub struct EntityCache {
  store: Arc<dyn LocalStore>,
  partition: &'static str,
}

impl EntityCache {
  pub fn new(store: Arc<dyn LocalStore>, partition: &'static str) -> Self {
    Self { store, partition }
  }

  pub fn partition(&self) -> &'static str {
    self.partition
  }

  pub fn get(&self, entity_id: &str) -> Result<Option<CachedEntity>> {
    self
      .store
      .get(self.partition, &Key::from(entity_id))?
      .map(from_record)
      .transpose()
  }

  pub fn get_all(&self) -> Result<Vec<CachedEntity>> {
    self
      .store
      .get_all(self.partition)?
      .into_iter()
      .map(from_record)
      .collect()
  }

  /// Store a confirmed snapshot, dropping any pending state.
  pub fn save_snapshot(&self, entity_id: &str, payload: Value) -> Result<CachedEntity> {
    let entity = CachedEntity {
      entity_id: entity_id.to_string(),
      payload,
      timestamp: Utc::now(),
      pending_sync: false,
      offline_updates: None,
    };
    self.write(&entity)?;
    Ok(entity)
  }

  /// Store a snapshot fetched from the backend unless local edits are
  /// pending for it. Returns whether the snapshot was stored.
  pub fn refresh_snapshot(&self, entity_id: &str, payload: Value) -> Result<bool> {
    let written = self.modify(entity_id, |current| match current {
      Some(entity) if entity.pending_sync => None,
      _ => Some(CachedEntity {
        entity_id: entity_id.to_string(),
        payload: payload.clone(),
        timestamp: Utc::now(),
        pending_sync: false,
        offline_updates: None,
      }),
    })?;
    if written.is_none() {
      debug!(partition = self.partition, entity_id, "Kept snapshot with pending edits");
    }
    Ok(written.is_some())
  }

  /// Merge changes the backend just accepted into the snapshot.
  ///
  /// Left alone while local edits are pending, since those already sit on
  /// top of the snapshot. Returns the resulting entity, if any.
  pub fn apply_confirmed(&self, entity_id: &str, changes: &Value) -> Result<Option<CachedEntity>> {
    let mut kept = None;
    let written = self.modify(entity_id, |current| match current {
      Some(entity) if entity.pending_sync => {
        kept = Some(entity);
        None
      }
      current => {
        let mut payload = current
          .map(|e| e.payload)
          .unwrap_or_else(|| Value::Object(Default::default()));
        merge_payload(&mut payload, changes);
        Some(CachedEntity {
          entity_id: entity_id.to_string(),
          payload,
          timestamp: Utc::now(),
          pending_sync: false,
          offline_updates: None,
        })
      }
    })?;
    Ok(written.or(kept))
  }

  /// Apply an unconfirmed partial update on top of the current snapshot.
  pub fn save_offline_update(&self, entity_id: &str, updates: &Value) -> Result<CachedEntity> {
    let entity = self
      .modify(entity_id, |current| {
        let mut payload = current
          .map(|e| e.payload)
          .unwrap_or_else(|| Value::Object(Default::default()));
        merge_payload(&mut payload, updates);
        Some(CachedEntity {
          entity_id: entity_id.to_string(),
          payload,
          timestamp: Utc::now(),
          pending_sync: true,
          offline_updates: Some(updates.clone()),
        })
      })?
      .ok_or_else(|| eyre!("Offline update for {} was not stored", entity_id))?;
    debug!(partition = self.partition, entity_id, "Applied offline update");
    Ok(entity)
  }

  /// Flag an entity as pending without touching its payload.
  pub fn mark_pending(&self, entity_id: &str, updates: &Value) -> Result<()> {
    self.modify(entity_id, |current| {
      current.map(|mut entity| {
        entity.pending_sync = true;
        entity.offline_updates = Some(updates.clone());
        entity.timestamp = Utc::now();
        entity
      })
    })?;
    Ok(())
  }

  /// Entities with unconfirmed local edits.
  pub fn pending(&self) -> Result<Vec<CachedEntity>> {
    self
      .store
      .get_all_by_index(self.partition, "pendingSync", &Value::Bool(true))?
      .into_iter()
      .map(from_record)
      .collect()
  }

  pub fn clear_pending_sync(&self, entity_id: &str) -> Result<()> {
    self.modify(entity_id, |current| {
      current.map(|mut entity| {
        entity.pending_sync = false;
        entity.offline_updates = None;
        entity
      })
    })?;
    Ok(())
  }

  /// Read-modify-write one entity in a single store transaction.
  ///
  /// `f` returns the replacement entity, or `None` to keep the current one.
  fn modify(
    &self,
    entity_id: &str,
    mut f: impl FnMut(Option<CachedEntity>) -> Option<CachedEntity>,
  ) -> Result<Option<CachedEntity>> {
    let mut written = None;
    self
      .store
      .update(self.partition, &Key::from(entity_id), &mut |current| {
        let current = current.map(from_record::<CachedEntity>).transpose()?;
        match f(current) {
          Some(entity) => {
            let record = to_record(&entity)?;
            written = Some(entity);
            Ok(Some(record))
          }
          None => Ok(None),
        }
      })?;
    Ok(written)
  }

  fn write(&self, entity: &CachedEntity) -> Result<()> {
    self
      .store
      .put(self.partition, None, to_record(entity)?)
      .map(|_| ())
  }
}

/// Entity caches by partition name.
#[derive(Clone, Default)]
pub struct EntityRegistry {
  caches: HashMap<&'static str, EntityCache>,
}

impl EntityRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, cache: EntityCache) {
    self.caches.insert(cache.partition(), cache);
  }

  pub fn get(&self, partition: &str) -> Option<&EntityCache> {
    self.caches.get(partition)
  }

  pub fn require(&self, partition: &str) -> Result<&EntityCache> {
    self
      .get(partition)
      .ok_or_else(|| eyre!("Unknown entity partition '{}'", partition))
  }
}
