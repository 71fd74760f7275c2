//! Write-ahead buffer for mutations made while the backend is unreachable.
//!
//! Mutations are recorded in the `offline` database in insertion order and
//! replayed later by the reconciler. Enqueuing also updates the mirrored
//! entity snapshot so local reads see the change right away.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ExhaustedPolicy, ResourceConfig, SyncConfig};
use crate::entity::{EntityCache, EntityRegistry};
use crate::store::{from_record, to_record, Key, LocalStore, DEAD_LETTERS, MUTATIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Insert,
  Update,
  Delete,
}

impl OperationKind {
  /// Map an HTTP method to the mutation it performs.
  pub fn from_method(method: &str) -> Option<Self> {
    match method.to_ascii_uppercase().as_str() {
      "POST" => Some(OperationKind::Insert),
      "PUT" | "PATCH" => Some(OperationKind::Update),
      "DELETE" => Some(OperationKind::Delete),
      _ => None,
    }
  }
}

impl FromStr for OperationKind {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "insert" => Ok(OperationKind::Insert),
      "update" => Ok(OperationKind::Update),
      "delete" => Ok(OperationKind::Delete),
      other => Err(eyre!("Unknown operation '{}' (expected insert, update or delete)", other)),
    }
  }
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      OperationKind::Insert => "insert",
      OperationKind::Update => "update",
      OperationKind::Delete => "delete",
    })
  }
}

/// A buffered state-changing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
  pub id: i64,
  /// Backend table the mutation applies to
  pub target_resource: String,
  pub operation_kind: OperationKind,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  pub synced: bool,
  /// Rejections counted toward the exhaustion limit
  #[serde(default)]
  pub attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

/// What happened to a mutation after a failed replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
  Retained,
  Discarded,
  DeadLettered,
}

/// Bindings from backend tables to key columns and local partitions.
#[derive(Debug, Clone, Default)]
pub struct Resources {
  bindings: Vec<ResourceConfig>,
}

impl Resources {
  pub fn new(bindings: Vec<ResourceConfig>) -> Self {
    Self { bindings }
  }

  /// Column identifying a row of `resource` ("id" unless bound otherwise).
  pub fn key_column(&self, resource: &str) -> &str {
    self
      .bindings
      .iter()
      .find(|b| b.name == resource)
      .map(|b| b.key_column.as_str())
      .unwrap_or("id")
  }

  pub fn partition(&self, resource: &str) -> Option<&str> {
    self
      .bindings
      .iter()
      .find(|b| b.name == resource)
      .and_then(|b| b.partition.as_deref())
  }
}

/// Render a row identifier found in a payload.
pub fn identifier(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

pub struct MutationBuffer {
  store: Arc<dyn LocalStore>,
  entities: EntityRegistry,
  resources: Resources,
  policy: SyncConfig,
}

impl MutationBuffer {
  pub fn new(
    store: Arc<dyn LocalStore>,
    entities: EntityRegistry,
    resources: Resources,
    policy: SyncConfig,
  ) -> Self {
    Self {
      store,
      entities,
      resources,
      policy,
    }
  }

  pub fn resources(&self) -> &Resources {
    &self.resources
  }

  /// Record a mutation for later replay. Never touches the network.
  pub fn enqueue(
    &self,
    target_resource: &str,
    payload: Value,
    operation_kind: OperationKind,
  ) -> Result<PendingMutation> {
    let mut mutation = PendingMutation {
      id: 0,
      target_resource: target_resource.to_string(),
      operation_kind,
      payload,
      enqueued_at: Utc::now(),
      synced: false,
      attempts: 0,
      last_error: None,
    };

    // Let the store assign the id
    let mut record = to_record(&mutation)?;
    if let Some(fields) = record.as_object_mut() {
      fields.remove("id");
    }
    let key = self.store.put(MUTATIONS, None, record)?;
    mutation.id = key
      .as_int()
      .ok_or_else(|| eyre!("Mutation store returned non-integer key {}", key))?;

    if let Err(e) = self.apply_optimistic(&mutation) {
      warn!(id = mutation.id, error = %e, "Failed to apply optimistic update");
    }

    info!(
      id = mutation.id,
      resource = target_resource,
      operation = %operation_kind,
      "Queued offline mutation"
    );
    Ok(mutation)
  }

  /// Unsynced mutations in the order they were enqueued.
  pub fn list_pending(&self) -> Result<Vec<PendingMutation>> {
    self
      .store
      .get_all_by_index(MUTATIONS, "synced", &Value::Bool(false))?
      .into_iter()
      .map(from_record)
      .collect()
  }

  /// Mutations given up on under the dead-letter policy.
  pub fn list_failed(&self) -> Result<Vec<PendingMutation>> {
    self
      .store
      .get_all(DEAD_LETTERS)?
      .into_iter()
      .map(from_record)
      .collect()
  }

  pub fn mark_synced(&self, id: i64) -> Result<()> {
    let key = Key::Int(id);
    if !self.policy.retain_synced {
      return self.store.delete(MUTATIONS, &key);
    }

    let Some(record) = self.store.get(MUTATIONS, &key)? else {
      return Ok(());
    };
    let mut mutation: PendingMutation = from_record(record)?;
    mutation.synced = true;
    mutation.last_error = None;
    self.store.put(MUTATIONS, None, to_record(&mutation)?)?;
    Ok(())
  }

  /// Note a failed replay and apply the exhaustion policy.
  ///
  /// Only failures with `counts_toward_limit` (remote rejections) increase
  /// the attempt counter; transient network failures never exhaust a mutation.
  pub fn record_failure(
    &self,
    id: i64,
    error: &str,
    counts_toward_limit: bool,
  ) -> Result<FailureOutcome> {
    let key = Key::Int(id);
    let record = self
      .store
      .get(MUTATIONS, &key)?
      .ok_or_else(|| eyre!("Mutation {} not found", id))?;
    let mut mutation: PendingMutation = from_record(record)?;

    if counts_toward_limit {
      mutation.attempts += 1;
    }
    mutation.last_error = Some(error.to_string());

    let exhausted = counts_toward_limit
      && self
        .policy
        .max_attempts
        .is_some_and(|max| mutation.attempts >= max);

    if !exhausted {
      self.store.put(MUTATIONS, None, to_record(&mutation)?)?;
      return Ok(FailureOutcome::Retained);
    }

    match self.policy.on_exhausted {
      ExhaustedPolicy::Retain => {
        self.store.put(MUTATIONS, None, to_record(&mutation)?)?;
        Ok(FailureOutcome::Retained)
      }
      ExhaustedPolicy::Discard => {
        warn!(id, attempts = mutation.attempts, error, "Discarding mutation after repeated rejections");
        self.store.delete(MUTATIONS, &key)?;
        Ok(FailureOutcome::Discarded)
      }
      ExhaustedPolicy::DeadLetter => {
        warn!(id, attempts = mutation.attempts, error, "Moving mutation to dead letters");
        self
          .store
          .transfer(MUTATIONS, &key, DEAD_LETTERS, to_record(&mutation)?)?;
        Ok(FailureOutcome::DeadLettered)
      }
    }
  }

  /// Entity cache and id mirroring the row a mutation targets, if bound.
  pub fn entity_target(&self, mutation: &PendingMutation) -> Option<(&EntityCache, String)> {
    let partition = self.resources.partition(&mutation.target_resource)?;
    let cache = self.entities.get(partition)?;
    let key_column = self.resources.key_column(&mutation.target_resource);
    let entity_id = mutation.payload.get(key_column).and_then(identifier)?;
    Some((cache, entity_id))
  }

  /// Whether unsynced mutations remain for one row.
  pub fn has_pending_for(&self, resource: &str, row_id: &str) -> Result<bool> {
    Ok(self.latest_pending_for(resource, row_id)?.is_some())
  }

  /// Most recently enqueued unsynced mutation for one row.
  pub fn latest_pending_for(&self, resource: &str, row_id: &str) -> Result<Option<PendingMutation>> {
    let key_column = self.resources.key_column(resource);
    Ok(self.list_pending()?.into_iter().rev().find(|m| {
      m.target_resource == resource
        && m.payload.get(key_column).and_then(identifier).as_deref() == Some(row_id)
    }))
  }

  fn apply_optimistic(&self, mutation: &PendingMutation) -> Result<()> {
    let Some((cache, entity_id)) = self.entity_target(mutation) else {
      debug!(
        resource = %mutation.target_resource,
        "No local partition bound to resource, skipping optimistic update"
      );
      return Ok(());
    };

    match mutation.operation_kind {
      OperationKind::Insert | OperationKind::Update => {
        cache.save_offline_update(&entity_id, &mutation.payload)?;
      }
      OperationKind::Delete => cache.mark_pending(&entity_id, &mutation.payload)?,
    }
    Ok(())
  }
}
