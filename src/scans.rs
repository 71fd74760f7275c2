//! Locally kept QR scan results.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::store::{from_record, to_record, Key, LocalStore, SCANS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
  pub id: i64,
  /// Decoded QR payload
  pub result: String,
  pub timestamp: DateTime<Utc>,
  pub synced: bool,
}

pub struct ScanHistory {
  store: Arc<dyn LocalStore>,
}

impl ScanHistory {
  pub fn new(store: Arc<dyn LocalStore>) -> Self {
    Self { store }
  }

  pub fn save_scan(&self, result: &str) -> Result<ScanRecord> {
    let record = serde_json::json!({
      "result": result,
      "timestamp": Utc::now(),
      "synced": false,
    });
    let key = self.store.put(SCANS, None, record)?;
    debug!(%key, "Saved scan");

    self
      .store
      .get(SCANS, &key)?
      .map(from_record)
      .transpose()?
      .ok_or_else(|| eyre!("Scan {} vanished after saving", key))
  }

  pub fn saved_scans(&self) -> Result<Vec<ScanRecord>> {
    self
      .store
      .get_all(SCANS)?
      .into_iter()
      .map(from_record)
      .collect()
  }

  pub fn unsynced(&self) -> Result<Vec<ScanRecord>> {
    self
      .store
      .get_all_by_index(SCANS, "synced", &Value::Bool(false))?
      .into_iter()
      .map(from_record)
      .collect()
  }

  pub fn mark_as_synced(&self, id: i64) -> Result<()> {
    let key = Key::Int(id);
    let mut scan: ScanRecord = self
      .store
      .get(SCANS, &key)?
      .map(from_record)
      .transpose()?
      .ok_or_else(|| eyre!("Scan {} not found", id))?;

    scan.synced = true;
    self.store.put(SCANS, None, to_record(&scan)?)?;
    Ok(())
  }
}
