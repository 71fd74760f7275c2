//! Messages exchanged between the worker and the foreground.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::buffer::OperationKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  /// A backend mutation failed at the transport level and should be queued
  StoreOfflineRequest(OfflineRequest),
  PerformSync,
  SyncStarted,
  /// Activate a waiting worker right away
  SkipWaiting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineRequest {
  pub url: String,
  pub method: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<String>,
}

/// A failed request translated into a buffer entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
  pub resource: String,
  pub payload: Value,
  pub kind: OperationKind,
}

const REST_PREFIX: &str = "/rest/v1/";

impl OfflineRequest {
  pub fn to_mutation(&self) -> Result<MutationRequest> {
    let kind = OperationKind::from_method(&self.method)
      .ok_or_else(|| eyre!("{} requests are not mutations", self.method))?;

    let url = Url::parse(&self.url).map_err(|e| eyre!("Invalid request URL {}: {}", self.url, e))?;
    let resource = url
      .path()
      .split_once(REST_PREFIX)
      .and_then(|(_, rest)| rest.split('/').filter(|s| !s.is_empty()).last())
      .ok_or_else(|| eyre!("Not a backend table URL: {}", self.url))?
      .to_string();

    let mut payload = match self.body.as_deref().map(str::trim) {
      None | Some("") => Map::new(),
      Some(body) => match serde_json::from_str(body) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => return Err(eyre!("Expected a JSON object body, got {}", other)),
        Err(e) => return Err(eyre!("Request body is not JSON: {}", e)),
      },
    };

    // Fold row filters (`column=eq.value`) into the payload so updates and
    // deletes carry their identifier.
    for (column, filter) in url.query_pairs() {
      if let Some(value) = filter.strip_prefix("eq.") {
        payload
          .entry(column.into_owned())
          .or_insert_with(|| Value::String(value.to_string()));
      }
    }

    Ok(MutationRequest {
      resource,
      payload: Value::Object(payload),
      kind,
    })
  }
}
