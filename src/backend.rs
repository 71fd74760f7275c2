//! Row-level CRUD against the hosted backend's REST interface.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum BackendError {
  #[error("network error: {0}")]
  Network(String),

  #[error("request timed out")]
  Timeout,

  #[error("backend rejected request ({status}): {message}")]
  Rejected { status: u16, message: String },

  #[error("invalid request: {0}")]
  Invalid(String),
}

impl BackendError {
  /// Whether retrying later could succeed without changing the request.
  pub fn is_transient(&self) -> bool {
    matches!(self, BackendError::Network(_) | BackendError::Timeout)
  }
}

impl From<reqwest::Error> for BackendError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      BackendError::Timeout
    } else if e.is_decode() {
      BackendError::Invalid(format!("malformed response: {}", e))
    } else {
      BackendError::Network(e.to_string())
    }
  }
}

/// Equality filter selecting a single row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
  pub column: String,
  pub value: String,
}

impl RowFilter {
  pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      column: column.into(),
      value: value.into(),
    }
  }
}

/// Remote backend the reconciler replays mutations against.
#[async_trait]
pub trait Backend: Send + Sync {
  async fn insert(&self, resource: &str, row: &Value) -> Result<(), BackendError>;

  async fn update(
    &self,
    resource: &str,
    filter: &RowFilter,
    changes: &Value,
  ) -> Result<(), BackendError>;

  async fn delete(&self, resource: &str, filter: &RowFilter) -> Result<(), BackendError>;

  async fn select_one(
    &self,
    resource: &str,
    filter: &RowFilter,
  ) -> Result<Option<Value>, BackendError>;
}

/// Backend client speaking the PostgREST dialect (`/rest/v1/{table}`).
#[derive(Clone)]
pub struct RestBackend {
  client: reqwest::Client,
  base: Url,
  api_key: Option<String>,
}

impl RestBackend {
  pub fn new(config: &Config) -> Result<Self> {
    let base = Url::parse(&config.backend.url)
      .map_err(|e| eyre!("Invalid backend URL {}: {}", config.backend.url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.backend.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      api_key: Config::api_key(),
    })
  }

  pub fn with_client(client: reqwest::Client, base: Url, api_key: Option<String>) -> Self {
    Self {
      client,
      base,
      api_key,
    }
  }

  fn table_url(&self, resource: &str, filter: Option<&RowFilter>) -> Result<Url, BackendError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| BackendError::Invalid(format!("backend URL {} cannot be a base", self.base)))?
      .pop_if_empty()
      .extend(["rest", "v1", resource]);

    if let Some(filter) = filter {
      url
        .query_pairs_mut()
        .append_pair(&filter.column, &format!("eq.{}", filter.value));
    }
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let mut builder = self.client.request(method, url);
    if let Some(key) = &self.api_key {
      builder = builder
        .header("apikey", key)
        .header("Authorization", format!("Bearer {}", key));
    }
    builder
  }

  async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, BackendError> {
    let response = builder.send().await?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(BackendError::Rejected {
      status: status.as_u16(),
      message: if message.is_empty() {
        status.canonical_reason().unwrap_or("unknown error").to_string()
      } else {
        message
      },
    })
  }
}

#[async_trait]
impl Backend for RestBackend {
  async fn insert(&self, resource: &str, row: &Value) -> Result<(), BackendError> {
    let url = self.table_url(resource, None)?;
    self
      .send(
        self
          .request(Method::POST, url)
          .header("Prefer", "return=minimal")
          .json(row),
      )
      .await?;
    Ok(())
  }

  async fn update(
    &self,
    resource: &str,
    filter: &RowFilter,
    changes: &Value,
  ) -> Result<(), BackendError> {
    let url = self.table_url(resource, Some(filter))?;
    self
      .send(
        self
          .request(Method::PATCH, url)
          .header("Prefer", "return=minimal")
          .json(changes),
      )
      .await?;
    Ok(())
  }

  async fn delete(&self, resource: &str, filter: &RowFilter) -> Result<(), BackendError> {
    let url = self.table_url(resource, Some(filter))?;
    self.send(self.request(Method::DELETE, url)).await?;
    Ok(())
  }

  async fn select_one(
    &self,
    resource: &str,
    filter: &RowFilter,
  ) -> Result<Option<Value>, BackendError> {
    let mut url = self.table_url(resource, Some(filter))?;
    url.query_pairs_mut().append_pair("select", "*");

    let rows: Vec<Value> = self
      .send(self.request(Method::GET, url))
      .await?
      .json()
      .await?;

    Ok(rows.into_iter().next())
  }
}
