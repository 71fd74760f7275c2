//! The network the worker sits in front of.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use thiserror::Error;
use url::{Origin, Url};

use super::http::{Method, Request, Response, ResponseKind};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
  #[error("transport error: {0}")]
  Transport(String),

  #[error("request timed out")]
  Timeout,

  #[error("worker is not running")]
  WorkerGone,
}

impl From<reqwest::Error> for NetworkError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      NetworkError::Timeout
    } else {
      NetworkError::Transport(e.to_string())
    }
  }
}

/// Something that turns requests into responses.
///
/// Only transport failures are errors; any HTTP status is a response.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: Request) -> Result<Response, NetworkError>;
}

/// Plain HTTP through reqwest.
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Origin,
}

impl HttpNetwork {
  pub fn new(app_origin: &str, timeout: Duration) -> Result<Self> {
    let origin = Url::parse(app_origin)
      .map_err(|e| eyre!("Invalid application origin {}: {}", app_origin, e))?
      .origin();

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }
}

fn reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
    Method::Options => reqwest::Method::OPTIONS,
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
    let kind = if request.url.origin() == self.origin {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    };

    let mut builder = self
      .client
      .request(reqwest_method(request.method), request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
      kind,
    })
  }
}
