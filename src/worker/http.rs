//! Request and response values passed through the interception layer.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
    }
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      "OPTIONS" => Ok(Method::Options),
      other => Err(eyre!("Unsupported HTTP method '{}'", other)),
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Whether a request loads a top-level document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  Navigate,
  Subresource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: RequestMode::Subresource,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// A top-level document load.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_json(mut self, body: &Value) -> Self {
    self.body = Some(body.to_string().into_bytes());
    self.with_header("Content-Type", "application/json")
  }

  pub fn body_text(&self) -> Option<String> {
    self
      .body
      .as_ref()
      .map(|b| String::from_utf8_lossy(b).into_owned())
  }
}

/// Where a response came from, as far as cacheability is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin network response
  Basic,
  /// Cross-origin network response
  Cors,
  /// Built locally by the worker
  Synthetic,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseKind::Basic => "basic",
      ResponseKind::Cors => "cors",
      ResponseKind::Synthetic => "synthetic",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "basic" => ResponseKind::Basic,
      "cors" => ResponseKind::Cors,
      _ => ResponseKind::Synthetic,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub kind: ResponseKind,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>, kind: ResponseKind) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      kind,
    }
  }

  /// Empty 200 standing in for an unavailable resource.
  pub fn empty() -> Self {
    Self::new(200, Vec::new(), ResponseKind::Synthetic)
  }

  pub fn text(status: u16, text: &str) -> Self {
    Self::new(status, text.as_bytes().to_vec(), ResponseKind::Synthetic)
      .with_header("Content-Type", "text/plain")
  }

  pub fn json(status: u16, value: &Value) -> Self {
    Self::new(status, value.to_string().into_bytes(), ResponseKind::Synthetic)
      .with_header("Content-Type", "application/json")
  }

  pub fn html(status: u16, document: &str) -> Self {
    Self::new(status, document.as_bytes().to_vec(), ResponseKind::Synthetic)
      .with_header("Content-Type", "text/html; charset=utf-8")
  }

  /// Set a header, replacing any existing value.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_method_parsing() {
    assert_eq!("patch".parse::<Method>().unwrap(), Method::Patch);
    assert_eq!(Method::Delete.to_string(), "DELETE");
    assert!("TRACE".parse::<Method>().is_err());
  }

  #[test]
  fn test_headers_are_case_insensitive() {
    let response = Response::json(503, &json!({"offline": true}))
      .with_header("content-type", "application/problem+json");
    assert_eq!(response.headers.len(), 1);
    assert_eq!(
      response.header("Content-Type"),
      Some("application/problem+json")
    );
    assert!(!response.is_success());
  }

  #[test]
  fn test_navigate_request() {
    let url = Url::parse("http://localhost:5173/").unwrap();
    let request = Request::navigate(url);
    assert_eq!(request.mode, RequestMode::Navigate);
    assert_eq!(request.method, Method::Get);
  }
}
