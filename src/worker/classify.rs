//! Decides which caching strategy applies to an intercepted request.

use color_eyre::{eyre::eyre, Result};
use url::{Origin, Url};

use super::http::{Method, Request, RequestMode};
use crate::config::Config;

/// Strategy classes, listed in the order they are tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
  /// Left alone: foreign untrusted origins and uncached mutations
  Passthrough,
  Navigation,
  MapTile,
  BackendApi,
  StaticAsset,
}

#[derive(Debug, Clone)]
pub struct Policy {
  origin: Origin,
  backend_host: Option<String>,
  api_hosts: Vec<String>,
  trusted_hosts: Vec<String>,
  tile_patterns: Vec<String>,
  api_allow_list: Vec<String>,
}

/// `host` is `domain` or one of its subdomains.
fn host_matches(host: &str, domain: &str) -> bool {
  host == domain
    || host
      .strip_suffix(domain)
      .is_some_and(|prefix| prefix.ends_with('.'))
}

impl Policy {
  pub fn from_config(config: &Config) -> Result<Self> {
    let origin = Url::parse(&config.app.origin)
      .map_err(|e| eyre!("Invalid application origin {}: {}", config.app.origin, e))?
      .origin();
    let backend = Url::parse(&config.backend.url)
      .map_err(|e| eyre!("Invalid backend URL {}: {}", config.backend.url, e))?;

    Ok(Self {
      origin,
      backend_host: backend.host_str().map(String::from),
      api_hosts: config.cache.api_hosts.clone(),
      trusted_hosts: config.cache.trusted_hosts.clone(),
      tile_patterns: config.cache.tile_patterns.clone(),
      api_allow_list: config.cache.api_allow_list.clone(),
    })
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin
  }

  fn is_api_host(&self, host: &str) -> bool {
    self.backend_host.as_deref() == Some(host)
      || self.api_hosts.iter().any(|h| host_matches(host, h))
  }

  fn is_trusted(&self, url: &Url) -> bool {
    if self.is_same_origin(url) {
      return true;
    }
    let Some(host) = url.host_str() else {
      return false;
    };
    self.is_api_host(host) || self.trusted_hosts.iter().any(|h| host_matches(host, h))
  }

  pub fn classify(&self, request: &Request) -> RouteClass {
    let url = &request.url;

    if !self.is_trusted(url) {
      return RouteClass::Passthrough;
    }
    if request.mode == RequestMode::Navigate {
      return RouteClass::Navigation;
    }
    if self
      .tile_patterns
      .iter()
      .any(|p| url.as_str().contains(p.as_str()))
    {
      return RouteClass::MapTile;
    }
    if url.host_str().is_some_and(|h| self.is_api_host(h)) || url.path().contains("/api/") {
      return RouteClass::BackendApi;
    }

    match request.method {
      Method::Get | Method::Head => RouteClass::StaticAsset,
      _ => RouteClass::Passthrough,
    }
  }

  /// Whether a successful response to `request` belongs in the API cache.
  pub fn is_cacheable_api(&self, request: &Request) -> bool {
    request.method == Method::Get
      && self
        .api_allow_list
        .iter()
        .any(|fragment| request.url.as_str().contains(fragment.as_str()))
  }
}
