//! The interception worker and its handle.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use super::cache::{CacheKind, CacheSet, HttpCache};
use super::classify::{Policy, RouteClass};
use super::http::{Method, Request, Response, ResponseKind};
use super::message::{OfflineRequest, WorkerMessage};
use super::network::{Network, NetworkError};
use crate::config::Config;

/// Background-sync tag that triggers a reconciliation pass.
pub const SYNC_TAG: &str = "sync-pending-requests";

const OFFLINE_DOCUMENT: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Offline</title>
</head>
<body>
<h1>You are offline</h1>
<p>This page is not available offline. Check your connection and try again.</p>
</body>
</html>
"#;

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Intercepts requests and answers them from the network or the cache set.
pub struct ServiceWorker {
  network: Arc<dyn Network>,
  cache: Arc<HttpCache>,
  policy: Policy,
  caches: CacheSet,
  critical_assets: Vec<Url>,
  dynamic_assets: Vec<Url>,
  shell_url: Url,
  offline_url: Url,
  auto_activate: bool,
  activated: AtomicBool,
  messages: mpsc::UnboundedSender<WorkerMessage>,
}

impl ServiceWorker {
  pub fn new(
    config: &Config,
    network: Arc<dyn Network>,
    cache: Arc<HttpCache>,
    messages: mpsc::UnboundedSender<WorkerMessage>,
  ) -> Result<Self> {
    let origin = Url::parse(&config.app.origin)
      .map_err(|e| eyre!("Invalid application origin {}: {}", config.app.origin, e))?;
    let resolve = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid asset path {}: {}", path, e))
    };

    Ok(Self {
      network,
      cache,
      policy: Policy::from_config(config)?,
      caches: CacheSet::new(config.cache.generation),
      critical_assets: config
        .cache
        .critical_assets
        .iter()
        .map(|p| resolve(p))
        .collect::<Result<_>>()?,
      dynamic_assets: config
        .cache
        .precache_dynamic
        .iter()
        .filter(|p| !config.cache.critical_assets.contains(*p))
        .map(|p| resolve(p))
        .collect::<Result<_>>()?,
      shell_url: resolve(&config.cache.shell_path)?,
      offline_url: resolve(&config.cache.offline_path)?,
      auto_activate: config.cache.auto_activate,
      activated: AtomicBool::new(false),
      messages,
    })
  }

  pub fn is_activated(&self) -> bool {
    self.activated.load(Ordering::SeqCst)
  }

  /// Precache the critical assets into the critical cache and the map
  /// assets into the dynamic cache. Returns how many were stored.
  ///
  /// Individual failures are logged and skipped.
  pub async fn install(&self) -> Result<usize> {
    let critical = self.caches.name(CacheKind::Critical);
    let dynamic = self.caches.name(CacheKind::Dynamic);
    let targets: Vec<(&str, &Url)> = self
      .critical_assets
      .iter()
      .map(|url| (critical.as_str(), url))
      .chain(self.dynamic_assets.iter().map(|url| (dynamic.as_str(), url)))
      .collect();

    let fetches = targets
      .iter()
      .map(|(_, url)| self.network.fetch(Request::get((*url).clone())));

    let mut stored = 0;
    for ((cache_name, url), result) in targets.iter().zip(join_all(fetches).await) {
      match result {
        Ok(response) if response.is_success() => {
          if self.store(cache_name, url, &response) {
            stored += 1;
          }
        }
        Ok(response) => warn!(%url, status = response.status, "Failed to precache asset"),
        Err(e) => warn!(%url, error = %e, "Failed to precache asset"),
      }
    }

    info!(
      generation = self.caches.generation(),
      stored,
      total = targets.len(),
      "Worker installed"
    );

    if self.auto_activate {
      self.activate()?;
    }
    Ok(stored)
  }

  /// Retire every cache outside the current generation and start intercepting.
  pub fn activate(&self) -> Result<usize> {
    let mut deleted = 0;
    for name in self.cache.cache_names()? {
      if !self.caches.is_current(&name) {
        let removed = self.cache.delete_cache(&name)?;
        debug!(cache = %name, removed, "Deleted stale cache");
        deleted += 1;
      }
    }

    if !self.activated.swap(true, Ordering::SeqCst) {
      info!(generation = self.caches.generation(), deleted, "Worker activated");
    }
    Ok(deleted)
  }

  pub fn handle_message(&self, message: WorkerMessage) {
    match message {
      WorkerMessage::SkipWaiting => {
        if let Err(e) = self.activate() {
          warn!(error = %e, "Activation failed");
        }
      }
      other => debug!(message = ?other, "Ignoring message"),
    }
  }

  pub fn background_sync(&self, tag: &str) {
    if tag != SYNC_TAG {
      debug!(tag, "Ignoring unknown sync tag");
      return;
    }
    self.post(WorkerMessage::SyncStarted);
    self.post(WorkerMessage::PerformSync);
  }

  pub async fn handle_fetch(&self, request: Request) -> Result<Response, NetworkError> {
    if !self.is_activated() {
      return self.network.fetch(request).await;
    }

    match self.policy.classify(&request) {
      RouteClass::Passthrough => self.network.fetch(request).await,
      RouteClass::Navigation => Ok(self.navigate(request).await),
      RouteClass::MapTile => Ok(self.tile(request).await),
      RouteClass::BackendApi => Ok(self.api(request).await),
      RouteClass::StaticAsset => Ok(self.asset(request).await),
    }
  }

  /// Cache-first against the critical cache, falling back to the app shell.
  async fn navigate(&self, request: Request) -> Response {
    let critical = self.caches.name(CacheKind::Critical);
    let url = request.url.clone();

    if let Some(hit) = self.cached(&critical, &url) {
      debug!(%url, "Navigation served from cache");
      return hit;
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&critical, &url, &response);
        }
        response
      }
      Err(e) => {
        debug!(%url, error = %e, "Navigation failed, serving fallback");
        if let Some(shell) = self.cached(&critical, &self.shell_url) {
          return shell.with_header("Cache-Control", "no-store");
        }
        if let Some(page) = self.cached(&critical, &self.offline_url) {
          return page;
        }
        Response::html(200, OFFLINE_DOCUMENT)
      }
    }
  }

  async fn tile(&self, request: Request) -> Response {
    let dynamic = self.caches.name(CacheKind::Dynamic);
    let url = request.url.clone();

    if let Some(hit) = self.cached(&dynamic, &url) {
      return hit;
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&dynamic, &url, &response);
        }
        response
      }
      Err(e) => {
        debug!(%url, error = %e, "Tile unavailable");
        Response::empty()
      }
    }
  }

  /// Network-first. Allow-listed GETs are kept for offline reads, failed
  /// mutations are handed to the foreground for queueing.
  async fn api(&self, request: Request) -> Response {
    let api = self.caches.name(CacheKind::Api);
    let url = request.url.clone();
    let method = request.method;
    let cacheable = self.policy.is_cacheable_api(&request);
    let offline_request = matches!(
      method,
      Method::Post | Method::Put | Method::Patch | Method::Delete
    )
    .then(|| OfflineRequest {
      url: url.to_string(),
      method: method.to_string(),
      body: request.body_text(),
    });

    match self.network.fetch(request).await {
      Ok(response) => {
        if cacheable && response.is_success() {
          self.store(&api, &url, &response);
        }
        response
      }
      Err(e) => {
        debug!(%url, %method, error = %e, "Backend unreachable");
        if let Some(offline_request) = offline_request {
          self.post(WorkerMessage::StoreOfflineRequest(offline_request));
        }
        if method == Method::Get {
          if let Some(hit) = self.cached(&api, &url) {
            debug!(%url, "Serving cached API response");
            return hit;
          }
        }
        Response::json(503, &json!({"error": "Network error", "offline": true}))
      }
    }
  }

  async fn asset(&self, request: Request) -> Response {
    let url = request.url.clone();

    match self.cache.match_any(&self.caches.current_names(), &url) {
      Ok(Some(hit)) => return hit,
      Ok(None) => {}
      Err(e) => warn!(%url, error = %e, "Cache lookup failed"),
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.status == 200 && response.kind == ResponseKind::Basic {
          self.store(&self.caches.name(CacheKind::Dynamic), &url, &response);
        }
        response
      }
      Err(e) => {
        debug!(%url, error = %e, "Asset unavailable");
        Response::text(408, "Network error happened")
      }
    }
  }

  fn cached(&self, cache_name: &str, url: &Url) -> Option<Response> {
    match self.cache.match_in(cache_name, url) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(cache = cache_name, %url, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  fn store(&self, cache_name: &str, url: &Url, response: &Response) -> bool {
    match self.cache.put(cache_name, url, response) {
      Ok(()) => true,
      Err(e) => {
        warn!(cache = cache_name, %url, error = %e, "Failed to cache response");
        false
      }
    }
  }

  fn post(&self, message: WorkerMessage) {
    if self.messages.send(message).is_err() {
      warn!("No foreground listener, dropping worker message");
    }
  }

  /// Run the worker on its own task.
  pub fn spawn(self) -> WorkerHandle {
    let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let worker = Arc::new(self);

    tokio::spawn(async move {
      while let Some(command) = rx.recv().await {
        match command {
          Command::Fetch(request, reply) => {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
              let _ = reply.send(worker.handle_fetch(request).await);
            });
          }
          Command::Install(reply) => {
            let _ = reply.send(worker.install().await);
          }
          Command::Activate(reply) => {
            let _ = reply.send(worker.activate());
          }
          Command::Message(message) => worker.handle_message(message),
          Command::Sync(tag) => worker.background_sync(&tag),
        }
      }
      debug!("Worker stopped");
    });

    WorkerHandle { tx }
  }
}

enum Command {
  Fetch(Request, oneshot::Sender<Result<Response, NetworkError>>),
  Install(oneshot::Sender<Result<usize>>),
  Activate(oneshot::Sender<Result<usize>>),
  Message(WorkerMessage),
  Sync(String),
}

/// Foreground side of a running worker.
///
/// Fetching through the handle routes the request through interception.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::Sender<Command>,
}

impl WorkerHandle {
  async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(command(reply))
      .await
      .map_err(|_| eyre!("Worker is not running"))?;
    rx.await.map_err(|_| eyre!("Worker stopped before replying"))
  }

  pub async fn install(&self) -> Result<usize> {
    self.call(Command::Install).await?
  }

  pub async fn activate(&self) -> Result<usize> {
    self.call(Command::Activate).await?
  }

  pub async fn post_message(&self, message: WorkerMessage) -> Result<()> {
    self
      .tx
      .send(Command::Message(message))
      .await
      .map_err(|_| eyre!("Worker is not running"))
  }

  /// Deliver a background-sync event.
  pub async fn background_sync(&self, tag: &str) -> Result<()> {
    self
      .tx
      .send(Command::Sync(tag.to_string()))
      .await
      .map_err(|_| eyre!("Worker is not running"))
  }
}

#[async_trait]
impl Network for WorkerHandle {
  async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Command::Fetch(request, reply))
      .await
      .map_err(|_| NetworkError::WorkerGone)?;
    rx.await.map_err(|_| NetworkError::WorkerGone)?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::FakeNetwork;

  const ORIGIN: &str = "http://localhost:5173";

  struct Harness {
    worker: ServiceWorker,
    network: Arc<FakeNetwork>,
    cache: Arc<HttpCache>,
    messages: mpsc::UnboundedReceiver<WorkerMessage>,
  }

  fn harness_with(config: Config) -> Harness {
    let network = Arc::new(FakeNetwork::new());
    let cache = Arc::new(HttpCache::open_in_memory().unwrap());
    let (tx, messages) = mpsc::unbounded_channel();
    let worker = ServiceWorker::new(&config, network.clone(), cache.clone(), tx).unwrap();
    Harness {
      worker,
      network,
      cache,
      messages,
    }
  }

  fn harness() -> Harness {
    harness_with(Config::with_backend("https://xyz.supabase.co"))
  }

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  fn app(path: &str) -> Url {
    url(&format!("{}{}", ORIGIN, path))
  }

  fn serve_shell(network: &FakeNetwork) {
    for path in ["/", "/index.html", "/manifest.json", "/offline.html"] {
      network.route(
        app(path).as_str(),
        Response::html(200, &format!("<p>{}</p>", path)),
      );
    }
  }

  #[tokio::test]
  async fn test_install_precaches_and_activates() {
    let h = harness();
    serve_shell(&h.network);
    h.cache
      .put("critical-v0", &app("/"), &Response::html(200, "old"))
      .unwrap();

    for path in ["/leaflet.css", "/marker-icon.png", "/marker-icon-2x.png", "/marker-shadow.png"] {
      h.network.route(app(path).as_str(), Response::text(200, path));
    }

    assert_eq!(h.worker.install().await.unwrap(), 8);
    assert!(h.worker.is_activated());
    assert_eq!(
      h.cache.cache_names().unwrap(),
      vec!["critical-v1", "dynamic-v1"]
    );
    assert_eq!(h.cache.entries("critical-v1").unwrap().len(), 4);
    assert!(h
      .cache
      .match_in("dynamic-v1", &app("/marker-icon.png"))
      .unwrap()
      .is_some());
    assert!(h
      .cache
      .match_in("critical-v1", &app("/leaflet.css"))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_dynamic_precache_skips_critical_paths() {
    let mut config = Config::with_backend("https://xyz.supabase.co");
    config.cache.precache_dynamic = vec!["/offline.html".into(), "/leaflet.css".into()];
    let h = harness_with(config);
    serve_shell(&h.network);
    h.network
      .route(app("/leaflet.css").as_str(), Response::text(200, "css"));

    assert_eq!(h.worker.install().await.unwrap(), 5);
    assert_eq!(h.cache.entries("dynamic-v1").unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_install_skips_failed_assets() {
    let h = harness();
    h.network
      .route(app("/index.html").as_str(), Response::html(200, "shell"));

    assert_eq!(h.worker.install().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_waiting_worker_passes_through_until_skip_waiting() {
    let mut config = Config::with_backend("https://xyz.supabase.co");
    config.cache.auto_activate = false;
    let h = harness_with(config);
    serve_shell(&h.network);

    h.worker.install().await.unwrap();
    assert!(!h.worker.is_activated());

    h.network.set_offline(true);
    let err = h
      .worker
      .handle_fetch(Request::navigate(app("/")))
      .await
      .unwrap_err();
    assert!(matches!(err, NetworkError::Transport(_)));

    h.worker.handle_message(WorkerMessage::SkipWaiting);
    assert!(h.worker.is_activated());
    let response = h
      .worker
      .handle_fetch(Request::navigate(app("/")))
      .await
      .unwrap();
    assert_eq!(response.body_text(), "<p>/</p>");
  }

  #[tokio::test]
  async fn test_cached_navigation_skips_network() {
    let h = harness();
    serve_shell(&h.network);
    h.worker.install().await.unwrap();
    let before = h.network.request_count();

    let response = h
      .worker
      .handle_fetch(Request::navigate(app("/")))
      .await
      .unwrap();
    assert_eq!(response.body_text(), "<p>/</p>");
    assert_eq!(h.network.request_count(), before);
  }

  #[tokio::test]
  async fn test_offline_navigation_falls_back_to_shell() {
    let h = harness();
    serve_shell(&h.network);
    h.worker.install().await.unwrap();
    h.network.set_offline(true);

    let response = h
      .worker
      .handle_fetch(Request::navigate(app("/profile")))
      .await
      .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "<p>/index.html</p>");
    assert_eq!(response.header("Cache-Control"), Some("no-store"));
  }

  #[tokio::test]
  async fn test_offline_navigation_without_cache_gets_placeholder() {
    let h = harness();
    h.worker.activate().unwrap();
    h.network.set_offline(true);

    let response = h
      .worker
      .handle_fetch(Request::navigate(app("/")))
      .await
      .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.body_text().contains("You are offline"));
  }

  #[tokio::test]
  async fn test_allow_listed_api_response_served_offline_byte_identical() {
    let h = harness();
    h.worker.activate().unwrap();
    let target = "https://xyz.supabase.co/rest/v1/user_profiles?user_id=eq.u1&select=*";
    let body = br#"[{"user_id":"u1","full_name":"A"}]"#.to_vec();
    h.network.route(
      target,
      Response::new(200, body.clone(), ResponseKind::Cors)
        .with_header("Content-Type", "application/json"),
    );

    let online = h
      .worker
      .handle_fetch(Request::get(url(target)))
      .await
      .unwrap();
    assert_eq!(online.body, body);

    h.network.set_offline(true);
    let offline = h
      .worker
      .handle_fetch(Request::get(url(target)))
      .await
      .unwrap();
    assert_eq!(offline.status, 200);
    assert_eq!(offline.body, body);
  }

  #[tokio::test]
  async fn test_uncached_api_failure_is_synthetic_503() {
    let h = harness();
    h.worker.activate().unwrap();
    h.network.set_offline(true);

    let response = h
      .worker
      .handle_fetch(Request::get(url("https://xyz.supabase.co/rest/v1/scans")))
      .await
      .unwrap();
    assert_eq!(response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body, json!({"error": "Network error", "offline": true}));
  }

  #[tokio::test]
  async fn test_non_allow_listed_api_response_is_not_cached() {
    let h = harness();
    h.worker.activate().unwrap();
    let target = "https://xyz.supabase.co/rest/v1/scans";
    h.network.route(target, Response::json(200, &json!([])));

    h.worker.handle_fetch(Request::get(url(target))).await.unwrap();
    assert!(h.cache.entries("api-v1").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_mutation_is_posted_to_foreground() {
    let mut h = harness();
    h.worker.activate().unwrap();
    h.network.set_offline(true);

    let request = Request::new(
      Method::Patch,
      url("https://xyz.supabase.co/rest/v1/user_profiles?user_id=eq.u1"),
    )
    .with_json(&json!({"full_name": "B"}));
    let response = h.worker.handle_fetch(request).await.unwrap();
    assert_eq!(response.status, 503);

    match h.messages.try_recv().unwrap() {
      WorkerMessage::StoreOfflineRequest(offline) => {
        assert_eq!(offline.method, "PATCH");
        assert_eq!(offline.body.as_deref(), Some(r#"{"full_name":"B"}"#));
        assert!(offline.url.ends_with("user_id=eq.u1"));
      }
      other => panic!("unexpected message {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_failing_tile_returns_empty_body() {
    let h = harness();
    h.worker.activate().unwrap();
    h.network.set_offline(true);

    let response = h
      .worker
      .handle_fetch(Request::get(url("https://a.tile.openstreetmap.org/3/4/2.png")))
      .await
      .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.body.is_empty());
  }

  #[tokio::test]
  async fn test_tiles_are_cached_after_first_fetch() {
    let h = harness();
    h.worker.activate().unwrap();
    let tile = "https://a.tile.openstreetmap.org/3/4/2.png";
    h.network
      .route(tile, Response::new(200, vec![1u8, 2, 3], ResponseKind::Cors));

    h.worker.handle_fetch(Request::get(url(tile))).await.unwrap();
    h.network.set_offline(true);
    let response = h.worker.handle_fetch(Request::get(url(tile))).await.unwrap();
    assert_eq!(response.body, vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_static_assets() {
    let h = harness();
    h.worker.activate().unwrap();
    h.network.route(
      app("/app.js").as_str(),
      Response::new(200, "app", ResponseKind::Basic),
    );

    h.worker
      .handle_fetch(Request::get(app("/app.js")))
      .await
      .unwrap();
    h.network.set_offline(true);

    let cached = h
      .worker
      .handle_fetch(Request::get(app("/app.js")))
      .await
      .unwrap();
    assert_eq!(cached.body_text(), "app");

    let missing = h
      .worker
      .handle_fetch(Request::get(app("/missing.js")))
      .await
      .unwrap();
    assert_eq!(missing.status, 408);
    assert_eq!(missing.body_text(), "Network error happened");
  }

  #[tokio::test]
  async fn test_background_sync_posts_sync_messages() {
    let mut h = harness();
    h.worker.background_sync("other-tag");
    assert!(h.messages.try_recv().is_err());

    h.worker.background_sync(SYNC_TAG);
    assert_eq!(h.messages.try_recv().unwrap(), WorkerMessage::SyncStarted);
    assert_eq!(h.messages.try_recv().unwrap(), WorkerMessage::PerformSync);
  }

  #[tokio::test]
  async fn test_handle_routes_fetches_through_worker() {
    let h = harness();
    serve_shell(&h.network);
    let network = h.network.clone();
    let handle = h.worker.spawn();

    assert_eq!(handle.install().await.unwrap(), 4);
    network.set_offline(true);

    let response = handle.fetch(Request::navigate(app("/"))).await.unwrap();
    assert_eq!(response.body_text(), "<p>/</p>");
  }
}
