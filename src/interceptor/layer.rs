//! Interceptor that applies a caching strategy to each request.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::classify::{RequestClass, RouteRules};
use super::http::{FetchError, Fetcher, Request, Response};
use crate::config::CacheConfig;
use crate::storage::{CacheEntry, Storage};

/// Page returned when navigation fails and nothing suitable is cached.
pub const OFFLINE_PAGE: &str = include_str!("offline.html");

const OFFLINE_PAGE_PATH: &str = "/offline.html";

/// The two caches of the current generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  pub static_name: String,
  pub dynamic_name: String,
}

impl CacheNames {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      static_name: format!("{}-static-{}", prefix, version),
      dynamic_name: format!("{}-dynamic-{}", prefix, version),
    }
  }

  /// Names for the configured generation. Without an explicit version the
  /// manifest fingerprint is used, so changing the manifest rolls the caches.
  pub fn from_config(config: &CacheConfig) -> Self {
    let version = config
      .version
      .clone()
      .unwrap_or_else(|| manifest_fingerprint(&config.manifest));
    Self::new(&config.prefix, &version)
  }

  pub fn is_current(&self, name: &str) -> bool {
    name == self.static_name || name == self.dynamic_name
  }
}

/// First 8 hex chars of the SHA-256 of the manifest paths.
fn manifest_fingerprint(manifest: &[String]) -> String {
  let mut hasher = Sha256::new();
  for path in manifest {
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
  }
  let digest = hex::encode(hasher.finalize());
  format!("m{}", &digest[..8])
}

/// What the interceptor decided for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// The interceptor produced the response
  Respond(Response),
  /// Not intercepted; the caller talks to the network itself
  PassThrough,
}

/// Network interceptor.
///
/// Sits between the application and the fetcher, serving from the named
/// caches according to the request class. Cache writes run as detached
/// blocking tasks and never delay the response; `settle` waits for them.
pub struct Interceptor<S: Storage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  rules: RouteRules,
  names: CacheNames,
  origin: Url,
  manifest: Vec<String>,
  writes: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Storage, F: Fetcher> Interceptor<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>, origin: Url, config: &CacheConfig) -> Self {
    Self {
      storage,
      fetcher,
      rules: RouteRules::from_config(config),
      names: CacheNames::from_config(config),
      origin,
      manifest: config.manifest.clone(),
      writes: Mutex::new(Vec::new()),
    }
  }

  pub fn cache_names(&self) -> &CacheNames {
    &self.names
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .origin
      .join(target)
      .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))
  }

  /// Prefetch the manifest into the static cache.
  ///
  /// All-or-nothing: any transport error or non-2xx response fails the
  /// install and nothing is written.
  pub async fn install(&self) -> Result<usize> {
    info!(cache = %self.names.static_name, "Caching static files...");

    let urls = self
      .manifest
      .iter()
      .map(|path| self.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let entries: Vec<CacheEntry> = try_join_all(urls.iter().map(|url| async move {
      let response = self
        .fetcher
        .fetch(&Request::get(url.clone()))
        .await
        .map_err(|e| eyre!("Failed to prefetch {}: {}", url, e))?;

      if !response.is_success() {
        return Err(eyre!("Failed to prefetch {}: HTTP {}", url, response.status));
      }
      Ok::<_, color_eyre::Report>(response.to_entry(&self.names.static_name, url))
    }))
    .await?;

    self.storage.cache_put_all(&entries)?;
    info!(count = entries.len(), "Static files cached");

    Ok(entries.len())
  }

  /// Delete every cache that is not part of the current generation.
  /// Returns the deleted names.
  pub fn activate(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    for name in self.storage.cache_names()? {
      if self.names.is_current(&name) {
        continue;
      }
      info!(cache = %name, "Deleting old cache");
      self.storage.cache_delete(&name)?;
      deleted.push(name);
    }

    Ok(deleted)
  }

  /// Decide how to answer `request`. Only GET requests are intercepted.
  pub async fn handle(&self, request: &Request) -> Outcome {
    if request.method != Method::GET {
      return Outcome::PassThrough;
    }

    let class = self.rules.classify(request);
    debug!(url = %request.url, ?class, "intercepted");

    let response = match class {
      RequestClass::StaticFile => self.handle_static_file(request).await,
      RequestClass::Api => self.handle_api(request).await,
      RequestClass::Navigation => self.handle_navigation(request).await,
      RequestClass::Other => self.handle_other(request).await,
    };

    Outcome::Respond(response)
  }

  /// Like `handle`, but pass-through requests are sent straight to the network.
  pub async fn respond(&self, request: &Request) -> Result<Response, FetchError> {
    match self.handle(request).await {
      Outcome::Respond(response) => Ok(response),
      Outcome::PassThrough => self.fetcher.fetch(request).await,
    }
  }

  /// Wait for all detached cache writes to finish.
  pub async fn settle(&self) {
    let pending = match self.writes.lock() {
      Ok(mut writes) => std::mem::take(&mut *writes),
      Err(e) => {
        warn!("Lock poisoned: {}", e);
        return;
      }
    };

    for handle in pending {
      if let Err(e) = handle.await {
        warn!("Cache write task failed: {}", e);
      }
    }
  }

  /// Cache-first.
  async fn handle_static_file(&self, request: &Request) -> Response {
    if let Some(entry) = self.lookup(&request.url) {
      return entry.into();
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_detached(&self.names.static_name, &request.url, &response);
        }
        response
      }
      Err(e) => {
        warn!(url = %request.url, "Static file fetch failed: {}", e);
        Response::synthetic(503, "text/plain", "File not available offline")
      }
    }
  }

  /// Network-first with cache fallback.
  async fn handle_api(&self, request: &Request) -> Response {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_detached(&self.names.dynamic_name, &request.url, &response);
        }
        response
      }
      Err(e) => {
        info!(url = %request.url, "Network failed, trying cache: {}", e);
        match self.lookup(&request.url) {
          Some(entry) => entry.into(),
          None => offline_api_response(),
        }
      }
    }
  }

  /// Network-first; falls back to the cached page, then the offline page.
  async fn handle_navigation(&self, request: &Request) -> Response {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_detached(&self.names.dynamic_name, &request.url, &response);
        }
        response
      }
      Err(e) => {
        info!(url = %request.url, "Navigation failed, serving offline page: {}", e);
        if let Some(entry) = self.lookup(&request.url) {
          return entry.into();
        }
        if let Some(entry) = self
          .resolve(OFFLINE_PAGE_PATH)
          .ok()
          .and_then(|url| self.lookup(&url))
        {
          return entry.into();
        }
        Response::synthetic(200, "text/html", OFFLINE_PAGE)
      }
    }
  }

  /// Network only.
  async fn handle_other(&self, request: &Request) -> Response {
    match self.fetcher.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        debug!(url = %request.url, "Fetch failed: {}", e);
        Response::synthetic(503, "text/plain", "Resource not available offline")
      }
    }
  }

  /// Cache lookup across all caches. Storage errors count as a miss.
  fn lookup(&self, url: &Url) -> Option<CacheEntry> {
    match self.storage.cache_match(None, url.as_str()) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %url, "Cache lookup failed: {}", e);
        None
      }
    }
  }

  fn store_detached(&self, cache_name: &str, url: &Url, response: &Response) {
    let entry = response.to_entry(cache_name, url);
    let storage = Arc::clone(&self.storage);

    let handle = tokio::task::spawn_blocking(move || {
      if let Err(e) = storage.cache_put(&entry) {
        warn!(url = %entry.url, "Cache write failed: {}", e);
      }
    });

    match self.writes.lock() {
      Ok(mut writes) => {
        writes.retain(|h| !h.is_finished());
        writes.push(handle);
      }
      Err(e) => warn!("Lock poisoned: {}", e),
    }
  }
}

fn offline_api_response() -> Response {
  let body = serde_json::json!({
    "error": "Offline - data not available",
    "offline": true,
  });
  Response::synthetic(503, "application/json", body.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::interceptor::http::testing::ScriptedFetcher;
  use crate::interceptor::http::ResponseSource;
  use crate::storage::SqliteStorage;
  use chrono::Utc;

  const ORIGIN: &str = "http://localhost:8080";

  fn setup() -> (
    Interceptor<SqliteStorage, ScriptedFetcher>,
    Arc<ScriptedFetcher>,
    Arc<SqliteStorage>,
  ) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let config = CacheConfig {
      version: Some("v1".to_string()),
      ..CacheConfig::default()
    };
    let interceptor = Interceptor::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      Url::parse(ORIGIN).unwrap(),
      &config,
    );
    (interceptor, fetcher, storage)
  }

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  async fn respond(interceptor: &Interceptor<SqliteStorage, ScriptedFetcher>, req: Request) -> Response {
    match interceptor.handle(&req).await {
      Outcome::Respond(r) => r,
      Outcome::PassThrough => panic!("expected interception"),
    }
  }

  #[test]
  fn test_cache_names_from_version() {
    let names = CacheNames::new("field-smart-link", "v1");
    assert_eq!(names.static_name, "field-smart-link-static-v1");
    assert_eq!(names.dynamic_name, "field-smart-link-dynamic-v1");
  }

  #[test]
  fn test_derived_version_follows_manifest() {
    let config = CacheConfig::default();
    let a = CacheNames::from_config(&config);
    assert_eq!(a, CacheNames::from_config(&config));

    let mut changed = config.clone();
    changed.manifest.push("/app.css".to_string());
    assert_ne!(a, CacheNames::from_config(&changed));
  }

  #[tokio::test]
  async fn test_static_second_request_is_cache_hit() {
    let (interceptor, fetcher, _) = setup();
    for path in ["/assets/app.js", "/style.css", "/img/field.png", "/fonts/a.woff2"] {
      fetcher.route(&url(path), 200, path);
      let req = Request::get(interceptor.resolve(path).unwrap());

      let first = respond(&interceptor, req.clone()).await;
      assert_eq!(first.source, ResponseSource::Network);
      interceptor.settle().await;

      let calls = fetcher.calls();
      let second = respond(&interceptor, req).await;
      assert_eq!(fetcher.calls(), calls, "{} hit the network twice", path);
      assert_eq!(second.source, ResponseSource::Cache);
      assert_eq!(second.body, first.body);
    }
  }

  #[tokio::test]
  async fn test_static_error_status_not_cached() {
    let (interceptor, fetcher, storage) = setup();
    fetcher.route(&url("/broken.js"), 500, "boom");
    let req = Request::get(interceptor.resolve("/broken.js").unwrap());

    assert_eq!(respond(&interceptor, req).await.status, 500);
    interceptor.settle().await;
    assert!(storage
      .cache_match(None, &url("/broken.js"))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_static_offline_without_cache_is_503() {
    let (interceptor, fetcher, _) = setup();
    fetcher.set_online(false);
    let response = respond(
      &interceptor,
      Request::get(interceptor.resolve("/app.js").unwrap()),
    )
    .await;
    assert_eq!(response.status, 503);
    assert_eq!(response.source, ResponseSource::Synthetic);
  }

  #[tokio::test]
  async fn test_api_falls_back_to_latest_cached_copy() {
    let (interceptor, fetcher, _) = setup();
    let farms = url("/api/farms");
    let req = Request::get(Url::parse(&farms).unwrap());

    fetcher.route(&farms, 200, "[1]");
    respond(&interceptor, req.clone()).await;
    interceptor.settle().await;
    fetcher.route(&farms, 200, "[1,2]");
    respond(&interceptor, req.clone()).await;
    interceptor.settle().await;

    fetcher.set_online(false);
    let response = respond(&interceptor, req).await;
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.text(), "[1,2]");
  }

  #[tokio::test]
  async fn test_api_offline_without_cache_is_json_503() {
    let (interceptor, fetcher, _) = setup();
    fetcher.set_online(false);
    let response = respond(
      &interceptor,
      Request::get(interceptor.resolve("/api/crops?farm=3").unwrap()),
    )
    .await;

    assert_eq!(response.status, 503);
    assert_eq!(response.content_type.as_deref(), Some("application/json"));
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["offline"], true);
    assert!(body["error"].is_string());
  }

  #[tokio::test]
  async fn test_api_fallback_requires_exact_url() {
    let (interceptor, fetcher, _) = setup();
    fetcher.route(&url("/api/crops?farm=1"), 200, "one");
    respond(
      &interceptor,
      Request::get(interceptor.resolve("/api/crops?farm=1").unwrap()),
    )
    .await;
    interceptor.settle().await;

    fetcher.set_online(false);
    let response = respond(
      &interceptor,
      Request::get(interceptor.resolve("/api/crops?farm=2").unwrap()),
    )
    .await;
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_index_page_served_from_cache_when_offline() {
    let (interceptor, fetcher, _) = setup();
    fetcher.route(&url("/index.html"), 200, "<html>farm</html>");
    let req = Request::navigate(interceptor.resolve("/index.html").unwrap());

    let online = respond(&interceptor, req.clone()).await;
    assert_eq!(online.status, 200);
    interceptor.settle().await;

    fetcher.set_online(false);
    let offline = respond(&interceptor, req).await;
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.body, online.body);
  }

  #[tokio::test]
  async fn test_navigation_uses_cached_offline_page_then_embedded() {
    let (interceptor, fetcher, storage) = setup();
    fetcher.set_online(false);
    let req = Request::navigate(interceptor.resolve("/farms/7").unwrap());

    let embedded = respond(&interceptor, req.clone()).await;
    assert_eq!(embedded.status, 200);
    assert_eq!(embedded.source, ResponseSource::Synthetic);
    assert!(embedded.text().contains("You're Offline"));

    storage
      .cache_put(&CacheEntry {
        cache_name: interceptor.cache_names().static_name.clone(),
        url: url("/offline.html"),
        status: 200,
        content_type: Some("text/html".to_string()),
        body: b"custom offline".to_vec(),
        captured_at: Utc::now(),
      })
      .unwrap();
    let cached = respond(&interceptor, req).await;
    assert_eq!(cached.text(), "custom offline");
  }

  #[tokio::test]
  async fn test_other_is_network_only() {
    let (interceptor, fetcher, _) = setup();
    fetcher.route(&url("/report.pdf"), 200, "pdf");
    let req = Request::get(interceptor.resolve("/report.pdf").unwrap());
    assert_eq!(respond(&interceptor, req.clone()).await.status, 200);
    interceptor.settle().await;

    fetcher.set_online(false);
    let response = respond(&interceptor, req).await;
    assert_eq!(response.status, 503);
    assert_eq!(response.text(), "Resource not available offline");
  }

  #[tokio::test]
  async fn test_non_get_passes_through() {
    let (interceptor, fetcher, _) = setup();
    let req = Request::get(interceptor.resolve("/api/farms").unwrap()).with_method(Method::POST);
    assert_eq!(interceptor.handle(&req).await, Outcome::PassThrough);
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_install_caches_whole_manifest() {
    let (interceptor, fetcher, storage) = setup();
    for path in &CacheConfig::default().manifest {
      fetcher.route(&url(path), 200, path);
    }

    assert_eq!(interceptor.install().await.unwrap(), 6);
    let hit = storage
      .cache_match(Some(&interceptor.cache_names().static_name), &url("/logo.svg"))
      .unwrap()
      .unwrap();
    assert_eq!(hit.body, b"/logo.svg");
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let (interceptor, fetcher, storage) = setup();
    for path in &CacheConfig::default().manifest {
      if path != "/favicon.ico" {
        fetcher.route(&url(path), 200, path);
      }
    }

    assert!(interceptor.install().await.is_err());
    assert!(storage.cache_names().unwrap().is_empty());

    fetcher.route(&url("/favicon.ico"), 200, "ico");
    fetcher.set_online(false);
    assert!(interceptor.install().await.is_err());
    assert!(storage.cache_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_deletes_only_old_generations() {
    let (interceptor, _, storage) = setup();
    let names = interceptor.cache_names().clone();
    for cache_name in [
      "field-smart-link-static-v0",
      "field-smart-link-dynamic-v0",
      "field-smart-link-v1",
      names.static_name.as_str(),
      names.dynamic_name.as_str(),
    ] {
      storage
        .cache_put(&CacheEntry {
          cache_name: cache_name.to_string(),
          url: url("/index.html"),
          status: 200,
          content_type: None,
          body: cache_name.as_bytes().to_vec(),
          captured_at: Utc::now(),
        })
        .unwrap();
    }

    let mut deleted = interceptor.activate().unwrap();
    deleted.sort();
    assert_eq!(
      deleted,
      vec![
        "field-smart-link-dynamic-v0",
        "field-smart-link-static-v0",
        "field-smart-link-v1"
      ]
    );

    let mut left = storage.cache_names().unwrap();
    left.sort();
    let mut expected = vec![names.dynamic_name, names.static_name];
    expected.sort();
    assert_eq!(left, expected);

    assert!(interceptor.activate().unwrap().is_empty());
  }

  /// Storage whose cache is always broken.
  struct BrokenCacheStorage;

  impl Storage for BrokenCacheStorage {
    fn replace_all(&self, _: crate::storage::Collection, _: &[serde_json::Value]) -> Result<()> {
      Ok(())
    }

    fn get_all(&self, _: crate::storage::Collection) -> Result<Vec<crate::storage::StoredRecord>> {
      Ok(Vec::new())
    }

    fn get(&self, _: crate::storage::Collection, _: &str) -> Result<Option<serde_json::Value>> {
      Ok(None)
    }

    fn append(&self, _: crate::storage::Collection, _: &serde_json::Value) -> Result<String> {
      Err(eyre!("disk full"))
    }

    fn remove_keys(&self, _: crate::storage::Collection, _: &[String]) -> Result<usize> {
      Ok(0)
    }

    fn clear(&self, _: crate::storage::Collection) -> Result<()> {
      Ok(())
    }

    fn cache_put(&self, _: &CacheEntry) -> Result<()> {
      Err(eyre!("disk full"))
    }

    fn cache_put_all(&self, _: &[CacheEntry]) -> Result<()> {
      Err(eyre!("disk full"))
    }

    fn cache_match(&self, _: Option<&str>, _: &str) -> Result<Option<CacheEntry>> {
      Err(eyre!("database is locked"))
    }

    fn cache_names(&self) -> Result<Vec<String>> {
      Err(eyre!("database is locked"))
    }

    fn cache_delete(&self, _: &str) -> Result<bool> {
      Err(eyre!("database is locked"))
    }

    fn notifications_load(&self) -> Result<Vec<crate::notifications::Notification>> {
      Ok(Vec::new())
    }

    fn notification_put_front(&self, _: &crate::notifications::Notification) -> Result<()> {
      Ok(())
    }

    fn notifications_mark_read(&self, _: Option<&str>) -> Result<usize> {
      Ok(0)
    }

    fn notification_remove(&self, _: &str) -> Result<bool> {
      Ok(false)
    }

    fn notifications_clear(&self) -> Result<()> {
      Ok(())
    }

    fn meta_get(&self, _: &str) -> Result<Option<String>> {
      Ok(None)
    }

    fn meta_set(&self, _: &str, _: Option<&str>) -> Result<()> {
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_cache_failures_count_as_miss() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let interceptor = Interceptor::new(
      Arc::new(BrokenCacheStorage),
      Arc::clone(&fetcher),
      Url::parse(ORIGIN).unwrap(),
      &CacheConfig::default(),
    );
    fetcher.route(&url("/assets/app.js"), 200, "console.log(1)");

    let static_req = Request::get(Url::parse(&url("/assets/app.js")).unwrap());
    let Outcome::Respond(response) = interceptor.handle(&static_req).await else {
      panic!("expected interception");
    };
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(response.text(), "console.log(1)");
    // Failed write is logged, not surfaced
    interceptor.settle().await;

    fetcher.set_online(false);

    let api_req = Request::get(Url::parse(&url("/api/farms")).unwrap());
    let Outcome::Respond(response) = interceptor.handle(&api_req).await else {
      panic!("expected interception");
    };
    assert_eq!(response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["offline"], true);
    assert_eq!(body["error"], "Offline - data not available");

    let nav_req = Request::navigate(Url::parse(&url("/farms")).unwrap());
    let Outcome::Respond(response) = interceptor.handle(&nav_req).await else {
      panic!("expected interception");
    };
    assert_eq!(response.status, 200);
    assert_eq!(response.source, ResponseSource::Synthetic);
    assert_eq!(response.text(), OFFLINE_PAGE);

    assert!(interceptor.activate().is_err());
  }
}
