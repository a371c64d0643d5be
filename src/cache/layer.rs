//! Cache layer that applies a fetch strategy to each intercepted request.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::classifier::{Classifier, Strategy};
use super::expiry::ExpiryPolicy;
use super::generation::Generations;
use super::storage::{CacheStorage, CachedResponse};
use super::traits::{CacheResult, CacheSource, Request, Response};
use crate::config::CacheConfig;
use crate::network::Network;

/// Strategy executor.
///
/// Sits between the page and the network, deciding per request whether the
/// answer comes from the cache, the network, or both.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  classifier: Arc<Classifier>,
  expiry: ExpiryPolicy,
  generations: Generations,
  offline_page: String,
  /// Background revalidations still running
  refreshes: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, config: &CacheConfig) -> Self {
    Self {
      storage,
      network,
      classifier: Arc::new(Classifier::new(config)),
      expiry: ExpiryPolicy::new(&config.max_age),
      generations: Generations::from_config(config),
      offline_page: config.offline_page.clone(),
      refreshes: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn generations(&self) -> &Generations {
    &self.generations
  }

  /// Route an interceptable request to its strategy.
  pub async fn handle(&self, request: &Request) -> Result<CacheResult<Response>> {
    let strategy = self.classifier.classify(&request.url);
    debug!(url = %request.url, %strategy, "Handling request");

    match strategy {
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::StaleWhileRevalidate => Ok(self.stale_while_revalidate(request).await),
    }
  }

  /// Serve from cache while fresh; otherwise go to the network and keep the
  /// cached copy as a fallback.
  pub async fn cache_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    let cached = self.lookup_any(request);

    if let Some(hit) = &cached {
      if !self.is_expired(request, &hit.response) {
        debug!(url = %request.url, partition = %hit.partition, "Cache hit");
        return Ok(CacheResult::from_cache(hit.response.clone(), false));
      }
      debug!(url = %request.url, "Cached entry expired");
    }

    match self.network.fetch(request).await {
      Ok(response) if response.is_success() => {
        if response.is_cacheable() {
          self.store(self.partition_for(request), request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Ok(response) => match cached {
        // Only expired entries reach this point
        Some(hit) => {
          warn!(url = %request.url, status = response.status, "Network error status, serving expired copy");
          Ok(CacheResult::from_cache(hit.response, true))
        }
        None => Ok(CacheResult::from_network(response)),
      },
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed");
        if let Some(hit) = cached {
          return Ok(CacheResult::from_cache(hit.response, true));
        }
        if request.is_navigation() {
          return Ok(self.offline_fallback(request));
        }
        Err(e)
      }
    }
  }

  /// Always try the network; the cache only answers when it is unreachable
  /// or answers with an error status.
  pub async fn network_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    match self.network.fetch(request).await {
      Ok(response) if response.is_success() => {
        if response.is_cacheable() {
          self.store(self.generations.dynamic_name(), request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Ok(response) => {
        warn!(url = %request.url, status = response.status, "Network error status, trying cache");
        Ok(self.cached_copy(request).unwrap_or_else(|| CacheResult::from_network(response)))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Network failed, trying cache");
        self.cached_copy(request).ok_or(e)
      }
    }
  }

  /// Any cached copy, marked stale when past its max age.
  fn cached_copy(&self, request: &Request) -> Option<CacheResult<Response>> {
    self.lookup_any(request).map(|hit| {
      let stale = self.is_expired(request, &hit.response);
      CacheResult::from_cache(hit.response, stale)
    })
  }

  /// Serve a fresh cached copy immediately and refresh it in the background.
  ///
  /// Precedence: fresh cache, then a successful network response, then an
  /// expired cached copy, then whatever the network answered, then the
  /// synthetic offline response. Never fails.
  pub async fn stale_while_revalidate(&self, request: &Request) -> CacheResult<Response> {
    let cached = self.lookup_in(self.generations.dynamic_name(), request);
    let refresh = self.spawn_refresh(request.clone());

    if let Some(response) = &cached {
      if !self.is_expired(request, response) {
        debug!(url = %request.url, "Serving cached copy, revalidating in background");
        return CacheResult::from_cache(response.clone(), false);
      }
    }

    let outcome = refresh
      .await
      .unwrap_or_else(|e| Err(eyre!("Refresh task failed: {}", e)));

    match (outcome, cached) {
      (Ok(response), Some(stale)) if !response.is_success() => {
        warn!(url = %request.url, status = response.status, "Network error status, serving expired copy");
        CacheResult::from_cache(stale, true)
      }
      (Ok(response), _) => CacheResult::from_network(response),
      (Err(e), Some(response)) => {
        warn!(url = %request.url, error = %e, "Network failed, serving expired copy");
        CacheResult::from_cache(response, true)
      }
      (Err(e), None) => {
        warn!(url = %request.url, error = %e, "Network failed and nothing cached");
        CacheResult::with_source(Response::offline(), CacheSource::Offline)
      }
    }
  }

  /// Wait for every background refresh started so far to write its result.
  ///
  /// Returns how many refreshes were awaited.
  pub async fn settle(&self) -> usize {
    let mut pending = match self.refreshes.lock() {
      Ok(mut set) => std::mem::take(&mut *set),
      Err(e) => {
        warn!(error = %e, "Refresh set poisoned");
        return 0;
      }
    };

    let mut settled = 0;
    while let Some(joined) = pending.join_next().await {
      if let Err(e) = joined {
        warn!(error = %e, "Refresh task failed");
      }
      settled += 1;
    }
    if settled > 0 {
      debug!(settled, "Background refreshes settled");
    }
    settled
  }

  /// Start a refresh that outlives the caller.
  ///
  /// The task is tracked so [`CacheLayer::settle`] can wait for it; the
  /// receiver only matters to callers that need the network answer.
  fn spawn_refresh(&self, request: Request) -> oneshot::Receiver<Result<Response>> {
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);
    let partition = self.generations.dynamic_name().to_string();
    let (tx, rx) = oneshot::channel();

    let task = async move {
      let outcome = network.fetch(&request).await;
      if let Ok(response) = &outcome {
        if response.is_cacheable() {
          match storage.put(&partition, &request, response) {
            Ok(()) => debug!(url = %request.url, "Revalidated cache entry"),
            Err(e) => warn!(url = %request.url, error = %e, "Failed to store refreshed entry"),
          }
        }
      }
      // Nobody waiting on a fresh hit
      let _ = tx.send(outcome);
    };

    match self.refreshes.lock() {
      Ok(mut set) => {
        while set.try_join_next().is_some() {}
        set.spawn(task);
      }
      Err(e) => {
        warn!(error = %e, "Refresh set poisoned, refreshing untracked");
        tokio::spawn(task);
      }
    }
    rx
  }

  /// Cached offline page for a failed navigation, or the synthetic one.
  fn offline_fallback(&self, request: &Request) -> CacheResult<Response> {
    let fallback = request
      .url
      .join(&self.offline_page)
      .ok()
      .map(Request::get)
      .and_then(|req| self.lookup_any(&req));

    match fallback {
      Some(hit) => CacheResult::with_source(hit.response, CacheSource::Fallback),
      None => CacheResult::with_source(Response::offline(), CacheSource::Offline),
    }
  }

  fn partition_for(&self, request: &Request) -> &str {
    if self.classifier.is_static_asset(&request.url) {
      self.generations.static_name()
    } else {
      self.generations.dynamic_name()
    }
  }

  fn is_expired(&self, request: &Request, response: &Response) -> bool {
    let class = self.classifier.expiry_class(&request.url);
    self.expiry.is_expired(class, response)
  }

  // A broken cache degrades to a miss rather than failing the page.
  fn lookup_any(&self, request: &Request) -> Option<CachedResponse> {
    self.storage.match_any(request).unwrap_or_else(|e| {
      warn!(url = %request.url, error = %e, "Cache lookup failed");
      None
    })
  }

  fn lookup_in(&self, partition: &str, request: &Request) -> Option<Response> {
    self
      .storage
      .match_in(partition, request)
      .unwrap_or_else(|e| {
        warn!(url = %request.url, error = %e, "Cache lookup failed");
        None
      })
  }

  fn store(&self, partition: &str, request: &Request, response: &Response) {
    if let Err(e) = self.storage.put(partition, request, response) {
      warn!(url = %request.url, %partition, error = %e, "Failed to store response");
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      classifier: Arc::clone(&self.classifier),
      expiry: self.expiry,
      generations: self.generations.clone(),
      offline_page: self.offline_page.clone(),
      refreshes: Arc::clone(&self.refreshes),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::testing::{http_date, MockNetwork};
  use chrono::{Duration, Utc};
  use url::Url;

  type TestLayer = CacheLayer<SqliteStorage, MockNetwork>;

  fn setup(network: MockNetwork) -> (TestLayer, Arc<MockNetwork>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(network);
    let layer = CacheLayer::new(storage, Arc::clone(&network), &CacheConfig::default());
    (layer, network)
  }

  fn url(path: &str) -> Url {
    Url::parse("https://example.com").unwrap().join(path).unwrap()
  }

  fn aged(body: &str, age: Duration) -> Response {
    Response::new(200, body).with_header("date", http_date(Utc::now() - age))
  }

  #[tokio::test]
  async fn test_cache_first_warm_entry_skips_network() {
    let (layer, network) = setup(MockNetwork::serving("from network"));
    let req = Request::get(url("/assets/css/styles.css"));
    let cached = aged("body{}", Duration::days(1));
    layer.storage().put("app-static-v1", &req, &cached).unwrap();

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(result.data, cached);
    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_static_asset_end_to_end() {
    let (layer, network) = setup(MockNetwork::serving("body{color:red}"));
    let req = Request::get(url("/assets/css/styles.css"));

    let first = layer.handle(&req).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    let stored = layer
      .storage()
      .match_in("app-static-v1", &req)
      .unwrap()
      .unwrap();
    assert_eq!(stored, first.data);

    network.go_offline();
    let second = layer.handle(&req).await.unwrap();
    assert_eq!(second.data, first.data);
    assert_eq!(network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_expired_entry_refetches() {
    let (layer, network) = setup(MockNetwork::serving("new"));
    let req = Request::get(url("/assets/js/main.js"));
    layer
      .storage()
      .put("app-static-v1", &req, &aged("old", Duration::days(31)))
      .unwrap();

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(result.data.body, b"new");
    assert_eq!(network.call_count(), 1);
    let stored = layer.storage().match_in("app-static-v1", &req).unwrap().unwrap();
    assert_eq!(stored.body, b"new");
  }

  #[tokio::test]
  async fn test_cache_first_expired_entry_used_when_offline() {
    let (layer, _network) = setup(MockNetwork::offline());
    let req = Request::get(url("/assets/js/main.js"));
    layer
      .storage()
      .put("app-static-v1", &req, &aged("old", Duration::days(31)))
      .unwrap();

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(result.data.body, b"old");
    assert_eq!(result.source, CacheSource::CacheStale);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let (layer, _network) = setup(MockNetwork::new(|_| Ok(Response::new(404, "nope"))));
    let req = Request::get(url("/assets/img/missing.png"));

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(result.data.status, 404);
    assert!(layer.storage().match_any(&req).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_error_status_serves_expired_copy() {
    let (layer, network) = setup(MockNetwork::new(|_| Ok(Response::new(500, "boom"))));
    let req = Request::get(url("/assets/js/main.js"));
    layer
      .storage()
      .put("app-static-v1", &req, &aged("old", Duration::days(31)))
      .unwrap();

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(network.call_count(), 1);
    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data.body, b"old");
    let stored = layer.storage().match_in("app-static-v1", &req).unwrap().unwrap();
    assert_eq!(stored.body, b"old");
  }

  #[tokio::test]
  async fn test_failed_navigation_gets_offline_page() {
    let (layer, _network) = setup(MockNetwork::offline());
    layer
      .storage()
      .put(
        "app-static-v1",
        &Request::get(url("/offline.html")),
        &Response::new(200, "<h1>You are offline</h1>"),
      )
      .unwrap();

    let result = layer.handle(&Request::navigate(url("/"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.body, b"<h1>You are offline</h1>");
  }

  #[tokio::test]
  async fn test_failed_navigation_without_offline_page_is_synthetic() {
    let (layer, _network) = setup(MockNetwork::offline());

    let result = layer.handle(&Request::navigate(url("/index.html"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, Response::offline());
  }

  #[tokio::test]
  async fn test_cache_first_subresource_failure_propagates() {
    let (layer, _network) = setup(MockNetwork::offline());
    let result = layer.handle(&Request::get(url("/assets/js/roi.js"))).await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_network_first_ignores_fresh_cache() {
    let (layer, network) = setup(MockNetwork::serving("live"));
    let req = Request::get(url("/api/pricing"));
    layer
      .storage()
      .put("app-dynamic-v1", &req, &aged("cached", Duration::zero()))
      .unwrap();

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"live");
    assert_eq!(network.call_count(), 1);
    let stored = layer.storage().match_in("app-dynamic-v1", &req).unwrap().unwrap();
    assert_eq!(stored.body, b"live");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_expired_cache() {
    let (layer, network) = setup(MockNetwork::offline());
    let req = Request::get(url("/contact"));
    layer
      .storage()
      .put("app-dynamic-v1", &req, &aged("form", Duration::days(60)))
      .unwrap();

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(network.call_count(), 1);
    assert_eq!(result.data.body, b"form");
    assert_eq!(result.source, CacheSource::CacheStale);
  }

  #[tokio::test]
  async fn test_network_first_error_status_serves_cache() {
    let (layer, _network) = setup(MockNetwork::new(|_| Ok(Response::new(503, "upstream down"))));
    let req = Request::get(url("/api/pricing"));
    let cached = aged("cached pricing", Duration::zero());
    layer.storage().put("app-dynamic-v1", &req, &cached).unwrap();

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(result.data, cached);
  }

  #[tokio::test]
  async fn test_network_first_error_status_without_cache_is_returned() {
    let (layer, _network) = setup(MockNetwork::new(|_| Ok(Response::new(503, "upstream down"))));
    let req = Request::get(url("/api/pricing"));

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 503);
    assert!(layer.storage().match_any(&req).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_network_first_offline_without_cache_errors() {
    let (layer, _network) = setup(MockNetwork::offline());
    assert!(layer.handle(&Request::get(url("/api/roi"))).await.is_err());
  }

  #[tokio::test]
  async fn test_swr_fresh_cache_does_not_wait_for_network() {
    let (layer, network) = setup(MockNetwork::serving("refreshed"));
    let req = Request::get(url("/pricing"));
    let cached = aged("cached", Duration::hours(1));
    layer.storage().put("app-dynamic-v1", &req, &cached).unwrap();
    let gate = network.hold();

    let result = tokio::time::timeout(std::time::Duration::from_millis(200), layer.handle(&req))
      .await
      .expect("served without waiting for the network")
      .unwrap();

    assert_eq!(result.data, cached);
    assert_eq!(result.source, CacheSource::CacheFresh);

    gate.notify_one();
    assert_eq!(layer.settle().await, 1);

    assert_eq!(network.call_count(), 1);
    let stored = layer.storage().match_in("app-dynamic-v1", &req).unwrap().unwrap();
    assert_eq!(stored.body, b"refreshed");
  }

  #[tokio::test]
  async fn test_swr_refresh_completes_on_settle() {
    let (layer, network) = setup(MockNetwork::serving("refreshed"));
    let req = Request::get(url("/pricing"));
    layer
      .storage()
      .put("app-dynamic-v1", &req, &aged("cached", Duration::minutes(5)))
      .unwrap();

    let result = layer.handle(&req).await.unwrap();
    assert_eq!(result.data.body, b"cached");

    // No yield between serving and settling
    assert_eq!(layer.settle().await, 1);
    assert_eq!(network.call_count(), 1);
    let stored = layer.storage().match_in("app-dynamic-v1", &req).unwrap().unwrap();
    assert_eq!(stored.body, b"refreshed");
    assert_eq!(layer.settle().await, 0);
  }

  #[tokio::test]
  async fn test_swr_error_status_serves_expired_copy() {
    let (layer, _network) = setup(MockNetwork::new(|_| Ok(Response::new(502, "bad gateway"))));
    let req = Request::get(url("/pricing"));
    layer
      .storage()
      .put("app-dynamic-v1", &req, &aged("old", Duration::days(8)))
      .unwrap();

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data.body, b"old");
  }

  #[tokio::test]
  async fn test_swr_expired_cache_waits_for_network() {
    let (layer, _network) = setup(MockNetwork::serving("new"));
    let req = Request::get(url("/pricing"));
    layer
      .storage()
      .put("app-dynamic-v1", &req, &aged("old", Duration::days(8)))
      .unwrap();

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"new");
  }

  #[tokio::test]
  async fn test_swr_offline_serves_expired_copy() {
    let (layer, _network) = setup(MockNetwork::offline());
    let req = Request::get(url("/pricing"));
    layer
      .storage()
      .put("app-dynamic-v1", &req, &aged("old", Duration::days(8)))
      .unwrap();

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data.body, b"old");
  }

  #[tokio::test]
  async fn test_swr_offline_without_cache_is_synthetic() {
    let (layer, _network) = setup(MockNetwork::offline());

    let result = layer.handle(&Request::get(url("/pricing"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.status, 503);
  }

  #[tokio::test]
  async fn test_swr_miss_populates_dynamic_partition() {
    let (layer, _network) = setup(MockNetwork::serving("<html>pricing</html>"));
    let req = Request::get(url("/pricing"));

    let result = layer.handle(&req).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    let stored = layer.storage().match_in("app-dynamic-v1", &req).unwrap().unwrap();
    assert_eq!(stored, result.data);
  }
}
