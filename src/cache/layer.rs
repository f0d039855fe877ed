//! Interception layer that picks a serving strategy per request.

use std::sync::Arc;
use tracing::{debug, error, warn};
use url::Url;

use super::classify::{classify, RequestClass};
use super::generation::ActiveGeneration;
use super::storage::{cache_url, CacheStorage};
use super::traits::{CacheSource, Served};
use crate::net::{HttpResponse, Network, OutboundRequest};

/// Sits in front of every request the page issues.
///
/// Pages are served network-first with the cached copy and then the offline
/// page as fallbacks. Static assets are served cache-first and never
/// refreshed once stored. Everything that isn't a GET goes straight through.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  generation: ActiveGeneration,
  origin: Url,
  offline_url: String,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<dyn Network>,
    generation: ActiveGeneration,
    origin: Url,
    offline_url: impl Into<String>,
  ) -> Self {
    Self {
      storage,
      network,
      generation,
      origin,
      offline_url: offline_url.into(),
    }
  }

  pub async fn handle(&self, request: &OutboundRequest) -> Served {
    let class = classify(request);
    let generation = match (class, self.generation.current()) {
      (RequestClass::Bypass, _) | (_, None) => return self.passthrough(request).await,
      (_, Some(generation)) => generation,
    };

    let Some(key) = cache_url(&self.origin, &request.url) else {
      warn!(url = %request.url, "unresolvable request url, not caching");
      return self.passthrough(request).await;
    };

    match class {
      RequestClass::Document => self.network_first(request, &generation, key).await,
      _ => self.cache_first(request, &generation, key).await,
    }
  }

  async fn passthrough(&self, request: &OutboundRequest) -> Served {
    match self.network.fetch(request).await {
      Ok(response) => Served::new(response, CacheSource::Passthrough),
      Err(e) => {
        debug!(method = %request.method, url = %request.url, error = %e, "passthrough failed");
        Served::network_error()
      }
    }
  }

  /// Network, then the cached copy, then the offline page.
  async fn network_first(&self, request: &OutboundRequest, generation: &str, key: String) -> Served {
    match self.network.fetch(request).await {
      Ok(response) => {
        let cache_write = self.store_copy(generation, key, &response);
        Served {
          response,
          source: CacheSource::Network,
          cache_write,
        }
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "page fetch failed, falling back to cache");
        if let Some(response) = self.lookup(generation, &key) {
          return Served::new(response, CacheSource::Cache);
        }

        match cache_url(&self.origin, &self.offline_url).and_then(|url| self.lookup(generation, &url)) {
          Some(response) => Served::new(response, CacheSource::OfflineFallback),
          None => {
            warn!(url = %request.url, "no cached page and no offline page available");
            Served::network_error()
          }
        }
      }
    }
  }

  /// Cached copy if present, otherwise the network.
  async fn cache_first(&self, request: &OutboundRequest, generation: &str, key: String) -> Served {
    if let Some(response) = self.lookup(generation, &key) {
      return Served::new(response, CacheSource::Cache);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        let cache_write = self.store_copy(generation, key, &response);
        Served {
          response,
          source: CacheSource::Network,
          cache_write,
        }
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "asset fetch failed with nothing cached");
        Served::network_error()
      }
    }
  }

  fn lookup(&self, generation: &str, url: &str) -> Option<HttpResponse> {
    match self.storage.lookup(generation, url) {
      Ok(Some(entry)) => {
        debug!(url, cached_at = %entry.cached_at, "cache hit");
        Some(entry.response)
      }
      Ok(None) => None,
      Err(e) => {
        error!(generation, url, error = %e, "cache lookup failed");
        None
      }
    }
  }

  /// Store a copy of a successful response in the background.
  fn store_copy(
    &self,
    generation: &str,
    url: String,
    response: &HttpResponse,
  ) -> Option<tokio::task::JoinHandle<()>> {
    if !response.is_success() {
      return None;
    }

    let storage = Arc::clone(&self.storage);
    let generation = generation.to_string();
    let copy = response.clone();
    Some(tokio::spawn(async move {
      if let Err(e) = storage.store(&generation, &url, &copy) {
        error!(generation = %generation, url = %url, error = %e, "cache write failed");
      }
    }))
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      generation: self.generation.clone(),
      origin: self.origin.clone(),
      offline_url: self.offline_url.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::net::testing::{FakeNetwork, Reply};

  const ORIGIN: &str = "https://pos.example.com";
  const GEN: &str = "nura-pos-cache-v1";

  struct Fixture {
    storage: Arc<SqliteStorage>,
    network: Arc<FakeNetwork>,
    generation: ActiveGeneration,
    layer: CacheLayer<SqliteStorage>,
  }

  fn fixture() -> Fixture {
    let storage = Arc::new(SqliteStorage::new(crate::db::open_in_memory().unwrap()));
    let network = Arc::new(FakeNetwork::new());
    let generation = ActiveGeneration::default();
    generation.claim(GEN);
    let layer = CacheLayer::new(
      Arc::clone(&storage),
      network.clone(),
      generation.clone(),
      Url::parse(ORIGIN).unwrap(),
      "/offline/",
    );
    Fixture {
      storage,
      network,
      generation,
      layer,
    }
  }

  fn page(path: &str) -> OutboundRequest {
    let mut request = OutboundRequest::get(path);
    request
      .headers
      .push(("Accept".into(), "text/html,application/xhtml+xml".into()));
    request
  }

  fn asset(path: &str) -> OutboundRequest {
    let mut request = OutboundRequest::get(path);
    request.headers.push(("Accept".into(), "text/css,*/*;q=0.1".into()));
    request
  }

  fn seed(f: &Fixture, path: &str, body: &str) {
    f.storage
      .store(GEN, &format!("{}{}", ORIGIN, path), &HttpResponse::new(200, body))
      .unwrap();
  }

  #[tokio::test]
  async fn test_cached_asset_never_hits_network() {
    let f = fixture();
    seed(&f, "/static/core/css/styles.css", "body{color:red}");
    f.network
      .reply("/static/core/css/styles.css", Reply::Status(200, "body{color:blue}"));

    for _ in 0..3 {
      let served = f.layer.handle(&asset("/static/core/css/styles.css")).await;
      assert_eq!(served.source, CacheSource::Cache);
      assert_eq!(served.response.body, b"body{color:red}");
    }
    assert_eq!(f.network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_cached_page_does_not_replay_cookies() {
    let f = fixture();
    f.storage
      .store(
        GEN,
        "https://pos.example.com/sales/pos/",
        &HttpResponse::new(200, "pos").with_header("set-cookie", "sessionid=stale"),
      )
      .unwrap();
    f.network.reply("/sales/pos/", Reply::Fail);

    let served = f.layer.handle(&page("/sales/pos/")).await;
    assert_eq!(served.source, CacheSource::Cache);
    assert!(served
      .response
      .headers
      .iter()
      .all(|(name, _)| !name.eq_ignore_ascii_case("set-cookie")));
  }

  #[tokio::test]
  async fn test_uncached_asset_is_fetched_and_stored() {
    let f = fixture();
    f.network.reply("/static/js/pwa.js", Reply::Status(200, "console.log(1)"));

    let mut served = f.layer.handle(&asset("/static/js/pwa.js")).await;
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.response.body, b"console.log(1)");
    served.flush().await;

    let again = f.layer.handle(&asset("/static/js/pwa.js")).await;
    assert_eq!(again.source, CacheSource::Cache);
    assert_eq!(again.response.body, b"console.log(1)");
    assert_eq!(f.network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_asset_failure_without_cache_is_network_error() {
    let f = fixture();
    f.network.reply("/static/missing.png", Reply::Fail);

    let served = f.layer.handle(&asset("/static/missing.png")).await;
    assert_eq!(served.source, CacheSource::NetworkError);
    assert_eq!(served.response.status, 502);
  }

  #[tokio::test]
  async fn test_page_prefers_network_and_refreshes_cache() {
    let f = fixture();
    seed(&f, "/sales/pos/", "stale");
    f.network.reply("/sales/pos/", Reply::Status(200, "fresh"));

    let mut served = f.layer.handle(&page("/sales/pos/")).await;
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.response.body, b"fresh");
    served.flush().await;

    let stored = f
      .storage
      .lookup(GEN, "https://pos.example.com/sales/pos/")
      .unwrap()
      .unwrap();
    assert_eq!(stored.response.body, b"fresh");
  }

  #[tokio::test]
  async fn test_page_falls_back_to_direct_cache_entry() {
    let f = fixture();
    seed(&f, "/sales/pos/", "cached pos");
    seed(&f, "/offline/", "offline page");
    f.network.reply("/sales/pos/", Reply::Fail);

    let served = f.layer.handle(&page("/sales/pos/")).await;
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"cached pos");
  }

  #[tokio::test]
  async fn test_page_falls_back_to_offline_page() {
    let f = fixture();
    seed(&f, "/offline/", "offline page");
    f.network.reply("/sales/transactions/", Reply::Fail);

    let served = f.layer.handle(&page("/sales/transactions/")).await;
    assert_eq!(served.source, CacheSource::OfflineFallback);
    assert_eq!(served.response.body, b"offline page");
  }

  #[tokio::test]
  async fn test_page_without_any_fallback_is_network_error() {
    let f = fixture();
    f.network.reply("/sales/pos/", Reply::Fail);

    let served = f.layer.handle(&page("/sales/pos/")).await;
    assert_eq!(served.source, CacheSource::NetworkError);
  }

  #[tokio::test]
  async fn test_error_pages_are_not_cached() {
    let f = fixture();
    f.network.reply("/sales/pos/", Reply::Status(500, "oops"));

    let served = f.layer.handle(&page("/sales/pos/")).await;
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.response.status, 500);
    assert!(served.cache_write.is_none());
    assert_eq!(f.storage.entry_count(GEN).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_post_passes_through_uncached() {
    let f = fixture();
    f.network.reply("/sales/record/", Reply::Status(200, "recorded"));
    let request = OutboundRequest {
      method: "POST".into(),
      body: Some(b"item=5".to_vec()),
      ..page("/sales/record/")
    };

    let served = f.layer.handle(&request).await;
    assert_eq!(served.source, CacheSource::Passthrough);
    assert!(served.cache_write.is_none());
    assert_eq!(f.network.calls()[0], request);
    assert_eq!(f.storage.entry_count(GEN).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_nothing_intercepted_before_claim() {
    let f = fixture();
    f.generation.release();
    seed(&f, "/static/js/pwa.js", "cached");
    f.network.reply("/static/js/pwa.js", Reply::Status(200, "live"));

    let served = f.layer.handle(&asset("/static/js/pwa.js")).await;
    assert_eq!(served.source, CacheSource::Passthrough);
    assert_eq!(served.response.body, b"live");
  }
}
