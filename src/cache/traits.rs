//! Core types for the interception cache.

use tokio::task::JoinHandle;

use crate::net::HttpResponse;

/// Header naming where a proxied response came from.
pub const SOURCE_HEADER: &str = "x-offline-source";

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from the origin
  Network,
  /// Stored response for this exact request
  Cache,
  /// Network and direct cache both failed; the offline page was served
  OfflineFallback,
  /// Not intercepted: non-GET, or no generation in control yet
  Passthrough,
  /// Nothing could satisfy the request
  NetworkError,
  /// Origin unreachable; the submission was saved for replay
  Queued,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::OfflineFallback => "offline-fallback",
      CacheSource::Passthrough => "passthrough",
      CacheSource::NetworkError => "network-error",
      CacheSource::Queued => "queued",
    }
  }
}

/// Result of intercepting one request.
#[derive(Debug)]
pub struct Served {
  pub response: HttpResponse,
  pub source: CacheSource,
  /// Pending cache write for a copy of `response`, if one was started
  pub cache_write: Option<JoinHandle<()>>,
}

impl Served {
  pub fn new(response: HttpResponse, source: CacheSource) -> Self {
    Self {
      response,
      source,
      cache_write: None,
    }
  }

  /// Stand-in for a failed fetch, so callers always get a response.
  pub fn network_error() -> Self {
    Self::new(
      HttpResponse::new(502, "Network error").with_header("content-type", "text/plain"),
      CacheSource::NetworkError,
    )
  }

  /// Wait for the background cache write, if any.
  #[cfg(test)]
  pub async fn flush(&mut self) {
    if let Some(handle) = self.cache_write.take() {
      let _ = handle.await;
    }
  }
}
