//! Network seam shared by the replay worker and the interception proxy.

mod client;
mod connectivity;

pub use client::HttpNetwork;
pub use connectivity::{Connectivity, FixedConnectivity, ProbeConnectivity};

use async_trait::async_trait;
use std::time::Duration;

/// Headers that describe a single connection and must not be forwarded or cached.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// A request about to leave for the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
  pub method: String,
  /// Absolute URL or a path relative to the origin
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.into(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A fully buffered response.
///
/// The body is owned bytes, so handing one copy to the cache and another to the
/// caller is an explicit `clone` and never consumes a shared stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Same meaning as `Response.ok`: any 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
  #[error("invalid url '{url}': {reason}")]
  InvalidUrl { url: String, reason: String },
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  #[error("transport error: {0}")]
  Transport(String),
}

/// Anything able to carry a request to the origin and bring back a response.
///
/// A returned `Ok` only means an HTTP response arrived; the status still decides
/// whether the request succeeded.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &OutboundRequest) -> Result<HttpResponse, NetworkError>;
}

#[cfg(test)]
pub mod testing {
  //! Scripted network used across module tests.

  use super::*;
  use std::collections::{HashMap, VecDeque};
  use std::sync::Mutex;

  #[derive(Clone)]
  pub enum Reply {
    Status(u16, &'static str),
    Fail,
  }

  /// Replies per URL, recording every request it sees.
  #[derive(Default)]
  pub struct FakeNetwork {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallback: Mutex<Option<Reply>>,
    calls: Mutex<Vec<OutboundRequest>>,
  }

  impl FakeNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    /// Queue a reply for `url`; the last queued reply keeps repeating.
    pub fn reply(&self, url: &str, reply: Reply) -> &Self {
      self
        .routes
        .lock()
        .unwrap()
        .entry(url.to_string())
        .or_default()
        .push_back(reply);
      self
    }

    /// Reply used for URLs without a route (defaults to a transport failure).
    pub fn otherwise(&self, reply: Reply) -> &Self {
      *self.fallback.lock().unwrap() = Some(reply);
      self
    }

    pub fn calls(&self) -> Vec<OutboundRequest> {
      self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
      self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, url: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.url == url)
        .count()
    }
  }

  /// Serve `router` on a loopback port and return its base URL.
  pub async fn spawn_origin(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
  }

  #[async_trait]
  impl Network for FakeNetwork {
    async fn fetch(&self, request: &OutboundRequest) -> Result<HttpResponse, NetworkError> {
      self.calls.lock().unwrap().push(request.clone());

      let reply = {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(&request.url) {
          Some(queue) if queue.len() > 1 => queue.pop_front(),
          Some(queue) => queue.front().cloned(),
          None => self.fallback.lock().unwrap().clone(),
        }
      };

      match reply {
        Some(Reply::Status(status, body)) => {
          Ok(HttpResponse::new(status, body).with_header("content-type", "text/html"))
        }
        Some(Reply::Fail) | None => Err(NetworkError::Transport("connection refused".into())),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_success_range() {
    assert!(HttpResponse::new(200, "").is_success());
    assert!(HttpResponse::new(204, "").is_success());
    assert!(!HttpResponse::new(302, "").is_success());
    assert!(!HttpResponse::new(500, "").is_success());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let mut request = OutboundRequest::get("/");
    request.headers.push(("Accept".into(), "text/css".into()));
    assert_eq!(request.header("accept"), Some("text/css"));
    assert_eq!(request.header("cookie"), None);
    assert!(is_hop_by_hop("Transfer-Encoding"));
    assert!(!is_hop_by_hop("cookie"));
  }
}
