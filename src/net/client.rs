use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use url::Url;

use super::{is_hop_by_hop, HttpResponse, Network, NetworkError, OutboundRequest};

/// reqwest-backed access to the POS origin.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
  /// Sent with every request that doesn't carry its own Cookie header
  cookie: Option<String>,
}

impl HttpNetwork {
  /// Client for proxied page traffic: cookies and redirects belong to the browser.
  pub fn proxy(origin: &str) -> Result<Self> {
    Self::build(origin, false, false, None)
  }

  /// Client for replays: follows redirects so a POST answered with 302 counts by
  /// its final response, and keeps its own cookie jar plus an optional configured
  /// session.
  pub fn replay(origin: &str, session_cookie: Option<String>) -> Result<Self> {
    Self::build(origin, true, true, session_cookie)
  }

  /// Client for seeding the app shell: follows redirects like a browser fetch,
  /// so a login-protected route yields the page it lands on.
  pub fn shell(origin: &str) -> Result<Self> {
    Self::build(origin, true, true, None)
  }

  fn build(
    origin: &str,
    cookie_store: bool,
    follow_redirects: bool,
    cookie: Option<String>,
  ) -> Result<Self> {
    let origin = Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;

    let redirect = if follow_redirects {
      reqwest::redirect::Policy::default()
    } else {
      reqwest::redirect::Policy::none()
    };
    let client = reqwest::Client::builder()
      .cookie_store(cookie_store)
      .redirect(redirect)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin,
      cookie,
    })
  }

  /// Resolve a stored URL (usually a path) against the origin.
  pub fn resolve(&self, url: &str) -> Result<Url, NetworkError> {
    self.origin.join(url).map_err(|e| NetworkError::InvalidUrl {
      url: url.to_string(),
      reason: e.to_string(),
    })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &OutboundRequest) -> Result<HttpResponse, NetworkError> {
    let url = self.resolve(&request.url)?;
    let method =
      Method::from_bytes(request.method.as_bytes()).map_err(|e| NetworkError::InvalidUrl {
        url: request.url.clone(),
        reason: format!("bad method {}: {}", request.method, e),
      })?;

    let mut builder = self.client.request(method, url);
    for (name, value) in &request.headers {
      if is_hop_by_hop(name) {
        continue;
      }
      let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) else {
        tracing::debug!(header = %name, "dropping unrepresentable header");
        continue;
      };
      builder = builder.header(name, value);
    }
    if let Some(cookie) = &self.cookie {
      if request.header("cookie").is_none() {
        builder = builder.header(reqwest::header::COOKIE, cookie.as_str());
      }
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(map_reqwest_error)?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}

fn map_reqwest_error(e: reqwest::Error) -> NetworkError {
  NetworkError::Transport(e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::testing::spawn_origin;
  use axum::http::{header::LOCATION, StatusCode};
  use axum::routing::{get, post};
  use axum::Router;

  fn redirecting_origin() -> Router {
    Router::new()
      .route(
        "/sales/record/",
        post(|| async { (StatusCode::FOUND, [(LOCATION, "/sales/receipt/1/")]) }),
      )
      .route("/sales/receipt/1/", get(|| async { "receipt" }))
  }

  fn post_sale() -> OutboundRequest {
    OutboundRequest {
      method: "POST".into(),
      body: Some(b"item=5".to_vec()),
      ..OutboundRequest::get("/sales/record/")
    }
  }

  #[tokio::test]
  async fn test_replay_client_judges_the_final_response() {
    let origin = spawn_origin(redirecting_origin()).await;
    let network = HttpNetwork::replay(&origin, None).unwrap();

    let response = network.fetch(&post_sale()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"receipt");
  }

  #[tokio::test]
  async fn test_proxy_client_hands_redirects_to_the_browser() {
    let origin = spawn_origin(redirecting_origin()).await;
    let network = HttpNetwork::proxy(&origin).unwrap();

    let response = network.fetch(&post_sale()).await.unwrap();
    assert_eq!(response.status, 302);
    assert!(response
      .headers
      .iter()
      .any(|(k, v)| k == "location" && v == "/sales/receipt/1/"));
  }

  #[test]
  fn test_resolve_relative_and_absolute() {
    let network = HttpNetwork::proxy("https://pos.example.com").unwrap();
    assert_eq!(
      network.resolve("/sales/record/").unwrap().as_str(),
      "https://pos.example.com/sales/record/"
    );
    assert_eq!(
      network
        .resolve("https://pos.example.com/static/js/pwa.js?v=2")
        .unwrap()
        .as_str(),
      "https://pos.example.com/static/js/pwa.js?v=2"
    );
  }
}
