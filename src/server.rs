//! Local proxy the POS browser talks to; every request goes through the cache layer.
//!
//! A form post that fails to reach the origin is queued for replay when it
//! carries the `_offline=true` hidden field.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheSource, CacheStorage, Served, SOURCE_HEADER};
use crate::net::{is_hop_by_hop, HttpResponse, OutboundRequest};
use crate::queue::{ActionCapture, FormSubmission, SlotStorage};

/// Largest request body forwarded to the origin.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Handler state: the cache layer plus the capture path for failed form posts.
pub struct Proxy<S: CacheStorage, Q: SlotStorage> {
  layer: CacheLayer<S>,
  capture: Arc<ActionCapture<Q>>,
}

impl<S: CacheStorage, Q: SlotStorage> Clone for Proxy<S, Q> {
  fn clone(&self) -> Self {
    Self {
      layer: self.layer.clone(),
      capture: Arc::clone(&self.capture),
    }
  }
}

pub fn router<S, Q>(layer: CacheLayer<S>, capture: Arc<ActionCapture<Q>>) -> Router
where
  S: CacheStorage + 'static,
  Q: SlotStorage + 'static,
{
  Router::new()
    .fallback(intercept::<S, Q>)
    .with_state(Proxy { layer, capture })
}

pub async fn run_server<S, Q, F>(
  addr: SocketAddr,
  layer: CacheLayer<S>,
  capture: Arc<ActionCapture<Q>>,
  shutdown: F,
) -> Result<()>
where
  S: CacheStorage + 'static,
  Q: SlotStorage + 'static,
  F: Future<Output = ()> + Send + 'static,
{
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;
  info!(%addr, "Offline proxy listening");

  axum::serve(listener, router(layer, capture))
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| eyre!("Proxy server failed: {}", e))?;
  Ok(())
}

async fn intercept<S, Q>(State(proxy): State<Proxy<S, Q>>, request: Request) -> Response
where
  S: CacheStorage + 'static,
  Q: SlotStorage + 'static,
{
  let (parts, body) = request.into_parts();

  let body = match to_bytes(body, MAX_BODY_BYTES).await {
    Ok(bytes) => bytes,
    Err(e) => {
      warn!(uri = %parts.uri, error = %e, "could not read request body");
      return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }
  };

  let url = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str().to_string())
    .unwrap_or_else(|| "/".to_string());
  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let outbound = OutboundRequest {
    method: parts.method.as_str().to_string(),
    url,
    headers,
    body: (!body.is_empty()).then(|| body.to_vec()),
  };

  let mut served = proxy.layer.handle(&outbound).await;
  if served.source == CacheSource::NetworkError {
    if let Some(queued) = capture_offline(proxy.capture.as_ref(), &outbound) {
      served = queued;
    }
  }
  debug!(method = %outbound.method, url = %outbound.url, source = served.source.as_str(), status = served.response.status, "served");
  into_response(served)
}

/// Queue an opted-in form post the origin never received.
fn capture_offline<Q: SlotStorage>(
  capture: &ActionCapture<Q>,
  request: &OutboundRequest,
) -> Option<Served> {
  if matches!(request.method.as_str(), "GET" | "HEAD") {
    return None;
  }
  let is_form = request
    .header("content-type")
    .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
  if !is_form {
    return None;
  }

  let body = request.body.as_deref().unwrap_or_default();
  let form = FormSubmission::from_urlencoded(&request.url, &request.method, body);
  if !form.is_offline_capable() {
    return None;
  }

  // A failed capture has been logged and notified; the browser gets the 502
  let action = capture.capture(&form, &request.url).ok()?;
  let notice = format!(
    "You are offline. Your {} action has been saved and will sync when you're back online.",
    action.kind
  );
  Some(Served::new(
    HttpResponse::new(202, notice).with_header("content-type", "text/plain; charset=utf-8"),
    CacheSource::Queued,
  ))
}

fn into_response(served: Served) -> Response {
  let Served {
    response, source, ..
  } = served;

  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut out = Response::new(Body::from(response.body));
  *out.status_mut() = status;

  let headers = out.headers_mut();
  for (name, value) in &response.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  headers.insert(SOURCE_HEADER, HeaderValue::from_static(source.as_str()));
  out
}
