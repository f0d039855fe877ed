use crate::net::OutboundRequest;

/// How the interception cache treats a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Pages: network first, then cache, then the offline page
  Document,
  /// Scripts, styles, images, data: cache first
  Asset,
  /// Mutating requests always go to the network untouched
  Bypass,
}

/// Classify by method and the declared `Accept` header.
pub fn classify(request: &OutboundRequest) -> RequestClass {
  if !request.method.eq_ignore_ascii_case("GET") {
    return RequestClass::Bypass;
  }

  let accept = request.header("accept").unwrap_or("");
  if accept.to_ascii_lowercase().contains("text/html") {
    RequestClass::Document
  } else {
    RequestClass::Asset
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn get_accepting(accept: &str) -> OutboundRequest {
    let mut request = OutboundRequest::get("/sales/pos/");
    request.headers.push(("Accept".into(), accept.into()));
    request
  }

  #[test]
  fn test_navigation_is_document() {
    let request = get_accepting(
      "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,*/*;q=0.8",
    );
    assert_eq!(classify(&request), RequestClass::Document);
  }

  #[test]
  fn test_assets() {
    assert_eq!(classify(&get_accepting("text/css,*/*;q=0.1")), RequestClass::Asset);
    assert_eq!(classify(&get_accepting("image/webp,*/*")), RequestClass::Asset);
    assert_eq!(classify(&get_accepting("application/json")), RequestClass::Asset);
  }

  #[test]
  fn test_missing_accept_is_asset() {
    assert_eq!(classify(&OutboundRequest::get("/static/js/pwa.js")), RequestClass::Asset);
  }

  #[test]
  fn test_non_get_bypasses() {
    let mut request = get_accepting("text/html");
    request.method = "POST".into();
    assert_eq!(classify(&request), RequestClass::Bypass);

    request.method = "HEAD".into();
    assert_eq!(classify(&request), RequestClass::Bypass);
  }
}
