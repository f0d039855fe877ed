use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// A mutating request deferred until the origin is reachable again.
///
/// Field names on the wire match what the browser-side queue has always
/// written, so queues persisted by either side stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
  /// Business action tag, e.g. "sale"
  #[serde(rename = "type", default = "default_kind")]
  pub kind: String,
  pub url: String,
  #[serde(default = "default_method")]
  pub method: String,
  /// Anti-forgery token captured at enqueue time, replayed as-is
  #[serde(default)]
  pub csrf_token: String,
  /// URL-encoded form fields
  #[serde(default)]
  pub body: String,
  pub created_at: DateTime<Utc>,
  /// Failed replays so far; only counted under a bounded retry policy
  #[serde(default, skip_serializing_if = "is_zero")]
  pub attempts: u32,
}

pub const DEFAULT_KIND: &str = "generic";
pub const DEFAULT_METHOD: &str = "POST";

fn default_kind() -> String {
  DEFAULT_KIND.to_string()
}

fn default_method() -> String {
  DEFAULT_METHOD.to_string()
}

fn is_zero(n: &u32) -> bool {
  *n == 0
}

impl QueuedAction {
  pub fn new(
    kind: impl Into<String>,
    url: impl Into<String>,
    method: impl Into<String>,
    csrf_token: impl Into<String>,
    body: impl Into<String>,
  ) -> Self {
    Self {
      kind: kind.into(),
      url: url.into(),
      method: method.into(),
      csrf_token: csrf_token.into(),
      body: body.into(),
      // Millisecond precision, like an ISO-8601 string from a browser clock
      created_at: Utc::now().trunc_subsecs(3),
      attempts: 0,
    }
  }

  /// Same captured action, whatever its attempt counter says.
  pub fn same_action(&self, other: &QueuedAction) -> bool {
    self.created_at == other.created_at
      && self.url == other.url
      && self.body == other.body
      && self.kind == other.kind
      && self.method == other.method
      && self.csrf_token == other.csrf_token
  }
}
