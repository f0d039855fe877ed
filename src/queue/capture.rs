//! Turns offline form submissions into queued actions.

use std::sync::Arc;
use tracing::{info, warn};
use url::form_urlencoded;

use super::action::{QueuedAction, DEFAULT_KIND, DEFAULT_METHOD};
use super::store::{QueueStore, SlotStorage, StoreError};
use crate::net::Connectivity;

/// Hidden input carrying the anti-forgery token.
pub const CSRF_FIELD: &str = "csrfmiddlewaretoken";

/// Hidden input opting a natively posted form into offline capture.
pub const OFFLINE_FIELD: &str = "_offline";

/// Hidden input carrying the action tag of a natively posted form.
pub const OFFLINE_TYPE_FIELD: &str = "_offline_type";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
  Text(String),
  /// File inputs are never queued
  File { filename: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
  pub name: String,
  pub value: FieldValue,
}

impl FormField {
  pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      value: FieldValue::Text(value.into()),
    }
  }

  pub fn file(name: impl Into<String>, filename: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      value: FieldValue::File {
        filename: filename.into(),
      },
    }
  }
}

/// What a submitted form looks like to the capture layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormSubmission {
  /// `action` attribute
  pub action: Option<String>,
  /// `method` attribute
  pub method: Option<String>,
  /// `data-offline` opt-in marker
  pub offline: Option<String>,
  /// `data-offline-type` action tag
  pub offline_type: Option<String>,
  /// Successful controls in document order
  pub fields: Vec<FormField>,
}

impl FormSubmission {
  /// Rebuild a submission from a url-encoded request body.
  ///
  /// The hidden fields `_offline` and `_offline_type` stand in for the form's
  /// `data-offline` attributes and are not kept as fields.
  pub fn from_urlencoded(action: &str, method: &str, body: &[u8]) -> Self {
    let mut form = FormSubmission {
      action: Some(action.to_string()),
      method: Some(method.to_string()),
      ..Default::default()
    };
    for (name, value) in form_urlencoded::parse(body) {
      match name.as_ref() {
        OFFLINE_FIELD => form.offline = Some(value.into_owned()),
        OFFLINE_TYPE_FIELD => form.offline_type = Some(value.into_owned()),
        _ => form.fields.push(FormField::text(name, value)),
      }
    }
    form
  }

  /// Only forms explicitly marked `data-offline="true"` take part.
  pub fn is_offline_capable(&self) -> bool {
    self
      .offline
      .as_deref()
      .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
  }

  fn csrf_token(&self) -> String {
    self
      .fields
      .iter()
      .find(|f| f.name == CSRF_FIELD)
      .and_then(|f| match &f.value {
        FieldValue::Text(v) => Some(v.clone()),
        FieldValue::File { .. } => None,
      })
      .unwrap_or_default()
  }

  /// Encode text fields as `application/x-www-form-urlencoded`, dropping files
  /// and controls without a name.
  fn encode_body(&self) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for field in &self.fields {
      if field.name.is_empty() {
        warn!("skipping nameless field in offline capture");
        continue;
      }
      match &field.value {
        FieldValue::Text(value) => {
          serializer.append_pair(&field.name, value);
        }
        FieldValue::File { filename } => {
          warn!(field = %field.name, filename = %filename, "skipping file field in offline capture");
        }
      }
    }
    serializer.finish()
  }

  /// Build the queued action this form would have submitted.
  pub fn to_action(&self, current_path: &str) -> QueuedAction {
    let url = non_empty(self.action.as_deref()).unwrap_or(current_path);
    let method = non_empty(self.method.as_deref())
      .map(|m| m.to_ascii_uppercase())
      .unwrap_or_else(|| DEFAULT_METHOD.to_string());
    let kind = non_empty(self.offline_type.as_deref()).unwrap_or(DEFAULT_KIND);
    QueuedAction::new(kind, url, method, self.csrf_token(), self.encode_body())
  }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
  value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
  #[error("could not save the action: {0}")]
  Store(#[from] StoreError),
}

/// Message the user must see before continuing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
  Queued { kind: String, pending: usize },
  CaptureFailed { reason: String },
}

impl std::fmt::Display for Notice {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Notice::Queued { kind, pending } => write!(
        f,
        "You are offline. Your {} action has been saved and will sync when you're back online ({} pending).",
        kind, pending
      ),
      Notice::CaptureFailed { reason } => write!(
        f,
        "You are offline and your action could not be saved: {}. Please try again.",
        reason
      ),
    }
  }
}

pub trait Notifier: Send + Sync {
  fn notify(&self, notice: &Notice);
}

/// Prints notices to stdout; the CLI returns only after the line is written.
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
  fn notify(&self, notice: &Notice) {
    println!("{}", notice);
  }
}

/// Logs notices; the proxy answers the browser with its own response.
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn notify(&self, notice: &Notice) {
    match notice {
      Notice::Queued { .. } => info!(%notice, "User notified"),
      Notice::CaptureFailed { .. } => warn!(%notice, "User notified"),
    }
  }
}

/// Result of a submit the capture layer has seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
  /// Form didn't opt in; native submission goes ahead
  NotOfflineCapable,
  /// Online; native submission goes ahead untouched
  Submitted,
  /// Native submission suppressed; action stored for replay
  Queued(QueuedAction),
}

/// Intercepts submissions of offline-capable forms while the origin is unreachable.
pub struct ActionCapture<S: SlotStorage> {
  queue: Arc<QueueStore<S>>,
  connectivity: Arc<dyn Connectivity>,
  notifier: Arc<dyn Notifier>,
}

impl<S: SlotStorage> ActionCapture<S> {
  pub fn new(
    queue: Arc<QueueStore<S>>,
    connectivity: Arc<dyn Connectivity>,
    notifier: Arc<dyn Notifier>,
  ) -> Self {
    Self {
      queue,
      connectivity,
      notifier,
    }
  }

  /// Handle a submit event for `form` on the page at `current_path`.
  pub async fn submit(
    &self,
    form: &FormSubmission,
    current_path: &str,
  ) -> Result<SubmitOutcome, CaptureError> {
    if !form.is_offline_capable() {
      return Ok(SubmitOutcome::NotOfflineCapable);
    }
    if self.connectivity.is_online().await {
      return Ok(SubmitOutcome::Submitted);
    }

    self.capture(form, current_path).map(SubmitOutcome::Queued)
  }

  /// Queue `form` without consulting connectivity, for callers that already
  /// saw the origin fail. The user is notified either way.
  pub fn capture(&self, form: &FormSubmission, current_path: &str) -> Result<QueuedAction, CaptureError> {
    let action = form.to_action(current_path);
    match self.queue.append(action.clone()) {
      Ok(pending) => {
        info!(kind = %action.kind, url = %action.url, pending, "Queued offline action");
        self.notifier.notify(&Notice::Queued {
          kind: action.kind.clone(),
          pending,
        });
        Ok(action)
      }
      Err(e) => {
        let e = CaptureError::from(e);
        warn!(error = %e, "Offline capture failed");
        self.notifier.notify(&Notice::CaptureFailed {
          reason: e.to_string(),
        });
        Err(e)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::FixedConnectivity;
  use crate::queue::store::testing::InstrumentedSlots;
  use std::sync::atomic::Ordering;
  use std::sync::Mutex;

  #[derive(Default)]
  struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
  }

  impl Notifier for RecordingNotifier {
    fn notify(&self, notice: &Notice) {
      self.notices.lock().unwrap().push(notice.clone());
    }
  }

  struct Fixture {
    slots: Arc<InstrumentedSlots>,
    queue: Arc<QueueStore<InstrumentedSlots>>,
    connectivity: Arc<FixedConnectivity>,
    notifier: Arc<RecordingNotifier>,
    capture: ActionCapture<InstrumentedSlots>,
  }

  fn fixture(online: bool) -> Fixture {
    let slots = Arc::new(InstrumentedSlots::new());
    let queue = Arc::new(QueueStore::new(Arc::clone(&slots), "q"));
    let connectivity = Arc::new(FixedConnectivity::new(online));
    let notifier = Arc::new(RecordingNotifier::default());
    let capture = ActionCapture::new(
      Arc::clone(&queue),
      connectivity.clone(),
      notifier.clone(),
    );
    Fixture {
      slots,
      queue,
      connectivity,
      notifier,
      capture,
    }
  }

  fn sale_form() -> FormSubmission {
    FormSubmission {
      action: Some("/sales/record/".into()),
      method: Some("post".into()),
      offline: Some("true".into()),
      offline_type: Some("sale".into()),
      fields: vec![
        FormField::text(CSRF_FIELD, "abc"),
        FormField::text("item", "5"),
        FormField::text("qty", "2"),
      ],
    }
  }

  #[tokio::test]
  async fn test_online_submission_passes_through() {
    let f = fixture(true);
    let outcome = f.capture.submit(&sale_form(), "/sales/pos/").await.unwrap();
    assert_eq!(outcome, SubmitOutcome::Submitted);
    assert!(f.queue.read().is_empty());
    assert!(f.notifier.notices.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_unmarked_form_is_ignored_even_offline() {
    let f = fixture(false);
    let mut form = sale_form();
    form.offline = None;
    assert_eq!(
      f.capture.submit(&form, "/").await.unwrap(),
      SubmitOutcome::NotOfflineCapable
    );

    form.offline = Some("false".into());
    assert_eq!(
      f.capture.submit(&form, "/").await.unwrap(),
      SubmitOutcome::NotOfflineCapable
    );
    assert_eq!(f.slots.write_count(), 0);
  }

  #[tokio::test]
  async fn test_offline_submission_is_queued() {
    let f = fixture(false);
    let outcome = f.capture.submit(&sale_form(), "/sales/pos/").await.unwrap();

    let SubmitOutcome::Queued(action) = outcome else {
      panic!("expected queued outcome");
    };
    assert_eq!(action.kind, "sale");
    assert_eq!(action.url, "/sales/record/");
    assert_eq!(action.method, "POST");
    assert_eq!(action.csrf_token, "abc");
    assert_eq!(action.body, "csrfmiddlewaretoken=abc&item=5&qty=2");

    assert_eq!(f.queue.read(), vec![action]);
    assert_eq!(
      f.notifier.notices.lock().unwrap().as_slice(),
      &[Notice::Queued {
        kind: "sale".into(),
        pending: 1
      }]
    );
  }

  #[tokio::test]
  async fn test_missing_attributes_fall_back() {
    let f = fixture(false);
    let form = FormSubmission {
      action: Some("".into()),
      offline: Some("TRUE".into()),
      fields: vec![FormField::text("note", "hello world & more")],
      ..Default::default()
    };

    let SubmitOutcome::Queued(action) = f.capture.submit(&form, "/inventory/products/").await.unwrap()
    else {
      panic!("expected queued outcome");
    };
    assert_eq!(action.url, "/inventory/products/");
    assert_eq!(action.method, "POST");
    assert_eq!(action.kind, "generic");
    assert_eq!(action.csrf_token, "");
    assert_eq!(action.body, "note=hello+world+%26+more");
  }

  #[tokio::test]
  async fn test_file_fields_are_dropped() {
    let f = fixture(false);
    let mut form = sale_form();
    form.fields.push(FormField::file("photo", "receipt.jpg"));
    form.fields.push(FormField::text("qty", "3"));

    let SubmitOutcome::Queued(action) = f.capture.submit(&form, "/").await.unwrap() else {
      panic!("expected queued outcome");
    };
    assert_eq!(action.body, "csrfmiddlewaretoken=abc&item=5&qty=2&qty=3");
  }

  #[tokio::test]
  async fn test_nameless_fields_are_skipped() {
    let f = fixture(false);
    let mut form = sale_form();
    form.fields.insert(1, FormField::text("", "x"));

    let SubmitOutcome::Queued(action) = f.capture.submit(&form, "/").await.unwrap() else {
      panic!("expected queued outcome");
    };
    assert_eq!(action.body, "csrfmiddlewaretoken=abc&item=5&qty=2");
    assert_eq!(f.queue.read().len(), 1);
  }

  #[test]
  fn test_form_rebuilt_from_posted_body() {
    let form = FormSubmission::from_urlencoded(
      "/sales/record/",
      "POST",
      b"csrfmiddlewaretoken=abc&item=5&_offline=true&_offline_type=sale&note=a+b",
    );

    assert!(form.is_offline_capable());
    assert_eq!(form.offline_type.as_deref(), Some("sale"));
    let action = form.to_action("/");
    assert_eq!(action.url, "/sales/record/");
    assert_eq!(action.csrf_token, "abc");
    assert_eq!(action.body, "csrfmiddlewaretoken=abc&item=5&note=a+b");
  }

  #[tokio::test]
  async fn test_store_failure_fails_and_informs_user() {
    let f = fixture(false);
    f.slots.fail_writes.store(true, Ordering::SeqCst);

    let err = f.capture.submit(&sale_form(), "/").await.unwrap_err();
    assert!(matches!(err, CaptureError::Store(_)));
    assert!(matches!(
      f.notifier.notices.lock().unwrap()[0],
      Notice::CaptureFailed { .. }
    ));
  }

  #[tokio::test]
  async fn test_goes_back_to_native_submit_when_connectivity_returns() {
    let f = fixture(false);
    f.capture.submit(&sale_form(), "/").await.unwrap();
    f.connectivity.set(true);
    assert_eq!(
      f.capture.submit(&sale_form(), "/").await.unwrap(),
      SubmitOutcome::Submitted
    );
    assert_eq!(f.queue.read().len(), 1);
  }
}
