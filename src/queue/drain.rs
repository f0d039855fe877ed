//! Replays queued actions against the origin and keeps only the failures.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::action::QueuedAction;
use super::store::{QueueSnapshot, QueueStore, SlotStorage, StoreError};
use crate::net::{Connectivity, HttpResponse, Network, NetworkError, OutboundRequest};

/// Attempts at the final versioned write before giving up on merging.
const FINAL_WRITE_RETRIES: usize = 4;

/// How failed replays are retried.
///
/// The default retries forever with no timeout: a failed action simply waits
/// for the next trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Dead-letter an action once it has failed this many times
  pub max_attempts: Option<u32>,
  /// Abandon a single replay after this long
  pub request_timeout: Option<Duration>,
}

/// What caused a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
  PageLoad,
  ConnectivityRestored,
  Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  Offline,
  Empty,
  InFlight,
  StorageUnavailable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub synced: usize,
  pub retained: usize,
  pub dead_lettered: usize,
  /// Actions enqueued while the drain ran, kept after the retained ones
  pub arrived_during_drain: usize,
  pub skipped: Option<SkipReason>,
}

impl DrainReport {
  fn skipped(reason: SkipReason) -> Self {
    Self {
      skipped: Some(reason),
      ..Self::default()
    }
  }
}

/// Walks the persistent queue and replays each action in order.
pub struct DrainWorker<S: SlotStorage> {
  queue: Arc<QueueStore<S>>,
  dead_letters: QueueStore<S>,
  network: Arc<dyn Network>,
  connectivity: Arc<dyn Connectivity>,
  policy: RetryPolicy,
  running: Mutex<()>,
}

impl<S: SlotStorage> DrainWorker<S> {
  pub fn new(
    queue: Arc<QueueStore<S>>,
    dead_letters: QueueStore<S>,
    network: Arc<dyn Network>,
    connectivity: Arc<dyn Connectivity>,
    policy: RetryPolicy,
  ) -> Self {
    Self {
      queue,
      dead_letters,
      network,
      connectivity,
      policy,
      running: Mutex::new(()),
    }
  }

  /// Replay every queued action once.
  ///
  /// Actions are sent strictly one after another in queue order. An action
  /// leaves the queue only when its replay got a 2xx answer.
  pub async fn drain(&self, trigger: DrainTrigger) -> DrainReport {
    let Ok(_guard) = self.running.try_lock() else {
      debug!(?trigger, "drain already in flight");
      return DrainReport::skipped(SkipReason::InFlight);
    };

    if !self.connectivity.is_online().await {
      return DrainReport::skipped(SkipReason::Offline);
    }

    let snapshot = match self.queue.load() {
      Ok(snapshot) => snapshot,
      Err(e) => {
        error!(error = %e, "Error reading offline queue");
        return DrainReport::skipped(SkipReason::StorageUnavailable);
      }
    };
    if snapshot.actions.is_empty() {
      return DrainReport::skipped(SkipReason::Empty);
    }

    info!(?trigger, count = snapshot.actions.len(), "Processing offline queue");

    let mut report = DrainReport::default();
    let mut retained = Vec::new();
    let mut dead = Vec::new();

    for action in &snapshot.actions {
      report.attempted += 1;
      match self.replay(action).await {
        Ok(response) if response.is_success() => {
          report.synced += 1;
          info!(kind = %action.kind, url = %action.url, "Offline action synced");
        }
        outcome => {
          match outcome {
            Ok(response) => warn!(
              kind = %action.kind,
              url = %action.url,
              status = response.status,
              "Offline action failed, keeping in queue"
            ),
            Err(e) => error!(kind = %action.kind, url = %action.url, error = %e, "Error syncing offline action"),
          }
          self.retain(action, &mut retained, &mut dead);
        }
      }
    }

    report.retained = retained.len();

    // Dead letters leave the queue only once the queue write has landed
    if let Some(arrived) = self.persist(&snapshot, retained) {
      report.arrived_during_drain = arrived;
      if !dead.is_empty() {
        self.bury(&dead);
        report.dead_lettered = dead.len();
      }
    }
    report
  }

  fn retain(&self, action: &QueuedAction, retained: &mut Vec<QueuedAction>, dead: &mut Vec<QueuedAction>) {
    let Some(max) = self.policy.max_attempts else {
      retained.push(action.clone());
      return;
    };

    let mut action = action.clone();
    action.attempts += 1;
    if action.attempts >= max {
      warn!(kind = %action.kind, url = %action.url, attempts = action.attempts, "Giving up on offline action");
      dead.push(action);
    } else {
      retained.push(action);
    }
  }

  async fn replay(&self, action: &QueuedAction) -> Result<HttpResponse, NetworkError> {
    let request = replay_request(action);
    match self.policy.request_timeout {
      Some(limit) => tokio::time::timeout(limit, self.network.fetch(&request))
        .await
        .map_err(|_| NetworkError::Timeout(limit))?,
      None => self.network.fetch(&request).await,
    }
  }

  fn bury(&self, dead: &[QueuedAction]) {
    for action in dead {
      if let Err(e) = self.dead_letters.append(action.clone()) {
        error!(kind = %action.kind, error = %e, "Error saving dead-lettered action");
      }
    }
  }

  /// Write the retained actions back, keeping anything enqueued meanwhile.
  ///
  /// Returns how many actions arrived during the drain, or `None` when the
  /// queue was left untouched.
  fn persist(&self, snapshot: &QueueSnapshot, retained: Vec<QueuedAction>) -> Option<usize> {
    let mut expected = snapshot.version;
    let mut arrived = Vec::new();

    for _ in 0..FINAL_WRITE_RETRIES {
      let mut next = retained.clone();
      next.extend(arrived.iter().cloned());

      match self.queue.save_if_unchanged(expected, &next) {
        Ok(()) => return Some(arrived.len()),
        Err(StoreError::Conflict { .. }) => match self.queue.load() {
          Ok(current) => {
            arrived = added_since(&snapshot.actions, current.actions);
            expected = current.version;
          }
          Err(e) => {
            error!(error = %e, "Error re-reading offline queue after concurrent write");
            return None;
          }
        },
        Err(e) => {
          error!(error = %e, "Error saving offline queue");
          return None;
        }
      }
    }

    error!("Offline queue kept changing during drain; leaving it as is");
    None
  }
}

/// Entries of `current` that were not part of `original`, in their current order.
///
/// Entries are matched as a multiset by identity, ignoring the attempt counter
/// another drain may have bumped, so two identical actions where only one was
/// drained leave exactly one behind.
fn added_since(original: &[QueuedAction], current: Vec<QueuedAction>) -> Vec<QueuedAction> {
  let mut unmatched: Vec<&QueuedAction> = original.iter().collect();
  current
    .into_iter()
    .filter(|action| match unmatched.iter().position(|o| o.same_action(action)) {
      Some(i) => {
        unmatched.swap_remove(i);
        false
      }
      None => true,
    })
    .collect()
}

/// The request a queued action replays as.
pub fn replay_request(action: &QueuedAction) -> OutboundRequest {
  OutboundRequest {
    method: action.method.clone(),
    url: action.url.clone(),
    headers: vec![
      (
        "Content-Type".to_string(),
        "application/x-www-form-urlencoded".to_string(),
      ),
      ("X-Requested-With".to_string(), "XMLHttpRequest".to_string()),
      ("X-CSRFToken".to_string(), action.csrf_token.clone()),
    ],
    body: Some(action.body.clone().into_bytes()),
  }
}
