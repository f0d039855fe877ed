use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::net::Connectivity;

/// Lifecycle events driving the drain worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Emitted once when the process has started
  Loaded,
  /// Origin became reachable after being unreachable
  ConnectivityRestored,
  /// Origin stopped answering
  ConnectivityLost,
}

/// Event handler that emits `Loaded`, then connectivity transitions seen by polling
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler probing connectivity every `interval`
  pub fn new(connectivity: Arc<dyn Connectivity>, interval: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      if tx.send(Event::Loaded).is_err() {
        return;
      }

      let mut online = connectivity.is_online().await;
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      ticker.tick().await;

      loop {
        ticker.tick().await;
        let now_online = connectivity.is_online().await;
        let event = match (online, now_online) {
          (false, true) => Some(Event::ConnectivityRestored),
          (true, false) => Some(Event::ConnectivityLost),
          _ => None,
        };
        online = now_online;

        if let Some(event) = event {
          if tx.send(event).is_err() {
            break;
          }
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
