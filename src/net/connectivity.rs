use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{HttpNetwork, Network, OutboundRequest};

/// Live view of whether the origin is reachable.
#[async_trait]
pub trait Connectivity: Send + Sync {
  async fn is_online(&self) -> bool;
}

/// Probes the origin with a HEAD request; any HTTP answer counts as online.
pub struct ProbeConnectivity {
  network: HttpNetwork,
  probe_path: String,
  timeout: Duration,
}

impl ProbeConnectivity {
  pub fn new(network: HttpNetwork, probe_path: impl Into<String>, timeout: Duration) -> Self {
    Self {
      network,
      probe_path: probe_path.into(),
      timeout,
    }
  }
}

#[async_trait]
impl Connectivity for ProbeConnectivity {
  async fn is_online(&self) -> bool {
    let request = OutboundRequest {
      method: "HEAD".to_string(),
      ..OutboundRequest::get(self.probe_path.clone())
    };

    match tokio::time::timeout(self.timeout, self.network.fetch(&request)).await {
      Ok(Ok(_)) => true,
      Ok(Err(e)) => {
        tracing::debug!(error = %e, "connectivity probe failed");
        false
      }
      Err(_) => {
        tracing::debug!(timeout = ?self.timeout, "connectivity probe timed out");
        false
      }
    }
  }
}

/// Connectivity decided by the caller (`--offline`, tests).
#[derive(Debug)]
pub struct FixedConnectivity {
  online: AtomicBool,
}

impl FixedConnectivity {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
    }
  }

  #[cfg(test)]
  pub fn set(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }
}

#[async_trait]
impl Connectivity for FixedConnectivity {
  async fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}
