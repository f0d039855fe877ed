//! Versioned cache generations: seeding on install, garbage collection on activation.

use futures::future::join_all;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};
use url::Url;

use super::storage::{cache_url, CacheStorage};
use crate::net::{HttpResponse, Network, OutboundRequest};

/// The generation currently serving reads and writes, shared with the cache layer.
///
/// `None` until a generation claims control; requests pass through untouched
/// until then.
#[derive(Debug, Clone, Default)]
pub struct ActiveGeneration {
  inner: Arc<RwLock<Option<String>>>,
}

impl ActiveGeneration {
  pub fn current(&self) -> Option<String> {
    match self.inner.read() {
      Ok(guard) => guard.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  pub fn claim(&self, name: &str) {
    let mut guard = match self.inner.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(name.to_string());
  }

  #[cfg(test)]
  pub fn release(&self) {
    if let Ok(mut guard) = self.inner.write() {
      *guard = None;
    }
  }
}

/// What happens when some app-shell URLs can't be fetched during install.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPolicy {
  /// Nothing is stored and the install fails
  #[default]
  Strict,
  /// Store what was fetched and carry on
  BestEffort,
}

/// Lifecycle of one generation manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Parsed,
  Installing,
  Installed,
  Activated,
  /// Install failed; this version never takes control
  Redundant,
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
  #[error("failed to fetch {} app-shell url(s): {}", .0.len(), .0.join(", "))]
  ShellFetch(Vec<String>),
  #[error("cache storage error: {0}")]
  Storage(String),
  #[error("cannot activate generation in state {0:?}")]
  NotInstalled(Lifecycle),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub stored: usize,
  pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
}

/// Owns one cache version: seeds it with the app shell and retires older ones.
pub struct GenerationManager<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  active: ActiveGeneration,
  origin: Url,
  version: String,
  app_shell: Vec<String>,
  policy: InstallPolicy,
  state: Lifecycle,
}

impl<S: CacheStorage> GenerationManager<S> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<dyn Network>,
    active: ActiveGeneration,
    origin: Url,
    version: impl Into<String>,
    app_shell: Vec<String>,
    policy: InstallPolicy,
  ) -> Self {
    Self {
      storage,
      network,
      active,
      origin,
      version: version.into(),
      app_shell,
      policy,
      state: Lifecycle::Parsed,
    }
  }

  pub fn state(&self) -> Lifecycle {
    self.state
  }

  /// Open this version's namespace and populate it with the app shell.
  pub async fn install(&mut self) -> Result<InstallReport, InstallError> {
    self.state = Lifecycle::Installing;
    info!(version = %self.version, urls = self.app_shell.len(), "Installing cache generation");

    let created = self
      .storage
      .open_generation(&self.version)
      .map_err(|e| self.fail(InstallError::Storage(e.to_string())))?;

    let fetches = self.app_shell.iter().map(|url| self.fetch_shell(url));
    let results = join_all(fetches).await;

    let mut fetched = Vec::new();
    let mut failed = Vec::new();
    for (url, result) in self.app_shell.iter().zip(results) {
      match result {
        Some(entry) => fetched.push(entry),
        None => failed.push(url.clone()),
      }
    }

    if !failed.is_empty() && self.policy == InstallPolicy::Strict {
      if created {
        if let Err(e) = self.storage.delete_generation(&self.version) {
          error!(version = %self.version, error = %e, "failed to remove aborted generation");
        }
      }
      return Err(self.fail(InstallError::ShellFetch(failed)));
    }

    self
      .storage
      .store_all(&self.version, &fetched)
      .map_err(|e| self.fail(InstallError::Storage(e.to_string())))?;

    if !failed.is_empty() {
      warn!(version = %self.version, failed = ?failed, "Installed without some app-shell urls");
    }
    self.state = Lifecycle::Installed;
    Ok(InstallReport {
      stored: fetched.len(),
      failed,
    })
  }

  /// Fetch one shell URL; only a 2xx counts.
  async fn fetch_shell(&self, url: &str) -> Option<(String, HttpResponse)> {
    let Some(key) = cache_url(&self.origin, url) else {
      warn!(url, "app-shell url does not resolve against origin");
      return None;
    };

    match self.network.fetch(&OutboundRequest::get(url)).await {
      Ok(response) if response.is_success() => Some((key, response)),
      Ok(response) => {
        warn!(url, status = response.status, "app-shell url returned an error");
        None
      }
      Err(e) => {
        warn!(url, error = %e, "app-shell url could not be fetched");
        None
      }
    }
  }

  fn fail(&mut self, error: InstallError) -> InstallError {
    error!(version = %self.version, error = %error, "Cache generation install failed");
    self.state = Lifecycle::Redundant;
    error
  }

  /// Delete every other generation, then take control of all requests.
  pub fn activate(&mut self) -> Result<ActivationReport, InstallError> {
    if self.state != Lifecycle::Installed {
      return Err(InstallError::NotInstalled(self.state));
    }

    let generations = self
      .storage
      .generations()
      .map_err(|e| InstallError::Storage(e.to_string()))?;

    let mut report = ActivationReport::default();
    for name in generations.into_iter().filter(|name| *name != self.version) {
      match self.storage.delete_generation(&name) {
        Ok(_) => report.deleted.push(name),
        Err(e) => error!(generation = %name, error = %e, "failed to delete stale generation"),
      }
    }

    self.active.claim(&self.version);
    self.state = Lifecycle::Activated;
    info!(version = %self.version, deleted = ?report.deleted, "Cache generation activated");
    Ok(report)
  }

  /// Hand control back to the newest existing generation after a failed install.
  ///
  /// Returns the generation that took over, if any.
  pub fn resume_previous(&self) -> Option<String> {
    let generations = match self.storage.generations() {
      Ok(generations) => generations,
      Err(e) => {
        error!(error = %e, "failed to list cache generations");
        return None;
      }
    };

    let previous = generations.into_iter().last()?;
    self.active.claim(&previous);
    warn!(generation = %previous, "Serving from previous cache generation");
    Some(previous)
  }
}
