use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::InstallPolicy;
use crate::queue::RetryPolicy;

/// Shell routes and assets seeded into every new cache generation.
pub const DEFAULT_APP_SHELL: &[&str] = &[
  "/",
  "/offline/",
  "/accounts/login/",
  "/inventory/products/",
  "/sales/pos/",
  "/static/core/css/bootstrap.min.css",
  "/static/core/css/styles.css",
  "/static/js/pwa.js",
  "/static/js/offline-queue.js",
  "/static/core/icons/icon-192.png",
  "/static/core/icons/icon-512.png",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the POS server every request is forwarded to
  pub origin: String,
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  /// SQLite file shared by the queue and the response cache
  pub database: Option<PathBuf>,
  /// Directory for rolling log files (defaults to the data directory)
  pub log_dir: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8088))
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Generation tag; bumping it invalidates every older generation on activation
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// Route served when a page is neither reachable nor cached
  #[serde(default = "default_offline_url")]
  pub offline_url: String,
  #[serde(default = "default_app_shell")]
  pub app_shell: Vec<String>,
  #[serde(default)]
  pub install_policy: InstallPolicy,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_cache_version(),
      offline_url: default_offline_url(),
      app_shell: default_app_shell(),
      install_policy: InstallPolicy::default(),
    }
  }
}

fn default_cache_version() -> String {
  "nura-pos-cache-v1".to_string()
}

fn default_offline_url() -> String {
  "/offline/".to_string()
}

fn default_app_shell() -> Vec<String> {
  DEFAULT_APP_SHELL.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Name of the storage slot holding the pending actions
  #[serde(default = "default_queue_slot")]
  pub slot: String,
  /// Give up on an action after this many failed replays (unset = retry forever)
  pub max_attempts: Option<u32>,
  pub replay_timeout_secs: Option<u64>,
  /// Cookie header sent with every replay, for sessions established outside this process
  pub session_cookie: Option<String>,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      slot: default_queue_slot(),
      max_attempts: None,
      replay_timeout_secs: None,
      session_cookie: None,
    }
  }
}

fn default_queue_slot() -> String {
  "nura_pos_offline_queue_v1".to_string()
}

impl QueueConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_attempts,
      request_timeout: self.replay_timeout_secs.map(Duration::from_secs),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  #[serde(default = "default_probe_path")]
  pub probe_path: String,
  #[serde(default = "default_interval_ms")]
  pub interval_ms: u64,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_path: default_probe_path(),
      interval_ms: default_interval_ms(),
      timeout_ms: default_timeout_ms(),
    }
  }
}

fn default_probe_path() -> String {
  "/".to_string()
}

fn default_interval_ms() -> u64 {
  2000
}

fn default_timeout_ms() -> u64 {
  1500
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pos-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pos-offline/config.yaml
  ///
  /// `POS_OFFLINE_ORIGIN` overrides the configured origin.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/pos-offline/config.yaml\n\
                 See config.example.yaml for the format."
        ))
      }
    };

    if let Ok(origin) = std::env::var("POS_OFFLINE_ORIGIN") {
      config.origin = origin;
    }
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("pos-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pos-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let origin = url::Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be an http(s) URL, got '{}'", self.origin));
    }
    if self.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }
    if self.queue.max_attempts == Some(0) {
      return Err(eyre!("queue.max_attempts must be at least 1"));
    }
    Ok(())
  }

  /// Database path, falling back to the per-user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("offline.db")),
    }
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.log_dir {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("logs")),
    }
  }
}

fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("pos-offline"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("origin: https://pos.example.com\n").unwrap();
    assert_eq!(config.listen, default_listen());
    assert_eq!(config.cache.version, "nura-pos-cache-v1");
    assert_eq!(config.cache.offline_url, "/offline/");
    assert_eq!(config.cache.app_shell.len(), DEFAULT_APP_SHELL.len());
    assert_eq!(config.cache.install_policy, InstallPolicy::Strict);
    assert_eq!(config.queue.slot, "nura_pos_offline_queue_v1");
    assert_eq!(config.queue.retry_policy(), RetryPolicy::default());
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
origin: http://10.0.0.5:8000
listen: 0.0.0.0:9000
cache:
  version: nura-pos-cache-v2
  app_shell: ["/", "/offline/"]
  install_policy: best_effort
queue:
  max_attempts: 5
  replay_timeout_secs: 30
connectivity:
  probe_path: /health/
  interval_ms: 500
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.listen.port(), 9000);
    assert_eq!(config.cache.version, "nura-pos-cache-v2");
    assert_eq!(config.cache.app_shell, vec!["/", "/offline/"]);
    assert_eq!(config.cache.install_policy, InstallPolicy::BestEffort);
    let policy = config.queue.retry_policy();
    assert_eq!(policy.max_attempts, Some(5));
    assert_eq!(policy.request_timeout, Some(Duration::from_secs(30)));
    assert_eq!(config.connectivity.probe_path, "/health/");
    assert_eq!(config.connectivity.timeout_ms, 1500);
  }

  #[test]
  fn test_validate_rejects_bad_origin() {
    let config = Config::from_yaml("origin: ftp://pos.example.com\n").unwrap();
    assert!(config.validate().is_err());

    let config = Config::from_yaml("origin: not a url\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_validate_rejects_zero_attempts() {
    let config =
      Config::from_yaml("origin: https://pos.example.com\nqueue:\n  max_attempts: 0\n").unwrap();
    assert!(config.validate().is_err());
  }
}
