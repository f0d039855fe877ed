use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};
use url::Url;

use crate::cache::{ActiveGeneration, CacheLayer, CacheStorage, GenerationManager, SqliteStorage};
use crate::config::Config;
use crate::db;
use crate::event::{Event, EventHandler};
use crate::net::{Connectivity, FixedConnectivity, HttpNetwork, ProbeConnectivity};
use crate::queue::{
  ActionCapture, ConsoleNotifier, DrainReport, DrainTrigger, DrainWorker, FormSubmission,
  LogNotifier, QueueStore, QueuedAction, SqliteSlots, SubmitOutcome, DEAD_LETTER_SLOT,
};
use crate::server;

/// Queue length and cache generations at a glance.
#[derive(Debug)]
pub struct Status {
  pub pending: usize,
  pub dead_lettered: usize,
  pub generations: Vec<(String, usize)>,
}

/// Wires the queue side and the interception side to one database and origin.
pub struct App {
  config: Config,
  origin: Url,
  queue: Arc<QueueStore<SqliteSlots>>,
  cache: Arc<SqliteStorage>,
  connectivity: Arc<dyn Connectivity>,
}

impl App {
  /// `force_offline` pins connectivity to offline instead of probing the origin.
  pub fn new(config: Config, force_offline: bool) -> Result<Self> {
    let origin =
      Url::parse(&config.origin).map_err(|e| eyre!("Invalid origin '{}': {}", config.origin, e))?;
    let db_path = config.database_path()?;

    let slots = Arc::new(SqliteSlots::new(db::open(&db_path)?));
    let queue = Arc::new(QueueStore::new(slots, config.queue.slot.clone()));
    let cache = Arc::new(SqliteStorage::new(db::open(&db_path)?));

    let connectivity: Arc<dyn Connectivity> = if force_offline {
      Arc::new(FixedConnectivity::new(false))
    } else {
      Arc::new(ProbeConnectivity::new(
        HttpNetwork::proxy(&config.origin)?,
        config.connectivity.probe_path.clone(),
        Duration::from_millis(config.connectivity.timeout_ms),
      ))
    };

    Ok(Self {
      config,
      origin,
      queue,
      cache,
      connectivity,
    })
  }

  fn drain_worker(&self) -> Result<DrainWorker<SqliteSlots>> {
    let network = HttpNetwork::replay(&self.config.origin, self.config.queue.session_cookie.clone())?;
    Ok(DrainWorker::new(
      Arc::clone(&self.queue),
      self.queue.sibling(DEAD_LETTER_SLOT),
      Arc::new(network),
      Arc::clone(&self.connectivity),
      self.config.queue.retry_policy(),
    ))
  }

  /// Run the proxy and the drain worker until Ctrl-C.
  pub async fn serve(self) -> Result<()> {
    let proxy_network = Arc::new(HttpNetwork::proxy(&self.config.origin)?);
    let active = ActiveGeneration::default();

    let mut generations = GenerationManager::new(
      Arc::clone(&self.cache),
      Arc::new(HttpNetwork::shell(&self.config.origin)?),
      active.clone(),
      self.origin.clone(),
      self.config.cache.version.clone(),
      self.config.cache.app_shell.clone(),
      self.config.cache.install_policy,
    );
    match generations.install().await {
      Ok(report) => {
        info!(stored = report.stored, failed = report.failed.len(), "App shell cached");
        generations
          .activate()
          .map_err(|e| eyre!("Failed to activate cache generation: {}", e))?;
        info!(state = ?generations.state(), "Cache generation in control");
      }
      Err(e) => {
        warn!(error = %e, "Keeping previous cache generation");
        if generations.resume_previous().is_none() {
          warn!("No cache generation available; requests pass through uncached");
        }
      }
    }

    let layer = CacheLayer::new(
      Arc::clone(&self.cache),
      proxy_network,
      active,
      self.origin.clone(),
      self.config.cache.offline_url.clone(),
    );

    let capture = Arc::new(ActionCapture::new(
      Arc::clone(&self.queue),
      Arc::clone(&self.connectivity),
      Arc::new(LogNotifier),
    ));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(server::run_server(
      self.config.listen,
      layer,
      capture,
      async move {
        let _ = shutdown_rx.await;
      },
    ));

    let worker = Arc::new(self.drain_worker()?);
    let mut events = EventHandler::new(
      Arc::clone(&self.connectivity),
      Duration::from_millis(self.config.connectivity.interval_ms),
    );

    loop {
      tokio::select! {
        event = events.next() => match event {
          Some(Event::Loaded) => spawn_drain(&worker, DrainTrigger::PageLoad),
          Some(Event::ConnectivityRestored) => {
            info!("Connectivity restored");
            spawn_drain(&worker, DrainTrigger::ConnectivityRestored);
          }
          Some(Event::ConnectivityLost) => warn!("Origin unreachable, serving from cache"),
          None => break,
        },
        result = &mut server => {
          return match result {
            Ok(result) => result,
            Err(e) => Err(eyre!("Proxy task failed: {}", e)),
          };
        }
        _ = tokio::signal::ctrl_c() => {
          info!("Shutting down");
          break;
        }
      }
    }

    let _ = shutdown_tx.send(());
    server.await.map_err(|e| eyre!("Proxy task failed: {}", e))?
  }

  /// Handle a form submission the way the page would.
  pub async fn capture(&self, form: &FormSubmission, current_path: &str) -> Result<SubmitOutcome> {
    let capture = ActionCapture::new(
      Arc::clone(&self.queue),
      Arc::clone(&self.connectivity),
      Arc::new(ConsoleNotifier),
    );
    capture
      .submit(form, current_path)
      .await
      .map_err(|e| eyre!("Offline capture failed: {}", e))
  }

  pub async fn drain(&self) -> Result<DrainReport> {
    Ok(self.drain_worker()?.drain(DrainTrigger::Manual).await)
  }

  pub fn pending(&self) -> Result<Vec<QueuedAction>> {
    Ok(self.queue.load()?.actions)
  }

  pub fn dead_lettered(&self) -> Result<Vec<QueuedAction>> {
    Ok(self.queue.sibling(DEAD_LETTER_SLOT).load()?.actions)
  }

  /// Drop every pending action. Storage failures are logged, not returned.
  pub fn clear_queue(&self) {
    self.queue.write(&[]);
  }

  pub fn status(&self) -> Result<Status> {
    let generations = self
      .cache
      .generations()?
      .into_iter()
      .map(|name| {
        let count = self.cache.entry_count(&name)?;
        Ok((name, count))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Status {
      pending: self.queue.read().len(),
      dead_lettered: self.queue.sibling(DEAD_LETTER_SLOT).read().len(),
      generations,
    })
  }
}

fn spawn_drain(worker: &Arc<DrainWorker<SqliteSlots>>, trigger: DrainTrigger) {
  let worker = Arc::clone(worker);
  tokio::spawn(async move {
    let report = worker.drain(trigger).await;
    match report.skipped {
      Some(reason) => info!(?trigger, ?reason, "Drain skipped"),
      None if report.retained > 0 || report.dead_lettered > 0 => warn!(
        ?trigger,
        synced = report.synced,
        retained = report.retained,
        dead_lettered = report.dead_lettered,
        "Offline queue partially synced"
      ),
      None => info!(?trigger, synced = report.synced, "Offline queue synced"),
    }
  });
}
