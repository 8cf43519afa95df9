//! Composition root: builds every component from a [`Config`].

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::broadcast::{Broadcast, StorageBroadcast};
use crate::cache::{CacheManager, CacheStats, CacheStore, NoopStore, SqliteStore};
use crate::config::Config;
use crate::db::Database;
use crate::facade::{ChartStore, ClientSyncFacade, FacadeOptions, FacadeStatus, ProbeConnectivity};
use crate::net::{HttpNetwork, Network};
use crate::notify::{HttpPushTransport, NotificationDispatcher, NotificationStatus, PushTransport};
use crate::sync::{DrainReport, SyncQueue};
use crate::worker::{ServiceWorkerController, WorkerEvent, WorkerHandle};

/// Combined status of every component
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
  pub sync: FacadeStatus,
  pub notifications: NotificationStatus,
  pub caches: BTreeMap<String, CacheStats>,
}

/// Every component wired together over one database
pub struct App {
  pub config: Config,
  pub db: Arc<Database>,
  pub cache: CacheManager,
  pub queue: SyncQueue,
  pub bus: Arc<dyn Broadcast>,
  pub dispatcher: NotificationDispatcher,
  pub worker: ServiceWorkerController,
  pub facade: ClientSyncFacade,
}

impl App {
  pub async fn new(config: Config) -> Result<Self> {
    let network: Arc<dyn Network> =
      Arc::new(HttpNetwork::new()?.with_token(Config::get_api_token(), &config.base_url()?));
    let db = Arc::new(Database::open(&Database::default_path(&config.data_dir()))?);
    Self::with_network(config, db, network).await
  }

  /// Build over an explicit database and network.
  pub async fn with_network(
    config: Config,
    db: Arc<Database>,
    network: Arc<dyn Network>,
  ) -> Result<Self> {
    let store: Arc<dyn CacheStore> = if config.cache.enabled {
      let sqlite = SqliteStore::new(Arc::clone(&db));
      Arc::new(match config.cache.quota_bytes {
        Some(quota) => sqlite.with_quota(quota),
        None => sqlite,
      })
    } else {
      Arc::new(NoopStore)
    };

    let precache = config
      .cache
      .precache
      .iter()
      .map(|p| config.endpoint(p))
      .collect::<Result<Vec<_>>>()?;

    let cache = CacheManager::new(store, Arc::clone(&network))
      .with_reserved_cache(&config.cache.offline_cache)
      .with_precache(precache);
    cache.initialize(config.cache.strategies.clone()).await?;

    let queue = SyncQueue::open(
      Arc::clone(&db),
      Arc::clone(&network),
      config.background_sync.clone(),
    )?
    .with_entity_sync(
      &config.server.chart_sync_tag,
      Arc::new(ChartStore::new(Arc::clone(&db))),
    );

    let bus: Arc<dyn Broadcast> = Arc::new(StorageBroadcast::new(Arc::clone(&db)));

    let transport: Option<Arc<dyn PushTransport>> = if config.notifications.enabled {
      Some(Arc::new(HttpPushTransport::new(
        Arc::clone(&network),
        &config.server.base_url,
        config.notifications.endpoints(),
      )?))
    } else {
      None
    };
    let dispatcher = NotificationDispatcher::new(transport)
      .with_sync_queue(queue.clone())
      .with_bus(Arc::clone(&bus));

    let worker = ServiceWorkerController::new(
      config.worker_config()?,
      cache.clone(),
      queue.clone(),
      Arc::clone(&network),
    )
    .with_dispatcher(dispatcher.clone())
    .with_bus(Arc::clone(&bus));

    let connectivity = Arc::new(ProbeConnectivity::new(
      Arc::clone(&network),
      config.endpoint(&config.server.health_path)?,
    ));
    let mut options = FacadeOptions::new(
      config.endpoint(&config.server.charts_path)?,
      &config.server.chart_sync_tag,
    );
    options.network_interval = config.polling.network_interval();
    options.sync_interval = config.polling.sync_interval();
    let facade = ClientSyncFacade::new(
      Arc::clone(&db),
      queue.clone(),
      cache.clone(),
      network,
      connectivity,
      options,
    )?
    .with_bus(Arc::clone(&bus));

    Ok(Self {
      config,
      db,
      cache,
      queue,
      bus,
      dispatcher,
      worker,
      facade,
    })
  }

  pub async fn status(&self) -> AppStatus {
    AppStatus {
      sync: self.facade.status().await,
      notifications: self.dispatcher.status().await,
      caches: self.cache.stats().into_iter().collect(),
    }
  }

  /// Drain one tag, or every registered tag when `tag` is `None`.
  pub async fn sync(&self, tag: Option<&str>) -> Result<Vec<DrainReport>> {
    let tags = match tag {
      Some(t) => {
        if self.queue.registration(t).is_none() {
          return Err(eyre!("No background sync registration for tag {}", t));
        }
        vec![t.to_string()]
      }
      None => self.queue.tags(),
    };

    let reports = join_all(tags.iter().map(|t| self.worker.sync(t))).await;
    Ok(reports.into_iter().flatten().collect())
  }

  /// Run the worker until Ctrl-C: install, activate, poll status and drain
  /// the queue whenever the network comes back.
  pub async fn watch(&self, user_id: Option<&str>) -> Result<()> {
    let (handle, events) = WorkerHandle::channel();
    let worker = self.worker.clone();
    let worker_task = tokio::spawn(async move { worker.run(events).await });

    handle.send(WorkerEvent::Install);
    handle.send(WorkerEvent::Activate);

    if !self.dispatcher.initialize(user_id).await {
      warn!("Continuing without push notifications");
    }
    if let (Some(user), Some(prefs)) = (user_id, &self.config.notifications.preferences) {
      if let Err(e) = self.dispatcher.subscribe(user, Some(prefs)).await {
        warn!("Push subscription failed: {}", e);
      }
    }

    let poller = self.facade.spawn_polling();
    let mut online = self.facade.watch_online();
    let mut navigations = self.dispatcher.navigations();
    let mut sync_tick = tokio::time::interval(self.config.polling.sync_interval());
    sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Watching for sync opportunities");
    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => break,
        changed = online.changed() => {
          if changed.is_err() {
            break;
          }
          if *online.borrow_and_update() {
            info!("Network is back, draining sync queue");
            for tag in self.queue.tags() {
              handle.sync(&tag);
            }
          }
        }
        _ = sync_tick.tick() => {
          if *online.borrow() && self.queue.pending_count().unwrap_or(0) > 0 {
            for tag in self.queue.tags() {
              handle.sync(&tag);
            }
          }
        }
        Ok(target) = navigations.recv() => info!(%target, "Navigate"),
      }
    }

    info!("Shutting down");
    poller.abort();
    self.dispatcher.shutdown();
    handle.send(WorkerEvent::Shutdown);
    if let Err(e) = worker_task.await {
      warn!("Worker task ended abnormally: {}", e);
    }
    Ok(())
  }
}
