//! Main-context facade used by UI code: optimistic chart writes, sync flags,
//! import/export and aggregate status.

mod charts;
mod connectivity;

pub use charts::{ChartRecord, ChartStore, ExportDocument, ImportReport, EXPORT_VERSION};
pub use connectivity::{Connectivity, NetworkQuality, ProbeConnectivity};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcast, Subscription, SyncMessage};
use crate::cache::{CacheManager, DEFAULT_NETWORK_TIMEOUT};
use crate::db::Database;
use crate::net::{Method, Network, Request};
use crate::sync::{DrainOutcome, SyncQueue, TaskStatus};

#[derive(Debug, Clone)]
pub struct FacadeOptions {
  /// Endpoint charts are POSTed to when online
  pub charts_url: String,
  /// Background sync tag used for chart writes
  pub sync_tag: String,
  pub request_timeout: Duration,
  pub network_interval: Duration,
  pub sync_interval: Duration,
}

impl FacadeOptions {
  pub fn new(charts_url: impl Into<String>, sync_tag: impl Into<String>) -> Self {
    Self {
      charts_url: charts_url.into(),
      sync_tag: sync_tag.into(),
      request_timeout: DEFAULT_NETWORK_TIMEOUT,
      network_interval: Duration::from_secs(30),
      sync_interval: Duration::from_secs(10),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResult {
  pub success: bool,
  pub chart_id: String,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub offline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
  pub synced: usize,
  pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
  pub database_bytes: u64,
  pub cache_bytes: u64,
  pub cache_entries: usize,
  pub charts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacadeStatus {
  pub online: bool,
  pub quality: NetworkQuality,
  pub pending: usize,
  pub failed: usize,
  pub errors: u64,
  pub storage: StorageUsage,
  pub checked_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ClientSyncFacade {
  db: Arc<Database>,
  charts: ChartStore,
  queue: SyncQueue,
  cache: CacheManager,
  network: Arc<dyn Network>,
  connectivity: Arc<dyn Connectivity>,
  bus: Option<Arc<dyn Broadcast>>,
  options: Arc<FacadeOptions>,
  chart_list: Arc<RwLock<Vec<ChartRecord>>>,
  status: Arc<RwLock<FacadeStatus>>,
  online: Arc<watch::Sender<bool>>,
  connectivity_changed: Arc<Notify>,
}

impl ClientSyncFacade {
  pub fn new(
    db: Arc<Database>,
    queue: SyncQueue,
    cache: CacheManager,
    network: Arc<dyn Network>,
    connectivity: Arc<dyn Connectivity>,
    options: FacadeOptions,
  ) -> Result<Self> {
    if queue.registration(&options.sync_tag).is_none() {
      return Err(eyre!(
        "Chart sync tag {} has no background sync registration",
        options.sync_tag
      ));
    }

    let (online, _) = watch::channel(false);
    let facade = Self {
      charts: ChartStore::new(Arc::clone(&db)),
      db,
      queue,
      cache,
      network,
      connectivity,
      bus: None,
      options: Arc::new(options),
      chart_list: Arc::new(RwLock::new(Vec::new())),
      status: Arc::new(RwLock::new(FacadeStatus::default())),
      online: Arc::new(online),
      connectivity_changed: Arc::new(Notify::new()),
    };
    facade.refresh_charts();
    Ok(facade)
  }

  pub fn with_bus(mut self, bus: Arc<dyn Broadcast>) -> Self {
    self.bus = Some(bus);
    self
  }

  pub fn chart_store(&self) -> &ChartStore {
    &self.charts
  }

  /// In-memory chart list as of the last refresh, newest first.
  pub fn charts(&self) -> Vec<ChartRecord> {
    self.chart_list.read().map(|c| c.clone()).unwrap_or_default()
  }

  fn refresh_charts(&self) {
    match self.charts.list() {
      Ok(list) => {
        if let Ok(mut charts) = self.chart_list.write() {
          *charts = list;
        }
      }
      Err(e) => warn!("Failed to refresh chart list: {}", e),
    }
  }

  fn publish(&self, message: SyncMessage) {
    if let Some(bus) = &self.bus {
      if let Err(e) = bus.publish(&message) {
        warn!("Failed to publish {}: {}", message.kind(), e);
      }
    }
  }

  fn sync_payload(chart: &ChartRecord) -> Value {
    json!({ "localId": chart.id, "data": chart.data, "params": chart.params })
  }

  /// Save a chart locally, then try to reach the server.
  ///
  /// A local write failure is the only error. When offline or when the POST
  /// fails, the write is queued for background sync.
  pub async fn save_chart(&self, data: Value, params: Value) -> Result<SaveResult> {
    let chart = ChartRecord::new(data, params);
    self.charts.upsert(&chart)?;

    let offline = if self.connectivity.check().await.is_online() {
      match self.post_chart(&chart).await {
        Ok(server_id) => {
          self.charts.mark_synced(&chart.id, server_id.as_deref())?;
          false
        }
        Err(e) => {
          debug!(chart = %chart.id, "Direct save failed, queueing: {}", e);
          true
        }
      }
    } else {
      true
    };

    if offline {
      self.queue.enqueue_for(
        &self.options.sync_tag,
        Some(Self::sync_payload(&chart)),
        Some(chart.id.as_str()),
      )?;
    }

    self.refresh_charts();
    self.publish(SyncMessage::ChartSaved {
      chart_id: chart.id.clone(),
      offline,
    });
    info!(chart = %chart.id, offline, "Chart saved");

    Ok(SaveResult {
      success: true,
      chart_id: chart.id,
      offline,
    })
  }

  async fn post_chart(&self, chart: &ChartRecord) -> Result<Option<String>> {
    let request =
      Request::new(Method::POST, &self.options.charts_url)?.with_json(&Self::sync_payload(chart))?;
    let response = tokio::time::timeout(self.options.request_timeout, self.network.fetch(&request))
      .await
      .map_err(|_| eyre!("Timed out after {:?}", self.options.request_timeout))??;
    if !response.is_success() {
      return Err(eyre!("HTTP {}", response.status));
    }
    Ok(response.server_id())
  }

  /// Push every dirty chart through its sync task.
  pub async fn sync_charts(&self) -> Result<SyncSummary> {
    let mut summary = SyncSummary::default();

    for chart in self.charts.dirty()? {
      match self.sync_chart(&chart).await {
        Ok(true) => summary.synced += 1,
        Ok(false) => summary.errors += 1,
        Err(e) => {
          warn!(chart = %chart.id, "Chart sync failed: {}", e);
          summary.errors += 1;
        }
      }
    }

    self.refresh_charts();
    self.refresh_sync_status();
    info!(synced = summary.synced, errors = summary.errors, "Chart sync finished");
    Ok(summary)
  }

  async fn sync_chart(&self, chart: &ChartRecord) -> Result<bool> {
    let task = match self.queue.find_for_entity(&chart.id)? {
      Some(task) if task.status == TaskStatus::Failed => {
        self.queue.retry_failed(&task.id)?;
        task
      }
      Some(task) => task,
      None => self.queue.enqueue_for(
        &self.options.sync_tag,
        Some(Self::sync_payload(chart)),
        Some(chart.id.as_str()),
      )?,
    };

    match self.queue.run_task(&task.id).await? {
      DrainOutcome::Succeeded { response, .. } => {
        self
          .charts
          .mark_synced(&chart.id, response.server_id().as_deref())?;
        Ok(true)
      }
      DrainOutcome::AlreadyInFlight => {
        debug!(chart = %chart.id, "Sync already in progress");
        Ok(false)
      }
      _ => Ok(false),
    }
  }

  /// Apply a cross-context message to local chart flags.
  pub fn apply_sync_message(&self, message: &SyncMessage) -> Result<bool> {
    let SyncMessage::SyncComplete {
      tag,
      entity_id: Some(id),
      server_id,
      ..
    } = message
    else {
      return Ok(false);
    };
    if tag != &self.options.sync_tag {
      return Ok(false);
    }
    let updated = self.charts.mark_synced(id, server_id.as_deref())?;
    if updated {
      self.refresh_charts();
    }
    Ok(updated)
  }

  pub fn export_charts(&self) -> Result<String> {
    let document = self.charts.export()?;
    serde_json::to_string_pretty(&document).map_err(|e| eyre!("Failed to encode export: {}", e))
  }

  pub fn import_charts(&self, data: &str) -> Result<ImportReport> {
    let document: Value =
      serde_json::from_str(data).map_err(|e| eyre!("Import file is not valid JSON: {}", e))?;
    let report = self.charts.import(&document)?;

    self.refresh_charts();
    self.publish(SyncMessage::ChartsImported {
      imported: report.imported,
    });
    info!(imported = report.imported, errors = report.errors, "Charts imported");
    Ok(report)
  }

  /// Signal a host connectivity change; the polling loop re-probes at once.
  pub fn connectivity_changed(&self) {
    self.connectivity_changed.notify_one();
  }

  /// Observe the online flag.
  pub fn watch_online(&self) -> watch::Receiver<bool> {
    self.online.subscribe()
  }

  async fn refresh_network(&self) {
    let quality = self.connectivity.check().await;
    self.online.send_if_modified(|online| {
      let changed = *online != quality.is_online();
      *online = quality.is_online();
      changed
    });
    if let Ok(mut status) = self.status.write() {
      status.quality = quality;
      status.online = quality.is_online();
      status.checked_at = Some(Utc::now());
    }
  }

  fn refresh_sync_status(&self) {
    let cache_entries = self.cache.stats().values().map(|s| s.entries).sum();
    let storage = StorageUsage {
      database_bytes: self.db.size_bytes().unwrap_or(0),
      cache_bytes: self.cache.store().total_bytes().unwrap_or(0),
      cache_entries,
      charts: self.charts.count().unwrap_or(0),
    };

    if let Ok(mut status) = self.status.write() {
      status.pending = self.queue.pending_count().unwrap_or(status.pending);
      status.failed = self.queue.failed_count().unwrap_or(status.failed);
      status.errors = self.queue.error_count().unwrap_or(status.errors);
      status.storage = storage;
    }
  }

  /// Probe the network and collect fresh sync and storage figures.
  pub async fn status(&self) -> FacadeStatus {
    self.refresh_network().await;
    self.refresh_sync_status();
    self.cached_status()
  }

  /// Status as of the last poll, without probing.
  pub fn cached_status(&self) -> FacadeStatus {
    self.status.read().map(|s| s.clone()).unwrap_or_default()
  }

  /// Keep status current: network on a fixed interval and on connectivity
  /// changes, sync figures on a shorter interval and on sync messages.
  pub fn spawn_polling(&self) -> JoinHandle<()> {
    let this = self.clone();
    let mut subscription = self.bus.as_ref().map(|b| b.subscribe());

    tokio::spawn(async move {
      let mut network_tick = tokio::time::interval(this.options.network_interval);
      let mut sync_tick = tokio::time::interval(this.options.sync_interval);
      let mut listening = subscription.is_some();

      loop {
        tokio::select! {
          _ = network_tick.tick() => this.refresh_network().await,
          _ = this.connectivity_changed.notified() => this.refresh_network().await,
          _ = sync_tick.tick() => this.refresh_sync_status(),
          message = next_message(&mut subscription), if listening => match message {
            Some(message) => {
              if let Err(e) = this.apply_sync_message(&message) {
                warn!("Failed to apply {}: {}", message.kind(), e);
              }
              this.refresh_sync_status();
            }
            None => listening = false,
          },
        }
      }
    })
  }
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<SyncMessage> {
  match subscription {
    Some(sub) => sub.recv().await,
    None => None,
  }
}
