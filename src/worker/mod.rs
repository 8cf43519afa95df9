//! Worker controller: routes install, activate, fetch, sync and push events
//! to the cache manager, the sync queue and the notification dispatcher.

mod event;
mod push;

pub use event::{WorkerEvent, WorkerHandle};
pub use push::{LogNotifier, Notifier, PushDefaults, PushNotification};

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::broadcast::{Broadcast, SyncMessage, WorkerMessage};
use crate::cache::{CacheEntry, CacheManager, DEFAULT_NETWORK_TIMEOUT};
use crate::net::{Method, Network, Request, Response};
use crate::notify::NotificationDispatcher;
use crate::sync::{DrainReport, SyncQueue};

/// Sync lifecycle of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
  Idle,
  Syncing,
  Succeeded,
  Failed,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  /// Only requests to this origin are routed through the cache
  pub origin: Url,
  pub offline_cache: String,
  pub offline_pages: Vec<String>,
  /// Page served to HTML navigations that cannot be answered; defaults to
  /// the first offline page
  pub offline_fallback: Option<String>,
  pub skip_waiting: bool,
  pub push: PushDefaults,
}

impl WorkerConfig {
  pub fn new(origin: Url) -> Self {
    Self {
      origin,
      offline_cache: "offline-v1".to_string(),
      offline_pages: Vec::new(),
      offline_fallback: None,
      skip_waiting: true,
      push: PushDefaults::default(),
    }
  }

  fn fallback_page(&self) -> Option<&str> {
    self
      .offline_fallback
      .as_deref()
      .or_else(|| self.offline_pages.first().map(String::as_str))
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
  pub cached: usize,
  pub failed: usize,
  pub skip_waiting: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
  pub deleted: Vec<String>,
  pub clients_claimed: bool,
}

#[derive(Clone)]
pub struct ServiceWorkerController {
  config: Arc<WorkerConfig>,
  cache: CacheManager,
  queue: SyncQueue,
  network: Arc<dyn Network>,
  dispatcher: Option<NotificationDispatcher>,
  bus: Option<Arc<dyn Broadcast>>,
  notifier: Arc<dyn Notifier>,
  state: Arc<watch::Sender<WorkerState>>,
  last_outcome: Arc<Mutex<Option<WorkerState>>>,
  clients_claimed: Arc<AtomicBool>,
  sync_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ServiceWorkerController {
  pub fn new(
    config: WorkerConfig,
    cache: CacheManager,
    queue: SyncQueue,
    network: Arc<dyn Network>,
  ) -> Self {
    let (state, _) = watch::channel(WorkerState::Idle);
    Self {
      config: Arc::new(config),
      cache,
      queue,
      network,
      dispatcher: None,
      bus: None,
      notifier: Arc::new(LogNotifier),
      state: Arc::new(state),
      last_outcome: Arc::new(Mutex::new(None)),
      clients_claimed: Arc::new(AtomicBool::new(false)),
      sync_lock: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  pub fn with_dispatcher(mut self, dispatcher: NotificationDispatcher) -> Self {
    self.dispatcher = Some(dispatcher);
    self
  }

  pub fn with_bus(mut self, bus: Arc<dyn Broadcast>) -> Self {
    self.bus = Some(bus);
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  /// Observe state transitions.
  pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
    self.state.subscribe()
  }

  /// Result of the most recent sync event.
  pub fn last_outcome(&self) -> Option<WorkerState> {
    self.last_outcome.lock().ok().and_then(|o| *o)
  }

  pub fn clients_claimed(&self) -> bool {
    self.clients_claimed.load(Ordering::SeqCst)
  }

  /// Pre-cache the offline pages into the offline cache.
  pub async fn install(&self) -> Result<InstallOutcome> {
    let store = self.cache.store();
    store.open(&self.config.offline_cache)?;

    let mut outcome = InstallOutcome {
      cached: 0,
      failed: 0,
      skip_waiting: self.config.skip_waiting,
    };

    for url in &self.config.offline_pages {
      match self.fetch_offline_page(url).await {
        Ok(()) => outcome.cached += 1,
        Err(e) => {
          warn!(%url, "Failed to pre-cache offline page: {}", e);
          outcome.failed += 1;
        }
      }
    }

    info!(
      cached = outcome.cached,
      failed = outcome.failed,
      skip_waiting = outcome.skip_waiting,
      "Worker installed"
    );
    Ok(outcome)
  }

  async fn fetch_offline_page(&self, url: &str) -> Result<()> {
    let request = Request::get(url)?;
    let response = tokio::time::timeout(DEFAULT_NETWORK_TIMEOUT, self.network.fetch(&request))
      .await
      .map_err(|_| eyre!("Timed out"))??;
    if !response.is_success() {
      return Err(eyre!("HTTP {}", response.status));
    }

    let now = Utc::now();
    self.cache.store().put(&CacheEntry {
      key: request.cache_key(),
      cache_name: self.config.offline_cache.clone(),
      url: request.url.to_string(),
      timestamp: Some(response.date().unwrap_or(now)),
      response,
      stored_at: now,
      max_age: None,
    })
  }

  /// Purge caches outside the registry and take control of open clients.
  pub fn activate(&self) -> Result<ActivateOutcome> {
    let mut keep = self.cache.referenced_caches();
    keep.insert(self.config.offline_cache.clone());
    let deleted = self.cache.delete_stale_caches(&keep)?;
    self.clients_claimed.store(true, Ordering::SeqCst);

    info!(deleted = ?deleted, "Worker activated");
    Ok(ActivateOutcome {
      deleted,
      clients_claimed: true,
    })
  }

  /// Answer an intercepted request.
  ///
  /// Same-origin GETs go through the cache manager; everything else is
  /// passed to the network untouched.
  pub async fn fetch(&self, request: &Request) -> Option<Response> {
    if request.method != Method::GET || request.url.origin() != self.config.origin.origin() {
      debug!(method = %request.method, url = %request.url, "Passing request through");
      return match self.network.fetch(request).await {
        Ok(resp) => Some(resp),
        Err(e) => {
          debug!(url = %request.url, "Pass-through fetch failed: {}", e);
          None
        }
      };
    }

    if let Some(resp) = self.cache.get(request).await {
      return Some(resp);
    }

    if request.accepts_html() {
      return self.offline_page();
    }
    None
  }

  fn offline_page(&self) -> Option<Response> {
    let url = self.config.fallback_page()?;
    let key = Request::get(url).ok()?.cache_key();
    match self.cache.store().get(&self.config.offline_cache, &key) {
      Ok(entry) => {
        debug!(%url, found = entry.is_some(), "Serving offline page");
        entry.map(|e| e.response)
      }
      Err(e) => {
        warn!("Offline cache unavailable: {}", e);
        None
      }
    }
  }

  /// Drain the queue for a registered tag. Unknown tags are ignored.
  pub async fn sync(&self, tag: &str) -> Option<DrainReport> {
    if self.queue.registration(tag).is_none() {
      debug!(%tag, "Ignoring sync for unregistered tag");
      return None;
    }

    let _serial = self.sync_lock.lock().await;
    self.state.send_replace(WorkerState::Syncing);

    let report = match self.queue.drain(tag).await {
      Ok(report) => report,
      Err(e) => {
        warn!(%tag, "Sync drain aborted: {}", e);
        self.finish(WorkerState::Failed);
        return None;
      }
    };

    self.publish(&report);
    if let Some(dispatcher) = &self.dispatcher {
      dispatcher.on_sync_report(&report).await;
    }

    let outcome = if report.is_success() {
      WorkerState::Succeeded
    } else {
      WorkerState::Failed
    };
    info!(
      %tag,
      succeeded = report.succeeded.len(),
      failed = report.failed.len(),
      skipped = report.skipped,
      "Sync finished"
    );
    self.finish(outcome);
    Some(report)
  }

  fn finish(&self, outcome: WorkerState) {
    self.state.send_replace(outcome);
    if let Ok(mut last) = self.last_outcome.lock() {
      *last = Some(outcome);
    }
    self.state.send_replace(WorkerState::Idle);
  }

  fn publish(&self, report: &DrainReport) {
    let Some(bus) = &self.bus else {
      return;
    };

    let succeeded = report.succeeded.iter().map(|(task, response)| SyncMessage::SyncComplete {
      task_id: task.id.clone(),
      tag: task.tag.clone(),
      entity_id: task.entity_id.clone(),
      server_id: response.server_id(),
    });
    let failed = report.failed.iter().map(|(task, error)| SyncMessage::SyncFailed {
      task_id: task.id.clone(),
      tag: task.tag.clone(),
      entity_id: task.entity_id.clone(),
      error: error.clone(),
    });

    for message in succeeded.chain(failed) {
      if let Err(e) = bus.publish(&message) {
        warn!("Failed to publish sync message: {}", e);
      }
    }
  }

  /// Show a notification for a push payload.
  pub fn push(&self, payload: &[u8]) -> PushNotification {
    let notification = PushNotification::parse(payload, &self.config.push);
    if let Err(e) = self.notifier.show(&notification) {
      warn!("Failed to show notification: {}", e);
    }
    notification
  }

  /// Forward a notification click to page contexts.
  pub fn notification_click(&self, action: &str, chart_id: Option<&str>) {
    let Some(dispatcher) = &self.dispatcher else {
      return;
    };
    let message = WorkerMessage::NotificationClick {
      action: action.to_string(),
      chart_id: chart_id.map(String::from),
    };
    if let Err(e) = dispatcher.worker_channel().send(message) {
      debug!(%action, "No page context listening for notification click: {}", e);
    }
  }

  /// Handle events until the channel closes or `Shutdown` arrives.
  pub async fn run(&self, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
      match event {
        WorkerEvent::Install => {
          if let Err(e) = self.install().await {
            warn!("Install failed: {}", e);
          }
        }
        WorkerEvent::Activate => {
          if let Err(e) = self.activate() {
            warn!("Activate failed: {}", e);
          }
        }
        WorkerEvent::Fetch { request, reply } => {
          let this = self.clone();
          tokio::spawn(async move {
            let _ = reply.send(this.fetch(&request).await);
          });
        }
        WorkerEvent::Sync { tag } => {
          self.sync(&tag).await;
        }
        WorkerEvent::Push { payload } => {
          self.push(&payload);
        }
        WorkerEvent::NotificationClick { action, chart_id } => {
          self.notification_click(&action, chart_id.as_deref());
        }
        WorkerEvent::Shutdown => break,
      }
    }
    self.cache.settle().await;
    debug!("Worker event loop stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broadcast::ChannelBroadcast;
  use crate::cache::{CacheStrategy, CacheStrategyConfig, CacheStore, SqliteStore, UrlPattern};
  use crate::db::Database;
  use crate::net::fake::FakeNetwork;
  use crate::notify::fake::FakeTransport;
  use crate::notify::PushTransport;
  use crate::sync::{Backoff, SyncRegistration};
  use serde_json::json;
  use std::time::Duration;

  const ORIGIN: &str = "https://app.test";
  const SYNC_URL: &str = "https://app.test/api/charts";

  struct Harness {
    worker: ServiceWorkerController,
    net: Arc<FakeNetwork>,
    store: Arc<SqliteStore>,
    queue: SyncQueue,
    bus: Arc<ChannelBroadcast>,
    transport: Arc<FakeTransport>,
  }

  async fn harness() -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store = Arc::new(SqliteStore::new(db.clone()));
    let net = Arc::new(FakeNetwork::new());
    let cache = CacheManager::new(store.clone(), net.clone());
    cache
      .initialize(vec![CacheStrategyConfig::new(
        "api",
        UrlPattern::contains("/api/"),
        CacheStrategy::NetworkFirst,
        "api-v1",
      )
      .with_network_timeout(0.2)])
      .await
      .unwrap();

    let reg = SyncRegistration::new("chart-sync", SYNC_URL)
      .with_retries(2, 0.0)
      .with_backoff(Backoff::Fixed);
    let queue = SyncQueue::open(db, net.clone(), vec![reg]).unwrap();

    let transport = Arc::new(FakeTransport::default());
    let dispatcher =
      NotificationDispatcher::new(Some(transport.clone() as Arc<dyn PushTransport>));
    let bus = Arc::new(ChannelBroadcast::new());

    let mut config = WorkerConfig::new(Url::parse(ORIGIN).unwrap());
    config.offline_pages = vec![format!("{}/offline.html", ORIGIN)];

    let worker = ServiceWorkerController::new(config, cache, queue.clone(), net.clone())
      .with_dispatcher(dispatcher)
      .with_bus(bus.clone());

    Harness {
      worker,
      net,
      store,
      queue,
      bus,
      transport,
    }
  }

  #[tokio::test]
  async fn test_install_precaches_offline_pages() {
    let h = harness().await;
    h.net
      .respond(&format!("{}/offline.html", ORIGIN), 200, "<h1>offline</h1>");

    let outcome = h.worker.install().await.unwrap();
    assert_eq!(outcome.cached, 1);
    assert!(outcome.skip_waiting);
    assert_eq!(h.store.entry_count("offline-v1").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_activate_purges_unknown_caches_keeps_offline() {
    let h = harness().await;
    h.store.open("offline-v1").unwrap();
    h.store.open("api-v0").unwrap();

    let outcome = h.worker.activate().unwrap();
    assert_eq!(outcome.deleted, vec!["api-v0".to_string()]);
    assert!(h.worker.clients_claimed());
    let names = h.store.cache_names().unwrap();
    assert!(names.contains(&"offline-v1".to_string()));
    assert!(names.contains(&"api-v1".to_string()));
  }

  #[tokio::test]
  async fn test_fetch_passes_through_foreign_and_non_get() {
    let h = harness().await;
    h.net.respond("https://cdn.test/api/lib.js", 200, "lib");
    h.net.respond(SYNC_URL, 201, "{}");

    let foreign = h
      .worker
      .fetch(&Request::get("https://cdn.test/api/lib.js").unwrap())
      .await;
    assert_eq!(foreign.unwrap().text(), "lib");

    let post = Request::new(Method::POST, SYNC_URL).unwrap();
    assert_eq!(h.worker.fetch(&post).await.unwrap().status, 201);

    // Neither went through the cache
    assert_eq!(h.store.entry_count("api-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_fetch_serves_offline_page_for_navigations() {
    let h = harness().await;
    h.net
      .respond(&format!("{}/offline.html", ORIGIN), 200, "<h1>offline</h1>");
    h.worker.install().await.unwrap();
    h.net.set_online(false);

    let nav = Request::get(&format!("{}/api/page", ORIGIN))
      .unwrap()
      .with_header("accept", "text/html");
    assert_eq!(h.worker.fetch(&nav).await.unwrap().text(), "<h1>offline</h1>");

    let data = Request::get(&format!("{}/api/data", ORIGIN)).unwrap();
    assert!(h.worker.fetch(&data).await.is_none());
  }

  #[tokio::test]
  async fn test_sync_unknown_tag_is_ignored() {
    let h = harness().await;
    assert!(h.worker.sync("mystery").await.is_none());
    assert_eq!(h.worker.last_outcome(), None);
    assert_eq!(h.net.total_calls(), 0);
  }

  #[tokio::test]
  async fn test_sync_publishes_outcomes() {
    let h = harness().await;
    let mut sub = h.bus.subscribe();
    let mut states = h.worker.watch_state();
    h.net.respond(SYNC_URL, 201, r#"{"id": 99}"#);
    h.queue
      .enqueue_for("chart-sync", Some(json!({"a": 1})), Some("c1"))
      .unwrap();

    let report = h.worker.sync("chart-sync").await.unwrap();
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(h.worker.state(), WorkerState::Idle);
    assert_eq!(h.worker.last_outcome(), Some(WorkerState::Succeeded));
    assert!(states.has_changed().unwrap());

    match sub.recv().await.unwrap() {
      SyncMessage::SyncComplete {
        entity_id,
        server_id,
        ..
      } => {
        assert_eq!(entity_id.as_deref(), Some("c1"));
        assert_eq!(server_id.as_deref(), Some("99"));
      }
      other => panic!("unexpected message {:?}", other),
    }
    assert!(h.transport.queued().is_empty());
  }

  #[tokio::test]
  async fn test_sync_failure_notifies_and_marks_failed() {
    let h = harness().await;
    let mut sub = h.bus.subscribe();
    h.net.respond(SYNC_URL, 500, "boom");
    h.queue.enqueue_for("chart-sync", None, Some("c2")).unwrap();

    let report = h.worker.sync("chart-sync").await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(h.worker.last_outcome(), Some(WorkerState::Failed));
    assert!(matches!(sub.recv().await, Some(SyncMessage::SyncFailed { .. })));
    assert_eq!(h.transport.queued().len(), 1);
    assert_eq!(h.queue.error_count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_push_falls_back_on_defaults() {
    let h = harness().await;
    let n = h.worker.push(b"{\"body\": \"hello\"}");
    assert_eq!(n.title, push::DEFAULT_TITLE);
    assert_eq!(n.body, "hello");
  }

  #[tokio::test]
  async fn test_notification_click_reaches_navigation() {
    let h = harness().await;
    // No listener attached yet: the click is dropped
    h.worker.notification_click("view", Some("c1"));

    let dispatcher = h.worker.dispatcher.clone().unwrap();
    let mut nav = dispatcher.navigations();
    assert!(dispatcher.initialize(None).await);
    h.worker.notification_click("view", Some("c2"));
    let target = tokio::time::timeout(Duration::from_secs(1), nav.recv())
      .await
      .unwrap()
      .unwrap();
    assert!(target.contains("c2"), "{}", target);
    dispatcher.shutdown();
  }

  #[tokio::test]
  async fn test_event_loop_routes_events() {
    let h = harness().await;
    h.net.respond(&format!("{}/api/charts/1", ORIGIN), 200, "chart");
    let (handle, rx) = WorkerHandle::channel();
    let worker = h.worker.clone();
    let task = tokio::spawn(async move { worker.run(rx).await });

    let resp = handle
      .fetch(Request::get(&format!("{}/api/charts/1", ORIGIN)).unwrap())
      .await;
    assert_eq!(resp.unwrap().text(), "chart");

    assert!(handle.send(WorkerEvent::Shutdown));
    tokio::time::timeout(Duration::from_secs(1), task)
      .await
      .unwrap()
      .unwrap();
  }
}
