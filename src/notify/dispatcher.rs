//! Notification dispatch driven by sync outcomes, and routing of notification
//! clicks back to page contexts.

use chrono::{Local, NaiveDate, NaiveDateTime};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::preferences::NotificationPreferences;
use super::transport::{NotificationAction, PushTransport, QueuedNotification, Urgency};
use crate::broadcast::{Broadcast, SyncMessage, WorkerMessage};
use crate::sync::{DrainReport, SyncQueue};

type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Navigation target for a notification click.
pub fn route_click(action: &str, chart_id: Option<&str>) -> String {
  match (action, chart_id) {
    ("view", Some(id)) => format!("/charts/{}", id),
    ("share", Some(id)) => format!("/charts/{}/share", id),
    ("view" | "share", None) => "/charts".to_string(),
    ("horoscope", _) => "/horoscope".to_string(),
    ("settings", _) => "/settings/notifications".to_string(),
    _ => "/dashboard".to_string(),
  }
}

/// What happened to a notification handed to [`NotificationDispatcher::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
  Queued,
  /// Nothing to send (e.g. the entity had no id)
  Skipped,
  /// No push transport configured
  Unavailable,
  QuietHours,
  DailyLimit,
  /// Transport rejected the notification
  Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundSyncStatus {
  pub pending: usize,
  pub failed: usize,
  pub errors: u64,
}

/// Fully populated dispatcher status.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStatus {
  pub available: bool,
  pub user_id: Option<String>,
  pub total_sent: u64,
  pub total_delivered: u64,
  pub avg_delivery_time: f64,
  pub sent_today: u32,
  pub background_sync: BackgroundSyncStatus,
  pub last_sync_event: Option<SyncMessage>,
}

#[derive(Default)]
struct DispatcherState {
  user_id: Option<String>,
  preferences: NotificationPreferences,
  day: Option<NaiveDate>,
  sent_today: u32,
  last_sync_event: Option<SyncMessage>,
  listening: bool,
}

/// Coordinates user-facing notifications with sync events.
///
/// Built explicitly by the caller; the push transport is optional and its
/// absence makes every delivery report [`SendOutcome::Unavailable`].
#[derive(Clone)]
pub struct NotificationDispatcher {
  transport: Option<Arc<dyn PushTransport>>,
  queue: Option<SyncQueue>,
  bus: Option<Arc<dyn Broadcast>>,
  worker_messages: broadcast::Sender<WorkerMessage>,
  navigation: broadcast::Sender<String>,
  state: Arc<Mutex<DispatcherState>>,
  listeners: Arc<Mutex<Vec<JoinHandle<()>>>>,
  clock: Clock,
}

impl NotificationDispatcher {
  pub fn new(transport: Option<Arc<dyn PushTransport>>) -> Self {
    let (worker_messages, _) = broadcast::channel(32);
    let (navigation, _) = broadcast::channel(32);
    Self {
      transport,
      queue: None,
      bus: None,
      worker_messages,
      navigation,
      state: Arc::new(Mutex::new(DispatcherState::default())),
      listeners: Arc::new(Mutex::new(Vec::new())),
      clock: Arc::new(|| Local::now().naive_local()),
    }
  }

  /// Background sync status is read from this queue.
  pub fn with_sync_queue(mut self, queue: SyncQueue) -> Self {
    self.queue = Some(queue);
    self
  }

  /// Listen for cross-context sync messages on this bus.
  pub fn with_bus(mut self, bus: Arc<dyn Broadcast>) -> Self {
    self.bus = Some(bus);
    self
  }

  /// Override the local wall clock used for quiet hours and the daily cap.
  pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
    self.clock = Arc::new(clock);
    self
  }

  /// Sender the worker posts page-bound messages to.
  pub fn worker_channel(&self) -> broadcast::Sender<WorkerMessage> {
    self.worker_messages.clone()
  }

  /// Navigation targets produced by notification clicks.
  pub fn navigations(&self) -> broadcast::Receiver<String> {
    self.navigation.subscribe()
  }

  pub fn preferences(&self) -> NotificationPreferences {
    self.lock_state().map(|s| s.preferences.clone()).unwrap_or_default()
  }

  pub fn user_id(&self) -> Option<String> {
    self.lock_state().ok().and_then(|s| s.user_id.clone())
  }

  fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, DispatcherState>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Dispatcher state poisoned: {}", e))
  }

  /// Initialize the transport and attach listeners.
  ///
  /// Returns `false` when no transport is configured or it fails to start.
  pub async fn initialize(&self, user_id: Option<&str>) -> bool {
    let Some(transport) = &self.transport else {
      warn!("Push notifications unavailable: no transport configured");
      return false;
    };

    if let Err(e) = transport.initialize(user_id).await {
      warn!("Failed to initialize push transport: {}", e);
      return false;
    }

    let Ok(mut state) = self.lock_state() else {
      return false;
    };
    if let Some(user) = user_id {
      state.user_id = Some(user.to_string());
    }
    if !state.listening {
      state.listening = true;
      drop(state);
      self.attach_listeners();
    }

    info!(user = ?user_id, "Notification dispatcher ready");
    true
  }

  fn attach_listeners(&self) {
    let mut handles = Vec::new();

    let mut clicks = self.worker_messages.subscribe();
    let navigation = self.navigation.clone();
    handles.push(tokio::spawn(async move {
      loop {
        match clicks.recv().await {
          Ok(WorkerMessage::NotificationClick { action, chart_id }) => {
            let target = route_click(&action, chart_id.as_deref());
            debug!(%action, %target, "Notification clicked");
            if navigation.send(target).is_err() {
              debug!(%action, "No navigation listener for notification click");
            }
          }
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    }));

    if let Some(bus) = &self.bus {
      let mut sub = bus.subscribe();
      let state = Arc::clone(&self.state);
      handles.push(tokio::spawn(async move {
        while let Some(message) = sub.recv().await {
          debug!(kind = message.kind(), "Sync message received");
          if let Ok(mut s) = state.lock() {
            s.last_sync_event = Some(message);
          }
        }
      }));
    }

    if let Ok(mut listeners) = self.listeners.lock() {
      listeners.extend(handles);
    }
  }

  /// Stop the click and broadcast listeners.
  pub fn shutdown(&self) {
    if let Ok(mut listeners) = self.listeners.lock() {
      for handle in listeners.drain(..) {
        handle.abort();
      }
    }
    if let Ok(mut state) = self.lock_state() {
      state.listening = false;
    }
  }

  /// Subscribe `user_id` for push delivery.
  ///
  /// Invalid preferences are replaced by defaults merged with their valid
  /// fields. Errors only when the transport exposes no subscription API.
  pub async fn subscribe(
    &self,
    user_id: &str,
    preferences: Option<&Value>,
  ) -> Result<NotificationPreferences> {
    let prefs = NotificationPreferences::from_value(preferences);
    if let Some(value) = preferences {
      if !NotificationPreferences::is_valid(value) {
        debug!("Replaced invalid notification preferences with defaults");
      }
    }

    let transport = self
      .transport
      .as_ref()
      .ok_or_else(|| eyre!("Cannot subscribe: no push transport configured"))?;

    let api = match transport.subscription_api() {
      Some(api) => api,
      None => transport
        .legacy_subscription_api()
        .ok_or_else(|| eyre!("Push transport exposes no subscription API"))?,
    };
    api.subscribe(user_id, &prefs).await?;

    let mut state = self.lock_state()?;
    state.user_id = Some(user_id.to_string());
    state.preferences = prefs.clone();
    info!(user = %user_id, "Subscribed to push notifications");
    Ok(prefs)
  }

  /// Queue a notification, honouring quiet hours and the daily cap.
  pub async fn send(&self, notification: QueuedNotification) -> SendOutcome {
    let Some(transport) = &self.transport else {
      return SendOutcome::Unavailable;
    };

    let now = (self.clock)();
    {
      let Ok(mut state) = self.lock_state() else {
        return SendOutcome::Failed;
      };
      if state.day != Some(now.date()) {
        state.day = Some(now.date());
        state.sent_today = 0;
      }
      if state.preferences.quiet_hours.contains(now.time()) {
        debug!(tag = %notification.tag, "Notification suppressed by quiet hours");
        return SendOutcome::QuietHours;
      }
      if state.sent_today >= state.preferences.max_daily_notifications {
        debug!(tag = %notification.tag, "Daily notification limit reached");
        return SendOutcome::DailyLimit;
      }
    }

    match transport.queue(&notification).await {
      Ok(()) => {
        if let Ok(mut state) = self.lock_state() {
          state.sent_today += 1;
        }
        SendOutcome::Queued
      }
      Err(e) => {
        warn!(tag = %notification.tag, "Failed to queue notification: {}", e);
        SendOutcome::Failed
      }
    }
  }

  /// Tell the user a computed chart is available. No-op without a string `id`.
  pub async fn notify_chart_ready(&self, chart: &Value) -> SendOutcome {
    let Some(id) = chart.get("id").and_then(Value::as_str) else {
      return SendOutcome::Skipped;
    };

    let body = match chart.get("name").and_then(Value::as_str) {
      Some(name) => format!("{} is ready to explore.", name),
      None => "Your new chart is ready to explore.".to_string(),
    };

    self
      .send(QueuedNotification {
        title: "Your chart is ready".to_string(),
        body,
        tag: format!("chart-ready-{}", id),
        urgency: Urgency::Normal,
        data: Some(json!({ "chartId": id, "url": route_click("view", Some(id)) })),
        actions: vec![
          NotificationAction::new("view", "View chart"),
          NotificationAction::new("share", "Share"),
        ],
      })
      .await
  }

  /// Emit a failure notification when a drain left tasks permanently failed.
  pub async fn on_sync_report(&self, report: &DrainReport) -> Option<SendOutcome> {
    if report.failed.is_empty() {
      return None;
    }
    let n = report.failed.len();
    let body = if n == 1 {
      "1 change could not be saved to the server.".to_string()
    } else {
      format!("{} changes could not be saved to the server.", n)
    };

    Some(
      self
        .send(QueuedNotification {
          title: "Sync failed".to_string(),
          body,
          tag: format!("sync-failed-{}", report.tag),
          urgency: Urgency::Low,
          data: Some(json!({ "tag": report.tag, "failed": n })),
          actions: vec![NotificationAction::new("settings", "Settings")],
        })
        .await,
    )
  }

  pub async fn status(&self) -> NotificationStatus {
    let stats = match &self.transport {
      Some(t) => t.stats().await.unwrap_or_else(|e| {
        warn!("Failed to read push stats: {}", e);
        Default::default()
      }),
      None => Default::default(),
    };

    let background_sync = match &self.queue {
      Some(q) => BackgroundSyncStatus {
        pending: q.pending_count().unwrap_or(0),
        failed: q.failed_count().unwrap_or(0),
        errors: q.error_count().unwrap_or(0),
      },
      None => BackgroundSyncStatus::default(),
    };

    let (user_id, sent_today, last_sync_event) = self
      .lock_state()
      .map(|s| (s.user_id.clone(), s.sent_today, s.last_sync_event.clone()))
      .unwrap_or_default();

    NotificationStatus {
      available: self.transport.is_some(),
      user_id,
      total_sent: stats.total_sent.unwrap_or(0),
      total_delivered: stats.total_delivered.unwrap_or(0),
      avg_delivery_time: stats.avg_delivery_time.unwrap_or(0.0),
      sent_today,
      background_sync,
      last_sync_event,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broadcast::ChannelBroadcast;
  use crate::notify::transport::fake::FakeTransport;
  use crate::notify::transport::TransportStats;
  use crate::notify::ClockTime;
  use crate::sync::SyncTask;
  use std::sync::atomic::Ordering;
  use std::time::Duration;

  fn noon() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
      .unwrap()
      .and_hms_opt(12, 0, 0)
      .unwrap()
  }

  fn dispatcher(transport: &Arc<FakeTransport>) -> NotificationDispatcher {
    NotificationDispatcher::new(Some(transport.clone() as Arc<dyn PushTransport>)).with_clock(noon)
  }

  #[test]
  fn test_route_click() {
    assert_eq!(route_click("view", Some("c1")), "/charts/c1");
    assert_eq!(route_click("share", Some("c1")), "/charts/c1/share");
    assert_eq!(route_click("view", None), "/charts");
    assert_eq!(route_click("horoscope", None), "/horoscope");
    assert_eq!(route_click("settings", Some("c1")), "/settings/notifications");
    assert_eq!(route_click("dismiss", Some("c1")), "/dashboard");
  }

  #[tokio::test]
  async fn test_subscribe_with_invalid_prefs_uses_defaults() {
    let transport = Arc::new(FakeTransport::with_primary());
    let d = dispatcher(&transport);

    let prefs = d.subscribe("u1", Some(&json!({"not": "valid"}))).await.unwrap();
    assert_eq!(prefs, NotificationPreferences::default());
    assert_eq!(d.preferences(), NotificationPreferences::default());
    assert_eq!(d.user_id().as_deref(), Some("u1"));

    let calls = transport.primary.as_ref().unwrap().calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, NotificationPreferences::default());
  }

  #[tokio::test]
  async fn test_subscribe_falls_back_to_legacy() {
    let transport = Arc::new(FakeTransport::with_legacy());
    let d = dispatcher(&transport);
    d.subscribe("u1", None).await.unwrap();
    assert_eq!(transport.legacy.as_ref().unwrap().calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_subscribe_without_api_is_error() {
    let transport = Arc::new(FakeTransport::default());
    let d = dispatcher(&transport);
    assert!(d.subscribe("u1", None).await.is_err());

    let none = NotificationDispatcher::new(None);
    assert!(none.subscribe("u1", None).await.is_err());
  }

  #[tokio::test]
  async fn test_initialize_reports_failure() {
    assert!(!NotificationDispatcher::new(None).initialize(Some("u1")).await);

    let transport = Arc::new(FakeTransport::default());
    transport.fail_init.store(true, Ordering::SeqCst);
    assert!(!dispatcher(&transport).initialize(None).await);
  }

  #[tokio::test]
  async fn test_chart_ready_without_id_is_noop() {
    let transport = Arc::new(FakeTransport::default());
    let d = dispatcher(&transport);

    assert_eq!(d.notify_chart_ready(&json!({"name": "Natal"})).await, SendOutcome::Skipped);
    assert_eq!(d.notify_chart_ready(&json!({"id": 7})).await, SendOutcome::Skipped);
    assert!(transport.queued().is_empty());

    assert_eq!(d.notify_chart_ready(&json!({"id": "c1"})).await, SendOutcome::Queued);
    let queued = transport.queued();
    assert_eq!(queued.len(), 1);
    let actions: Vec<_> = queued[0].actions.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(actions, vec!["view", "share"]);
    assert_eq!(queued[0].data.as_ref().unwrap()["chartId"], "c1");
  }

  #[tokio::test]
  async fn test_quiet_hours_and_daily_cap() {
    let transport = Arc::new(FakeTransport::with_primary());
    let d = dispatcher(&transport);
    d.subscribe(
      "u1",
      Some(&json!({
        "quietHours": {"enabled": true, "start": "11:00", "end": "13:00"},
        "maxDailyNotifications": 1
      })),
    )
    .await
    .unwrap();
    assert_eq!(d.notify_chart_ready(&json!({"id": "c1"})).await, SendOutcome::QuietHours);

    let d = d.with_clock(|| noon() + chrono::Duration::hours(3));
    assert_eq!(d.preferences().quiet_hours.end, ClockTime::new(13, 0).unwrap());
    assert_eq!(d.notify_chart_ready(&json!({"id": "c1"})).await, SendOutcome::Queued);
    assert_eq!(d.notify_chart_ready(&json!({"id": "c2"})).await, SendOutcome::DailyLimit);

    let d = d.with_clock(|| noon() + chrono::Duration::days(1) + chrono::Duration::hours(3));
    assert_eq!(d.notify_chart_ready(&json!({"id": "c3"})).await, SendOutcome::Queued);
    assert_eq!(transport.queued().len(), 2);
  }

  #[tokio::test]
  async fn test_status_defaults_missing_stats() {
    let transport = Arc::new(FakeTransport::default());
    *transport.stats.lock().unwrap() = TransportStats {
      total_sent: Some(3),
      ..Default::default()
    };
    let status = dispatcher(&transport).status().await;
    assert!(status.available);
    assert_eq!(status.total_sent, 3);
    assert_eq!(status.total_delivered, 0);
    assert_eq!(status.avg_delivery_time, 0.0);
    assert_eq!(status.background_sync, BackgroundSyncStatus::default());

    let none = NotificationDispatcher::new(None).status().await;
    assert!(!none.available);
    assert_eq!(none.total_sent, 0);
  }

  #[tokio::test]
  async fn test_sync_report_failure_notifies() {
    let transport = Arc::new(FakeTransport::default());
    let d = dispatcher(&transport);

    let mut report = DrainReport {
      tag: "chart-sync".into(),
      ..Default::default()
    };
    assert_eq!(d.on_sync_report(&report).await, None);

    report
      .failed
      .push((SyncTask::new("chart-sync", "https://api.test/charts", "POST"), "HTTP 500".into()));
    assert_eq!(d.on_sync_report(&report).await, Some(SendOutcome::Queued));
    assert_eq!(transport.queued()[0].tag, "sync-failed-chart-sync");
  }

  #[tokio::test]
  async fn test_listeners_route_clicks_and_track_sync() {
    let transport = Arc::new(FakeTransport::default());
    let bus = Arc::new(ChannelBroadcast::new());
    let d = dispatcher(&transport).with_bus(bus.clone());
    let mut nav = d.navigations();

    assert!(d.initialize(Some("u1")).await);
    // Second initialize does not attach a second set of listeners
    assert!(d.initialize(Some("u1")).await);
    assert_eq!(d.listeners.lock().unwrap().len(), 2);

    d.worker_channel()
      .send(WorkerMessage::NotificationClick {
        action: "share".into(),
        chart_id: Some("c4".into()),
      })
      .unwrap();
    let target = tokio::time::timeout(Duration::from_secs(1), nav.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(target, "/charts/c4/share");

    let msg = SyncMessage::ChartsImported { imported: 1 };
    bus.publish(&msg).unwrap();
    for _ in 0..50 {
      if d.status().await.last_sync_event.is_some() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(d.status().await.last_sync_event, Some(msg));
    d.shutdown();
  }
}
