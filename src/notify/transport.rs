//! Push transport seam and its HTTP implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::preferences::NotificationPreferences;
use crate::net::{Method, Network, Request};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Urgency {
  VeryLow,
  Low,
  #[default]
  Normal,
  High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

impl NotificationAction {
  pub fn new(action: &str, title: &str) -> Self {
    Self {
      action: action.to_string(),
      title: title.to_string(),
    }
  }
}

/// A notification handed to the transport for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedNotification {
  pub title: String,
  pub body: String,
  pub tag: String,
  #[serde(default)]
  pub urgency: Urgency,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub actions: Vec<NotificationAction>,
}

/// Delivery statistics as reported by a transport; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
  pub total_sent: Option<u64>,
  pub total_delivered: Option<u64>,
  pub avg_delivery_time: Option<f64>,
}

/// One way of registering a user for push delivery.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
  async fn subscribe(&self, user_id: &str, preferences: &NotificationPreferences) -> Result<()>;
}

/// Backend that delivers push notifications.
#[async_trait]
pub trait PushTransport: Send + Sync {
  async fn initialize(&self, user_id: Option<&str>) -> Result<()>;

  /// Current subscription API, if this transport exposes one.
  fn subscription_api(&self) -> Option<&dyn SubscriptionApi> {
    None
  }

  /// Older subscription API kept for transports that predate the current one.
  fn legacy_subscription_api(&self) -> Option<&dyn SubscriptionApi> {
    None
  }

  async fn queue(&self, notification: &QueuedNotification) -> Result<()>;

  async fn stats(&self) -> Result<TransportStats>;
}

/// Subscription endpoint: POSTs `{userId, preferences}` to a fixed URL.
pub struct EndpointSubscription {
  network: Arc<dyn Network>,
  url: Url,
}

#[async_trait]
impl SubscriptionApi for EndpointSubscription {
  async fn subscribe(&self, user_id: &str, preferences: &NotificationPreferences) -> Result<()> {
    let body = json!({ "userId": user_id, "preferences": preferences });
    let request = Request::new(Method::POST, self.url.as_str())?.with_json(&body)?;
    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(eyre!("Subscription rejected: HTTP {}", response.status));
    }
    Ok(())
  }
}

/// Endpoint paths used by [`HttpPushTransport`], relative to the server base URL.
#[derive(Debug, Clone)]
pub struct PushEndpoints {
  pub init: String,
  pub subscribe: Option<String>,
  pub legacy_subscribe: Option<String>,
  pub queue: String,
  pub stats: String,
}

/// Push transport backed by the application server.
pub struct HttpPushTransport {
  network: Arc<dyn Network>,
  base: Url,
  init_path: String,
  queue_path: String,
  stats_path: String,
  subscribe: Option<EndpointSubscription>,
  legacy_subscribe: Option<EndpointSubscription>,
}

impl HttpPushTransport {
  pub fn new(network: Arc<dyn Network>, base_url: &str, endpoints: PushEndpoints) -> Result<Self> {
    let base = Url::parse(base_url).map_err(|e| eyre!("Invalid server URL {}: {}", base_url, e))?;
    let endpoint = |path: &Option<String>| -> Result<Option<EndpointSubscription>> {
      path
        .as_deref()
        .map(|p| {
          Ok(EndpointSubscription {
            network: Arc::clone(&network),
            url: join(&base, p)?,
          })
        })
        .transpose()
    };

    Ok(Self {
      subscribe: endpoint(&endpoints.subscribe)?,
      legacy_subscribe: endpoint(&endpoints.legacy_subscribe)?,
      network: Arc::clone(&network),
      base: base.clone(),
      init_path: endpoints.init,
      queue_path: endpoints.queue,
      stats_path: endpoints.stats,
    })
  }

  fn url(&self, path: &str) -> Result<Url> {
    join(&self.base, path)
  }
}

fn join(base: &Url, path: &str) -> Result<Url> {
  base
    .join(path)
    .map_err(|e| eyre!("Invalid endpoint path {}: {}", path, e))
}

#[async_trait]
impl PushTransport for HttpPushTransport {
  async fn initialize(&self, user_id: Option<&str>) -> Result<()> {
    let mut url = self.url(&self.init_path)?;
    if let Some(user) = user_id {
      url.query_pairs_mut().append_pair("userId", user);
    }
    let response = self.network.fetch(&Request::get(url.as_str())?).await?;
    if !response.is_success() {
      return Err(eyre!("Push service unavailable: HTTP {}", response.status));
    }
    debug!("Push transport initialized");
    Ok(())
  }

  fn subscription_api(&self) -> Option<&dyn SubscriptionApi> {
    self.subscribe.as_ref().map(|s| s as &dyn SubscriptionApi)
  }

  fn legacy_subscription_api(&self) -> Option<&dyn SubscriptionApi> {
    self
      .legacy_subscribe
      .as_ref()
      .map(|s| s as &dyn SubscriptionApi)
  }

  async fn queue(&self, notification: &QueuedNotification) -> Result<()> {
    let url = self.url(&self.queue_path)?;
    let request = Request::new(Method::POST, url.as_str())?.with_json(notification)?;
    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(eyre!("Failed to queue notification: HTTP {}", response.status));
    }
    Ok(())
  }

  async fn stats(&self) -> Result<TransportStats> {
    let url = self.url(&self.stats_path)?;
    let response = self.network.fetch(&Request::get(url.as_str())?).await?;
    if !response.is_success() {
      return Err(eyre!("Failed to read push stats: HTTP {}", response.status));
    }
    response.json()
  }
}

#[cfg(test)]
pub mod fake {
  use super::*;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;

  #[derive(Default)]
  pub struct RecordingApi {
    pub calls: Mutex<Vec<(String, NotificationPreferences)>>,
  }

  #[async_trait]
  impl SubscriptionApi for RecordingApi {
    async fn subscribe(&self, user_id: &str, preferences: &NotificationPreferences) -> Result<()> {
      self
        .calls
        .lock()
        .unwrap()
        .push((user_id.to_string(), preferences.clone()));
      Ok(())
    }
  }

  /// In-memory transport recording every call.
  #[derive(Default)]
  pub struct FakeTransport {
    pub primary: Option<RecordingApi>,
    pub legacy: Option<RecordingApi>,
    pub fail_init: AtomicBool,
    pub init_calls: AtomicUsize,
    pub queued: Mutex<Vec<QueuedNotification>>,
    pub stats: Mutex<TransportStats>,
  }

  impl FakeTransport {
    pub fn with_primary() -> Self {
      Self {
        primary: Some(RecordingApi::default()),
        ..Self::default()
      }
    }

    pub fn with_legacy() -> Self {
      Self {
        legacy: Some(RecordingApi::default()),
        ..Self::default()
      }
    }

    pub fn queued(&self) -> Vec<QueuedNotification> {
      self.queued.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl PushTransport for FakeTransport {
    async fn initialize(&self, _user_id: Option<&str>) -> Result<()> {
      self.init_calls.fetch_add(1, Ordering::SeqCst);
      if self.fail_init.load(Ordering::SeqCst) {
        return Err(eyre!("push service down"));
      }
      Ok(())
    }

    fn subscription_api(&self) -> Option<&dyn SubscriptionApi> {
      self.primary.as_ref().map(|s| s as &dyn SubscriptionApi)
    }

    fn legacy_subscription_api(&self) -> Option<&dyn SubscriptionApi> {
      self.legacy.as_ref().map(|s| s as &dyn SubscriptionApi)
    }

    async fn queue(&self, notification: &QueuedNotification) -> Result<()> {
      self.queued.lock().unwrap().push(notification.clone());
      Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
      Ok(self.stats.lock().unwrap().clone())
    }
  }
}
