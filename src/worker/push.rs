//! Push payload parsing and local notification display.

use color_eyre::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::notify::NotificationAction;

pub const DEFAULT_TITLE: &str = "skysync";
pub const DEFAULT_TAG: &str = "skysync-push";

/// Fallbacks for push fields that fail validation.
#[derive(Debug, Clone)]
pub struct PushDefaults {
  pub title: String,
  pub icon: String,
  pub badge: String,
}

impl Default for PushDefaults {
  fn default() -> Self {
    Self {
      title: DEFAULT_TITLE.to_string(),
      icon: "/icons/icon-192.png".to_string(),
      badge: "/icons/badge-72.png".to_string(),
    }
  }
}

/// A notification ready to show, every field validated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushNotification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  pub data: Value,
  pub actions: Vec<NotificationAction>,
}

fn non_empty_str<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
  obj
    .get(key)
    .and_then(Value::as_str)
    .filter(|s| !s.trim().is_empty())
}

impl PushNotification {
  /// Parse a raw push payload. Never fails: each field falls back on its own.
  pub fn parse(payload: &[u8], defaults: &PushDefaults) -> Self {
    let value: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
    let empty = serde_json::Map::new();
    let obj = value.as_object().unwrap_or(&empty);

    let actions = obj
      .get("actions")
      .and_then(Value::as_array)
      .map(|items| {
        items
          .iter()
          .filter_map(|a| {
            let a = a.as_object()?;
            Some(NotificationAction::new(
              non_empty_str(a, "action")?,
              non_empty_str(a, "title")?,
            ))
          })
          .collect()
      })
      .unwrap_or_default();

    Self {
      title: non_empty_str(obj, "title").unwrap_or(&defaults.title).to_string(),
      body: obj.get("body").and_then(Value::as_str).unwrap_or("").to_string(),
      icon: non_empty_str(obj, "icon").unwrap_or(&defaults.icon).to_string(),
      badge: non_empty_str(obj, "badge").unwrap_or(&defaults.badge).to_string(),
      tag: non_empty_str(obj, "tag").unwrap_or(DEFAULT_TAG).to_string(),
      data: obj.get("data").cloned().unwrap_or(Value::Null),
      actions,
    }
  }

  /// Chart referenced by the payload data, if any.
  pub fn chart_id(&self) -> Option<&str> {
    self.data.get("chartId").and_then(Value::as_str)
  }
}

/// Surface that displays notifications to the local user.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &PushNotification) -> Result<()>;
}

/// Notifier that writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn show(&self, notification: &PushNotification) -> Result<()> {
    info!(
      title = %notification.title,
      tag = %notification.tag,
      "Notification: {}",
      notification.body
    );
    Ok(())
  }
}
