//! Sync task and background sync registration types.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::backoff::Backoff;

/// Lifecycle of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
  Pending,
  InFlight,
  Succeeded,
  Failed,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InFlight => "in-flight",
      Self::Succeeded => "succeeded",
      Self::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "in-flight" => Ok(Self::InFlight),
      "succeeded" => Ok(Self::Succeeded),
      "failed" => Ok(Self::Failed),
      other => Err(eyre!("Unknown task status: {}", other)),
    }
  }
}

/// A pending mutation waiting to reach the server.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTask {
  pub id: String,
  pub tag: String,
  pub url: String,
  pub method: String,
  pub payload: Option<serde_json::Value>,
  /// Local entity the task writes, if any
  pub entity_id: Option<String>,
  pub retry_count: u32,
  pub max_retries: u32,
  pub retry_delay: Duration,
  pub status: TaskStatus,
  pub last_error: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl SyncTask {
  pub fn new(tag: impl Into<String>, url: impl Into<String>, method: impl Into<String>) -> Self {
    let now = Utc::now();
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      tag: tag.into(),
      url: url.into(),
      method: method.into(),
      payload: None,
      entity_id: None,
      retry_count: 0,
      max_retries: 3,
      retry_delay: Duration::from_secs(5),
      status: TaskStatus::Pending,
      last_error: None,
      created_at: now,
      updated_at: now,
    }
  }

  /// Task shaped by a background sync registration.
  pub fn from_registration(reg: &SyncRegistration) -> Self {
    Self::new(&reg.name, &reg.url, &reg.method).with_retry(reg.max_retries, reg.retry_delay())
  }

  pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
    self.payload = Some(payload);
    self
  }

  pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
    self.entity_id = Some(entity_id.into());
    self
  }

  pub fn with_retry(mut self, max_retries: u32, delay: Duration) -> Self {
    self.max_retries = max_retries;
    self.retry_delay = delay;
    self
  }
}

/// Attempt bound when a registration sets none.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn default_method() -> String {
  "POST".to_string()
}

fn default_max_retries() -> u32 {
  3
}

fn default_retry_delay() -> f64 {
  5.0
}

/// Background sync registration: what a tag means when the host signals sync.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRegistration {
  /// Sync tag
  pub name: String,
  pub url: String,
  #[serde(default = "default_method")]
  pub method: String,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Base retry delay in seconds
  #[serde(default = "default_retry_delay")]
  pub retry_delay: f64,
  #[serde(default)]
  pub backoff: Backoff,
  /// Bound on a single attempt, in seconds
  #[serde(default)]
  pub request_timeout_seconds: Option<f64>,
}

impl SyncRegistration {
  pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      url: url.into(),
      method: default_method(),
      max_retries: default_max_retries(),
      retry_delay: default_retry_delay(),
      backoff: Backoff::default(),
      request_timeout_seconds: None,
    }
  }

  pub fn with_retries(mut self, max_retries: u32, retry_delay: f64) -> Self {
    self.max_retries = max_retries;
    self.retry_delay = retry_delay;
    self
  }

  pub fn with_backoff(mut self, backoff: Backoff) -> Self {
    self.backoff = backoff;
    self
  }

  /// Base delay. Values a `Duration` cannot hold fall back to the default.
  pub fn retry_delay(&self) -> Duration {
    Duration::try_from_secs_f64(self.retry_delay.max(0.0))
      .unwrap_or_else(|_| Duration::from_secs_f64(default_retry_delay()))
  }

  pub fn request_timeout(&self) -> Duration {
    self
      .request_timeout_seconds
      .filter(|s| *s > 0.0)
      .and_then(|s| Duration::try_from_secs_f64(s).ok())
      .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_round_trip() {
    for status in [
      TaskStatus::Pending,
      TaskStatus::InFlight,
      TaskStatus::Succeeded,
      TaskStatus::Failed,
    ] {
      assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
    }
    assert!(TaskStatus::parse("done").is_err());
  }

  #[test]
  fn test_registration_defaults() {
    let reg: SyncRegistration =
      serde_yaml::from_str("{ name: chart-sync, url: 'https://api.test/charts' }").unwrap();
    assert_eq!(reg.method, "POST");
    assert_eq!(reg.max_retries, 3);
    assert_eq!(reg.retry_delay(), Duration::from_secs(5));
    assert_eq!(reg.backoff, Backoff::default());

    let task = SyncTask::from_registration(&reg);
    assert_eq!(task.tag, "chart-sync");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.max_retries, 3);
  }

  #[test]
  fn test_unrepresentable_durations_fall_back() {
    let mut reg = SyncRegistration::new("chart-sync", "https://api.test/charts");
    reg.retry_delay = f64::INFINITY;
    reg.request_timeout_seconds = Some(1e300);
    assert_eq!(reg.retry_delay(), Duration::from_secs(5));
    assert_eq!(reg.request_timeout(), DEFAULT_REQUEST_TIMEOUT);

    let task = SyncTask::from_registration(&reg);
    assert_eq!(task.retry_delay, Duration::from_secs(5));

    reg.retry_delay = -2.0;
    reg.request_timeout_seconds = Some(f64::NAN);
    assert_eq!(reg.retry_delay(), Duration::ZERO);
    assert_eq!(reg.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
  }
}
