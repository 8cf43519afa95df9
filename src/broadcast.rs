//! Local broadcast bus for propagating sync state between contexts.
//!
//! Two transports implement [`Broadcast`]: an in-process channel and a
//! storage-event emulation that writes every message under a reserved key
//! prefix of the shared key/value table. Listeners only ever see parsed
//! [`SyncMessage`] values; foreign keys and malformed values are dropped.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::db::Database;

/// Reserved key namespace for cross-context messages.
pub const CHANNEL_PREFIX: &str = "skysync:";

const CHANNEL_CAPACITY: usize = 64;

/// Sync state change shared with every open context, encoded as `{type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SyncMessage {
  #[serde(rename_all = "camelCase")]
  SyncComplete {
    task_id: String,
    tag: String,
    entity_id: Option<String>,
    server_id: Option<String>,
  },
  #[serde(rename_all = "camelCase")]
  SyncFailed {
    task_id: String,
    tag: String,
    entity_id: Option<String>,
    error: String,
  },
  #[serde(rename_all = "camelCase")]
  ChartSaved { chart_id: String, offline: bool },
  #[serde(rename_all = "camelCase")]
  ChartsImported { imported: usize },
}

impl SyncMessage {
  pub fn kind(&self) -> &'static str {
    match self {
      Self::SyncComplete { .. } => "sync-complete",
      Self::SyncFailed { .. } => "sync-failed",
      Self::ChartSaved { .. } => "chart-saved",
      Self::ChartsImported { .. } => "charts-imported",
    }
  }
}

/// Message posted by the worker to page contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
  #[serde(rename_all = "camelCase")]
  NotificationClick {
    action: String,
    chart_id: Option<String>,
  },
}

/// A change to the shared key/value area.
#[derive(Debug, Clone)]
pub struct StorageEvent {
  pub key: String,
  pub new_value: Option<String>,
}

/// Decode a storage event into a sync message if it belongs to the channel.
pub fn parse_storage_event(event: &StorageEvent) -> Option<SyncMessage> {
  if !event.key.starts_with(CHANNEL_PREFIX) {
    return None;
  }
  let value = event.new_value.as_deref()?;
  match serde_json::from_str(value) {
    Ok(message) => Some(message),
    Err(e) => {
      debug!(key = %event.key, "Ignoring unrecognized channel value: {}", e);
      None
    }
  }
}

/// Generic local broadcast interface.
pub trait Broadcast: Send + Sync {
  /// Deliver `message` to every current subscriber. Best effort.
  fn publish(&self, message: &SyncMessage) -> Result<()>;

  fn subscribe(&self) -> Subscription;
}

/// Receiving half of a broadcast transport.
pub enum Subscription {
  Channel(broadcast::Receiver<SyncMessage>),
  Storage(broadcast::Receiver<StorageEvent>),
}

impl Subscription {
  /// Next recognized message, or `None` once the transport is gone.
  pub async fn recv(&mut self) -> Option<SyncMessage> {
    loop {
      match self {
        Self::Channel(rx) => match rx.recv().await {
          Ok(message) => return Some(message),
          Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!(skipped = n, "Broadcast subscriber lagged");
          }
          Err(broadcast::error::RecvError::Closed) => return None,
        },
        Self::Storage(rx) => match rx.recv().await {
          Ok(event) => {
            if let Some(message) = parse_storage_event(&event) {
              return Some(message);
            }
          }
          Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!(skipped = n, "Storage event subscriber lagged");
          }
          Err(broadcast::error::RecvError::Closed) => return None,
        },
      }
    }
  }
}

/// In-process broadcast channel.
#[derive(Clone)]
pub struct ChannelBroadcast {
  tx: broadcast::Sender<SyncMessage>,
}

impl ChannelBroadcast {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
    Self { tx }
  }
}

impl Default for ChannelBroadcast {
  fn default() -> Self {
    Self::new()
  }
}

impl Broadcast for ChannelBroadcast {
  fn publish(&self, message: &SyncMessage) -> Result<()> {
    // No subscribers is not an error
    let _ = self.tx.send(message.clone());
    Ok(())
  }

  fn subscribe(&self) -> Subscription {
    Subscription::Channel(self.tx.subscribe())
  }
}

/// Storage-event emulation: messages are written to the shared key/value
/// table under [`CHANNEL_PREFIX`] and announced as [`StorageEvent`]s.
#[derive(Clone)]
pub struct StorageBroadcast {
  db: Arc<Database>,
  events: broadcast::Sender<StorageEvent>,
}

impl StorageBroadcast {
  pub fn new(db: Arc<Database>) -> Self {
    let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
    Self { db, events }
  }

  /// Write an arbitrary key and notify listeners, like a storage `setItem`.
  pub fn set_item(&self, key: &str, value: &str) -> Result<()> {
    self.db.set_meta(key, value)?;
    let _ = self.events.send(StorageEvent {
      key: key.to_string(),
      new_value: Some(value.to_string()),
    });
    Ok(())
  }

  /// Last message written for a message kind, if any.
  pub fn last(&self, kind: &str) -> Result<Option<SyncMessage>> {
    let key = format!("{}{}", CHANNEL_PREFIX, kind);
    Ok(
      self
        .db
        .get_meta(&key)?
        .and_then(|v| serde_json::from_str(&v).ok()),
    )
  }
}

impl Broadcast for StorageBroadcast {
  fn publish(&self, message: &SyncMessage) -> Result<()> {
    let key = format!("{}{}", CHANNEL_PREFIX, message.kind());
    let value = serde_json::to_string(message)
      .map_err(|e| eyre!("Failed to encode channel message: {}", e))?;
    self.set_item(&key, &value)
  }

  fn subscribe(&self) -> Subscription {
    Subscription::Storage(self.events.subscribe())
  }
}
