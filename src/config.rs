use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheStrategyConfig;
use crate::notify::PushEndpoints;
use crate::sync::{Backoff, SyncRegistration};
use crate::worker::{PushDefaults, WorkerConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub background_sync: Vec<SyncRegistration>,
  #[serde(default)]
  pub notifications: NotificationsConfig,
  #[serde(default)]
  pub polling: PollingConfig,
  /// Where the database and logs live (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
}

fn default_charts_path() -> String {
  "/api/charts".to_string()
}

fn default_health_path() -> String {
  "/api/health".to_string()
}

fn default_sync_tag() -> String {
  "chart-sync".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub base_url: String,
  /// Origin whose GET requests go through the cache (defaults to base_url)
  pub origin: Option<String>,
  #[serde(default = "default_charts_path")]
  pub charts_path: String,
  #[serde(default = "default_health_path")]
  pub health_path: String,
  /// Background sync tag used for chart writes
  #[serde(default = "default_sync_tag")]
  pub chart_sync_tag: String,
}

fn default_offline_cache() -> String {
  "offline-v1".to_string()
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Disable to serve everything from the network
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default)]
  pub strategies: Vec<CacheStrategyConfig>,
  /// Critical resources fetched during initialization
  #[serde(default)]
  pub precache: Vec<String>,
  #[serde(default = "default_offline_cache")]
  pub offline_cache: String,
  #[serde(default)]
  pub offline_pages: Vec<String>,
  pub offline_fallback: Option<String>,
  /// Total bytes of cached bodies allowed on disk
  pub quota_bytes: Option<u64>,
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      strategies: Vec::new(),
      precache: Vec::new(),
      offline_cache: default_offline_cache(),
      offline_pages: Vec::new(),
      offline_fallback: None,
      quota_bytes: None,
      skip_waiting: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
  pub enabled: bool,
  pub init_path: String,
  pub subscribe_path: Option<String>,
  pub legacy_subscribe_path: Option<String>,
  pub queue_path: String,
  pub stats_path: String,
  pub default_title: String,
  pub default_icon: String,
  pub default_badge: String,
  /// Preferences applied on subscribe when none are given
  pub preferences: Option<serde_json::Value>,
}

impl Default for NotificationsConfig {
  fn default() -> Self {
    let push = PushDefaults::default();
    Self {
      enabled: true,
      init_path: "/api/notifications/init".to_string(),
      subscribe_path: Some("/api/notifications/subscribe".to_string()),
      legacy_subscribe_path: None,
      queue_path: "/api/notifications/queue".to_string(),
      stats_path: "/api/notifications/stats".to_string(),
      default_title: push.title,
      default_icon: push.icon,
      default_badge: push.badge,
      preferences: None,
    }
  }
}

impl NotificationsConfig {
  pub fn endpoints(&self) -> PushEndpoints {
    PushEndpoints {
      init: self.init_path.clone(),
      subscribe: self.subscribe_path.clone(),
      legacy_subscribe: self.legacy_subscribe_path.clone(),
      queue: self.queue_path.clone(),
      stats: self.stats_path.clone(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
  pub network_interval_seconds: u64,
  pub sync_interval_seconds: u64,
}

impl Default for PollingConfig {
  fn default() -> Self {
    Self {
      network_interval_seconds: 30,
      sync_interval_seconds: 10,
    }
  }
}

impl PollingConfig {
  pub fn network_interval(&self) -> Duration {
    Duration::from_secs(self.network_interval_seconds.max(1))
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync_interval_seconds.max(1))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./skysync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/skysync/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/skysync/config.yaml\n\
                 See skysync.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("skysync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("skysync").join("config.yaml");
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

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.base_url()?;
    self.origin()?;

    let mut names = BTreeSet::new();
    for reg in &self.background_sync {
      if !names.insert(reg.name.as_str()) {
        return Err(eyre!("Background sync tag {} is registered twice", reg.name));
      }
    }
    if !names.contains(self.server.chart_sync_tag.as_str()) {
      return Err(eyre!(
        "Chart sync tag {} has no background_sync registration",
        self.server.chart_sync_tag
      ));
    }

    for reg in &self.background_sync {
      check_seconds(&format!("{}.retry_delay", reg.name), Some(reg.retry_delay))?;
      check_seconds(&format!("{}.request_timeout_seconds", reg.name), reg.request_timeout_seconds)?;
      if let Backoff::Exponential { max_delay_seconds, .. } = reg.backoff {
        check_seconds(&format!("{}.backoff.max_delay_seconds", reg.name), Some(max_delay_seconds))?;
      }
    }
    for strategy in &self.cache.strategies {
      check_seconds(
        &format!("{}.network_timeout_seconds", strategy.name),
        strategy.network_timeout_seconds,
      )?;
    }
    Ok(())
  }

  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.server.base_url)
      .map_err(|e| eyre!("Invalid server.base_url {}: {}", self.server.base_url, e))
  }

  pub fn origin(&self) -> Result<Url> {
    match &self.server.origin {
      Some(origin) => {
        Url::parse(origin).map_err(|e| eyre!("Invalid server.origin {}: {}", origin, e))
      }
      None => self.base_url(),
    }
  }

  /// Absolute URL for a path on the server.
  pub fn endpoint(&self, path: &str) -> Result<String> {
    let url = self
      .base_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint path {}: {}", path, e))?;
    Ok(url.to_string())
  }

  pub fn data_dir(&self) -> PathBuf {
    self
      .data_dir
      .clone()
      .or_else(|| dirs::data_dir().map(|d| d.join("skysync")))
      .unwrap_or_else(|| PathBuf::from(".skysync"))
  }

  pub fn worker_config(&self) -> Result<WorkerConfig> {
    let mut worker = WorkerConfig::new(self.origin()?);
    worker.offline_cache = self.cache.offline_cache.clone();
    worker.offline_pages = self
      .cache
      .offline_pages
      .iter()
      .map(|p| self.endpoint(p))
      .collect::<Result<_>>()?;
    worker.offline_fallback = self
      .cache
      .offline_fallback
      .as_deref()
      .map(|p| self.endpoint(p))
      .transpose()?;
    worker.skip_waiting = self.cache.skip_waiting;
    worker.push = PushDefaults {
      title: self.notifications.default_title.clone(),
      icon: self.notifications.default_icon.clone(),
      badge: self.notifications.default_badge.clone(),
    };
    Ok(worker)
  }

  /// Get the API token from the environment (SKYSYNC_TOKEN), if set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("SKYSYNC_TOKEN").ok().filter(|t| !t.is_empty())
  }
}

/// Longest accepted delay or timeout
const MAX_SECONDS: f64 = 7.0 * 24.0 * 3600.0;

fn check_seconds(field: &str, value: Option<f64>) -> Result<()> {
  match value {
    Some(v) if !(0.0..=MAX_SECONDS).contains(&v) => Err(eyre!(
      "{} must be between 0 and {} seconds, got {}",
      field,
      MAX_SECONDS,
      v
    )),
    _ => Ok(()),
  }
}
