//! Cache strategy configuration and URL matching.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bound on a single network attempt.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

/// How a cached response is served versus refreshed from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
  /// Serve from cache; refresh stale entries in the background
  CacheFirst,
  /// Try the network within a timeout; fall back to cache
  NetworkFirst,
  /// Serve from cache and always refresh in the background
  StaleWhileRevalidate,
  /// Never use the cache
  NetworkOnly,
  /// Never use the network
  CacheOnly,
}

/// URL pattern: a regular expression or a plain substring.
///
/// In YAML a bare string is a substring, `{ regex: "..." }` is a regex.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawPattern")]
pub enum UrlPattern {
  Regex(Regex),
  Contains(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPattern {
  Regex { regex: String },
  Contains(String),
}

impl TryFrom<RawPattern> for UrlPattern {
  type Error = regex::Error;

  fn try_from(raw: RawPattern) -> Result<Self, Self::Error> {
    match raw {
      RawPattern::Regex { regex } => Ok(Self::Regex(Regex::new(&regex)?)),
      RawPattern::Contains(s) => Ok(Self::Contains(s)),
    }
  }
}

impl UrlPattern {
  pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
    Ok(Self::Regex(Regex::new(pattern)?))
  }

  pub fn contains(needle: impl Into<String>) -> Self {
    Self::Contains(needle.into())
  }

  pub fn matches(&self, url: &str) -> bool {
    match self {
      Self::Regex(re) => re.is_match(url),
      Self::Contains(needle) => url.contains(needle.as_str()),
    }
  }
}

/// A registered strategy. Immutable after registration; one per named cache.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheStrategyConfig {
  pub name: String,
  pub pattern: UrlPattern,
  pub strategy: CacheStrategy,
  /// Seconds before an entry is considered stale
  #[serde(default)]
  pub max_age: Option<u64>,
  /// Upper bound on entries; oldest-inserted are evicted first
  #[serde(default)]
  pub max_entries: Option<usize>,
  #[serde(default)]
  pub network_timeout_seconds: Option<f64>,
  pub cache_name: String,
}

impl CacheStrategyConfig {
  pub fn new(
    name: impl Into<String>,
    pattern: UrlPattern,
    strategy: CacheStrategy,
    cache_name: impl Into<String>,
  ) -> Self {
    Self {
      name: name.into(),
      pattern,
      strategy,
      max_age: None,
      max_entries: None,
      network_timeout_seconds: None,
      cache_name: cache_name.into(),
    }
  }

  pub fn with_max_age(mut self, seconds: u64) -> Self {
    self.max_age = Some(seconds);
    self
  }

  pub fn with_max_entries(mut self, max: usize) -> Self {
    self.max_entries = Some(max);
    self
  }

  pub fn with_network_timeout(mut self, seconds: f64) -> Self {
    self.network_timeout_seconds = Some(seconds);
    self
  }

  /// Bound on a network attempt made by this strategy.
  pub fn timeout(&self) -> Duration {
    self
      .network_timeout_seconds
      .filter(|s| *s > 0.0)
      .and_then(|s| Duration::try_from_secs_f64(s).ok())
      .unwrap_or(DEFAULT_NETWORK_TIMEOUT)
  }

  pub fn matches(&self, url: &str) -> bool {
    self.pattern.matches(url)
  }
}
