//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::net::Response;

/// A stored request -> response pair.
///
/// Entries are immutable once written: a refresh writes a new entry that
/// replaces the old one in a single statement.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  /// Hash of method + URL (see [`crate::net::Request::cache_key`])
  pub key: String,
  /// Name of the cache that owns this entry
  pub cache_name: String,
  /// Original request URL, kept for diagnostics and pre-warm checks
  pub url: String,
  pub response: Response,
  /// When the entry was written
  pub stored_at: DateTime<Utc>,
  /// Date-equivalent used for staleness; `None` means always stale
  pub timestamp: Option<DateTime<Utc>>,
  /// Max age (seconds) of the strategy that wrote the entry
  pub max_age: Option<u64>,
}

impl CacheEntry {
  /// Check staleness against a max age in seconds.
  ///
  /// Without a max age an entry never goes stale; without a timestamp it is
  /// always stale.
  pub fn is_stale(&self, max_age: Option<u64>, now: DateTime<Utc>) -> bool {
    let Some(max_age) = max_age else {
      return false;
    };
    match self.timestamp {
      Some(ts) => (now - ts).num_seconds() > max_age as i64,
      None => true,
    }
  }

  /// Approximate storage footprint of the entry.
  pub fn size_bytes(&self) -> usize {
    self.response.body.len()
      + self
        .response
        .headers
        .iter()
        .map(|(k, v)| k.len() + v.len())
        .sum::<usize>()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, stale; a background refresh was started
  CacheStale,
  /// Network failed or timed out, serving cached data
  Offline,
}

/// Hit/miss counters for one named cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub entries: usize,
}
