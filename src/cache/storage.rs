//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::traits::CacheEntry;
use crate::db::Database;
use crate::net::Response;

/// Trait for cache storage backends.
pub trait CacheStore: Send + Sync {
  /// Open (create if missing) a named cache.
  fn open(&self, cache_name: &str) -> Result<()>;

  /// Names of all caches currently present.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a named cache and all its entries. Returns whether it existed.
  fn delete_cache(&self, cache_name: &str) -> Result<bool>;

  /// Look up a single entry.
  fn get(&self, cache_name: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// Insert or replace an entry. A replaced entry counts as newly inserted.
  fn put(&self, entry: &CacheEntry) -> Result<()>;

  /// Entry keys in insertion order, oldest first.
  fn keys(&self, cache_name: &str) -> Result<Vec<String>>;

  /// Delete oldest-inserted entries until at most `max_entries` remain.
  /// Returns the number of evicted entries.
  fn evict_to(&self, cache_name: &str, max_entries: usize) -> Result<usize>;

  /// Remove all entries of a cache but keep the cache itself.
  fn clear(&self, cache_name: &str) -> Result<()>;

  /// Bytes used by stored response bodies across all caches.
  fn total_bytes(&self) -> Result<u64>;

  /// Number of entries in a cache.
  fn entry_count(&self, cache_name: &str) -> Result<usize> {
    Ok(self.keys(cache_name)?.len())
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl CacheStore for NoopStore {
  fn open(&self, _cache_name: &str) -> Result<()> {
    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_cache(&self, _cache_name: &str) -> Result<bool> {
    Ok(false)
  }

  fn get(&self, _cache_name: &str, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn keys(&self, _cache_name: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn evict_to(&self, _cache_name: &str, _max_entries: usize) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self, _cache_name: &str) -> Result<()> {
    Ok(())
  }

  fn total_bytes(&self) -> Result<u64> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStore {
  db: Arc<Database>,
  /// Optional upper bound on stored body bytes
  quota_bytes: Option<u64>,
}

impl SqliteStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self {
      db,
      quota_bytes: None,
    }
  }

  /// Reject writes that would push stored bodies past `bytes`.
  pub fn with_quota(mut self, bytes: u64) -> Self {
    self.quota_bytes = Some(bytes);
    self
  }
}

impl CacheStore for SqliteStore {
  fn open(&self, cache_name: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_names (cache_name) VALUES (?)",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", cache_name, e))?;
    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT cache_name FROM cache_names ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_cache(&self, cache_name: &str) -> Result<bool> {
    let conn = self.db.conn()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let deleted = conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![cache_name],
      )
      .and_then(|_| {
        conn.execute(
          "DELETE FROM cache_names WHERE cache_name = ?",
          params![cache_name],
        )
      });

    match deleted {
      Ok(n) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(n > 0)
      }
      Err(e) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(eyre!("Failed to delete cache {}: {}", cache_name, e))
      }
    }
  }

  fn get(&self, cache_name: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT url, status, headers, body, stored_at, timestamp, max_age FROM cache_entries
         WHERE cache_name = ? AND cache_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    type Row = (String, u16, String, Vec<u8>, String, Option<String>, Option<i64>);
    let row: Option<Row> = stmt
      .query_row(params![cache_name, key], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let Some((url, status, headers, body, stored_at, timestamp, max_age)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

    Ok(Some(CacheEntry {
      key: key.to_string(),
      cache_name: cache_name.to_string(),
      url,
      response: Response {
        status,
        headers,
        body,
      },
      stored_at: parse_datetime(&stored_at)?,
      timestamp: timestamp.as_deref().map(parse_datetime).transpose()?,
      max_age: max_age.map(|m| m.max(0) as u64),
    }))
  }

  fn put(&self, entry: &CacheEntry) -> Result<()> {
    if let Some(quota) = self.quota_bytes {
      let used = self.total_bytes()?;
      let replaced = self
        .get(&entry.cache_name, &entry.key)?
        .map(|e| e.response.body.len() as u64)
        .unwrap_or(0);
      let needed = used.saturating_sub(replaced) + entry.response.body.len() as u64;
      if needed > quota {
        return Err(eyre!(
          "Cache quota exceeded: {} bytes needed, {} allowed",
          needed,
          quota
        ));
      }
    }

    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_names (cache_name) VALUES (?)",
        params![entry.cache_name],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", entry.cache_name, e))?;

    // REPLACE deletes the old row, so the refreshed entry gets a new seq
    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (cache_name, cache_key, url, status, headers, body, stored_at, timestamp, max_age)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          entry.cache_name,
          entry.key,
          entry.url,
          entry.response.status,
          headers,
          entry.response.body,
          format_datetime(entry.stored_at),
          entry.timestamp.map(format_datetime),
          entry.max_age.map(|m| m as i64),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn keys(&self, cache_name: &str) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT cache_key FROM cache_entries WHERE cache_name = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![cache_name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }

  fn evict_to(&self, cache_name: &str, max_entries: usize) -> Result<usize> {
    let conn = self.db.conn()?;
    let evicted = conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ?1 AND seq NOT IN (
           SELECT seq FROM cache_entries WHERE cache_name = ?1 ORDER BY seq DESC LIMIT ?2
         )",
        params![cache_name, max_entries as i64],
      )
      .map_err(|e| eyre!("Failed to evict from cache {}: {}", cache_name, e))?;
    Ok(evicted)
  }

  fn clear(&self, cache_name: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to clear cache {}: {}", cache_name, e))?;
    Ok(())
  }

  fn total_bytes(&self) -> Result<u64> {
    let conn = self.db.conn()?;
    let total: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(LENGTH(body)), 0) FROM cache_entries",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to compute cache size: {}", e))?;
    Ok(total.max(0) as u64)
  }
}

pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse a datetime string written by [`format_datetime`] or SQLite defaults.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Ok(dt.with_timezone(&Utc));
  }
  // SQLite's datetime('now') format "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
