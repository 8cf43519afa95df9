pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Shared SQLite connection backing the cache, the sync queue and the chart store.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the given path
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Get the default database path inside the data directory
  pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("skysync.db")
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Total bytes used by the database file (page_count * page_size).
  pub fn size_bytes(&self) -> Result<u64> {
    let conn = self.conn()?;
    let pages: i64 = conn
      .query_row("PRAGMA page_count", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read page count: {}", e))?;
    let page_size: i64 = conn
      .query_row("PRAGMA page_size", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read page size: {}", e))?;
    Ok((pages.max(0) as u64) * (page_size.max(0) as u64))
  }

  /// Read a value from the key/value table.
  pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT value FROM sync_meta WHERE key = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let value = stmt
      .query_row([key], |row| row.get(0))
      .optional()
      .map_err(|e| eyre!("Failed to read meta key {}: {}", key, e))?;
    Ok(value)
  }

  /// Write a value into the key/value table (last writer wins).
  pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
        [key, value],
      )
      .map_err(|e| eyre!("Failed to write meta key {}: {}", key, e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrations_are_idempotent() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().unwrap();
    assert!(db.size_bytes().unwrap() > 0);
  }

  #[test]
  fn test_meta_last_writer_wins() {
    let db = Database::open_in_memory().unwrap();
    assert_eq!(db.get_meta("k").unwrap(), None);
    db.set_meta("k", "1").unwrap();
    db.set_meta("k", "2").unwrap();
    assert_eq!(db.get_meta("k").unwrap().as_deref(), Some("2"));
  }

  #[test]
  fn test_meta_read_error_is_reported() {
    let db = Database::open_in_memory().unwrap();
    db.conn()
      .unwrap()
      .execute("INSERT INTO sync_meta (key, value) VALUES ('k', X'00FF')", [])
      .unwrap();
    assert!(db.get_meta("k").is_err());
    assert_eq!(db.get_meta("missing").unwrap(), None);
  }
}
