//! Local chart storage backing optimistic writes.

use chrono::{DateTime, SubsecRound, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::cache::{format_datetime, parse_datetime};
use crate::db::Database;
use crate::sync::EntitySync;

/// Version written into export documents.
pub const EXPORT_VERSION: u32 = 1;

/// A chart stored locally, possibly not yet known to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartRecord {
  /// Local id, assigned on save
  pub id: String,
  #[serde(default)]
  pub server_id: Option<String>,
  #[serde(default)]
  pub dirty: bool,
  #[serde(default)]
  pub synced: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub data: Value,
  #[serde(default)]
  pub params: Value,
}

impl ChartRecord {
  /// New unsynced chart with a fresh local id.
  pub fn new(data: Value, params: Value) -> Self {
    // Stored timestamps carry millisecond precision
    let now = Utc::now().trunc_subsecs(3);
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      server_id: None,
      dirty: true,
      synced: false,
      created_at: now,
      updated_at: now,
      data,
      params,
    }
  }
}

/// Full chart set as exported to a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
  pub version: u32,
  pub exported_at: DateTime<Utc>,
  pub charts: Vec<ChartRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
  pub imported: usize,
  pub errors: usize,
}

#[derive(Clone)]
pub struct ChartStore {
  db: Arc<Database>,
}

const CHART_COLUMNS: &str = "local_id, server_id, dirty, synced, data, params, created_at, updated_at";

impl ChartStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Insert or replace a chart by local id.
  pub fn upsert(&self, chart: &ChartRecord) -> Result<()> {
    let data = serde_json::to_string(&chart.data)
      .map_err(|e| eyre!("Failed to serialize chart data: {}", e))?;
    let params = serde_json::to_string(&chart.params)
      .map_err(|e| eyre!("Failed to serialize chart params: {}", e))?;

    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO charts
           (local_id, server_id, dirty, synced, data, params, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          chart.id,
          chart.server_id,
          chart.dirty,
          chart.synced,
          data,
          params,
          format_datetime(chart.created_at),
          format_datetime(chart.updated_at),
        ],
      )
      .map_err(|e| eyre!("Failed to save chart {}: {}", chart.id, e))?;
    Ok(())
  }

  pub fn get(&self, id: &str) -> Result<Option<ChartRecord>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(&format!("SELECT {} FROM charts WHERE local_id = ?", CHART_COLUMNS))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let raw = stmt
      .query_row(params![id], RawChart::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to read chart {}: {}", id, e))?;
    raw.map(RawChart::into_record).transpose()
  }

  /// All charts, newest first.
  pub fn list(&self) -> Result<Vec<ChartRecord>> {
    self.query(&format!(
      "SELECT {} FROM charts ORDER BY created_at DESC, local_id",
      CHART_COLUMNS
    ))
  }

  /// Charts with local changes the server has not acknowledged, oldest first.
  pub fn dirty(&self) -> Result<Vec<ChartRecord>> {
    self.query(&format!(
      "SELECT {} FROM charts WHERE dirty = 1 ORDER BY created_at, local_id",
      CHART_COLUMNS
    ))
  }

  fn query(&self, sql: &str) -> Result<Vec<ChartRecord>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let rows: Vec<RawChart> = stmt
      .query_map([], RawChart::from_row)
      .map_err(|e| eyre!("Failed to query charts: {}", e))?
      .filter_map(|r| r.ok())
      .collect();
    rows.into_iter().map(RawChart::into_record).collect()
  }

  /// Record server acknowledgment. Keeps a known server id when none is given.
  pub fn mark_synced(&self, id: &str, server_id: Option<&str>) -> Result<bool> {
    let n = self
      .db
      .conn()?
      .execute(
        "UPDATE charts SET dirty = 0, synced = 1, server_id = COALESCE(?, server_id), updated_at = ?
         WHERE local_id = ?",
        params![server_id, format_datetime(Utc::now()), id],
      )
      .map_err(|e| eyre!("Failed to mark chart {} synced: {}", id, e))?;
    Ok(n > 0)
  }

  pub fn count(&self) -> Result<usize> {
    let n: i64 = self
      .db
      .conn()?
      .query_row("SELECT COUNT(*) FROM charts", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count charts: {}", e))?;
    Ok(n.max(0) as usize)
  }

  pub fn export(&self) -> Result<ExportDocument> {
    Ok(ExportDocument {
      version: EXPORT_VERSION,
      exported_at: Utc::now(),
      charts: self.list()?,
    })
  }

  /// Additive import: each well-formed record is upserted by id; nothing is deleted.
  pub fn import(&self, document: &Value) -> Result<ImportReport> {
    let charts = document
      .get("charts")
      .and_then(Value::as_array)
      .ok_or_else(|| eyre!("Import document has no charts array"))?;

    let mut report = ImportReport::default();
    for item in charts {
      let result = serde_json::from_value::<ChartRecord>(item.clone())
        .map_err(|e| eyre!("Malformed chart record: {}", e))
        .and_then(|chart| self.upsert(&chart));
      match result {
        Ok(()) => report.imported += 1,
        Err(e) => {
          tracing::warn!("Skipping chart during import: {}", e);
          report.errors += 1;
        }
      }
    }
    Ok(report)
  }
}

impl EntitySync for ChartStore {
  fn synced(&self, entity_id: &str, server_id: Option<&str>) -> Result<bool> {
    self.mark_synced(entity_id, server_id)
  }
}

struct RawChart {
  local_id: String,
  server_id: Option<String>,
  dirty: bool,
  synced: bool,
  data: String,
  params: String,
  created_at: String,
  updated_at: String,
}

impl RawChart {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      local_id: row.get(0)?,
      server_id: row.get(1)?,
      dirty: row.get(2)?,
      synced: row.get(3)?,
      data: row.get(4)?,
      params: row.get(5)?,
      created_at: row.get(6)?,
      updated_at: row.get(7)?,
    })
  }

  fn into_record(self) -> Result<ChartRecord> {
    let parse = |s: &str| -> Result<Value> {
      serde_json::from_str(s).map_err(|e| eyre!("Corrupt chart {}: {}", self.local_id, e))
    };
    Ok(ChartRecord {
      data: parse(&self.data)?,
      params: parse(&self.params)?,
      created_at: parse_datetime(&self.created_at)?,
      updated_at: parse_datetime(&self.updated_at)?,
      server_id: self.server_id.clone(),
      dirty: self.dirty,
      synced: self.synced,
      id: self.local_id.clone(),
    })
  }
}
