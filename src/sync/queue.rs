//! Durable queue of sync tasks and the drain loop.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::task::{SyncRegistration, SyncTask, TaskStatus, DEFAULT_REQUEST_TIMEOUT};
use crate::cache::{format_datetime, parse_datetime};
use crate::db::Database;
use crate::net::{Method, Network, Request, Response};

const ERROR_COUNT_KEY: &str = "sync.error_count";

/// Result of running one task.
#[derive(Debug, Clone)]
pub enum DrainOutcome {
  /// Server accepted the mutation; the task has been removed
  Succeeded { task: SyncTask, response: Response },
  /// Retry budget exhausted; the task stays in the queue as failed
  Failed { task: SyncTask, error: String },
  /// Another drain is already running this task
  AlreadyInFlight,
  /// Task exists but is not pending (e.g. failed earlier)
  NotPending(TaskStatus),
  /// No task with this id
  Missing,
}

/// Aggregate result of draining a tag.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
  pub tag: String,
  pub succeeded: Vec<(SyncTask, Response)>,
  pub failed: Vec<(SyncTask, String)>,
  pub skipped: usize,
}

impl DrainReport {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Applies a server acknowledgment to the local entity a task was created for.
///
/// Runs inside the drain, independent of any listener on the broadcast bus.
pub trait EntitySync: Send + Sync {
  /// Returns whether a local entity with `entity_id` was updated.
  fn synced(&self, entity_id: &str, server_id: Option<&str>) -> Result<bool>;
}

/// Removes a task id from the in-flight set when dropped.
struct InFlightGuard {
  set: Arc<Mutex<HashSet<String>>>,
  id: String,
}

impl InFlightGuard {
  fn acquire(set: &Arc<Mutex<HashSet<String>>>, id: &str) -> Option<Self> {
    let mut guard = set.lock().ok()?;
    if !guard.insert(id.to_string()) {
      return None;
    }
    Some(Self {
      set: Arc::clone(set),
      id: id.to_string(),
    })
  }
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    if let Ok(mut set) = self.set.lock() {
      set.remove(&self.id);
    }
  }
}

/// Persistent background sync queue.
///
/// Tasks of one id never run concurrently; retries of a task are strictly
/// sequential. Tasks of different ids have no ordering guarantee beyond
/// creation order within a single `drain` call.
#[derive(Clone)]
pub struct SyncQueue {
  db: Arc<Database>,
  network: Arc<dyn Network>,
  registrations: Arc<HashMap<String, SyncRegistration>>,
  in_flight: Arc<Mutex<HashSet<String>>>,
  entity_sync: Arc<HashMap<String, Arc<dyn EntitySync>>>,
}

impl SyncQueue {
  /// Open the queue. Tasks left in flight by a previous process go back to pending.
  pub fn open(
    db: Arc<Database>,
    network: Arc<dyn Network>,
    registrations: Vec<SyncRegistration>,
  ) -> Result<Self> {
    let registrations = registrations
      .into_iter()
      .map(|r| (r.name.clone(), r))
      .collect();

    let queue = Self {
      db,
      network,
      registrations: Arc::new(registrations),
      in_flight: Arc::new(Mutex::new(HashSet::new())),
      entity_sync: Arc::new(HashMap::new()),
    };

    let reset = queue.reset_in_flight()?;
    if reset > 0 {
      info!(count = reset, "Returned interrupted sync tasks to pending");
    }

    Ok(queue)
  }

  /// Update local entities of `tag` when their tasks succeed.
  pub fn with_entity_sync(mut self, tag: &str, hook: Arc<dyn EntitySync>) -> Self {
    let mut hooks = (*self.entity_sync).clone();
    hooks.insert(tag.to_string(), hook);
    self.entity_sync = Arc::new(hooks);
    self
  }

  pub fn registration(&self, tag: &str) -> Option<&SyncRegistration> {
    self.registrations.get(tag)
  }

  pub fn tags(&self) -> Vec<String> {
    let mut tags: Vec<String> = self.registrations.keys().cloned().collect();
    tags.sort();
    tags
  }

  /// Persist a new task.
  pub fn enqueue(&self, task: &SyncTask) -> Result<()> {
    let payload = task
      .payload
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize task payload: {}", e))?;

    self
      .db
      .conn()?
      .execute(
        "INSERT INTO sync_tasks
           (id, tag, url, method, payload, entity_id, retry_count, max_retries,
            retry_delay_ms, status, last_error, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          task.id,
          task.tag,
          task.url,
          task.method,
          payload,
          task.entity_id,
          task.retry_count,
          task.max_retries,
          task.retry_delay.as_millis() as i64,
          task.status.as_str(),
          task.last_error,
          format_datetime(task.created_at),
          format_datetime(task.updated_at),
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue sync task: {}", e))?;

    debug!(id = %task.id, tag = %task.tag, "Enqueued sync task");
    Ok(())
  }

  /// Build a task from the registration for `tag` and enqueue it.
  ///
  /// An unknown tag is a configuration error.
  pub fn enqueue_for(
    &self,
    tag: &str,
    payload: Option<serde_json::Value>,
    entity_id: Option<&str>,
  ) -> Result<SyncTask> {
    let reg = self
      .registration(tag)
      .ok_or_else(|| eyre!("No background sync registration for tag {}", tag))?;

    let mut task = SyncTask::from_registration(reg);
    task.payload = payload;
    task.entity_id = entity_id.map(String::from);
    self.enqueue(&task)?;
    Ok(task)
  }

  pub fn get(&self, id: &str) -> Result<Option<SyncTask>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(&format!("SELECT {} FROM sync_tasks WHERE id = ?", TASK_COLUMNS))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let raw = stmt
      .query_row(params![id], RawTask::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to read sync task {}: {}", id, e))?;

    raw.map(RawTask::into_task).transpose()
  }

  /// Pending tasks in creation order, optionally restricted to a tag.
  pub fn pending(&self, tag: Option<&str>) -> Result<Vec<SyncTask>> {
    self.query_tasks(
      &format!(
        "SELECT {} FROM sync_tasks WHERE status = 'pending' AND (?1 IS NULL OR tag = ?1)
         ORDER BY created_at, rowid",
        TASK_COLUMNS
      ),
      params![tag],
    )
  }

  /// Tasks that exhausted their retries, kept for inspection.
  pub fn failed(&self) -> Result<Vec<SyncTask>> {
    self.query_tasks(
      &format!(
        "SELECT {} FROM sync_tasks WHERE status = 'failed' ORDER BY updated_at, rowid",
        TASK_COLUMNS
      ),
      [],
    )
  }

  /// Most recent unfinished task targeting a local entity.
  pub fn find_for_entity(&self, entity_id: &str) -> Result<Option<SyncTask>> {
    Ok(
      self
        .query_tasks(
          &format!(
            "SELECT {} FROM sync_tasks WHERE entity_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
            TASK_COLUMNS
          ),
          params![entity_id],
        )?
        .into_iter()
        .next(),
    )
  }

  fn query_tasks<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<SyncTask>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<RawTask> = stmt
      .query_map(params, RawTask::from_row)
      .map_err(|e| eyre!("Failed to query sync tasks: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows.into_iter().map(RawTask::into_task).collect()
  }

  pub fn pending_count(&self) -> Result<usize> {
    self.count_status(TaskStatus::Pending)
  }

  pub fn failed_count(&self) -> Result<usize> {
    self.count_status(TaskStatus::Failed)
  }

  fn count_status(&self, status: TaskStatus) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sync_tasks WHERE status = ?",
        params![status.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count sync tasks: {}", e))?;
    Ok(count.max(0) as usize)
  }

  /// Permanent failures recorded so far. Survives restarts.
  pub fn error_count(&self) -> Result<u64> {
    Ok(
      self
        .db
        .get_meta(ERROR_COUNT_KEY)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0),
    )
  }

  fn increment_error_count(&self) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT INTO sync_meta (key, value) VALUES (?1, '1')
         ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1",
        params![ERROR_COUNT_KEY],
      )
      .map_err(|e| eyre!("Failed to increment sync error count: {}", e))?;
    Ok(())
  }

  pub fn remove(&self, id: &str) -> Result<bool> {
    let n = self
      .db
      .conn()?
      .execute("DELETE FROM sync_tasks WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync task {}: {}", id, e))?;
    Ok(n > 0)
  }

  /// Operator action: give a failed task a fresh retry budget.
  pub fn retry_failed(&self, id: &str) -> Result<bool> {
    let n = self
      .db
      .conn()?
      .execute(
        "UPDATE sync_tasks SET status = 'pending', retry_count = 0, updated_at = ?
         WHERE id = ? AND status = 'failed'",
        params![format_datetime(Utc::now()), id],
      )
      .map_err(|e| eyre!("Failed to reset sync task {}: {}", id, e))?;
    Ok(n > 0)
  }

  /// Tasks marked in flight by a process that no longer runs them.
  pub fn reset_in_flight(&self) -> Result<usize> {
    let n = self
      .db
      .conn()?
      .execute(
        "UPDATE sync_tasks SET status = 'pending' WHERE status = 'in-flight'",
        [],
      )
      .map_err(|e| eyre!("Failed to reset in-flight tasks: {}", e))?;
    Ok(n)
  }

  fn save(&self, task: &SyncTask) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "UPDATE sync_tasks SET retry_count = ?, status = ?, last_error = ?, updated_at = ?
         WHERE id = ?",
        params![
          task.retry_count,
          task.status.as_str(),
          task.last_error,
          format_datetime(task.updated_at),
          task.id,
        ],
      )
      .map_err(|e| eyre!("Failed to update sync task {}: {}", task.id, e))?;
    Ok(())
  }

  /// Run one task until it succeeds or its retry budget is exhausted.
  ///
  /// Attempts are sequential. Between attempts the queue sleeps according to
  /// the registration's backoff; the sleep is not cancellable.
  pub async fn run_task(&self, id: &str) -> Result<DrainOutcome> {
    let Some(_guard) = InFlightGuard::acquire(&self.in_flight, id) else {
      debug!(%id, "Sync task already in flight");
      return Ok(DrainOutcome::AlreadyInFlight);
    };

    let Some(mut task) = self.get(id)? else {
      return Ok(DrainOutcome::Missing);
    };
    if !matches!(task.status, TaskStatus::Pending | TaskStatus::InFlight) {
      return Ok(DrainOutcome::NotPending(task.status));
    }

    let (backoff, timeout) = self
      .registration(&task.tag)
      .map(|r| (r.backoff, r.request_timeout()))
      .unwrap_or((Backoff::default(), DEFAULT_REQUEST_TIMEOUT));

    task.status = TaskStatus::InFlight;
    task.updated_at = Utc::now();
    self.save(&task)?;

    loop {
      match self.attempt(&task, timeout).await {
        Ok(response) => {
          self.remove(&task.id)?;
          task.status = TaskStatus::Succeeded;
          task.updated_at = Utc::now();
          self.apply_entity_sync(&task, &response);
          info!(id = %task.id, tag = %task.tag, attempts = task.retry_count + 1, "Sync task succeeded");
          return Ok(DrainOutcome::Succeeded { task, response });
        }
        Err(error) => {
          task.retry_count += 1;
          task.last_error = Some(error.clone());
          task.updated_at = Utc::now();

          if task.retry_count < task.max_retries {
            self.save(&task)?;
            let delay = backoff.delay(task.retry_delay, task.retry_count);
            debug!(id = %task.id, attempt = task.retry_count, ?delay, "Sync attempt failed: {}", error);
            tokio::time::sleep(delay).await;
            continue;
          }

          task.status = TaskStatus::Failed;
          self.save(&task)?;
          self.increment_error_count()?;
          warn!(id = %task.id, tag = %task.tag, attempts = task.retry_count, "Sync task failed permanently: {}", error);
          return Ok(DrainOutcome::Failed { task, error });
        }
      }
    }
  }

  fn apply_entity_sync(&self, task: &SyncTask, response: &Response) {
    let (Some(entity_id), Some(hook)) = (&task.entity_id, self.entity_sync.get(&task.tag)) else {
      return;
    };
    match hook.synced(entity_id, response.server_id().as_deref()) {
      Ok(true) => debug!(id = %task.id, %entity_id, "Marked entity synced"),
      Ok(false) => debug!(id = %task.id, %entity_id, "Synced entity no longer stored locally"),
      Err(e) => warn!(id = %task.id, %entity_id, "Failed to mark entity synced: {}", e),
    }
  }

  async fn attempt(&self, task: &SyncTask, timeout: Duration) -> std::result::Result<Response, String> {
    let method = Method::from_bytes(task.method.to_uppercase().as_bytes())
      .map_err(|e| format!("Invalid method {}: {}", task.method, e))?;
    let mut request = Request::new(method, &task.url).map_err(|e| e.to_string())?;
    if let Some(payload) = &task.payload {
      request = request.with_json(payload).map_err(|e| e.to_string())?;
    }

    let response = match tokio::time::timeout(timeout, self.network.fetch(&request)).await {
      Ok(Ok(resp)) => resp,
      Ok(Err(e)) => return Err(e.to_string()),
      Err(_) => return Err(format!("Timed out after {:?}", timeout)),
    };

    if response.is_success() {
      Ok(response)
    } else {
      Err(format!("HTTP {}", response.status))
    }
  }

  /// Drain every pending task registered under `tag`, one after another.
  pub async fn drain(&self, tag: &str) -> Result<DrainReport> {
    let mut report = DrainReport {
      tag: tag.to_string(),
      ..Default::default()
    };

    for task in self.pending(Some(tag))? {
      match self.run_task(&task.id).await? {
        DrainOutcome::Succeeded { task, response } => report.succeeded.push((task, response)),
        DrainOutcome::Failed { task, error } => report.failed.push((task, error)),
        _ => report.skipped += 1,
      }
    }

    Ok(report)
  }
}

const TASK_COLUMNS: &str = "id, tag, url, method, payload, entity_id, retry_count, max_retries, \
   retry_delay_ms, status, last_error, created_at, updated_at";

/// Row as stored; converted into a [`SyncTask`] outside the rusqlite closure.
struct RawTask {
  id: String,
  tag: String,
  url: String,
  method: String,
  payload: Option<String>,
  entity_id: Option<String>,
  retry_count: u32,
  max_retries: u32,
  retry_delay_ms: i64,
  status: String,
  last_error: Option<String>,
  created_at: String,
  updated_at: String,
}

impl RawTask {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      tag: row.get(1)?,
      url: row.get(2)?,
      method: row.get(3)?,
      payload: row.get(4)?,
      entity_id: row.get(5)?,
      retry_count: row.get(6)?,
      max_retries: row.get(7)?,
      retry_delay_ms: row.get(8)?,
      status: row.get(9)?,
      last_error: row.get(10)?,
      created_at: row.get(11)?,
      updated_at: row.get(12)?,
    })
  }

  fn into_task(self) -> Result<SyncTask> {
    let payload = self
      .payload
      .as_deref()
      .map(serde_json::from_str)
      .transpose()
      .map_err(|e| eyre!("Failed to parse payload of task {}: {}", self.id, e))?;

    Ok(SyncTask {
      payload,
      entity_id: self.entity_id,
      retry_count: self.retry_count,
      max_retries: self.max_retries,
      retry_delay: Duration::from_millis(self.retry_delay_ms.max(0) as u64),
      status: TaskStatus::parse(&self.status)?,
      last_error: self.last_error,
      created_at: parse_datetime(&self.created_at)?,
      updated_at: parse_datetime(&self.updated_at)?,
      id: self.id,
      tag: self.tag,
      url: self.url,
      method: self.method,
    })
  }
}
