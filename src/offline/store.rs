//! SQLite-backed durable store for queued actions and offline read data.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// How long offline read data stays usable when not configured otherwise.
pub const DEFAULT_CACHED_DATA_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// A mutating request waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
  /// Auto-assigned, increases with enqueue order
  pub id: i64,
  pub endpoint: String,
  pub method: String,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
}

/// A queued action the server refused permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedAction {
  pub action: PendingAction,
  pub reason: String,
  pub rejected_at: DateTime<Utc>,
}

/// Durable local store with two collections: pending actions and cached
/// read payloads.
pub struct OfflineStore {
  conn: Mutex<Connection>,
  cached_data_max_age: Duration,
}

impl OfflineStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the store at `path`. Safe to call on an existing store.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open offline store at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
      cached_data_max_age: DEFAULT_CACHED_DATA_MAX_AGE,
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Set how long offline read data stays usable.
  pub fn with_cached_data_max_age(mut self, max_age: Duration) -> Self {
    self.cached_data_max_age = max_age;
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("offline.db"))
  }

  /// Run database migrations.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(OFFLINE_SCHEMA)
      .map_err(|e| eyre!("Failed to run offline store migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  // ==========================================================================
  // Pending actions (owned by ActionQueue)
  // ==========================================================================

  pub(crate) fn insert_action(
    &self,
    endpoint: &str,
    method: &str,
    payload: &Value,
  ) -> Result<PendingAction> {
    let conn = self.lock()?;
    let enqueued_at = Utc::now();
    let data =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO pending_actions (endpoint, method, payload, enqueued_at)
         VALUES (?, ?, ?, ?)",
        params![endpoint, method, data, enqueued_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store pending action: {}", e))?;

    Ok(PendingAction {
      id: conn.last_insert_rowid(),
      endpoint: endpoint.to_string(),
      method: method.to_string(),
      payload: payload.clone(),
      enqueued_at,
    })
  }

  /// All pending actions in enqueue order.
  pub(crate) fn pending_actions(&self) -> Result<Vec<PendingAction>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, endpoint, method, payload, enqueued_at FROM pending_actions
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Vec<u8>>(3)?,
          row.get::<_, String>(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query pending actions: {}", e))?;

    let mut actions = Vec::new();
    for row in rows {
      let (id, endpoint, method, payload, enqueued_at) =
        row.map_err(|e| eyre!("Failed to read pending action: {}", e))?;
      actions.push(PendingAction {
        id,
        endpoint,
        method,
        payload: serde_json::from_slice(&payload)
          .map_err(|e| eyre!("Failed to deserialize payload of action {}: {}", id, e))?,
        enqueued_at: parse_datetime(&enqueued_at)?,
      });
    }
    Ok(actions)
  }

  pub(crate) fn pending_count(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM pending_actions", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count pending actions: {}", e))?;
    Ok(count as usize)
  }

  pub(crate) fn delete_action(&self, id: i64) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM pending_actions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete pending action {}: {}", id, e))?;
    Ok(())
  }

  /// Move an action out of the replay path, recording why.
  pub(crate) fn reject_action(&self, action: &PendingAction, reason: &str) -> Result<()> {
    let mut conn = self.lock()?;
    let data = serde_json::to_vec(&action.payload)
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute(
      "INSERT OR REPLACE INTO rejected_actions
         (id, endpoint, method, payload, enqueued_at, reason, rejected_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        action.id,
        action.endpoint,
        action.method,
        data,
        action.enqueued_at.to_rfc3339(),
        reason,
        Utc::now().to_rfc3339()
      ],
    )
    .map_err(|e| eyre!("Failed to record rejected action: {}", e))?;
    tx.execute("DELETE FROM pending_actions WHERE id = ?", params![action.id])
      .map_err(|e| eyre!("Failed to delete pending action {}: {}", action.id, e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  pub(crate) fn rejected_actions(&self) -> Result<Vec<RejectedAction>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, endpoint, method, payload, enqueued_at, reason, rejected_at
         FROM rejected_actions ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Vec<u8>>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, String>(5)?,
          row.get::<_, String>(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query rejected actions: {}", e))?;

    let mut rejected = Vec::new();
    for row in rows {
      let (id, endpoint, method, payload, enqueued_at, reason, rejected_at) =
        row.map_err(|e| eyre!("Failed to read rejected action: {}", e))?;
      rejected.push(RejectedAction {
        action: PendingAction {
          id,
          endpoint,
          method,
          payload: serde_json::from_slice(&payload)
            .map_err(|e| eyre!("Failed to deserialize payload of action {}: {}", id, e))?,
          enqueued_at: parse_datetime(&enqueued_at)?,
        },
        reason,
        rejected_at: parse_datetime(&rejected_at)?,
      });
    }
    Ok(rejected)
  }

  // ==========================================================================
  // Cached read data
  // ==========================================================================

  /// Store the last known value for `key` so a cold start without network
  /// can still show something.
  pub fn cache_data<T: Serialize>(&self, key: &str, data: &T) -> Result<()> {
    let conn = self.lock()?;
    let data = serde_json::to_vec(data).map_err(|e| eyre!("Failed to serialize '{}': {}", key, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cached_data (key, data, timestamp) VALUES (?, ?, ?)",
        params![key, data, Utc::now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to cache data for '{}': {}", key, e))?;
    Ok(())
  }

  /// Read the last known value for `key`. Entries older than the configured
  /// max age read as absent.
  pub fn cached_data<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let conn = self.lock()?;
    let row: Option<(Vec<u8>, i64)> = conn
      .query_row(
        "SELECT data, timestamp FROM cached_data WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cached data for '{}': {}", key, e))?;

    let Some((data, timestamp)) = row else {
      return Ok(None);
    };

    let age = Utc::now().timestamp_millis() - timestamp;
    let max_age = i64::try_from(self.cached_data_max_age.as_millis()).unwrap_or(i64::MAX);
    if age > max_age {
      debug!(key, age_ms = age, "Offline cached data expired");
      return Ok(None);
    }

    let value = serde_json::from_slice(&data)
      .map_err(|e| eyre!("Failed to deserialize cached data for '{}': {}", key, e))?;
    Ok(Some(value))
  }
}

/// Schema for the offline store. Every statement is idempotent so opening an
/// existing store is an upgrade path.
const OFFLINE_SCHEMA: &str = r#"
-- Mutating requests captured while offline (replayed in id order)
CREATE TABLE IF NOT EXISTS pending_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL
);

-- Actions the server refused permanently
CREATE TABLE IF NOT EXISTS rejected_actions (
    id INTEGER PRIMARY KEY,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL,
    reason TEXT NOT NULL,
    rejected_at TEXT NOT NULL
);

-- Last known read payloads, keyed by logical cache key
CREATE TABLE IF NOT EXISTS cached_data (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    timestamp INTEGER NOT NULL
);
"#;

/// Parse an RFC 3339 timestamp written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
