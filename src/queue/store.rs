//! Durable storage for form submissions made while offline.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use crate::db;

/// One queued form submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSubmission {
  /// Monotonic, assigned on insert; also the replay order
  pub id: i64,
  pub payload: serde_json::Value,
  pub timestamp: DateTime<Utc>,
}

/// Trait for submission storage backends.
///
/// Records are append-only: inserted once, never updated, removed after a
/// confirmed replay.
pub trait SubmissionStore: Send + Sync + 'static {
  /// Append a submission and return its identifier.
  fn add(&self, payload: &serde_json::Value, timestamp: DateTime<Utc>) -> Result<i64>;

  /// All pending submissions in insertion order.
  fn pending(&self) -> Result<Vec<PendingSubmission>>;

  /// Remove a submission. Returns whether it was still queued.
  fn remove(&self, id: i64) -> Result<bool>;
}

/// SQLite-based submission storage.
pub struct SqliteSubmissionStore {
  conn: Mutex<Connection>,
}

const SUBMISSION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_submissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_submissions_timestamp
    ON pending_submissions(timestamp);
"#;

const SUBMISSION_SCHEMA_VERSION: i64 = 1;

impl SqliteSubmissionStore {
  pub fn open_at(path: &Path) -> Result<Self> {
    Self::from_connection(db::open(path)?)
  }

  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory submission store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    db::migrate(
      &conn,
      "submissions",
      SUBMISSION_SCHEMA_VERSION,
      SUBMISSION_SCHEMA,
    )?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl SubmissionStore for SqliteSubmissionStore {
  fn add(&self, payload: &serde_json::Value, timestamp: DateTime<Utc>) -> Result<i64> {
    let data =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO pending_submissions (payload, timestamp) VALUES (?, ?)",
        params![data, timestamp.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store submission: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending(&self) -> Result<Vec<PendingSubmission>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT id, payload, timestamp FROM pending_submissions ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query submissions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read submissions: {}", e))?;

    rows
      .into_iter()
      .map(|(id, payload, timestamp)| {
        let payload = serde_json::from_str(&payload)
          .map_err(|e| eyre!("Failed to deserialize submission {}: {}", id, e))?;
        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
          .map_err(|e| eyre!("Failed to parse timestamp of submission {}: {}", id, e))?
          .with_timezone(&Utc);
        Ok(PendingSubmission {
          id,
          payload,
          timestamp,
        })
      })
      .collect()
  }

  fn remove(&self, id: i64) -> Result<bool> {
    let conn = self.lock()?;
    let deleted = conn
      .execute("DELETE FROM pending_submissions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete submission {}: {}", id, e))?;
    Ok(deleted > 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_ids_are_monotonic_and_order_preserved() {
    let store = SqliteSubmissionStore::open_in_memory().unwrap();
    let a = store.add(&json!({"name": "A"}), Utc::now()).unwrap();
    let b = store.add(&json!({"name": "B"}), Utc::now()).unwrap();
    assert!(b > a);

    let pending = store.pending().unwrap();
    let names: Vec<_> = pending.iter().map(|s| s.payload["name"].clone()).collect();
    assert_eq!(names, vec![json!("A"), json!("B")]);
  }

  #[test]
  fn test_ids_not_reused_after_remove() {
    let store = SqliteSubmissionStore::open_in_memory().unwrap();
    let a = store.add(&json!({}), Utc::now()).unwrap();
    assert!(store.remove(a).unwrap());
    let b = store.add(&json!({}), Utc::now()).unwrap();
    assert!(b > a);
    assert!(!store.remove(a).unwrap());
  }

  #[test]
  fn test_submissions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(db::DB_FILE);

    {
      let store = SqliteSubmissionStore::open_at(&path).unwrap();
      store
        .add(&json!({"email": "lead@example.com"}), Utc::now())
        .unwrap();
    }

    let store = SqliteSubmissionStore::open_at(&path).unwrap();
    let pending = store.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload["email"], "lead@example.com");
  }
}
