//! Cache storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::traits::{Request, Response};
use crate::db;

/// A stored response together with the partition it was found in.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  pub partition: String,
}

/// Trait for cache storage backends.
///
/// Entries are keyed by request identity within a partition. Writes to the
/// same key overwrite; concurrent writers race and the last one wins.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if it does not exist yet.
  fn create_partition(&self, name: &str) -> Result<()>;

  /// Store a response, replacing any prior entry for the same request.
  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store a batch of responses. Either every entry is written or none is.
  fn put_all(&self, partition: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Look up a request within one partition.
  fn match_in(&self, partition: &str, request: &Request) -> Result<Option<Response>>;

  /// Look up a request across all partitions, oldest partition first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>>;

  /// URLs stored in a partition.
  fn keys(&self, partition: &str) -> Result<Vec<String>>;

  /// Drop a partition and all of its entries. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// All partition names in creation order.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Handle scoped to one partition. The partition itself is created by the
  /// first write through the handle.
  fn open(&self, name: &str) -> Partition<'_, Self>
  where
    Self: Sized,
  {
    Partition {
      storage: self,
      name: name.to_string(),
    }
  }
}

/// Handle to a single named partition.
pub struct Partition<'a, S: CacheStorage> {
  storage: &'a S,
  name: String,
}

impl<S: CacheStorage> Partition<'_, S> {
  pub fn put_all(&self, entries: &[(Request, Response)]) -> Result<()> {
    self.storage.put_all(&self.name, entries)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, request_key),
    FOREIGN KEY (partition) REFERENCES cache_partitions(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(request_key);
"#;

const CACHE_SCHEMA_VERSION: i64 = 1;

impl SqliteStorage {
  /// Open the cache tables in the database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    Self::from_connection(db::open(path)?)
  }

  /// Throwaway storage, used by tests.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch("PRAGMA foreign_keys = ON;")
      .map_err(|e| eyre!("Failed to enable foreign keys: {}", e))?;
    db::migrate(&conn, "cache", CACHE_SCHEMA_VERSION, CACHE_SCHEMA)?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Write entries into `partition` inside a single transaction.
  fn write_entries<'a>(
    &self,
    partition: &str,
    entries: impl IntoIterator<Item = (&'a Request, &'a Response)>,
  ) -> Result<usize> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

    let mut written = 0;
    for (request, response) in entries {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO cache_entries
           (partition, request_key, method, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          partition,
          request.cache_key(),
          request.method.as_str(),
          request.identity_url(),
          response.status,
          headers,
          response.body,
        ],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", request.url, e))?;
      written += 1;
    }

    // Dropping an uncommitted transaction rolls it back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(written)
  }

  /// Make every insert of a URL ending in `suffix` fail, as a full disk would.
  #[cfg(test)]
  pub(crate) fn fail_writes_for(&self, suffix: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(&format!(
        "CREATE TRIGGER fail_write BEFORE INSERT ON cache_entries
         WHEN NEW.url LIKE '%{}'
         BEGIN SELECT RAISE(ABORT, 'database or disk is full'); END;",
        suffix
      ))
      .map_err(|e| eyre!("Failed to install trigger: {}", e))
  }
}

fn row_to_response(status: u16, headers: &str, body: Vec<u8>) -> Result<Response> {
  let headers: BTreeMap<String, String> =
    serde_json::from_str(headers).map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
  Ok(Response {
    status,
    headers,
    body,
  })
}

impl CacheStorage for SqliteStorage {
  fn create_partition(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", name, e))?;
    Ok(())
  }

  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
    self.write_entries(partition, [(request, response)])?;
    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[(Request, Response)]) -> Result<()> {
    let written = self.write_entries(partition, entries.iter().map(|(req, resp)| (req, resp)))?;
    debug!(partition, written, "Stored batch");
    Ok(())
  }

  fn match_in(&self, partition: &str, request: &Request) -> Result<Option<Response>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries
         WHERE partition = ? AND request_key = ?",
        params![partition, request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    row
      .map(|(status, headers, body)| row_to_response(status, &headers, body))
      .transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(String, u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT ce.partition, ce.status, ce.headers, ce.body FROM cache_entries ce
         INNER JOIN cache_partitions cp ON cp.name = ce.partition
         WHERE ce.request_key = ?
         ORDER BY cp.rowid
         LIMIT 1",
        params![request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match row {
      Some((partition, status, headers, body)) => Ok(Some(CachedResponse {
        response: row_to_response(status, &headers, body)?,
        partition,
      })),
      None => Ok(None),
    }
  }

  fn keys(&self, partition: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE partition = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read keys: {}", e))?;

    Ok(keys)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;

    // Entries go with the partition via ON DELETE CASCADE
    let deleted = conn
      .execute("DELETE FROM cache_partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    Ok(deleted > 0)
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partitions: {}", e))?;

    Ok(names)
  }
}
