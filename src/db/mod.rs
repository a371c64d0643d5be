//! Shared SQLite plumbing for the cache store and the submission queue.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the database inside the data directory.
pub const DB_FILE: &str = "swcache.db";

/// Get the default data directory
pub fn default_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("swcache"))
}

/// Open or create the database at `path`.
pub fn open(path: &Path) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  // Cache store and submission queue hold separate connections to one file
  conn
    .busy_timeout(Duration::from_secs(5))
    .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

  Ok(conn)
}

/// Apply `schema` unless the named schema is already at `version`.
///
/// Each store records its version in a `schema_versions` row so that two
/// stores can share one file.
pub fn migrate(conn: &Connection, name: &str, version: i64, schema: &str) -> Result<()> {
  conn
    .execute_batch(
      "CREATE TABLE IF NOT EXISTS schema_versions (
           name TEXT PRIMARY KEY,
           version INTEGER NOT NULL
       );",
    )
    .map_err(|e| eyre!("Failed to create schema_versions: {}", e))?;

  let current: i64 = conn
    .query_row(
      "SELECT COALESCE(MAX(version), 0) FROM schema_versions WHERE name = ?",
      [name],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to read schema version for {}: {}", name, e))?;

  if current >= version {
    return Ok(());
  }

  conn
    .execute_batch(schema)
    .map_err(|e| eyre!("Failed to run {} migrations: {}", name, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO schema_versions (name, version) VALUES (?, ?)",
      rusqlite::params![name, version],
    )
    .map_err(|e| eyre!("Failed to record schema version for {}: {}", name, e))?;

  tracing::debug!(schema = name, version, "Applied database schema");
  Ok(())
}
