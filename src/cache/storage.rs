//! Resource store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::generation::Generation;
use super::traits::{RequestKey, ResponseKind, Snapshot};

/// Summary of a stored entry, for inspection.
#[derive(Debug, Clone)]
pub struct EntryInfo {
  pub method: String,
  pub url: String,
  pub status: u16,
  pub kind: ResponseKind,
  pub size: usize,
  pub stored_at: DateTime<Utc>,
}

/// Trait for resource store backends.
///
/// Every operation names its generation explicitly; there is no notion of a
/// "current" generation at this level.
pub trait ResourceStore: Send + Sync {
  /// Create the namespace for a generation. Idempotent.
  fn open_generation(&self, generation: &Generation) -> Result<()>;

  /// Store or overwrite a snapshot, returning whether it was written.
  /// Writes into a generation that is not open (never created, or already
  /// deleted) are dropped.
  fn put(&self, generation: &Generation, key: &RequestKey, snapshot: &Snapshot) -> Result<bool>;

  /// Look up a snapshot.
  fn get(&self, generation: &Generation, key: &RequestKey) -> Result<Option<Snapshot>>;

  /// Remove a generation and all of its entries. Deleting an absent
  /// generation is a no-op.
  fn delete_generation(&self, generation: &Generation) -> Result<()>;

  /// All known generations, including ones that never finished installing.
  fn list_generations(&self) -> Result<Vec<Generation>>;

  /// Record that a generation completed activation.
  fn mark_active(&self, generation: &Generation) -> Result<()>;

  /// Generations that completed activation, oldest activation first.
  fn active_generations(&self) -> Result<Vec<Generation>>;

  /// Entries stored under a generation, ordered by URL.
  fn entries(&self, generation: &Generation) -> Result<Vec<EntryInfo>>;
}

/// Storage implementation that doesn't cache anything.
/// Used when the database is unusable - the layer degrades to network-only.
pub struct NoopStorage;

impl ResourceStore for NoopStorage {
  fn open_generation(&self, _generation: &Generation) -> Result<()> {
    Ok(())
  }

  fn put(&self, _generation: &Generation, _key: &RequestKey, _snapshot: &Snapshot) -> Result<bool> {
    Ok(false) // Discard
  }

  fn get(&self, _generation: &Generation, _key: &RequestKey) -> Result<Option<Snapshot>> {
    Ok(None) // Always miss
  }

  fn delete_generation(&self, _generation: &Generation) -> Result<()> {
    Ok(())
  }

  fn list_generations(&self) -> Result<Vec<Generation>> {
    Ok(Vec::new())
  }

  fn mark_active(&self, _generation: &Generation) -> Result<()> {
    Ok(())
  }

  fn active_generations(&self) -> Result<Vec<Generation>> {
    Ok(Vec::new())
  }

  fn entries(&self, _generation: &Generation) -> Result<Vec<EntryInfo>> {
    Ok(Vec::new())
  }
}

/// SQLite-based resource store.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory store.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("innerorder").join("offline.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    // Databases created before activation was tracked lack the column
    if conn
      .prepare("SELECT activated_at FROM generations LIMIT 0")
      .is_err()
    {
      conn
        .execute_batch("ALTER TABLE generations ADD COLUMN activated_at TEXT")
        .map_err(|e| eyre!("Failed to add activation column: {}", e))?;
    }

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per generation namespace; activated_at is set once install
-- and activation both finished
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    activated_at TEXT
);

-- Response snapshots, keyed by canonical request identity
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    kind TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, key_hash),
    FOREIGN KEY (generation) REFERENCES generations(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_generation ON entries(generation);
"#;

impl ResourceStore for SqliteStorage {
  fn open_generation(&self, generation: &Generation) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![generation.as_str()],
      )
      .map_err(|e| eyre!("Failed to open generation {}: {}", generation, e))?;

    Ok(())
  }

  fn put(&self, generation: &Generation, key: &RequestKey, snapshot: &Snapshot) -> Result<bool> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&snapshot.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    // Only write into a live namespace
    let written = conn
      .execute(
        "INSERT OR REPLACE INTO entries (generation, key_hash, method, url, status, kind, headers, body, stored_at)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now')
         WHERE EXISTS (SELECT 1 FROM generations WHERE name = ?1)",
        params![
          generation.as_str(),
          key.hash(),
          key.method(),
          key.url(),
          snapshot.status,
          snapshot.kind.as_str(),
          headers,
          snapshot.body,
        ],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

    if written == 0 {
      debug!(%generation, %key, "dropped write into closed generation");
    }

    Ok(written > 0)
  }

  fn get(&self, generation: &Generation, key: &RequestKey) -> Result<Option<Snapshot>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT url, status, kind, headers, body FROM entries
         WHERE generation = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, u16, String, String, Vec<u8>)> = stmt
      .query_row(params![generation.as_str(), key.hash()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

    let Some((url, status, kind, headers, body)) = row else {
      return Ok(None);
    };

    let kind =
      ResponseKind::parse(&kind).ok_or_else(|| eyre!("Unknown response kind '{}'", kind))?;
    let headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

    Ok(Some(Snapshot {
      url,
      status,
      kind,
      headers,
      body,
    }))
  }

  fn delete_generation(&self, generation: &Generation) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM entries WHERE generation = ?",
        params![generation.as_str()],
      )
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", generation, e))?;
    conn
      .execute(
        "DELETE FROM generations WHERE name = ?",
        params![generation.as_str()],
      )
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    Ok(())
  }

  fn list_generations(&self) -> Result<Vec<Generation>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    Ok(names.into_iter().map(Generation::new).collect())
  }

  fn mark_active(&self, generation: &Generation) -> Result<()> {
    let conn = self.lock()?;

    let updated = conn
      .execute(
        "UPDATE generations SET activated_at = datetime('now') WHERE name = ?",
        params![generation.as_str()],
      )
      .map_err(|e| eyre!("Failed to mark {} active: {}", generation, e))?;

    if updated == 0 {
      return Err(eyre!("Generation {} does not exist", generation));
    }

    Ok(())
  }

  fn active_generations(&self) -> Result<Vec<Generation>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT name FROM generations
         WHERE activated_at IS NOT NULL
         ORDER BY activated_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list active generations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read generation row: {}", e))?;

    Ok(names.into_iter().map(Generation::new).collect())
  }

  fn entries(&self, generation: &Generation) -> Result<Vec<EntryInfo>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT method, url, status, kind, length(body), stored_at FROM entries
         WHERE generation = ?
         ORDER BY url",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, u16, String, i64, String)> = stmt
      .query_map(params![generation.as_str()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(method, url, status, kind, size, stored_at)| {
        Ok(EntryInfo {
          method,
          url,
          status,
          kind: ResponseKind::parse(&kind).unwrap_or(ResponseKind::Opaque),
          size: size.max(0) as usize,
          stored_at: parse_datetime(&stored_at)?,
        })
      })
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
