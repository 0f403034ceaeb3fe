//! Partition store backends: SQLite for persistence, memory for ephemeral runs.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::request::{RequestKey, Response, ResponseKind};
use super::traits::PartitionStore;

/// SQLite-based partition store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open partition store at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shelfguard").join("partitions.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for partition tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for partition tables.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- seq gives insertion order; INSERT OR REPLACE re-appends an overwritten key
CREATE TABLE IF NOT EXISTS entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    kind TEXT NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (partition, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_partition ON entries(partition, seq);
"#;

fn kind_to_str(kind: ResponseKind) -> &'static str {
  match kind {
    ResponseKind::Basic => "basic",
    ResponseKind::Cors => "cors",
    ResponseKind::Opaque => "opaque",
  }
}

fn kind_from_str(s: &str) -> ResponseKind {
  match s {
    "cors" => ResponseKind::Cors,
    "opaque" => ResponseKind::Opaque,
    _ => ResponseKind::Basic,
  }
}

#[async_trait]
impl PartitionStore for SqliteStore {
  async fn open(&self, partition: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;
    Ok(())
  }

  async fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<Response>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, status_text, headers, body, kind FROM entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} from {}: {}", key, partition, e))?;

    match row {
      Some((status, status_text, headers, body, kind)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(Response {
          status,
          status_text,
          headers,
          body,
          kind: kind_from_str(&kind),
        }))
      }
      None => Ok(None),
    }
  }

  async fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self.conn()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries
         (partition, key_hash, method, url, status, status_text, headers, body, kind, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        partition,
        key.cache_hash(),
        key.method,
        key.url,
        response.status,
        response.status_text,
        headers,
        response.body,
        kind_to_str(response.kind),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", key, partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  async fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM entries WHERE partition = ? AND key_hash = ?",
        params![partition, key.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete {} from {}: {}", key, partition, e))?;
    Ok(removed > 0)
  }

  async fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE partition = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| {
        Ok(RequestKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read keys of {}: {}", partition, e))?;

    Ok(keys)
  }

  async fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  async fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition names: {}", e))?;

    Ok(names)
  }
}

/// In-memory partition store.
/// Used for `--memory` runs and tests; contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
  partitions: Mutex<Vec<(String, Vec<(RequestKey, Response)>)>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn partitions(&self) -> Result<MutexGuard<'_, Vec<(String, Vec<(RequestKey, Response)>)>>> {
    self.partitions.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[async_trait]
impl PartitionStore for MemoryStore {
  async fn open(&self, partition: &str) -> Result<()> {
    let mut partitions = self.partitions()?;
    if !partitions.iter().any(|(name, _)| name == partition) {
      partitions.push((partition.to_string(), Vec::new()));
    }
    Ok(())
  }

  async fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<Response>> {
    let partitions = self.partitions()?;
    Ok(
      partitions
        .iter()
        .find(|(name, _)| name == partition)
        .and_then(|(_, entries)| entries.iter().find(|(k, _)| k == key))
        .map(|(_, response)| response.clone()),
    )
  }

  async fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut partitions = self.partitions()?;
    let index = match partitions.iter().position(|(name, _)| name == partition) {
      Some(index) => index,
      None => {
        partitions.push((partition.to_string(), Vec::new()));
        partitions.len() - 1
      }
    };

    let entries = &mut partitions[index].1;
    entries.retain(|(k, _)| k != key);
    entries.push((key.clone(), response.clone()));
    Ok(())
  }

  async fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool> {
    let mut partitions = self.partitions()?;
    let Some((_, entries)) = partitions.iter_mut().find(|(name, _)| name == partition) else {
      return Ok(false);
    };
    let before = entries.len();
    entries.retain(|(k, _)| k != key);
    Ok(entries.len() < before)
  }

  async fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let partitions = self.partitions()?;
    Ok(
      partitions
        .iter()
        .find(|(name, _)| name == partition)
        .map(|(_, entries)| entries.iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default(),
    )
  }

  async fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut partitions = self.partitions()?;
    let before = partitions.len();
    partitions.retain(|(name, _)| name != partition);
    Ok(partitions.len() < before)
  }

  async fn partition_names(&self) -> Result<Vec<String>> {
    Ok(
      self
        .partitions()?
        .iter()
        .map(|(name, _)| name.clone())
        .collect(),
    )
  }
}
