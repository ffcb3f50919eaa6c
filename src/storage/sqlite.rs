//! SQLite implementation of the offline storage contract.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheEntry, Collection, Storage, StoredRecord};
use crate::notifications::Notification;

/// SQLite-based storage for records, response caches, notifications and metadata.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fieldlink").join("fieldlink.db"))
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for all offline tables.
const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named record collections (farms, crops, messages, pendingChanges)
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    record_key TEXT NOT NULL,
    position INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (collection, record_key)
);

CREATE INDEX IF NOT EXISTS idx_records_position
    ON records(collection, position);

-- Monotonic counters; never reset by clear
CREATE TABLE IF NOT EXISTS collection_seq (
    collection TEXT PRIMARY KEY,
    last_value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS caches (
    cache_name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    captured_at TEXT NOT NULL,
    PRIMARY KEY (cache_name, url),
    FOREIGN KEY (cache_name) REFERENCES caches(cache_name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_url ON cache_entries(url);

CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL,
    data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl Storage for SqliteStorage {
  fn replace_all(&self, collection: Collection, records: &[Value]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM records WHERE collection = ?",
      params![collection.name()],
    )
    .map_err(|e| eyre!("Failed to clear {}: {}", collection, e))?;

    for record in records {
      insert_record(&tx, collection, record)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get_all(&self, collection: Collection) -> Result<Vec<StoredRecord>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT record_key, data FROM records
         WHERE collection = ?
         ORDER BY position",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>)> = stmt
      .query_map(params![collection.name()], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query {}: {}", collection, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read {}: {}", collection, e))?;

    rows
      .into_iter()
      .map(|(key, data)| {
        let data = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize {} record {}: {}", collection, key, e))?;
        Ok(StoredRecord { key, data })
      })
      .collect()
  }

  fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
    let conn = self.conn()?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM records WHERE collection = ? AND record_key = ?",
        params![collection.name(), key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} {}: {}", collection, key, e))?;

    data
      .map(|d| {
        serde_json::from_slice(&d).map_err(|e| eyre!("Failed to deserialize record: {}", e))
      })
      .transpose()
  }

  fn append(&self, collection: Collection, record: &Value) -> Result<String> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let key = insert_record(&tx, collection, record)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(key)
  }

  fn remove_keys(&self, collection: Collection, keys: &[String]) -> Result<usize> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut removed = 0;
    for key in keys {
      removed += tx
        .execute(
          "DELETE FROM records WHERE collection = ? AND record_key = ?",
          params![collection.name(), key],
        )
        .map_err(|e| eyre!("Failed to remove {} {}: {}", collection, key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed)
  }

  fn clear(&self, collection: Collection) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "DELETE FROM records WHERE collection = ?",
        params![collection.name()],
      )
      .map_err(|e| eyre!("Failed to clear {}: {}", collection, e))?;

    Ok(())
  }

  fn cache_put(&self, entry: &CacheEntry) -> Result<()> {
    self.cache_put_all(std::slice::from_ref(entry))
  }

  fn cache_put_all(&self, entries: &[CacheEntry]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for entry in entries {
      tx.execute(
        "INSERT OR IGNORE INTO caches (cache_name, created_at) VALUES (?, ?)",
        params![entry.cache_name, format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", entry.cache_name, e))?;

      tx.execute(
        "INSERT INTO cache_entries (cache_name, url, status, content_type, body, captured_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(cache_name, url) DO UPDATE SET
           status = excluded.status,
           content_type = excluded.content_type,
           body = excluded.body,
           captured_at = excluded.captured_at
         WHERE excluded.captured_at >= cache_entries.captured_at",
        params![
          entry.cache_name,
          entry.url,
          entry.status,
          entry.content_type,
          entry.body,
          format_datetime(entry.captured_at)
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", entry.url, entry.cache_name, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn cache_match(&self, cache_name: Option<&str>, url: &str) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;

    let row = conn
      .query_row(
        "SELECT cache_name, url, status, content_type, body, captured_at FROM cache_entries
         WHERE url = ?1 AND (?2 IS NULL OR cache_name = ?2)
         ORDER BY captured_at DESC
         LIMIT 1",
        params![url, cache_name],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, u16>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Vec<u8>>(4)?,
            row.get::<_, String>(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {} in cache: {}", url, e))?;

    match row {
      Some((cache_name, url, status, content_type, body, captured_at)) => Ok(Some(CacheEntry {
        cache_name,
        url,
        status,
        content_type,
        body,
        captured_at: parse_datetime(&captured_at)?,
      })),
      None => Ok(None),
    }
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT cache_name FROM caches ORDER BY created_at, cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache names: {}", e))?;

    Ok(names)
  }

  fn cache_delete(&self, cache_name: &str) -> Result<bool> {
    let conn = self.conn()?;

    // Entries go with the cache row via ON DELETE CASCADE
    let deleted = conn
      .execute(
        "DELETE FROM caches WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))?;

    Ok(deleted > 0)
  }

  fn notifications_load(&self) -> Result<Vec<Notification>> {
    let conn = self.conn()?;
    load_notifications(&conn)
  }

  fn notification_put_front(&self, notification: &Notification) -> Result<()> {
    let conn = self.conn()?;
    let data = serde_json::to_vec(notification)
      .map_err(|e| eyre!("Failed to serialize notification: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO notifications (id, seq, data)
         VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM notifications), ?)",
        params![notification.id, data],
      )
      .map_err(|e| eyre!("Failed to store notification {}: {}", notification.id, e))?;

    Ok(())
  }

  fn notifications_mark_read(&self, id: Option<&str>) -> Result<usize> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let unread: Vec<Notification> = load_notifications(&tx)?
      .into_iter()
      .filter(|n| !n.read && id.map_or(true, |id| n.id == id))
      .collect();

    for mut notification in unread.iter().cloned() {
      notification.read = true;
      let data = serde_json::to_vec(&notification)
        .map_err(|e| eyre!("Failed to serialize notification: {}", e))?;
      tx.execute(
        "UPDATE notifications SET data = ? WHERE id = ?",
        params![data, notification.id],
      )
      .map_err(|e| eyre!("Failed to update notification {}: {}", notification.id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(unread.len())
  }

  fn notification_remove(&self, id: &str) -> Result<bool> {
    let conn = self.conn()?;

    let deleted = conn
      .execute("DELETE FROM notifications WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove notification {}: {}", id, e))?;

    Ok(deleted > 0)
  }

  fn notifications_clear(&self) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute("DELETE FROM notifications", [])
      .map_err(|e| eyre!("Failed to clear notifications: {}", e))?;

    Ok(())
  }

  fn meta_get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn()?;

    conn
      .query_row(
        "SELECT value FROM meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read metadata {}: {}", key, e))
  }

  fn meta_set(&self, key: &str, value: Option<&str>) -> Result<()> {
    let conn = self.conn()?;

    match value {
      Some(value) => conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        params![key, value],
      ),
      None => conn.execute("DELETE FROM meta WHERE key = ?", params![key]),
    }
    .map_err(|e| eyre!("Failed to write metadata {}: {}", key, e))?;

    Ok(())
  }
}

/// Insert one record at the end of its collection. Returns the record key.
fn insert_record(tx: &Transaction<'_>, collection: Collection, record: &Value) -> Result<String> {
  let seq = next_seq(tx, collection)?;

  let (key, record) = match record.get("id") {
    Some(Value::String(s)) => (s.clone(), record.clone()),
    Some(Value::Number(n)) => (n.to_string(), record.clone()),
    Some(Value::Null) | None if collection.auto_key() => {
      let mut record = record.clone();
      match record.as_object_mut() {
        Some(map) => {
          map.insert("id".to_string(), Value::from(seq));
        }
        None => return Err(eyre!("Records in {} must be JSON objects", collection)),
      }
      (seq.to_string(), record)
    }
    _ => return Err(eyre!("Record in {} has no usable id", collection)),
  };

  let data = serde_json::to_vec(&record).map_err(|e| eyre!("Failed to serialize record: {}", e))?;

  tx.execute(
    "INSERT INTO records (collection, record_key, position, data) VALUES (?, ?, ?, ?)",
    params![collection.name(), key, seq, data],
  )
  .map_err(|e| eyre!("Failed to store {} record {}: {}", collection, key, e))?;

  Ok(key)
}

fn next_seq(tx: &Transaction<'_>, collection: Collection) -> Result<i64> {
  tx.execute(
    "INSERT INTO collection_seq (collection, last_value) VALUES (?1, 1)
     ON CONFLICT(collection) DO UPDATE SET last_value = last_value + 1",
    params![collection.name()],
  )
  .map_err(|e| eyre!("Failed to advance sequence for {}: {}", collection, e))?;

  tx.query_row(
    "SELECT last_value FROM collection_seq WHERE collection = ?",
    params![collection.name()],
    |row| row.get(0),
  )
  .map_err(|e| eyre!("Failed to read sequence for {}: {}", collection, e))
}

fn load_notifications(conn: &Connection) -> Result<Vec<Notification>> {
  let mut stmt = conn
    .prepare("SELECT data FROM notifications ORDER BY seq DESC")
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let rows: Vec<Vec<u8>> = stmt
    .query_map([], |row| row.get(0))
    .map_err(|e| eyre!("Failed to query notifications: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read notifications: {}", e))?;

  rows
    .iter()
    .map(|data| {
      serde_json::from_slice(data).map_err(|e| eyre!("Failed to deserialize notification: {}", e))
    })
    .collect()
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
