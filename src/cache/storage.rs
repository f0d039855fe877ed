//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::sync::{Mutex, MutexGuard};
use url::Url;

use crate::net::HttpResponse;

/// A stored response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: HttpResponse,
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Entries live inside named generations. Only GET responses are stored, so an
/// entry is identified by its absolute URL alone.
pub trait CacheStorage: Send + Sync {
  /// Create the generation if needed. Returns true when it was created.
  fn open_generation(&self, name: &str) -> Result<bool>;

  /// All generation names, oldest first.
  fn generations(&self) -> Result<Vec<String>>;

  /// Remove a generation and all its entries. Returns false if it didn't exist.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  fn lookup(&self, generation: &str, url: &str) -> Result<Option<CachedEntry>>;

  /// Insert or replace one entry (last write wins).
  fn store(&self, generation: &str, url: &str, response: &HttpResponse) -> Result<()>;

  /// Insert or replace several entries atomically.
  fn store_all(&self, generation: &str, entries: &[(String, HttpResponse)]) -> Result<()>;

  fn entry_count(&self, generation: &str) -> Result<usize>;
}

/// Response headers that belong to the exchange that produced them and are
/// never replayed from the cache.
const UNCACHED_HEADERS: &[&str] = &["set-cookie", "set-cookie2"];

/// Stable, fixed-length key for a GET of `url`.
pub fn request_key(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(b"GET ");
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// Absolute form of `url` against `origin`, used as the cache identity.
pub fn cache_url(origin: &Url, url: &str) -> Option<String> {
  origin.join(url).ok().map(|u| u.to_string())
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  pub fn new(conn: Connection) -> Self {
    Self {
      conn: Mutex::new(conn),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn insert_entry(conn: &Connection, generation: &str, url: &str, response: &HttpResponse) -> Result<()> {
  let headers: Vec<&(String, String)> = response
    .headers
    .iter()
    .filter(|(name, _)| !UNCACHED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)))
    .collect();
  let headers = serde_json::to_string(&headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to open generation {}: {}", generation, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (generation, request_hash, method, url, status, headers, body, cached_at)
       VALUES (?, ?, 'GET', ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        request_key(url),
        url,
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", url, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_generation(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let created = conn
      .execute(
        "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open generation {}: {}", name, e))?;
    Ok(created == 1)
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY created_at, rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<Result<Vec<String>, _>>()
      .map_err(|e| eyre!("Failed to read generation: {}", e))?;
    Ok(names)
  }

  fn delete_generation(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE generation = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let deleted = tx
      .execute("DELETE FROM cache_generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(deleted == 1)
  }

  fn lookup(&self, generation: &str, url: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE generation = ? AND request_hash = ?",
        params![generation, request_key(url)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", url, e))?;

    let Some((status, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let headers = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", url, e))?;
    Ok(Some(CachedEntry {
      response: HttpResponse {
        status,
        headers,
        body,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn store(&self, generation: &str, url: &str, response: &HttpResponse) -> Result<()> {
    let conn = self.lock()?;
    insert_entry(&conn, generation, url, response)
  }

  fn store_all(&self, generation: &str, entries: &[(String, HttpResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (url, response) in entries {
      insert_entry(&tx, generation, url, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", generation, e))?;
    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
