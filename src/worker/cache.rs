//! Named, generation-versioned response caches.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::http::{Response, ResponseKind};

/// Logical caches the worker keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
  /// App shell and other precached documents
  Critical,
  /// Same-origin assets and map tiles picked up at runtime
  Dynamic,
  /// Allow-listed backend GET responses
  Api,
}

impl CacheKind {
  pub const ALL: [CacheKind; 3] = [CacheKind::Critical, CacheKind::Dynamic, CacheKind::Api];

  fn prefix(&self) -> &'static str {
    match self {
      CacheKind::Critical => "critical",
      CacheKind::Dynamic => "dynamic",
      CacheKind::Api => "api",
    }
  }
}

/// The cache names of one deployment generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSet {
  generation: u32,
}

impl CacheSet {
  pub fn new(generation: u32) -> Self {
    Self { generation }
  }

  pub fn generation(&self) -> u32 {
    self.generation
  }

  pub fn name(&self, kind: CacheKind) -> String {
    format!("{}-v{}", kind.prefix(), self.generation)
  }

  pub fn current_names(&self) -> Vec<String> {
    CacheKind::ALL.iter().map(|k| self.name(*k)).collect()
  }

  pub fn is_current(&self, name: &str) -> bool {
    CacheKind::ALL.iter().any(|k| self.name(*k) == name)
  }
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub url: String,
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

const HTTP_CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS responses (
    cache_name TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    kind TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, url_hash)
);
"#;

/// Response storage keyed by cache name and request URL.
pub struct HttpCache {
  conn: Mutex<Connection>,
}

impl HttpCache {
  pub fn open(dir: &Path) -> Result<Self> {
    std::fs::create_dir_all(dir)
      .map_err(|e| eyre!("Failed to create cache directory {}: {}", dir.display(), e))?;

    let path = dir.join("http-cache.db");
    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open HTTP cache at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory HTTP cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(HTTP_CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run HTTP cache migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Store a response, replacing any earlier one for the same URL.
  pub fn put(&self, cache_name: &str, url: &Url, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO responses
         (cache_name, url_hash, url, status, headers, body, kind, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          cache_name,
          url_hash(url),
          url.as_str(),
          response.status,
          headers,
          response.body,
          response.kind.as_str(),
        ],
      )
      .map_err(|e| eyre!("Failed to cache {} in {}: {}", url, cache_name, e))?;

    Ok(())
  }

  pub fn match_in(&self, cache_name: &str, url: &Url) -> Result<Option<Response>> {
    Ok(self.lookup(cache_name, url)?.map(|cached| cached.response))
  }

  /// First match across `cache_names`, searched in order.
  pub fn match_any(&self, cache_names: &[String], url: &Url) -> Result<Option<Response>> {
    for name in cache_names {
      if let Some(response) = self.match_in(name, url)? {
        return Ok(Some(response));
      }
    }
    Ok(None)
  }

  fn lookup(&self, cache_name: &str, url: &Url) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT url, status, headers, body, kind, cached_at FROM responses
         WHERE cache_name = ? AND url_hash = ?",
        params![cache_name, url_hash(url)],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u16>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Vec<u8>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query {}: {}", cache_name, e))?;

    row.map(decode_row).transpose()
  }

  /// Names of every cache holding at least one response.
  pub fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM responses ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache names: {}", e))?;
    Ok(names)
  }

  /// Drop a whole cache. Returns the number of responses removed.
  pub fn delete_cache(&self, cache_name: &str) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM responses WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))
  }

  pub fn entries(&self, cache_name: &str) -> Result<Vec<CachedResponse>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT url, status, headers, body, kind, cached_at FROM responses
         WHERE cache_name = ? ORDER BY url",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![cache_name], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, u16>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Vec<u8>>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, String>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query {}: {}", cache_name, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read {}: {}", cache_name, e))?;

    rows.into_iter().map(decode_row).collect()
  }
}

type ResponseRow = (String, u16, String, Vec<u8>, String, String);

fn decode_row((url, status, headers, body, kind, cached_at): ResponseRow) -> Result<CachedResponse> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;

  Ok(CachedResponse {
    response: Response {
      status,
      headers,
      body,
      kind: ResponseKind::parse(&kind),
    },
    cached_at: parse_datetime(&cached_at)?,
    url,
  })
}

/// Stable, fixed-length key for a request URL.
fn url_hash(url: &Url) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
