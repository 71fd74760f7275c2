//! SQLite implementation of the local store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use rusqlite::{params, Connection, OptionalExtension, ToSql, Transaction};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::schema::{DatabaseSpec, PartitionSpec};
use super::traits::{Key, LocalStore};

impl ToSql for Key {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    Ok(match self {
      Key::Int(i) => ToSqlOutput::from(*i),
      Key::Text(s) => ToSqlOutput::from(s.as_str()),
    })
  }
}

/// SQLite-backed store for one database.
///
/// Each partition is a table holding JSON records. Secondary indexes are
/// expression indexes over `json_extract`. The schema version lives in
/// `PRAGMA user_version`.
pub struct SqliteStore {
  spec: &'static DatabaseSpec,
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the database file for `spec` inside `dir`.
  pub fn open(dir: &Path, spec: &'static DatabaseSpec) -> Result<Self> {
    std::fs::create_dir_all(dir)
      .map_err(|e| eyre!("Failed to create store directory {}: {}", dir.display(), e))?;

    let path = dir.join(spec.file_name());
    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn, spec)
  }

  pub fn open_in_memory(spec: &'static DatabaseSpec) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database {}: {}", spec.name, e))?;
    Self::with_connection(conn, spec)
  }

  fn with_connection(mut conn: Connection, spec: &'static DatabaseSpec) -> Result<Self> {
    upgrade(&mut conn, spec)?;
    Ok(Self {
      spec,
      conn: Mutex::new(conn),
    })
  }

  /// Schema version currently stored in the database.
  pub fn version(&self) -> Result<u32> {
    let conn = self.lock()?;
    read_version(&conn)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn partition(&self, name: &str) -> Result<&'static PartitionSpec> {
    self
      .spec
      .partition(name)
      .ok_or_else(|| eyre!("Unknown partition '{}' in database {}", name, self.spec.name))
  }
}

fn read_version(conn: &Connection) -> Result<u32> {
  conn
    .pragma_query_value(None, "user_version", |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))
}

/// Bring the database up to `spec.version`.
///
/// Runs only when the stored version is older. Every statement checks for
/// existence first, so re-running an upgrade is harmless.
fn upgrade(conn: &mut Connection, spec: &DatabaseSpec) -> Result<()> {
  let current = read_version(conn)?;

  if current > spec.version {
    return Err(eyre!(
      "Database {} is at schema version {}, newer than supported version {}",
      spec.name,
      current,
      spec.version
    ));
  }
  if current == spec.version {
    return Ok(());
  }

  let tx = conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin upgrade transaction: {}", e))?;

  for partition in spec.active_partitions() {
    tx.execute_batch(&partition_schema(partition))
      .map_err(|e| eyre!("Failed to create partition {}: {}", partition.name, e))?;
  }

  tx.pragma_update(None, "user_version", spec.version)
    .map_err(|e| eyre!("Failed to record schema version: {}", e))?;
  tx.commit()
    .map_err(|e| eyre!("Failed to commit upgrade: {}", e))?;

  info!(
    database = spec.name,
    from = current,
    to = spec.version,
    "Upgraded local store schema"
  );
  Ok(())
}

fn table(partition: &PartitionSpec) -> String {
  format!("part_{}", partition.name)
}

fn partition_schema(partition: &PartitionSpec) -> String {
  let table = table(partition);
  let key_column = if partition.auto_increment {
    "key INTEGER PRIMARY KEY AUTOINCREMENT"
  } else {
    "key NOT NULL PRIMARY KEY"
  };

  let mut sql = format!(
    "CREATE TABLE IF NOT EXISTS {} ({}, value TEXT NOT NULL);\n",
    table, key_column
  );
  for index in partition.indexes {
    sql.push_str(&format!(
      "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {} (json_extract(value, '$.{}'));\n",
      partition.name, index.name, table, index.key_path
    ));
  }
  sql
}

/// Convert a JSON index query into something SQLite compares equal to the
/// result of `json_extract`.
fn index_query(query: &Value) -> Result<SqlValue> {
  match query {
    Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
    Value::Number(n) => n
      .as_i64()
      .map(SqlValue::Integer)
      .or_else(|| n.as_f64().map(SqlValue::Real))
      .ok_or_else(|| eyre!("Unsupported numeric index query: {}", n)),
    Value::String(s) => Ok(SqlValue::Text(s.clone())),
    other => Err(eyre!("Unsupported index query: {}", other)),
  }
}

fn decode(data: &str) -> Result<Value> {
  serde_json::from_str(data).map_err(|e| eyre!("Failed to deserialize record: {}", e))
}

/// Read one record using an open connection or transaction.
fn read_record(conn: &Connection, part: &PartitionSpec, key: &Key) -> Result<Option<Value>> {
  let data: Option<String> = conn
    .query_row(
      &format!("SELECT value FROM {} WHERE key = ?", table(part)),
      params![key],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to read {}/{}: {}", part.name, key, e))?;

  data.as_deref().map(decode).transpose()
}

/// Insert or replace a record inside `tx`, assigning a key when needed.
fn write_record(
  tx: &Transaction<'_>,
  part: &PartitionSpec,
  key: Option<Key>,
  mut value: Value,
) -> Result<Key> {
  let existing_key = {
    let record = value
      .as_object_mut()
      .ok_or_else(|| eyre!("Records in {} must be JSON objects", part.name))?;
    if let Some(key) = key {
      record.insert(part.key_path.to_string(), key.to_json());
    }
    match record.get(part.key_path) {
      None | Some(Value::Null) => None,
      Some(v) => Some(Key::from_json(v).ok_or_else(|| {
        eyre!("Invalid key '{}' for {}.{}", v, part.name, part.key_path)
      })?),
    }
  };

  let table = table(part);
  match existing_key {
    Some(key) => {
      tx.execute(
        &format!("INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)", table),
        params![key, value.to_string()],
      )
      .map_err(|e| eyre!("Failed to store {}/{}: {}", part.name, key, e))?;
      Ok(key)
    }
    None if part.auto_increment => {
      tx.execute(
        &format!("INSERT INTO {} (value) VALUES ('{{}}')", table),
        [],
      )
      .map_err(|e| eyre!("Failed to allocate key in {}: {}", part.name, e))?;
      let key = Key::Int(tx.last_insert_rowid());
      value[part.key_path] = key.to_json();
      tx.execute(
        &format!("UPDATE {} SET value = ? WHERE key = ?", table),
        params![value.to_string(), key],
      )
      .map_err(|e| eyre!("Failed to store {}/{}: {}", part.name, key, e))?;
      Ok(key)
    }
    None => Err(eyre!(
      "Record for {} is missing key '{}'",
      part.name,
      part.key_path
    )),
  }
}

impl LocalStore for SqliteStore {
  fn name(&self) -> &str {
    self.spec.name
  }

  fn get(&self, partition: &str, key: &Key) -> Result<Option<Value>> {
    let part = self.partition(partition)?;
    let conn = self.lock()?;
    read_record(&conn, part, key)
  }

  fn put(&self, partition: &str, key: Option<Key>, value: Value) -> Result<Key> {
    let part = self.partition(partition)?;
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let key = write_record(&tx, part, key, value)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(database = self.spec.name, partition = part.name, %key, "Stored record");
    Ok(key)
  }

  fn update(
    &self,
    partition: &str,
    key: &Key,
    f: &mut dyn FnMut(Option<Value>) -> Result<Option<Value>>,
  ) -> Result<bool> {
    let part = self.partition(partition)?;
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let current = read_record(&tx, part, key)?;
    let Some(replacement) = f(current)? else {
      return Ok(false);
    };
    write_record(&tx, part, Some(key.clone()), replacement)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(database = self.spec.name, partition = part.name, %key, "Updated record");
    Ok(true)
  }

  fn transfer(&self, from: &str, key: &Key, to: &str, value: Value) -> Result<Key> {
    let source = self.partition(from)?;
    let target = self.partition(to)?;
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let new_key = write_record(&tx, target, None, value)?;
    tx.execute(
      &format!("DELETE FROM {} WHERE key = ?", table(source)),
      params![key],
    )
    .map_err(|e| eyre!("Failed to delete {}/{}: {}", source.name, key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(database = self.spec.name, from = source.name, to = target.name, %key, "Moved record");
    Ok(new_key)
  }

  fn get_all(&self, partition: &str) -> Result<Vec<Value>> {
    let part = self.partition(partition)?;
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!("SELECT value FROM {} ORDER BY key", table(part)))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query {}: {}", part.name, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read {}: {}", part.name, e))?;

    rows.iter().map(|data| decode(data)).collect()
  }

  fn get_all_by_index(&self, partition: &str, index: &str, query: &Value) -> Result<Vec<Value>> {
    let part = self.partition(partition)?;
    let index = part
      .index(index)
      .ok_or_else(|| eyre!("Unknown index '{}' on partition {}", index, part.name))?;
    let query = index_query(query)?;
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT value FROM {} WHERE json_extract(value, '$.{}') = ? ORDER BY key",
        table(part),
        index.key_path
      ))
      .map_err(|e| eyre!("Failed to prepare index query: {}", e))?;

    let rows: Vec<String> = stmt
      .query_map(params![query], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query {}.{}: {}", part.name, index.name, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read {}: {}", part.name, e))?;

    rows.iter().map(|data| decode(data)).collect()
  }

  fn delete(&self, partition: &str, key: &Key) -> Result<()> {
    let part = self.partition(partition)?;
    let conn = self.lock()?;

    conn
      .execute(
        &format!("DELETE FROM {} WHERE key = ?", table(part)),
        params![key],
      )
      .map_err(|e| eyre!("Failed to delete {}/{}: {}", part.name, key, e))?;

    Ok(())
  }

  fn count(&self, partition: &str) -> Result<usize> {
    let part = self.partition(partition)?;
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(&format!("SELECT COUNT(*) FROM {}", table(part)), [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count {}: {}", part.name, e))?;

    Ok(count as usize)
  }
}
