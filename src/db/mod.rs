//! Versioned local store with named collections.
//!
//! Every collection is a table of `(key, value)` rows where `value` is the
//! JSON-serialized record. Collections can declare extra indexed columns
//! (reviews are indexed by `restaurant_id`). All access goes through a
//! [`Tx`], so several reads and writes can share one transaction scope.

pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Primary key or index value of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
  Int(i64),
  Text(String),
}

impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Key::Int(n) => write!(f, "{}", n),
      Key::Text(s) => f.write_str(s),
    }
  }
}

impl From<i64> for Key {
  fn from(n: i64) -> Self {
    Key::Int(n)
  }
}

impl From<&str> for Key {
  fn from(s: &str) -> Self {
    Key::Text(s.to_string())
  }
}

impl From<String> for Key {
  fn from(s: String) -> Self {
    Key::Text(s)
  }
}

impl ToSql for Key {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    match self {
      Key::Int(n) => n.to_sql(),
      Key::Text(s) => s.to_sql(),
    }
  }
}

impl FromSql for Key {
  fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
    match value {
      ValueRef::Integer(n) => Ok(Key::Int(n)),
      ValueRef::Text(_) => String::column_result(value).map(Key::Text),
      _ => Err(FromSqlError::InvalidType),
    }
  }
}

/// Named collections known to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
  Restaurants,
  Reviews,
  Pending,
}

impl Collection {
  pub fn table(self) -> &'static str {
    match self {
      Collection::Restaurants => "restaurants",
      Collection::Reviews => "reviews",
      Collection::Pending => "pending",
    }
  }

  /// Secondary indexes, each backed by a column of the same name.
  pub fn indexes(self) -> &'static [&'static str] {
    match self {
      Collection::Reviews => &["restaurant_id"],
      Collection::Restaurants | Collection::Pending => &[],
    }
  }
}

/// A value that lives in one of the store's collections.
pub trait Record: Serialize + DeserializeOwned {
  fn collection() -> Collection;

  /// Primary key. `None` asks the collection to assign one.
  fn key(&self) -> Option<Key>;

  /// Value for a secondary index declared by the collection.
  fn index_value(&self, _index: &str) -> Option<Key> {
    None
  }

  /// Called after loading so records can carry their stored key.
  fn assign_key(&mut self, _key: Key) {}
}

/// Handle to the on-disk (or in-memory) database.
pub struct Store {
  conn: Mutex<Connection>,
  version: u32,
}

impl Store {
  /// Open the database at `path`, upgrading it to `version` with `migrate`.
  ///
  /// `migrate` receives the on-disk version and the requested version and is
  /// only called when the on-disk version is lower. It runs inside a single
  /// transaction together with the version bump.
  pub fn open<F>(path: &Path, version: u32, migrate: F) -> Result<Self>
  where
    F: FnOnce(&Connection, u32, u32) -> Result<()>,
  {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::init(conn, version, migrate)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory<F>(version: u32, migrate: F) -> Result<Self>
  where
    F: FnOnce(&Connection, u32, u32) -> Result<()>,
  {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::init(conn, version, migrate)
  }

  /// Open the database with the application schema.
  pub fn open_default(path: &Path) -> Result<Self> {
    Self::open(path, schema::VERSION, schema::upgrade)
  }

  /// Default database location under the user's data directory.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("restocache").join("cache.db"))
  }

  fn init<F>(mut conn: Connection, version: u32, migrate: F) -> Result<Self>
  where
    F: FnOnce(&Connection, u32, u32) -> Result<()>,
  {
    let current: u32 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read database version: {}", e))?;

    if current > version {
      return Err(eyre!(
        "Database version {} is newer than requested version {}",
        current,
        version
      ));
    }

    if current < version {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin migration: {}", e))?;
      migrate(&tx, current, version)?;
      tx.pragma_update(None, "user_version", version)
        .map_err(|e| eyre!("Failed to record database version: {}", e))?;
      tx.commit()
        .map_err(|e| eyre!("Failed to commit migration: {}", e))?;

      info!(from = current, to = version, "Upgraded local database");
    }

    Ok(Self {
      conn: Mutex::new(conn),
      version,
    })
  }

  /// Schema version this handle was opened with.
  pub fn version(&self) -> u32 {
    self.version
  }

  /// Run `f` inside one transaction. Commits when `f` returns `Ok`, rolls back otherwise.
  pub fn transaction<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Tx<'_>) -> Result<T>,
  {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let value = f(&Tx { conn: &tx })?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(value)
  }

  pub fn get<R: Record>(&self, key: &Key) -> Result<Option<R>> {
    self.transaction(|tx| tx.get(key))
  }

  pub fn put<R: Record>(&self, record: &R) -> Result<Key> {
    self.transaction(|tx| tx.put(record))
  }

  pub fn delete<R: Record>(&self, key: &Key) -> Result<bool> {
    self.transaction(|tx| tx.delete::<R>(key))
  }

  pub fn get_all<R: Record>(&self) -> Result<Vec<R>> {
    self.transaction(|tx| tx.get_all())
  }

  pub fn get_all_by_index<R: Record>(&self, index: &str, value: &Key) -> Result<Vec<R>> {
    self.transaction(|tx| tx.get_all_by_index(index, value))
  }

  pub fn count<R: Record>(&self) -> Result<usize> {
    self.transaction(|tx| tx.count::<R>())
  }
}

/// Operations available inside a transaction scope.
pub struct Tx<'a> {
  conn: &'a Connection,
}

impl<'a> Tx<'a> {
  /// Raw connection for tables that are not record collections.
  pub fn connection(&self) -> &'a Connection {
    self.conn
  }

  pub fn get<R: Record>(&self, key: &Key) -> Result<Option<R>> {
    let table = R::collection().table();
    let sql = format!("SELECT value FROM {} WHERE key = ?1", table);

    let value: Option<String> = self
      .conn
      .query_row(&sql, params![key], |row| row.get(0))
      .optional()
      .map_err(|e| eyre!("Failed to read {} {}: {}", table, key, e))?;

    value.map(|v| decode(key.clone(), &v)).transpose()
  }

  /// Insert or replace a record, returning its (possibly assigned) key.
  pub fn put<R: Record>(&self, record: &R) -> Result<Key> {
    let collection = R::collection();
    let value =
      serde_json::to_string(record).map_err(|e| eyre!("Failed to serialize record: {}", e))?;

    let mut columns = vec!["value"];
    let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(value)];

    let key = record.key();
    if let Some(ref key) = key {
      columns.push("key");
      values.push(Box::new(key.clone()));
    }
    for index in collection.indexes() {
      columns.push(*index);
      values.push(Box::new(record.index_value(index)));
    }

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
      "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
      collection.table(),
      columns.join(", "),
      placeholders.join(", ")
    );

    self
      .conn
      .execute(&sql, rusqlite::params_from_iter(values.iter()))
      .map_err(|e| eyre!("Failed to store {} record: {}", collection.table(), e))?;

    Ok(key.unwrap_or_else(|| Key::Int(self.conn.last_insert_rowid())))
  }

  pub fn delete<R: Record>(&self, key: &Key) -> Result<bool> {
    let table = R::collection().table();
    let sql = format!("DELETE FROM {} WHERE key = ?1", table);

    let removed = self
      .conn
      .execute(&sql, params![key])
      .map_err(|e| eyre!("Failed to delete {} {}: {}", table, key, e))?;

    Ok(removed > 0)
  }

  /// Every record in key order.
  pub fn get_all<R: Record>(&self) -> Result<Vec<R>> {
    let sql = format!("SELECT key, value FROM {} ORDER BY key", R::collection().table());
    self.query_records(&sql, &[])
  }

  /// Every record whose `index` column equals `value`, in key order.
  pub fn get_all_by_index<R: Record>(&self, index: &str, value: &Key) -> Result<Vec<R>> {
    let collection = R::collection();
    let index = collection
      .indexes()
      .iter()
      .find(|i| **i == index)
      .ok_or_else(|| eyre!("Collection {} has no index {}", collection.table(), index))?;

    let sql = format!(
      "SELECT key, value FROM {} WHERE {} = ?1 ORDER BY key",
      collection.table(),
      index
    );
    self.query_records(&sql, &[value as &dyn ToSql])
  }

  pub fn count<R: Record>(&self) -> Result<usize> {
    let sql = format!("SELECT COUNT(*) FROM {}", R::collection().table());
    let count: i64 = self
      .conn
      .query_row(&sql, [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count records: {}", e))?;
    Ok(count as usize)
  }

  /// Cursor positioned before the first record (lowest key).
  pub fn cursor<R: Record>(&self) -> Cursor<'a, R> {
    Cursor {
      conn: self.conn,
      position: None,
      current: None,
      _record: PhantomData,
    }
  }

  fn query_records<R: Record>(&self, sql: &str, args: &[&dyn ToSql]) -> Result<Vec<R>> {
    let mut stmt = self
      .conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(Key, String)> = stmt
      .query_map(args, |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query records: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read record row: {}", e))?;

    rows
      .into_iter()
      .map(|(key, value)| decode(key, &value))
      .collect()
  }
}

/// Sequential, key-ordered walk over a collection that can delete as it goes.
pub struct Cursor<'a, R> {
  conn: &'a Connection,
  position: Option<Key>,
  current: Option<Key>,
  _record: PhantomData<R>,
}

impl<R: Record> Cursor<'_, R> {
  /// Advance to the next record.
  ///
  /// If the row exists but cannot be decoded, the error is returned and the
  /// cursor still points at that row, so it can be removed with [`Cursor::delete`].
  pub fn next(&mut self) -> Result<Option<R>> {
    self.current = None;
    let table = R::collection().table();

    let row: Option<(Key, String)> = match &self.position {
      Some(after) => {
        let sql = format!(
          "SELECT key, value FROM {} WHERE key > ?1 ORDER BY key LIMIT 1",
          table
        );
        self
          .conn
          .query_row(&sql, params![after], |row| Ok((row.get(0)?, row.get(1)?)))
      }
      None => {
        let sql = format!("SELECT key, value FROM {} ORDER BY key LIMIT 1", table);
        self
          .conn
          .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
      }
    }
    .optional()
    .map_err(|e| eyre!("Failed to advance cursor over {}: {}", table, e))?;

    match row {
      Some((key, value)) => {
        self.position = Some(key.clone());
        self.current = Some(key.clone());
        decode(key, &value).map(Some)
      }
      None => Ok(None),
    }
  }

  /// Key of the record the cursor points at.
  pub fn key(&self) -> Option<&Key> {
    self.current.as_ref()
  }

  /// Delete the record the cursor points at.
  pub fn delete(&mut self) -> Result<()> {
    let key = self
      .current
      .take()
      .ok_or_else(|| eyre!("Cursor is not positioned on a record"))?;

    let sql = format!("DELETE FROM {} WHERE key = ?1", R::collection().table());
    self
      .conn
      .execute(&sql, params![key])
      .map_err(|e| eyre!("Failed to delete record {} at cursor: {}", key, e))?;

    Ok(())
  }
}

fn decode<R: Record>(key: Key, value: &str) -> Result<R> {
  let mut record: R = serde_json::from_str(value).map_err(|e| {
    eyre!(
      "Failed to deserialize {} record {}: {}",
      R::collection().table(),
      key,
      e
    )
  })?;
  record.assign_key(key);
  Ok(record)
}
