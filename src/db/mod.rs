use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, SyncError};

/// Schema for the key-value table.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Persistent key-value store for client-side state.
///
/// Values are JSON documents; each key holds exactly one document.
pub struct LocalStore {
  conn: Mutex<Connection>,
}

impl LocalStore {
  /// Open or create the store at the default location
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open or create the store at `path`
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::Storage(format!("Failed to create store directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::Storage(format!("Failed to open store at {}: {}", path.display(), e))
    })?;

    Self::with_connection(conn)
  }

  /// Store that lives only as long as the process
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default store path
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Storage("Could not determine data directory".into()))?;

    Ok(data_dir.join("inmo").join("local.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(SCHEMA)
      .map_err(|e| SyncError::Storage(format!("Failed to run migrations: {}", e)))
  }

  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let conn = self.conn()?;
    let raw: Option<String> = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;

    match raw {
      Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
      None => Ok(None),
    }
  }

  pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    self.conn()?.execute(
      "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))
       ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
      params![key, raw],
    )?;
    Ok(())
  }

  pub fn remove(&self, key: &str) -> Result<bool> {
    let removed = self
      .conn()?
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(removed > 0)
  }

  /// Read-modify-write `key` under one lock.
  pub fn update<T, R, F>(&self, key: &str, f: F) -> Result<R>
  where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(&mut T) -> Result<R>,
  {
    let conn = self.conn()?;
    let tx = conn.unchecked_transaction()?;

    let raw: Option<String> = tx
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    let mut value: T = match raw {
      Some(raw) => serde_json::from_str(&raw)?,
      None => T::default(),
    };

    let result = f(&mut value)?;

    tx.execute(
      "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))
       ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
      params![key, serde_json::to_string(&value)?],
    )?;
    tx.commit()?;
    Ok(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_get_remove() {
    let store = LocalStore::open_in_memory().unwrap();
    assert_eq!(store.get::<Vec<String>>("k").unwrap(), None);

    store.set("k", &vec!["a".to_string()]).unwrap();
    store.set("k", &vec!["b".to_string()]).unwrap();
    assert_eq!(store.get::<Vec<String>>("k").unwrap(), Some(vec!["b".to_string()]));

    assert!(store.remove("k").unwrap());
    assert!(!store.remove("k").unwrap());
  }

  #[test]
  fn test_update_rolls_back_on_error() {
    let store = LocalStore::open_in_memory().unwrap();
    store.set("n", &vec![1]).unwrap();

    let result: Result<()> = store.update::<Vec<i32>, _, _>("n", |v| {
      v.push(2);
      Err(SyncError::Validation("nope".into()))
    });
    assert!(result.is_err());
    assert_eq!(store.get::<Vec<i32>>("n").unwrap(), Some(vec![1]));

    let len = store
      .update::<Vec<i32>, _, _>("n", |v| {
        v.push(3);
        Ok(v.len())
      })
      .unwrap();
    assert_eq!(len, 2);
    assert_eq!(store.get::<Vec<i32>>("n").unwrap(), Some(vec![1, 3]));
  }

  #[test]
  fn test_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("local.db");

    {
      let store = LocalStore::open_at(&path).unwrap();
      store.set("session", &"abc").unwrap();
    }

    let store = LocalStore::open_at(&path).unwrap();
    assert_eq!(store.get::<String>("session").unwrap().as_deref(), Some("abc"));
  }
}
