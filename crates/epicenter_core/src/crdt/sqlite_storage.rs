//! SQLite-backed storage implementation for document persistence.
//!
//! This module provides an embedded storage backend that keeps one snapshot
//! row per document.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};

use super::storage::{PersistenceProvider, StorageResult};

/// SQLite-backed snapshot storage.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    ///
    /// This will create the necessary tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or if schema
    /// initialization fails.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the storage is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> StorageResult<()> {
        self.conn().execute_batch(
            r#"
            -- Document snapshots (full state)
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl PersistenceProvider for SqliteStorage {
    fn load(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let state = self
            .conn()
            .query_row(
                "SELECT state FROM documents WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    fn save(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        let now = chrono::Utc::now().timestamp_millis();

        self.conn().execute(
            "INSERT OR REPLACE INTO documents (name, state, updated_at)
             VALUES (?, ?, ?)",
            params![name, state, now],
        )?;
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name FROM documents ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, Map, ReadTxn, StateVector, Transact};

    fn sample_state() -> Vec<u8> {
        let doc = Doc::new();
        let map = doc.get_or_insert_map("kv");
        {
            let mut txn = doc.transact_mut();
            map.insert(&mut txn, "theme", "dark");
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    #[test]
    fn test_sqlite_save_and_load() {
        let storage = SqliteStorage::in_memory().unwrap();
        let state = sample_state();

        storage.save("test", &state).unwrap();
        let loaded = storage.load("test").unwrap();

        assert_eq!(loaded, Some(state));
    }

    #[test]
    fn test_sqlite_load_nonexistent() {
        let storage = SqliteStorage::in_memory().unwrap();
        let loaded = storage.load("nonexistent").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_sqlite_list() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.save("doc2", b"data2").unwrap();
        storage.save("doc1", b"data1").unwrap();

        assert_eq!(storage.list().unwrap(), vec!["doc1", "doc2"]);
    }

    #[test]
    fn test_sqlite_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs.sqlite");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.save("blog-0", &sample_state()).unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert!(storage.load("blog-0").unwrap().is_some());
    }
}
