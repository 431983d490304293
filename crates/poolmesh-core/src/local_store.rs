//! Local embedded key-value store
//!
//! Backs guards' last-seen mtimes, feed discovery cursors, and the
//! keystore's local cache. Spec.md §1 keeps the relational cache of
//! application metadata out of scope ("any embedded table store will do");
//! this is the minimal concrete store the core's own bookkeeping needs to
//! be testable end to end. One SQLite connection per process, WAL mode,
//! shared across pools (spec.md §6 "Process-wide state").

use crate::errors::Result;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

/// Thin wrapper around a single SQLite connection holding one `kv` table,
/// keyed by `(scope, key)`.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open (creating if absent) a local store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// An in-memory store, used by tests and ephemeral pools.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS kv (
                 scope TEXT NOT NULL,
                 key   TEXT NOT NULL,
                 value BLOB NOT NULL,
                 updated_at_ms INTEGER NOT NULL,
                 PRIMARY KEY (scope, key)
             );",
        )?;
        Ok(())
    }

    /// Store raw bytes under `(scope, key)`, overwriting any prior value.
    pub fn put(&self, scope: &str, key: &str, value: &[u8]) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock().expect("local store mutex poisoned");
        conn.execute(
            "INSERT INTO kv (scope, key, value, updated_at_ms) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
            params![scope, key, value, now],
        )?;
        Ok(())
    }

    /// Fetch raw bytes stored under `(scope, key)`, if present.
    pub fn get(&self, scope: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("local store mutex poisoned");
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE scope = ?1 AND key = ?2")?;
        let mut rows = stmt.query(params![scope, key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Delete a single entry, if present. Idempotent.
    pub fn delete(&self, scope: &str, key: &str) -> Result<()> {
        let conn = self.conn.lock().expect("local store mutex poisoned");
        conn.execute("DELETE FROM kv WHERE scope = ?1 AND key = ?2", params![scope, key])?;
        Ok(())
    }

    /// Delete every entry in a scope. Used by `Pool::leave`.
    pub fn clear_scope(&self, scope: &str) -> Result<()> {
        let conn = self.conn.lock().expect("local store mutex poisoned");
        conn.execute("DELETE FROM kv WHERE scope = ?1", params![scope])?;
        Ok(())
    }

    /// List all keys present in a scope, sorted ascending.
    pub fn list_keys(&self, scope: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("local store mutex poisoned");
        let mut stmt = conn.prepare("SELECT key FROM kv WHERE scope = ?1 ORDER BY key ASC")?;
        let rows = stmt.query_map(params![scope], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    /// Convenience helper storing/reading JSON-serializable values.
    pub fn put_json<T: serde::Serialize>(&self, scope: &str, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(scope, key, &bytes)
    }

    /// Convenience helper reading JSON-serializable values.
    pub fn get_json<T: serde::de::DeserializeOwned>(&self, scope: &str, key: &str) -> Result<Option<T>> {
        match self.get(scope, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
