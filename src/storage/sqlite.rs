//! SQLite-backed ordered store
//!
//! One `kv` table with BLOB keys; SQLite compares BLOBs with memcmp, so key
//! order matches byte order and prefix scans are range queries.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{prefix_upper_bound, KeyValue, Store, WriteBatch};
use crate::error::StoreError;

pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent read access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn, Some(path))
    }

    /// A private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<&Path>) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            ) WITHOUT ROWID;",
        )?;
        if let Some(path) = path {
            info!(path = %path.display(), "SQLite store opened");
        }
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }
}

impl Store for SqliteStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT value FROM kv WHERE key = ?1")?;
            Ok(stmt.query_row([key], |row| row.get(0)).optional()?)
        })
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(())
        })
    }

    fn prefix(&self, prefix: &[u8]) -> Result<Vec<KeyValue>, StoreError> {
        self.with_conn(|conn| {
            let rows = match prefix_upper_bound(prefix) {
                Some(upper) => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key",
                    )?;
                    let rows = stmt
                        .query_map(params![prefix, upper], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<Result<Vec<KeyValue>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn
                        .prepare_cached("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key")?;
                    let rows = stmt
                        .query_map([prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<Result<Vec<KeyValue>, _>>()?;
                    rows
                }
            };
            Ok(rows)
        })
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let count = batch.len();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut upsert = tx.prepare_cached(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = ?2",
                )?;
                let mut remove = tx.prepare_cached("DELETE FROM kv WHERE key = ?1")?;
                for (key, value) in batch.iter() {
                    match value {
                        Some(value) => {
                            upsert.execute(params![key, value])?;
                        }
                        None => {
                            remove.execute([key])?;
                        }
                    }
                }
            }
            tx.commit()?;
            debug!(writes = count, "Committed batch");
            Ok(())
        })
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        }
        Ok(())
    }
}
