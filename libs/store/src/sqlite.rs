//! SQLite backend.
//!
//! One table of `(key, value, updated_at)`. The connection is shared behind
//! an async mutex; statements are short and run inline.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{KeyGuard, LockTable, ResourceStore, StoreError};

/// A [`ResourceStore`] persisted to a single SQLite file.
///
/// Key locks are process-local; agents sharing one file from several
/// processes rely on single-writer ownership instead.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    locks: LockTable,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL lets readers in other agents proceed during a write
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Resource store schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
            locks: LockTable::new(),
        })
    }
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM resources WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;

        let entries = stmt
            .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT value FROM resources WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO resources (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, now],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM resources WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn lock(&self, key: &str) -> KeyGuard {
        self.locks.lock(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let store = SqliteStore::open_in_memory().unwrap();

        store.put("node/n1", b"a".to_vec()).await.unwrap();
        assert_eq!(store.get("node/n1").await.unwrap(), b"a".to_vec());

        store.put("node/n1", b"b".to_vec()).await.unwrap();
        assert_eq!(store.get("node/n1").await.unwrap(), b"b".to_vec());
    }

    #[tokio::test]
    async fn test_list_prefix_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("namespace/g1/a", b"1".to_vec()).await.unwrap();
        store.put("namespace/g1/b", b"2".to_vec()).await.unwrap();
        store.put("namespace/g2/c", b"3".to_vec()).await.unwrap();

        let keys: Vec<_> = store
            .list("namespace/g1/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["namespace/g1/a", "namespace/g1/b"]);

        store.delete("namespace/g1/a").await.unwrap();
        assert!(store.get("namespace/g1/a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_prefix_with_like_wildcards_is_literal() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("group/a_b", b"1".to_vec()).await.unwrap();
        store.put("group/axb", b"2".to_vec()).await.unwrap();

        let listed = store.list("group/a_").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "group/a_b");
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("group/g1", b"{}".to_vec()).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("group/g1").await.unwrap(), b"{}".to_vec());
    }
}
