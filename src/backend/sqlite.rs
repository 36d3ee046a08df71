//! SQLite backend for single-host deployments

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{BackendError, CacheBackend};

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open or create the cache database
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BackendError::Io(e.to_string()))?;
        }

        let conn = Connection::open(path)?;
        let backend = Self::from_connection(conn)?;
        info!("SQLite cache backend opened: {}", path.display());
        Ok(backend)
    }

    /// In-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self, BackendError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, BackendError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at
                ON cache_entries(expires_at);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Rows currently stored, expired ones included
    pub async fn row_count(&self) -> Result<usize, BackendError> {
        self.blocking(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, BackendError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let now = chrono::Utc::now().timestamp_millis();
            let value = conn
                .query_row(
                    "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                    params![key, now],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        let key = key.to_string();
        let value = value.to_string();
        self.blocking(move |conn| {
            let expires_at = chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64;
            conn.execute(
                "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, BackendError> {
        self.blocking(|conn| {
            let now = chrono::Utc::now().timestamp_millis();
            let rows = conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?1", params![now])?;
            if rows > 0 {
                debug!("Purged {} expired cache rows", rows);
            }
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_overwrite() {
        let temp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(&temp.path().join("cache.db")).unwrap();

        assert!(backend.read("k").await.unwrap().is_none());
        backend.write("k", "one", Duration::from_secs(60)).await.unwrap();
        backend.write("k", "two", Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.read("k").await.unwrap().as_deref(), Some("two"));

        backend.delete("k").await.unwrap();
        assert!(backend.read("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_expired_rows_are_invisible() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.write("gone", "v", Duration::from_millis(0)).await.unwrap();
        backend.write("kept", "v", Duration::from_secs(60)).await.unwrap();

        assert!(backend.read("gone").await.unwrap().is_none());
        assert_eq!(backend.purge_expired().await.unwrap(), 1);
        assert!(backend.read("kept").await.unwrap().is_some());
    }
}
