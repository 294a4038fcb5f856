// SQLite-backed durable key-value store
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

use super::kv::KvStore;
use crate::error::{AppError, AppResult};

pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    /// Open (or create) the database file
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> AppResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| AppError::Store("sqlite connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| AppError::Store(format!("sqlite task failed: {}", e)))?
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT value, expires_at FROM kv WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((value, expires_at)) if expires_at > now_ms() => Ok(Some(value)),
                Some(_) => {
                    conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                    Ok(None)
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = now_ms().saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    fn max_ttl(&self) -> Duration {
        // expires_at is an epoch-ms INTEGER
        Duration::from_secs(100 * 365 * 24 * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("kv.sqlite");
        let store = SqliteKvStore::open(&path).unwrap();

        store.put("token", "abc", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("token").await.unwrap().as_deref(), Some("abc"));

        // Survives reopening
        drop(store);
        let reopened = SqliteKvStore::open(&path).unwrap();
        assert_eq!(reopened.get("token").await.unwrap().as_deref(), Some("abc"));

        reopened.delete("token").await.unwrap();
        assert_eq!(reopened.get("token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_rows_are_absent() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store.put("gone", "x", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("gone").await.unwrap(), None);
    }
}
