//! SQLite profile store

use super::{PersistentStore, Result, StoreError};
use crate::config::StorageConfig;
use crate::profile::ProfileRecord;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A stored record plus when it was written (unix millis)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredProfile {
    #[serde(flatten)]
    pub record: ProfileRecord,
    pub cached_at: i64,
}

/// Single-table SQLite store.
///
/// The connection sits behind a mutex and every statement runs on tokio's
/// blocking pool, so async callers never stall the runtime on disk I/O.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create the database described by `config`
    pub fn open(config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %config.path.display(), "Opening profile database");

        let conn = Connection::open(&config.path)?;

        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(config.path.clone()),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS user_cache (
                username TEXT PRIMARY KEY NOT NULL,
                display_name TEXT NOT NULL,
                profile_image_url TEXT NOT NULL,
                cached_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))?;
            f(&guard).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("storage task failed: {}", e)))?
    }

    /// All stored records, oldest first
    pub async fn list(&self) -> Result<Vec<StoredProfile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT username, display_name, profile_image_url, cached_at
                FROM user_cache
                ORDER BY cached_at, username
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(StoredProfile {
                    record: ProfileRecord::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ),
                    cached_at: row.get(3)?,
                })
            })?;
            let profiles = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(profiles)
        })
        .await
    }

    /// Number of stored records
    pub async fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM user_cache", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .await
        .map(|n| n as usize)
    }

    /// Administrative delete. Returns whether a row was removed.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        let removed = self
            .with_conn(move |conn| {
                conn.execute("DELETE FROM user_cache WHERE username = ?", params![key])
            })
            .await?;
        Ok(removed > 0)
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn find_by_key(&self, key: &str) -> Result<Option<ProfileRecord>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT username, display_name, profile_image_url FROM user_cache WHERE username = ?",
                params![key],
                |row| {
                    Ok(ProfileRecord::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
        })
        .await
    }

    async fn insert(&self, record: &ProfileRecord) -> Result<()> {
        let record = record.clone();
        let now = Utc::now().timestamp_millis();

        let inserted = self
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR IGNORE INTO user_cache
                        (username, display_name, profile_image_url, cached_at)
                    VALUES (?, ?, ?, ?)
                    "#,
                    params![record.key, record.display_name, record.avatar_url, now],
                )
            })
            .await?;

        if inserted == 0 {
            tracing::debug!("Profile already stored, insert ignored");
        }

        Ok(())
    }
}
