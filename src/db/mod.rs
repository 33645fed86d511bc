use crate::error::QueueError;
use anyhow::Context;
use async_trait::async_trait;
use sqlx::{SqlitePool, migrate::Migrator};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Byte-oriented key-value medium the queue store persists into.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Keys starting with `prefix`, in ascending order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, QueueError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, QueueError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), QueueError>;
    async fn delete(&self, key: &str) -> Result<(), QueueError>;
}

/// SQLite-backed key-value medium.
#[derive(Debug, Clone)]
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, QueueError> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, QueueError> {
        let value: Option<Vec<u8>> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, Vec<u8>>,
    capacity: Option<usize>,
    unavailable: bool,
}

/// In-process key-value medium with switchable faults.
#[derive(Debug, Default)]
pub struct MemoryKv {
    state: Mutex<MemoryState>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject new keys once `capacity` entries are stored.
    pub fn with_capacity(capacity: usize) -> Self {
        let kv = Self::default();
        kv.lock().capacity = Some(capacity);
        kv
    }

    /// Make every operation fail with `StorageUnavailable` until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Overwrite a value without any checks; used to plant damaged records.
    pub fn put_raw(&self, key: &str, value: &[u8]) {
        self.lock().entries.insert(key.to_string(), value.to_vec());
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checked(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, QueueError> {
        let state = self.lock();
        if state.unavailable {
            return Err(QueueError::StorageUnavailable("medium offline".into()));
        }
        Ok(state)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, QueueError> {
        let state = self.checked()?;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, QueueError> {
        Ok(self.checked()?.entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), QueueError> {
        let mut state = self.checked()?;
        let is_new = !state.entries.contains_key(key);
        if is_new && state.capacity.is_some_and(|cap| state.entries.len() >= cap) {
            return Err(QueueError::StorageFull);
        }
        state.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), QueueError> {
        self.checked()?.entries.remove(key);
        Ok(())
    }
}

// Embed migrations from the `migrations` directory
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Connect to the SQLite database at `db_file`.
pub async fn init_pool_at(db_file: &Path) -> anyhow::Result<SqlitePool> {
    let db_url = format!("sqlite://{}", db_file.to_string_lossy());
    let pool = SqlitePool::connect(&db_url)
        .await
        .context("Failed to connect to the database")?;
    Ok(pool)
}

/// Create the database file (if missing) and bring its schema up to date.
pub async fn create_db_if_needed_at(db_file: &Path, force_recreate: bool) -> anyhow::Result<()> {
    if force_recreate && db_file.exists() {
        fs::remove_file(db_file)
            .with_context(|| format!("Failed to remove DB file at {}", db_file.display()))?;
    }
    if !db_file.exists() {
        fs::File::create(db_file)
            .with_context(|| format!("Failed to create DB file at {}", db_file.display()))?;
    }
    let pool = init_pool_at(db_file)
        .await
        .context("Failed to connect to the database for migrations")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    pool.close().await;
    Ok(())
}
