use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{AppError, AppResult};

/// C2 — durable, ordered-insensitive string→blob store with atomic
/// per-key replace.
///
/// Every higher-level component (shadow index, delivery log, retry queue,
/// critical mirror, sentinels, push token, persistent backup, retry config)
/// persists through this trait by key, exactly as spec §6 "Persisted state
/// layout" lists them. This mirrors the teacher's repository-per-concern
/// idiom, collapsed to a single generic schema because spec's C2 explicitly
/// calls for a generic contract rather than per-entity tables.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> AppResult<()>;
    async fn delete(&self, key: &str) -> AppResult<()>;
}

/// Typed convenience: deserialize a JSON blob, defaulting per spec §7
/// ("KV read failure: treat as empty; log; continue") when the key is
/// absent or unreadable. A free function (rather than a generic trait
/// method) so `KvStore` stays object-safe and usable as `Arc<dyn KvStore>`.
pub async fn get_json<T: serde::de::DeserializeOwned + Default>(
    store: &dyn KvStore,
    key: &str,
) -> T {
    match store.get(key).await {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!("kv: failed to deserialize key {}: {}", key, e);
            T::default()
        }),
        Ok(None) => T::default(),
        Err(e) => {
            tracing::warn!(
                "kv: read failure for key {}, degrading to default: {}",
                key,
                e
            );
            T::default()
        }
    }
}

/// Typed convenience: serialize and replace atomically.
pub async fn set_json<T: serde::Serialize + Sync>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> AppResult<()> {
    let raw = serde_json::to_string(value)
        .map_err(|e| AppError::Kv(format!("failed to serialize key {}: {}", key, e)))?;
    store.set(key, &raw).await
}

/// Sqlite-backed `KvStore`. A single table with an atomic
/// `INSERT ... ON CONFLICT DO UPDATE` replace, following the runtime-checked
/// `sqlx::query` style used throughout the teacher's
/// `notification_queue_repository.rs` (rather than the `query_as!` macro
/// style, which needs a live database at build time to validate).
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }
}

/// In-memory `KvStore` used by unit tests that don't need a real database.
#[derive(Default)]
pub struct InMemoryKvStore {
    inner: tokio::sync::Mutex<std::collections::HashMap<String, String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.inner
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.inner.lock().await.remove(key);
        Ok(())
    }
}
