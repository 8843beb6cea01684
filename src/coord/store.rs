//! Key-value substrate for scan locks.
//!
//! Two backends share one contract: an atomic set-if-absent with a TTL and
//! a compare-and-delete keyed on holder and fencing token. The SQL backend
//! lets every replica pointed at the same database share locks; the memory
//! backend serves single-replica deployments and tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use sqlx::SqlitePool;

use super::LockError;
use super::lock::{compute_lock_deadline, compute_next_fencing_token, is_lock_expired};

/// Current holder of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub holder_id: String,
    pub fencing_token: u64,
    /// Unix milliseconds; 0 once released.
    pub deadline_ms: u64,
}

pub trait KeyValueStore: Send + Sync {
    /// Take `key` for `holder_id` unless a live entry exists.
    ///
    /// Returns the new entry when taken, `None` when someone holds it.
    fn set_if_absent(
        &self,
        key: &str,
        holder_id: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> impl Future<Output = Result<Option<LockEntry>, LockError>> + Send;

    /// Drop `key` only if it still belongs to `holder_id` with `fencing_token`.
    ///
    /// The entry is kept as a released tombstone so the next fencing token
    /// still increases.
    fn compare_and_delete(
        &self,
        key: &str,
        holder_id: &str,
        fencing_token: u64,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;
}

// ==================== Memory Backend ====================

#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryKvStore {
    async fn set_if_absent(
        &self,
        key: &str,
        holder_id: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Option<LockEntry>, LockError> {
        let mut entries = self.lock();
        let current = entries.get(key);
        if current.is_some_and(|entry| !is_lock_expired(entry.deadline_ms, now_ms)) {
            return Ok(None);
        }
        let entry = LockEntry {
            holder_id: holder_id.to_string(),
            fencing_token: compute_next_fencing_token(current),
            deadline_ms: compute_lock_deadline(now_ms, ttl_ms),
        };
        entries.insert(key.to_string(), entry.clone());
        Ok(Some(entry))
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        holder_id: &str,
        fencing_token: u64,
    ) -> Result<bool, LockError> {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry)
                if entry.holder_id == holder_id
                    && entry.fencing_token == fencing_token
                    && entry.deadline_ms != 0 =>
            {
                entry.deadline_ms = 0;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ==================== SQL Backend ====================

/// Locks kept in the `scan_locks` table of the shared database.
#[derive(Debug, Clone)]
pub struct SqlKvStore {
    pool: SqlitePool,
}

impl SqlKvStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, LockError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_locks (
                key TEXT PRIMARY KEY,
                holder_id TEXT NOT NULL,
                fencing_token INTEGER NOT NULL,
                deadline_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

impl KeyValueStore for SqlKvStore {
    async fn set_if_absent(
        &self,
        key: &str,
        holder_id: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Option<LockEntry>, LockError> {
        let deadline_ms = compute_lock_deadline(now_ms, ttl_ms);

        // The conflict branch only fires for released or expired entries,
        // so a live holder leaves the row untouched and nothing is returned.
        let token: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO scan_locks (key, holder_id, fencing_token, deadline_ms)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(key) DO UPDATE SET
                holder_id = excluded.holder_id,
                fencing_token = scan_locks.fencing_token + 1,
                deadline_ms = excluded.deadline_ms
            WHERE scan_locks.deadline_ms = 0 OR scan_locks.deadline_ms < ?
            RETURNING fencing_token
            "#,
        )
        .bind(key)
        .bind(holder_id)
        .bind(deadline_ms as i64)
        .bind(now_ms as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(token.map(|token| LockEntry {
            holder_id: holder_id.to_string(),
            fencing_token: token as u64,
            deadline_ms,
        }))
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        holder_id: &str,
        fencing_token: u64,
    ) -> Result<bool, LockError> {
        let result = sqlx::query(
            r#"
            UPDATE scan_locks SET deadline_ms = 0
            WHERE key = ? AND holder_id = ? AND fencing_token = ? AND deadline_ms != 0
            "#,
        )
        .bind(key)
        .bind(holder_id)
        .bind(fencing_token as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ==================== Dispatch ====================

/// Lock backend selected at startup.
#[derive(Debug, Clone)]
pub enum KvStores {
    Memory(MemoryKvStore),
    Sql(SqlKvStore),
}

impl KeyValueStore for KvStores {
    async fn set_if_absent(
        &self,
        key: &str,
        holder_id: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Option<LockEntry>, LockError> {
        match self {
            Self::Memory(s) => s.set_if_absent(key, holder_id, ttl_ms, now_ms).await,
            Self::Sql(s) => s.set_if_absent(key, holder_id, ttl_ms, now_ms).await,
        }
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        holder_id: &str,
        fencing_token: u64,
    ) -> Result<bool, LockError> {
        match self {
            Self::Memory(s) => s.compare_and_delete(key, holder_id, fencing_token).await,
            Self::Sql(s) => s.compare_and_delete(key, holder_id, fencing_token).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn sql_store() -> SqlKvStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqlKvStore::new(pool).await.unwrap()
    }

    async fn exercise<S: KeyValueStore>(store: S) {
        let first = store.set_if_absent("k", "a", 1_000, 10_000).await.unwrap().unwrap();
        assert_eq!(first.fencing_token, 1);
        assert_eq!(first.deadline_ms, 11_000);

        // Live entry blocks everyone, including the same holder.
        assert!(store.set_if_absent("k", "b", 1_000, 10_500).await.unwrap().is_none());
        assert!(store.set_if_absent("k", "a", 1_000, 10_500).await.unwrap().is_none());

        // Wrong holder or stale token cannot release.
        assert!(!store.compare_and_delete("k", "b", 1).await.unwrap());
        assert!(!store.compare_and_delete("k", "a", 7).await.unwrap());

        assert!(store.compare_and_delete("k", "a", 1).await.unwrap());
        assert!(!store.compare_and_delete("k", "a", 1).await.unwrap());

        let second = store.set_if_absent("k", "b", 1_000, 10_600).await.unwrap().unwrap();
        assert_eq!(second.fencing_token, 2);

        // Expiry hands the key over without a release.
        let third = store.set_if_absent("k", "c", 1_000, 12_000).await.unwrap().unwrap();
        assert_eq!(third.fencing_token, 3);
        assert_eq!(third.holder_id, "c");
        assert!(!store.compare_and_delete("k", "b", 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        exercise(MemoryKvStore::new()).await;
    }

    #[tokio::test]
    async fn test_sql_store_contract() {
        exercise(sql_store().await).await;
    }

    #[tokio::test]
    async fn test_dispatch_keys_are_independent() {
        let store = KvStores::Memory(MemoryKvStore::new());
        assert!(store.set_if_absent("a", "h", 1_000, 0).await.unwrap().is_some());
        assert!(store.set_if_absent("b", "h", 1_000, 0).await.unwrap().is_some());
    }
}
