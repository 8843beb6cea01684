//! Per-registration scan locks.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::LockError;
use super::store::{KeyValueStore, LockEntry};
use crate::pool::Clock;

pub const SCAN_LOCK_PREFIX: &str = "tenantpool-scanner-lock";

/// Next fencing token after `current`; always at least 1.
#[inline]
pub fn compute_next_fencing_token(current: Option<&LockEntry>) -> u64 {
    match current {
        Some(entry) => entry.fencing_token.saturating_add(1),
        None => 1,
    }
}

#[inline]
pub fn compute_lock_deadline(acquired_at_ms: u64, ttl_ms: u64) -> u64 {
    acquired_at_ms.saturating_add(ttl_ms)
}

/// A deadline of 0 marks a released entry.
#[inline]
pub fn is_lock_expired(deadline_ms: u64, now_ms: u64) -> bool {
    deadline_ms == 0 || now_ms > deadline_ms
}

pub fn scan_lock_key(registration_id: &str) -> String {
    format!("{}:{}", SCAN_LOCK_PREFIX, registration_id)
}

/// Hands out scan locks for one process.
///
/// The locks are advisory: they keep replicas from scanning the same
/// registration at once, while the claim store's guarded writes keep the
/// data correct when a lock expires mid-scan.
pub struct Coordinator<S> {
    store: S,
    holder_id: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<S: KeyValueStore> Coordinator<S> {
    pub fn new(store: S, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            holder_id: uuid::Uuid::new_v4().to_string(),
            ttl,
            clock,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn now_ms(&self) -> u64 {
        self.clock.now().timestamp_millis().max(0) as u64
    }

    /// Try to take the scan lock of a registration without waiting.
    pub async fn try_acquire_scan_lock(&self, registration_id: &str) -> Result<Option<ScanLockGuard>, LockError> {
        let key = scan_lock_key(registration_id);
        let ttl_ms = self.ttl.as_millis() as u64;
        let entry = self
            .store
            .set_if_absent(&key, &self.holder_id, ttl_ms, self.now_ms())
            .await?;

        Ok(entry.map(|entry| {
            debug!(key = %key, token = entry.fencing_token, "scan lock acquired");
            ScanLockGuard {
                key,
                fencing_token: entry.fencing_token,
                deadline_ms: entry.deadline_ms,
            }
        }))
    }

    /// Release a lock. Returns false if it had already expired and moved on.
    pub async fn release(&self, guard: ScanLockGuard) -> Result<bool, LockError> {
        let released = self
            .store
            .compare_and_delete(&guard.key, &self.holder_id, guard.fencing_token)
            .await?;
        debug!(key = %guard.key, token = guard.fencing_token, released, "scan lock released");
        Ok(released)
    }

    /// Time left before the guard's lock lapses.
    pub fn remaining(&self, guard: &ScanLockGuard) -> Duration {
        Duration::from_millis(guard.deadline_ms.saturating_sub(self.now_ms()))
    }
}

/// Proof of holding a scan lock. Release it through the [`Coordinator`].
#[derive(Debug)]
pub struct ScanLockGuard {
    key: String,
    fencing_token: u64,
    deadline_ms: u64,
}

impl ScanLockGuard {
    #[cfg(test)]
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fencing_token(&self) -> u64 {
        self.fencing_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryKvStore;
    use crate::pool::testing::ManualClock;

    #[test]
    fn test_pure_lock_math() {
        assert_eq!(compute_next_fencing_token(None), 1);
        let entry = LockEntry {
            holder_id: "a".into(),
            fencing_token: u64::MAX,
            deadline_ms: 5,
        };
        assert_eq!(compute_next_fencing_token(Some(&entry)), u64::MAX);
        assert_eq!(compute_lock_deadline(u64::MAX - 1, 10), u64::MAX);
        assert!(is_lock_expired(0, 0));
        assert!(!is_lock_expired(100, 100));
        assert!(is_lock_expired(100, 101));
    }

    #[tokio::test]
    async fn test_second_replica_skips_held_registration() {
        let clock = ManualClock::new();
        let store = MemoryKvStore::new();
        let a = Coordinator::new(store.clone(), Duration::from_secs(30), clock.shared());
        let b = Coordinator::new(store, Duration::from_secs(30), clock.shared());

        let guard = a.try_acquire_scan_lock("reg").await.unwrap().unwrap();
        assert_eq!(guard.key(), "tenantpool-scanner-lock:reg");
        assert!(b.try_acquire_scan_lock("reg").await.unwrap().is_none());
        assert!(b.try_acquire_scan_lock("other").await.unwrap().is_some());

        assert!(a.release(guard).await.unwrap());
        let guard = b.try_acquire_scan_lock("reg").await.unwrap().unwrap();
        assert_eq!(guard.fencing_token(), 2);
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let clock = ManualClock::new();
        let store = MemoryKvStore::new();
        let a = Coordinator::new(store.clone(), Duration::from_secs(30), clock.shared());
        let b = Coordinator::new(store, Duration::from_secs(30), clock.shared());

        let stale = a.try_acquire_scan_lock("reg").await.unwrap().unwrap();
        assert_eq!(a.remaining(&stale), Duration::from_secs(30));

        clock.advance(chrono::Duration::seconds(31));
        let fresh = b.try_acquire_scan_lock("reg").await.unwrap().unwrap();
        assert!(fresh.fencing_token() > stale.fencing_token());
        assert_eq!(a.remaining(&stale), Duration::ZERO);

        // The old holder cannot release what it no longer owns.
        assert!(!a.release(stale).await.unwrap());
        assert!(b.release(fresh).await.unwrap());
    }
}
