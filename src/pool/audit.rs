//! Fire-and-forget audit trail.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::db::ClaimStore;
use crate::types::{AuditLog, AuditResponse, PoolResult};

/// Appends audit records in the background. A failed or slow write is
/// logged and never reaches the operation being audited.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    store: ClaimStore,
    timeout: Duration,
    in_flight: Arc<InFlight>,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl AuditLogger {
    pub fn new(store: ClaimStore, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            in_flight: Arc::default(),
        }
    }

    /// Queue a record. The handle only matters to callers that want to wait.
    pub fn append(&self, log: AuditLog) -> JoinHandle<()> {
        let store = self.store.clone();
        let timeout = self.timeout;
        let in_flight = self.in_flight.clone();
        in_flight.count.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            if let Err(e) = log.validate() {
                warn!(action = %log.action, error = %e, "dropping audit log");
            } else {
                match tokio::time::timeout(timeout, store.insert_audit_log(&log)).await {
                    Ok(Ok(id)) => debug!(id, action = %log.action, "audit log written"),
                    Ok(Err(e)) => warn!(action = %log.action, error = %e, "failed to write audit log"),
                    Err(_) => warn!(action = %log.action, "audit log write timed out"),
                }
            }
            if in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
                in_flight.idle.notify_waiters();
            }
        })
    }

    /// Wait until every queued record has been written or dropped.
    pub async fn flush(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Record the outcome of an operation, carrying the error text on failure.
    pub fn append_outcome<T>(&self, log: AuditLog, outcome: &PoolResult<T>) -> JoinHandle<()> {
        let log = log.response(AuditResponse::from_outcome(outcome));
        let log = match outcome {
            Err(e) => log.description(e.to_string()),
            Ok(_) => log,
        };
        self.append(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::models::{AuditQuery, PageQuery};
    use crate::pool::testing::ManualClock;
    use crate::types::{AuditAction, AuditActor, PoolError};

    #[tokio::test]
    async fn test_outcome_is_recorded() {
        let clock = ManualClock::new();
        let store = ClaimStore::open_in_memory().await.unwrap();
        let audit = AuditLogger::new(store.clone(), Duration::from_secs(5));

        let failed: PoolResult<()> = Err(PoolError::not_found("active registration reg"));
        audit
            .append_outcome(
                AuditLog::new(AuditAction::ReserveTenantClaim, AuditActor::User, clock.now())
                    .registration("reg"),
                &failed,
            )
            .await
            .unwrap();

        let (logs, _) = store
            .get_audit_logs(&AuditQuery::default(), &PageQuery::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].response, AuditResponse::Failed);
        assert!(logs[0].description.contains("active registration reg"));
    }

    #[tokio::test]
    async fn test_flush_waits_for_queued_records() {
        let clock = ManualClock::new();
        let store = ClaimStore::open_in_memory().await.unwrap();
        let audit = AuditLogger::new(store.clone(), Duration::from_secs(5));

        for _ in 0..5 {
            audit.append(
                AuditLog::new(AuditAction::ConfirmTenantClaim, AuditActor::User, clock.now())
                    .tenant("t1"),
            );
        }
        audit.flush().await;

        let (logs, _) = store
            .get_audit_logs(&AuditQuery::default(), &PageQuery::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 5);
        // Nothing queued: returns at once.
        audit.flush().await;
    }

    #[tokio::test]
    async fn test_invalid_record_is_dropped_quietly() {
        let clock = ManualClock::new();
        let store = ClaimStore::open_in_memory().await.unwrap();
        let audit = AuditLogger::new(store.clone(), Duration::from_secs(5));

        audit
            .append(AuditLog::new(
                AuditAction::DeleteTenantClaim,
                AuditActor::System,
                clock.now(),
            ))
            .await
            .unwrap();

        let (logs, _) = store
            .get_audit_logs(&AuditQuery::default(), &PageQuery::default())
            .await
            .unwrap();
        assert!(logs.is_empty());
    }
}
