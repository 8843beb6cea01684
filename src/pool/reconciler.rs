//! Pool reconciler.
//!
//! Every replica runs one periodic task per registration. A tick takes the
//! registration's scan lock, drives each claim one step through its state
//! machine and then sizes the pool of trial claims:
//!
//! 1. `CREATING` claims poll their edges and become `AVAILABLE` (trial),
//!    `ASSIGNED` (direct) or `FAILED`.
//! 2. `FAILED` claims and expired trials move to `DELETING`; expired
//!    reservations return to `AVAILABLE`.
//! 3. `DELETING` claims tear down their edges, run post-delete cleanup once
//!    everything is gone and then disappear.
//! 4. `available + creating` is pushed back into `[min, max]`, never with
//!    more than `maxPendingTenantCount` claims in `CREATING`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::db::{StateChange, StateGuard, change_claim_state, replace_edge_contexts, write_claim};
use super::lifecycle::PoolManager;
use super::models::{ClaimQuery, PageQuery};
use crate::account::AccountService;
use crate::provision::Provisioner;
use crate::types::{
    AuditAction, AuditActor, AuditLog, ClaimState, EdgeState, PoolError, PoolResult, Registration,
    RegistrationState, Resource, TenantClaim,
};

/// Claims polled at once within one registration.
const MAX_CLAIM_WORKERS: usize = 16;

/// Result of one reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Scanned,
    /// Another holder owns the scan lock.
    Skipped,
    /// The registration no longer exists.
    Gone,
}

/// Trial claims by state, the input to pool sizing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub creating: u32,
    pub available: u32,
    pub reserved: u32,
    pub assigned: u32,
    pub deleting: u32,
    pub failed: u32,
}

impl PoolCounts {
    fn add(&mut self, state: ClaimState) {
        let slot = match state {
            ClaimState::Creating => &mut self.creating,
            ClaimState::Available => &mut self.available,
            ClaimState::Reserved => &mut self.reserved,
            ClaimState::Assigned => &mut self.assigned,
            ClaimState::Deleting => &mut self.deleting,
            ClaimState::Failed => &mut self.failed,
        };
        *slot += 1;
    }

    pub fn unclaimed(&self) -> u32 {
        self.available + self.creating
    }
}

/// What one tick should do about pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityPlan {
    Hold,
    Create(u32),
    /// Delete this many `AVAILABLE` claims.
    Delete(u32),
}

/// Decide how to move `available + creating` toward `target` without
/// leaving `[.., max]` or exceeding `max_pending` claims in `CREATING`.
///
/// Claims above `target` but within `max` are kept unless `shrink_to_target`
/// is set, which dynamic sizing uses to release idle capacity.
pub fn plan_capacity(
    counts: &PoolCounts,
    target: u32,
    max: u32,
    max_pending: u32,
    shrink_to_target: bool,
) -> CapacityPlan {
    let unclaimed = counts.unclaimed();
    let target = target.min(max);

    let plan = if unclaimed > max {
        CapacityPlan::Delete((unclaimed - max).min(counts.available))
    } else if shrink_to_target && counts.available > target {
        CapacityPlan::Delete(counts.available - target)
    } else if unclaimed < target {
        let room = max_pending.saturating_sub(counts.creating);
        CapacityPlan::Create(room.min(target - unclaimed))
    } else {
        CapacityPlan::Hold
    };

    match plan {
        CapacityPlan::Create(0) | CapacityPlan::Delete(0) => CapacityPlan::Hold,
        plan => plan,
    }
}

impl<P, A> PoolManager<P, A>
where
    P: Provisioner + 'static,
    A: AccountService + 'static,
{
    // ==================== Scheduling ====================

    /// Scan every registration until `shutdown` flips, one task per registration.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> PoolResult<()> {
        let mut workers: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.scan_delay());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(delay = ?self.config.scan_delay(), holder = %self.coordinator.holder_id(), "reconciler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            workers.retain(|_, handle| !handle.is_finished());

            let registrations = match self
                .store
                .get_registrations(None, &[], &PageQuery::all())
                .await
            {
                Ok((registrations, _)) => registrations,
                Err(e) => {
                    error!(error = %e, "failed to list registrations");
                    continue;
                }
            };

            for registration in registrations {
                if workers.contains_key(&registration.id) {
                    continue;
                }
                debug!(registration = %registration.id, "starting registration scanner");
                let manager = self.clone();
                let shutdown = shutdown.clone();
                let id = registration.id.clone();
                workers.insert(
                    registration.id,
                    tokio::spawn(async move { manager.scan_loop(id, shutdown).await }),
                );
            }
        }

        info!(workers = workers.len(), "reconciler stopping");
        for (_, handle) in workers {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn scan_loop(self: Arc<Self>, registration_id: String, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.scan_delay());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            match self.reconcile_registration(&registration_id).await {
                Ok(ScanOutcome::Gone) => {
                    info!(registration = %registration_id, "registration gone, scanner exiting");
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(registration = %registration_id, error = %e, "scan failed"),
            }
        }
    }

    // ==================== Reconciliation ====================

    /// One reconciliation pass over a registration, under its scan lock.
    pub async fn reconcile_registration(&self, registration_id: &str) -> PoolResult<ScanOutcome> {
        let Some(guard) = self.coordinator.try_acquire_scan_lock(registration_id).await? else {
            debug!(registration = %registration_id, "scan lock held elsewhere");
            return Ok(ScanOutcome::Skipped);
        };

        // Stop before the lock lapses and another replica starts scanning.
        let token = guard.fencing_token();
        let budget = self.coordinator.remaining(&guard).min(self.config.scan_timeout());
        let result = tokio::time::timeout(budget, self.scan(registration_id)).await;

        if let Err(e) = self.coordinator.release(guard).await {
            warn!(registration = %registration_id, error = %e, "failed to release scan lock");
        }

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(PoolError::Internal(format!(
                "scan of registration {} timed out (lock token {})",
                registration_id, token
            ))),
        }
    }

    async fn scan(&self, registration_id: &str) -> PoolResult<ScanOutcome> {
        let Some(registration) = self.store.get_registration(registration_id).await? else {
            return Ok(ScanOutcome::Gone);
        };
        let now = self.clock.now();
        let draining = registration.state == RegistrationState::Deleting;

        let claims = self
            .store
            .collect_tenant_claims(&ClaimQuery::registration(registration_id))
            .await?;

        let tasks: Vec<_> = claims
            .into_iter()
            .map(|claim| self.reconcile_entry(&registration, claim, draining, now))
            .collect();
        let outcomes: Vec<(bool, Option<ClaimState>)> = futures::stream::iter(tasks)
            .buffer_unordered(MAX_CLAIM_WORKERS)
            .collect()
            .await;

        if draining {
            let remaining = outcomes.iter().filter(|(_, state)| state.is_some()).count();
            if remaining == 0 {
                self.store.delete_registration(registration_id).await?;
                self.stats.forget(registration_id);
                info!(registration = %registration_id, "registration drained and removed");
                return Ok(ScanOutcome::Gone);
            }
            info!(registration = %registration_id, remaining, "registration draining");
            return Ok(ScanOutcome::Scanned);
        }

        if registration.state == RegistrationState::Active {
            let mut counts = PoolCounts::default();
            for (_, state) in outcomes.iter().filter(|(trial, _)| *trial) {
                if let Some(state) = state {
                    counts.add(*state);
                }
            }
            self.resize_pool(&registration, &counts, now).await?;
        }

        Ok(ScanOutcome::Scanned)
    }

    /// Trial flag and resulting state of one claim. A claim that could not
    /// be advanced keeps its state and is retried next tick.
    async fn reconcile_entry(
        &self,
        registration: &Registration,
        claim: TenantClaim,
        draining: bool,
        now: DateTime<Utc>,
    ) -> (bool, Option<ClaimState>) {
        let (trial, state, id) = (claim.trial, claim.state, claim.id.clone());
        match self.reconcile_claim(registration, claim, draining, now).await {
            Ok(state) => (trial, state),
            Err(e) => {
                warn!(registration = %registration.id, tenant = %id, error = %e, "claim reconciliation failed");
                (trial, Some(state))
            }
        }
    }

    /// Advance one claim. Returns its state afterwards, or `None` once removed.
    async fn reconcile_claim(
        &self,
        registration: &Registration,
        mut claim: TenantClaim,
        draining: bool,
        now: DateTime<Utc>,
    ) -> PoolResult<Option<ClaimState>> {
        if draining && claim.state != ClaimState::Deleting {
            self.store
                .change_claim_state(
                    &claim.id,
                    &StateChange::to(ClaimState::Deleting),
                    &StateGuard::expect(claim.state).with_version(claim.version),
                    now,
                )
                .await?;
            claim.state = ClaimState::Deleting;
            claim.version += 1;
        }

        match claim.state {
            ClaimState::Creating => {
                let edge_count = registration.config.v1().edge_count as usize;
                self.poll_creating(claim, edge_count, now).await.map(Some)
            }
            ClaimState::Deleting => self.drive_deleting(claim, now).await,
            ClaimState::Failed => {
                self.transition(&claim, ClaimState::Deleting, now).await?;
                Ok(Some(ClaimState::Deleting))
            }
            ClaimState::Reserved
                if claim.trial && claim.reserve_expires_at.is_some_and(|at| at < now) =>
            {
                self.transition(&claim, ClaimState::Available, now).await?;
                info!(registration = %registration.id, tenant = %claim.id, "reservation expired");
                Ok(Some(ClaimState::Available))
            }
            ClaimState::Assigned if claim.trial && claim.expires_at.is_some_and(|at| at < now) => {
                let result = self.transition(&claim, ClaimState::Deleting, now).await;
                let log = AuditLog::new(AuditAction::DeleteTenantClaim, AuditActor::System, now)
                    .registration(registration.id.clone())
                    .tenant(claim.id.clone())
                    .description("trial expired");
                self.audit.append_outcome(log, &result);
                result?;
                info!(registration = %registration.id, tenant = %claim.id, "trial expired");
                Ok(Some(ClaimState::Deleting))
            }
            state => Ok(Some(state)),
        }
    }

    async fn transition(&self, claim: &TenantClaim, to: ClaimState, now: DateTime<Utc>) -> PoolResult<()> {
        self.store
            .change_claim_state(
                &claim.id,
                &StateChange::to(to),
                &StateGuard::expect(claim.state).with_version(claim.version),
                now,
            )
            .await
    }

    /// Poll a `CREATING` claim's edges and settle the claim once all
    /// `edge_count` of them have.
    async fn poll_creating(
        &self,
        mut claim: TenantClaim,
        edge_count: usize,
        now: DateTime<Utc>,
    ) -> PoolResult<ClaimState> {
        let provision_timeout = chrono::Duration::from_std(self.config.edge_provision_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let mut changed = false;
        let mut reported: Vec<(String, BTreeMap<String, Resource>)> = Vec::new();

        for context in claim.edge_contexts.iter_mut() {
            if context.state != EdgeState::Creating {
                continue;
            }
            if now - context.created_at > provision_timeout {
                warn!(tenant = %claim.id, context = %context.id, "edge provisioning timed out");
                context.state = EdgeState::Failed;
                context.updated_at = now;
                changed = true;
                continue;
            }
            let status = match self
                .bounded(
                    "get resource status",
                    self.provisioner.get_resource_status(&claim.id, &context.id),
                )
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    warn!(tenant = %claim.id, context = %context.id, error = %e, "status poll failed");
                    continue;
                }
            };
            if status.edge_id.is_some() && status.edge_id != context.edge_id {
                context.edge_id = status.edge_id.clone();
                changed = true;
            }
            if status.state != context.state {
                debug!(tenant = %claim.id, context = %context.id, state = %status.state, "edge state changed");
                context.state = status.state;
                context.updated_at = now;
                changed = true;
            }
            if status.state == EdgeState::Created {
                let edge_id = context.edge_id.clone().unwrap_or_else(|| context.id.clone());
                reported.push((edge_id, status.resources));
            }
        }
        for (edge_id, resources) in &reported {
            claim.add_resources(edge_id, resources);
        }

        // Edges still being requested, or never requested by a creator that died
        let incomplete = claim.edge_contexts.len() < edge_count.max(1);
        let stalled = incomplete && now - claim.created_at > provision_timeout;
        let failed = stalled || claim.edge_contexts.iter().any(|c| c.state == EdgeState::Failed);
        let created = !incomplete && claim.edge_contexts.iter().all(|c| c.state == EdgeState::Created);

        let guard = StateGuard::expect(ClaimState::Creating).with_version(claim.version);
        if failed {
            claim.state = ClaimState::Failed;
            self.store.update_tenant_claim_txn(&claim, &guard, now).await?;
            warn!(tenant = %claim.id, "tenant claim failed");
        } else if created && claim.trial {
            claim.state = ClaimState::Available;
            self.store.update_tenant_claim_txn(&claim, &guard, now).await?;
            info!(registration = %claim.registration_id, tenant = %claim.id, "tenant claim available");
        } else if created {
            self.assign_direct(&mut claim, &guard, now).await?;
        } else if changed {
            self.store.update_tenant_claim_txn(&claim, &guard, now).await?;
        }

        Ok(claim.state)
    }

    /// A directly created claim skips the pool: its system user, then
    /// `CREATING → RESERVED → ASSIGNED` in one transaction.
    async fn assign_direct(&self, claim: &mut TenantClaim, guard: &StateGuard, now: DateTime<Utc>) -> PoolResult<()> {
        // Created before the transaction opens; a retry after a failed write
        // finds the user already there.
        self.create_system_user(claim).await?;

        let mut tx = self.store.begin().await?;

        claim.state = ClaimState::Reserved;
        if !write_claim(&mut tx, claim, guard, now).await? {
            return Err(PoolError::not_found(format!("creating tenant claim {}", claim.id)));
        }
        replace_edge_contexts(&mut tx, claim).await?;

        let change = StateChange {
            assigned_at: Some(now),
            ..StateChange::to(ClaimState::Assigned)
        };
        if !change_claim_state(&mut tx, &claim.id, &change, &StateGuard::expect(ClaimState::Reserved), now).await? {
            return Err(PoolError::not_found(format!("reserved tenant claim {}", claim.id)));
        }
        tx.commit().await?;

        claim.state = ClaimState::Assigned;
        claim.assigned_at = Some(now);
        info!(registration = %claim.registration_id, tenant = %claim.id, "tenant claim assigned");
        Ok(())
    }

    /// Tear down a `DELETING` claim's edges; remove it once they are gone.
    async fn drive_deleting(&self, mut claim: TenantClaim, now: DateTime<Utc>) -> PoolResult<Option<ClaimState>> {
        let deletion_timeout = chrono::Duration::from_std(self.config.edge_deletion_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let mut changed = false;

        for context in claim.edge_contexts.iter_mut() {
            let call = match context.state {
                EdgeState::Deleted => continue,
                EdgeState::Deleting if now - context.updated_at <= deletion_timeout => {
                    self.bounded(
                        "get resource status",
                        self.provisioner.get_resource_status(&claim.id, &context.id),
                    )
                    .await
                }
                // Never issued, or issued so long ago it needs repeating
                _ => {
                    debug!(tenant = %claim.id, context = %context.id, "deleting edge");
                    context.updated_at = now;
                    changed = true;
                    self.bounded(
                        "delete resource",
                        self.provisioner.delete_resource(&claim.id, &context.id),
                    )
                    .await
                }
            };
            match call {
                Ok(status) => {
                    let state = match status.state {
                        EdgeState::Deleted => EdgeState::Deleted,
                        _ => EdgeState::Deleting,
                    };
                    if state != context.state {
                        context.state = state;
                        changed = true;
                    }
                }
                Err(e) => warn!(tenant = %claim.id, context = %context.id, error = %e, "edge deletion failed"),
            }
        }

        if claim.edge_contexts.iter().all(|c| c.state == EdgeState::Deleted) {
            match self.finish_deletion(&claim).await {
                Ok(()) => return Ok(None),
                Err(e) => warn!(tenant = %claim.id, error = %e, "post delete cleanup failed"),
            }
        }

        if changed {
            let guard = StateGuard::expect(ClaimState::Deleting).with_version(claim.version);
            self.store.update_tenant_claim_txn(&claim, &guard, now).await?;
        }
        Ok(Some(ClaimState::Deleting))
    }

    async fn finish_deletion(&self, claim: &TenantClaim) -> PoolResult<()> {
        self.bounded(
            "post delete cleanup",
            self.provisioner.post_delete_cleanup(&claim.id),
        )
        .await?;

        if claim.trial {
            let users = self
                .bounded("delete tenant users", self.accounts.delete_tenant_users(&claim.id))
                .await;
            let tenant = self
                .bounded("delete tenant", self.accounts.delete_tenant(&claim.id))
                .await;
            if let Err(e) = users.and(tenant) {
                warn!(tenant = %claim.id, error = %e, "failed to remove trial tenant");
            }
        }

        self.store.delete_tenant_claim(&claim.id).await?;
        info!(registration = %claim.registration_id, tenant = %claim.id, "tenant claim removed");
        Ok(())
    }

    // ==================== Pool Sizing ====================

    async fn resize_pool(&self, registration: &Registration, counts: &PoolCounts, now: DateTime<Utc>) -> PoolResult<()> {
        let cfg = registration.config.v1();
        let target = if self.stats.enabled() {
            self.stats_level(registration, counts, now).await?
        } else {
            cfg.min_tenant_pool_size
        };

        info!(
            registration = %registration.id,
            creating = counts.creating,
            available = counts.available,
            reserved = counts.reserved,
            assigned = counts.assigned,
            deleting = counts.deleting,
            failed = counts.failed,
            target,
            "pool scanned"
        );

        match plan_capacity(
            counts,
            target,
            cfg.max_tenant_pool_size,
            cfg.max_pending_tenant_count,
            self.stats.enabled(),
        ) {
            CapacityPlan::Hold => {}
            CapacityPlan::Create(count) => {
                info!(registration = %registration.id, count, "growing pool");
                for _ in 0..count {
                    if let Err(e) = self.provision_claim(registration, None).await {
                        warn!(registration = %registration.id, error = %e, "failed to create tenant claim");
                    }
                }
            }
            CapacityPlan::Delete(count) => {
                info!(registration = %registration.id, count, "shrinking pool");
                self.shrink_pool(registration, count, now).await?;
            }
        }
        Ok(())
    }

    async fn stats_level(&self, registration: &Registration, counts: &PoolCounts, now: DateTime<Utc>) -> PoolResult<u32> {
        let cfg = registration.config.v1();
        let (min, max) = (cfg.min_tenant_pool_size, cfg.max_tenant_pool_size);

        if let Some(since) = self.stats.begin_scan(&registration.id, counts.available, min, max, now) {
            let (requests, last) = self
                .store
                .count_audit_logs(&registration.id, AuditAction::ReserveTenantClaim, since)
                .await?;
            self.stats.record_sample(&registration.id, requests, last, min, max);
        }
        Ok(self.stats.level(&registration.id).unwrap_or(min))
    }

    async fn shrink_pool(&self, registration: &Registration, count: u32, now: DateTime<Utc>) -> PoolResult<()> {
        let query = ClaimQuery::registration(&registration.id).in_states(&[ClaimState::Available]);
        let page = PageQuery {
            filter: Some("trial = true".to_string()),
            order_by: Some("created_at asc".to_string()),
            page_size: count,
            ..PageQuery::default()
        };
        let (available, _) = self.store.list_tenant_claims(&query, &page).await?;

        let mut deleted = 0;
        for claim in available {
            match self.transition(&claim, ClaimState::Deleting, now).await {
                Ok(()) => deleted += 1,
                // Reserved in the meantime
                Err(PoolError::RecordNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        debug!(registration = %registration.id, deleted, "pool shrink applied");
        Ok(())
    }
}
