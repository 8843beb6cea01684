//! Claim lifecycle operations: everything a caller does to the pool.
//!
//! Each state change is a guarded write, so a reservation racing the
//! reconciler's expiry (or another reservation) has exactly one winner.
//! Identity-service calls never run while a store connection is held: the
//! claim is parked in RESERVED around the call and put back if it fails.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::audit::AuditLogger;
use super::clock::Clock;
use super::config::PoolConfig;
use super::db::{ClaimStore, StateChange, StateGuard};
use super::filter::{CLAIM_KEYS, Filter};
use super::models::{
    AuditQuery, ClaimQuery, CreateRegistration, PageInfo, PageQuery, UpdateRegistration,
};
use super::stats::PoolStatsTracker;
use crate::account::{AccountError, AccountService, NewUser, SYSTEM_USER_NAME, TRIAL_USER_NAME};
use crate::coord::{Coordinator, KvStores};
use crate::provision::{CreateResourceConfig, Provisioner};
use crate::types::{
    AuditAction, AuditActor, AuditLog, ClaimState, EdgeContext, PoolError, PoolResult,
    Registration, RegistrationState, TenantClaim, edge_name, system_user_email,
};

/// Selection for [`PoolManager::get_tenant_claims`].
#[derive(Debug, Clone, Default)]
pub struct ClaimLookup {
    pub registration_id: Option<String>,
    pub tenant_id: Option<String>,
    pub states: Vec<ClaimState>,
    /// Resolve the tenant through the identity service.
    pub email: Option<String>,
    /// Attach backend details to every edge context.
    pub verbose: bool,
}

/// Owns the pool: lifecycle operations here, reconciliation in
/// [`super::reconciler`].
pub struct PoolManager<P, A> {
    pub(super) store: ClaimStore,
    pub(super) provisioner: P,
    pub(super) accounts: A,
    pub(super) coordinator: Coordinator<KvStores>,
    pub(super) config: PoolConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) audit: AuditLogger,
    pub(super) stats: PoolStatsTracker,
}

impl<P: Provisioner, A: AccountService> PoolManager<P, A> {
    pub fn new(
        store: ClaimStore,
        provisioner: P,
        accounts: A,
        coordinator: Coordinator<KvStores>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let audit = AuditLogger::new(store.clone(), config.audit_timeout());
        let stats = PoolStatsTracker::new(config.pool_stats.clone());
        Self {
            store,
            provisioner,
            accounts,
            coordinator,
            config,
            clock,
            audit,
            stats,
        }
    }

    pub fn store(&self) -> &ClaimStore {
        &self.store
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Wait for queued audit records to land.
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }

    /// Run an external call under the configured call timeout.
    pub(super) async fn bounded<T, E>(
        &self,
        what: &str,
        call: impl Future<Output = Result<T, E>>,
    ) -> PoolResult<T>
    where
        PoolError: From<E>,
    {
        match tokio::time::timeout(self.config.call_timeout(), call).await {
            Ok(result) => result.map_err(PoolError::from),
            Err(_) => Err(PoolError::Internal(format!("{} timed out", what))),
        }
    }

    // ==================== Registrations ====================

    pub async fn create_registration(&self, input: &CreateRegistration) -> PoolResult<Registration> {
        let registration = self.store.create_registration(input, self.clock.now()).await?;
        info!(registration = %registration.id, state = %registration.state, "registration created");
        Ok(registration)
    }

    pub async fn get_registrations(
        &self,
        id: Option<&str>,
        states: &[RegistrationState],
        page: &PageQuery,
    ) -> PoolResult<(Vec<Registration>, PageInfo)> {
        self.store.get_registrations(id, states, page).await
    }

    pub async fn update_registration(&self, update: &UpdateRegistration) -> PoolResult<Registration> {
        let registration = self.store.update_registration(update, self.clock.now()).await?;
        info!(registration = %registration.id, version = registration.version, "registration updated");
        Ok(registration)
    }

    /// Mark a registration `DELETING`. The reconciler drains its claims and
    /// removes the row once none remain.
    pub async fn delete_registration(&self, id: &str) -> PoolResult<()> {
        self.store
            .update_registration_state(id, RegistrationState::Deleting, None, self.clock.now())
            .await?;
        self.stats.forget(id);
        info!(registration = %id, "registration marked for deletion");
        Ok(())
    }

    // ==================== Claim Creation ====================

    /// Create a claim outside the reconciler. Without a tenant id this is a
    /// trial claim for a fresh tenant; with one it provisions for that tenant
    /// and skips the pool.
    pub async fn create_tenant_claim(
        &self,
        registration_id: &str,
        tenant_id: Option<String>,
    ) -> PoolResult<TenantClaim> {
        if tenant_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(PoolError::bad_request("tenant id must not be blank"));
        }
        let registration = self.store.get_active_registration(registration_id).await?;
        self.provision_claim(&registration, tenant_id).await
    }

    pub(super) async fn provision_claim(
        &self,
        registration: &Registration,
        tenant_id: Option<String>,
    ) -> PoolResult<TenantClaim> {
        let now = self.clock.now();
        let trial = tenant_id.is_none();
        let tenant_id = tenant_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if trial {
            self.bounded("create tenant", self.accounts.create_tenant(&tenant_id, &tenant_id))
                .await?;
        }

        let claim = new_claim(registration, &tenant_id, trial, now);
        if let Err(e) = self.store.insert_tenant_claim(&claim).await {
            if trial {
                // Do not leave an identity tenant without a claim
                if let Err(rollback) = self
                    .bounded("delete tenant", self.accounts.delete_tenant(&tenant_id))
                    .await
                {
                    warn!(tenant = %tenant_id, error = %rollback, "failed to roll back tenant");
                }
            }
            return Err(e);
        }

        // Each edge is recorded as soon as it exists, so a claim deleted
        // mid-way still knows what to tear down.
        let mut failed = false;
        for index in 0..registration.config.v1().edge_count as usize {
            let request = self.resource_request(registration, &claim, index);
            let resource = match self
                .bounded("create resource", self.provisioner.create_resource(&request))
                .await
            {
                Ok(resource) => resource,
                Err(e) => {
                    warn!(tenant = %tenant_id, edge = %request.name, error = %e, "resource creation failed");
                    failed = true;
                    break;
                }
            };

            let mut context = EdgeContext::new(resource.context_id, resource.state, now);
            context.edge_id = resource.edge_id;
            match self.store.add_edge_context(&tenant_id, &context, now).await {
                Ok(ClaimState::Creating) => {}
                Ok(state) => {
                    info!(tenant = %tenant_id, state = %state, "tenant claim changed while provisioning");
                    break;
                }
                Err(e) => {
                    // The claim row is gone; the edge has no owner left
                    if let Err(cleanup) = self
                        .bounded("delete resource", self.provisioner.delete_resource(&tenant_id, &context.id))
                        .await
                    {
                        warn!(tenant = %tenant_id, context = %context.id, error = %cleanup, "failed to delete orphaned edge");
                    }
                    return Err(e);
                }
            }
        }

        if failed {
            match self
                .store
                .change_claim_state(
                    &tenant_id,
                    &StateChange::to(ClaimState::Failed),
                    &StateGuard::expect(ClaimState::Creating),
                    now,
                )
                .await
            {
                // Moved on already; the reconciler handles it from there
                Ok(()) | Err(PoolError::RecordNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let claim = self
            .store
            .get_tenant_claim(&tenant_id)
            .await?
            .ok_or_else(|| PoolError::not_found(format!("tenant claim {}", tenant_id)))?;

        info!(
            registration = %registration.id,
            tenant = %claim.id,
            trial,
            state = %claim.state,
            "tenant claim created"
        );
        Ok(claim)
    }

    fn resource_request(
        &self,
        registration: &Registration,
        claim: &TenantClaim,
        index: usize,
    ) -> CreateResourceConfig {
        let cfg = registration.config.v1();
        CreateResourceConfig {
            tenant_id: claim.id.clone(),
            name: edge_name(index),
            system_user: claim.system_user.clone(),
            system_password: claim.system_password_secret(),
            instance_type: cfg.instance_type.clone(),
            tags: vec![
                format!("namespace={}", self.config.namespace),
                format!("registration={}", registration.id),
                format!("tenant={}", claim.id),
                format!("chart-version={}", self.config.app_chart_version),
                format!("trial={}", claim.trial),
            ],
            deploy_app: cfg.deploy_apps || claim.trial,
            app_chart_version: self.config.app_chart_version.clone(),
        }
    }

    // ==================== Queries ====================

    pub async fn get_tenant_claims(
        &self,
        lookup: &ClaimLookup,
        page: &PageQuery,
    ) -> PoolResult<(Vec<TenantClaim>, PageInfo)> {
        let mut query = ClaimQuery {
            registration_id: lookup.registration_id.clone(),
            tenant_id: lookup.tenant_id.clone(),
            states: lookup.states.clone(),
        };

        if let Some(email) = &lookup.email {
            let user = self
                .bounded("lookup user", self.accounts.lookup_user_by_email(email))
                .await?;
            match user {
                Some(user) if query.tenant_id.as_ref().is_none_or(|t| *t == user.tenant_id) => {
                    query.tenant_id = Some(user.tenant_id);
                }
                _ => return Ok((Vec::new(), PageInfo::new(page, 0))),
            }
        }

        let (mut claims, info) = self.store.list_tenant_claims(&query, page).await?;

        if lookup.verbose {
            for claim in &mut claims {
                for context in &mut claim.edge_contexts {
                    match self
                        .bounded(
                            "describe resource",
                            self.provisioner.describe_resource(&claim.id, &context.id),
                        )
                        .await
                    {
                        Ok(details) => context.details = Some(details),
                        Err(e) => {
                            debug!(tenant = %claim.id, context = %context.id, error = %e, "no resource details")
                        }
                    }
                }
            }
        }

        Ok((claims, info))
    }

    pub async fn get_audit_logs(
        &self,
        query: &AuditQuery,
        page: &PageQuery,
    ) -> PoolResult<(Vec<AuditLog>, PageInfo)> {
        self.store.get_audit_logs(query, page).await
    }

    // ==================== Reserve / Confirm ====================

    /// Take one `AVAILABLE` trial claim out of the pool. Returns its tenant id.
    pub async fn reserve_tenant_claim(&self, registration_id: &str) -> PoolResult<String> {
        let now = self.clock.now();
        let result = self.reserve(registration_id, now).await;

        let mut log = AuditLog::new(AuditAction::ReserveTenantClaim, AuditActor::User, now)
            .registration(registration_id);
        if let Ok(tenant_id) = &result {
            log = log.tenant(tenant_id.clone());
        }
        self.audit.append_outcome(log, &result);

        result
    }

    async fn reserve(&self, registration_id: &str, now: DateTime<Utc>) -> PoolResult<String> {
        let registration = self.store.get_active_registration(registration_id).await?;
        let window = registration.config.reserve_window(self.config.reserve_expiry());

        let page = PageQuery {
            filter: Some("trial = true".to_string()),
            order_by: Some("created_at asc".to_string()),
            ..PageQuery::default()
        };
        let query = ClaimQuery::registration(registration_id).in_states(&[ClaimState::Available]);
        let (candidates, _) = self.store.list_tenant_claims(&query, &page).await?;

        let change = StateChange {
            reserve_expires_at: Some(now + window),
            ..StateChange::to(ClaimState::Reserved)
        };
        for candidate in candidates {
            match self
                .store
                .change_claim_state(&candidate.id, &change, &StateGuard::expect(ClaimState::Available), now)
                .await
            {
                Ok(()) => {
                    info!(registration = %registration_id, tenant = %candidate.id, "tenant claim reserved");
                    return Ok(candidate.id);
                }
                // Someone else won this one
                Err(PoolError::RecordNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(PoolError::not_found(format!(
            "available tenant claim for registration {}",
            registration_id
        )))
    }

    /// Turn a reservation into an assignment and create the tenant's
    /// system user.
    pub async fn confirm_tenant_claim(
        &self,
        registration_id: &str,
        tenant_id: &str,
    ) -> PoolResult<TenantClaim> {
        let now = self.clock.now();
        let result = self.confirm(registration_id, tenant_id, now).await;

        let log = AuditLog::new(AuditAction::ConfirmTenantClaim, AuditActor::User, now)
            .registration(registration_id)
            .tenant(tenant_id);
        self.audit.append_outcome(log, &result);

        result
    }

    async fn confirm(
        &self,
        registration_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> PoolResult<TenantClaim> {
        let registration = self.store.get_active_registration(registration_id).await?;

        let claim = self
            .store
            .get_tenant_claim(tenant_id)
            .await?
            .filter(|c| c.registration_id == registration_id && c.state == ClaimState::Reserved)
            .ok_or_else(|| PoolError::not_found(format!("reserved tenant claim {}", tenant_id)))?;

        if claim.reserve_expires_at.is_some_and(|deadline| deadline < now) {
            return Err(PoolError::bad_request(format!(
                "reservation of tenant claim {} has expired",
                tenant_id
            )));
        }

        let change = StateChange {
            assigned_at: Some(now),
            expires_at: Some(claim.expires_at.unwrap_or(now + registration.config.trial_period())),
            ..StateChange::to(ClaimState::Assigned)
        };
        // The identity call runs before the write so no connection is held
        // across it. A lost race leaves a system user behind, which a retry
        // tolerates and tenant deletion removes.
        self.create_system_user(&claim).await?;
        let guard = StateGuard::expect(ClaimState::Reserved).with_version(claim.version);
        self.store
            .change_claim_state(tenant_id, &change, &guard, now)
            .await?;

        info!(registration = %registration_id, tenant = %tenant_id, "tenant claim confirmed");
        self.store
            .get_tenant_claim(tenant_id)
            .await?
            .ok_or_else(|| PoolError::not_found(format!("tenant claim {}", tenant_id)))
    }

    pub(super) async fn create_system_user(&self, claim: &TenantClaim) -> PoolResult<()> {
        let user = NewUser::new(
            &claim.id,
            SYSTEM_USER_NAME,
            &claim.system_user,
            claim.system_password_secret(),
        );
        match tokio::time::timeout(
            self.config.call_timeout(),
            self.accounts.create_tenant_user(&user),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            // Left behind by an earlier attempt whose state write missed
            Ok(Err(AccountError::AlreadyExists(_))) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PoolError::Internal("create system user timed out".to_string())),
        }
    }

    // ==================== Update / Delete / Recreate ====================

    /// Change the caller-editable attributes of a claim.
    pub async fn update_tenant_claim(
        &self,
        tenant_id: &str,
        trial: Option<bool>,
        expires_at: Option<DateTime<Utc>>,
    ) -> PoolResult<()> {
        self.store
            .update_claim_attributes(tenant_id, trial, expires_at, self.clock.now())
            .await?;
        debug!(tenant = %tenant_id, ?trial, ?expires_at, "tenant claim updated");
        Ok(())
    }

    /// Start tearing a claim down, whatever state it is in.
    pub async fn delete_tenant_claim(&self, tenant_id: &str) -> PoolResult<()> {
        let now = self.clock.now();
        let result = self
            .store
            .change_claim_state(
                tenant_id,
                &StateChange::to(ClaimState::Deleting),
                &StateGuard::except(ClaimState::Deleting),
                now,
            )
            .await;

        let log =
            AuditLog::new(AuditAction::DeleteTenantClaim, AuditActor::User, now).tenant(tenant_id);
        self.audit.append_outcome(log, &result);

        if result.is_ok() {
            info!(tenant = %tenant_id, "tenant claim marked for deletion");
        }
        result
    }

    /// Replace matching `AVAILABLE` claims. Returns how many were marked.
    pub async fn recreate_tenant_claims(
        &self,
        registration_id: &str,
        filter: Option<&str>,
    ) -> PoolResult<usize> {
        let now = self.clock.now();
        let result = self.recreate(registration_id, filter, now).await;

        let mut log = AuditLog::new(AuditAction::RecreateTenantClaims, AuditActor::User, now)
            .registration(registration_id);
        if let Some(filter) = filter {
            log = log.description(format!("filter: {}", filter));
        }
        self.audit.append_outcome(log, &result);

        result
    }

    async fn recreate(
        &self,
        registration_id: &str,
        filter: Option<&str>,
        now: DateTime<Utc>,
    ) -> PoolResult<usize> {
        let filter = Filter::parse_opt(filter, CLAIM_KEYS)?;
        if self.store.get_registration(registration_id).await?.is_none() {
            return Err(PoolError::not_found(format!("registration {}", registration_id)));
        }

        let ids = self
            .store
            .trigger_delete_tenant_claims(registration_id, &filter, now)
            .await?;
        info!(registration = %registration_id, count = ids.len(), "tenant claims marked for recreation");
        Ok(ids.len())
    }

    // ==================== Assign ====================

    /// Give a claim to an end user by email. An `AVAILABLE` claim is taken
    /// through `RESERVED` to `ASSIGNED`; an `ASSIGNED` claim gains another
    /// user.
    pub async fn assign_tenant_claim(
        &self,
        registration_id: &str,
        tenant_id: &str,
        email: &str,
    ) -> PoolResult<()> {
        let now = self.clock.now();
        let result = self.assign(registration_id, tenant_id, email, now).await;

        let log = AuditLog::new(AuditAction::AssignTenantClaim, AuditActor::User, now)
            .registration(registration_id)
            .tenant(tenant_id)
            .email(email);
        self.audit.append_outcome(log, &result);

        result
    }

    async fn assign(
        &self,
        registration_id: &str,
        tenant_id: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> PoolResult<()> {
        validate_email(email)?;
        let existing = self
            .bounded("lookup user", self.accounts.lookup_user_by_email(email))
            .await?;
        if existing.is_some() {
            return Err(PoolError::Duplicate(format!("user {}", email)));
        }

        let registration = self
            .store
            .get_registration(registration_id)
            .await?
            .ok_or_else(|| PoolError::not_found(format!("registration {}", registration_id)))?;
        let claim = self
            .store
            .get_tenant_claim(tenant_id)
            .await?
            .filter(|c| c.registration_id == registration_id)
            .ok_or_else(|| PoolError::not_found(format!("tenant claim {}", tenant_id)))?;

        let user = NewUser::new(
            tenant_id,
            TRIAL_USER_NAME,
            email,
            Uuid::new_v4().simple().to_string().into(),
        );

        match claim.state {
            ClaimState::Available => {
                // Hold the claim as RESERVED while the identity service is
                // called; the reservation deadline hands it back to the pool
                // if this process dies in between.
                let window = registration.config.reserve_window(self.config.reserve_expiry());
                let reserve = StateChange {
                    reserve_expires_at: Some(now + window),
                    ..StateChange::to(ClaimState::Reserved)
                };
                let guard = StateGuard::expect(ClaimState::Available).with_version(claim.version);
                self.store
                    .change_claim_state(tenant_id, &reserve, &guard, now)
                    .await?;

                if let Err(e) = self
                    .bounded("create user", self.accounts.create_tenant_user(&user))
                    .await
                {
                    let restore = StateGuard::expect(ClaimState::Reserved);
                    if let Err(restore_err) =
                        self.store.update_tenant_claim_txn(&claim, &restore, now).await
                    {
                        warn!(tenant = %tenant_id, error = %restore_err, "failed to return tenant claim to the pool");
                    }
                    return Err(e);
                }

                let assign = StateChange {
                    assigned_at: Some(now),
                    expires_at: Some(
                        claim
                            .expires_at
                            .unwrap_or(now + registration.config.trial_period()),
                    ),
                    ..StateChange::to(ClaimState::Assigned)
                };
                self.store
                    .change_claim_state(tenant_id, &assign, &StateGuard::expect(ClaimState::Reserved), now)
                    .await?;
                info!(tenant = %tenant_id, "tenant claim assigned");
            }
            ClaimState::Assigned => {
                self.bounded("create user", self.accounts.create_tenant_user(&user))
                    .await?;
                info!(tenant = %tenant_id, "user added to assigned tenant claim");
            }
            state => {
                return Err(PoolError::not_found(format!(
                    "assignable tenant claim {} (state {})",
                    tenant_id, state
                )));
            }
        }
        Ok(())
    }

    // ==================== Administration ====================

    /// Hard-delete every claim of a registration without draining its edges.
    pub async fn purge_tenants(&self, registration_id: &str) -> PoolResult<Vec<String>> {
        let ids = self.store.purge_tenants(registration_id).await?;
        warn!(registration = %registration_id, count = ids.len(), "tenant claims purged");
        Ok(ids)
    }
}

fn new_claim(registration: &Registration, tenant_id: &str, trial: bool, now: DateTime<Utc>) -> TenantClaim {
    TenantClaim {
        id: tenant_id.to_string(),
        registration_id: registration.id.clone(),
        state: ClaimState::Creating,
        trial,
        assigned_at: None,
        expires_at: None,
        reserve_expires_at: None,
        system_user: system_user_email(tenant_id),
        system_password: Uuid::new_v4().simple().to_string(),
        resources: Default::default(),
        edge_contexts: Vec::new(),
        created_at: now,
        updated_at: now,
        version: 1,
    }
}

fn validate_email(email: &str) -> PoolResult<()> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(PoolError::bad_request(format!("invalid email: {}", email)))
    }
}
