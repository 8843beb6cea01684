//! Shared fixtures for pool tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use super::clock::{Clock, MockClock};
use super::config::PoolConfig;
use super::db::ClaimStore;
use super::lifecycle::PoolManager;
use super::models::{ClaimQuery, CreateRegistration, PageQuery};
use super::reconciler::ScanOutcome;
use crate::account::MemoryAccountService;
use crate::coord::{Coordinator, KvStores, MemoryKvStore};
use crate::provision::FakeProvisioner;
use crate::types::{
    AuditLog, ClaimState, RegistrationConfig, RegistrationConfigV1, RegistrationState,
    TenantClaim, system_user_email,
};

/// Controllable time shared by every clone handed out through [`ManualClock::shared`].
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }

    /// A mocked [`Clock`] reading this manual time.
    pub fn shared(&self) -> Arc<dyn Clock> {
        let now = self.now.clone();
        let mut clock = MockClock::new();
        clock.expect_now().returning(move || *now.lock().unwrap());
        Arc::new(clock)
    }
}

/// A v1 pool policy with one-hour trials.
pub fn pool_config(edge_count: u32, min: u32, max: u32, pending: u32) -> RegistrationConfig {
    RegistrationConfig::V1(RegistrationConfigV1 {
        edge_count,
        instance_type: "c5.large".to_string(),
        min_tenant_pool_size: min,
        max_tenant_pool_size: max,
        max_pending_tenant_count: pending,
        trial_expiry: 3600,
        deploy_apps: false,
        reserve_expiry: None,
    })
}

pub fn new_registration(id: &str, config: RegistrationConfig) -> CreateRegistration {
    CreateRegistration {
        id: id.to_string(),
        description: format!("{} pool", id),
        config,
        state: RegistrationState::Active,
    }
}

/// A trial claim with no edge contexts.
pub fn trial_claim(id: &str, registration_id: &str, state: ClaimState, now: DateTime<Utc>) -> TenantClaim {
    TenantClaim {
        id: id.to_string(),
        registration_id: registration_id.to_string(),
        state,
        trial: true,
        assigned_at: None,
        expires_at: None,
        reserve_expires_at: None,
        system_user: system_user_email(id),
        system_password: "pw".to_string(),
        resources: BTreeMap::new(),
        edge_contexts: Vec::new(),
        created_at: now,
        updated_at: now,
        version: 1,
    }
}

/// A pool manager over an in-memory store, fake backends and a manual clock.
pub struct Harness {
    pub clock: ManualClock,
    pub provisioner: FakeProvisioner,
    pub accounts: MemoryAccountService,
    pub kv: MemoryKvStore,
    pub manager: Arc<PoolManager<FakeProvisioner, MemoryAccountService>>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(PoolConfig::default()).await
    }

    pub async fn with_config(config: PoolConfig) -> Self {
        let clock = ManualClock::new();
        let provisioner = FakeProvisioner::new();
        let accounts = MemoryAccountService::new();
        let kv = MemoryKvStore::new();
        let store = ClaimStore::open_in_memory().await.unwrap();
        let coordinator = Coordinator::new(KvStores::Memory(kv.clone()), config.lock_ttl(), clock.shared());
        let manager = PoolManager::new(
            store,
            provisioner.clone(),
            accounts.clone(),
            coordinator,
            config,
            clock.shared(),
        );
        Self {
            clock,
            provisioner,
            accounts,
            kv,
            manager: Arc::new(manager),
        }
    }

    pub async fn register(&self, id: &str, config: RegistrationConfig) {
        self.manager
            .create_registration(&new_registration(id, config))
            .await
            .unwrap();
    }

    /// One reconciliation pass that must not be skipped.
    pub async fn tick(&self, registration_id: &str) -> ScanOutcome {
        self.manager.reconcile_registration(registration_id).await.unwrap()
    }

    pub async fn claims(&self, registration_id: &str, state: ClaimState) -> Vec<TenantClaim> {
        let query = ClaimQuery::registration(registration_id).in_states(&[state]);
        let (claims, _) = self
            .manager
            .store()
            .list_tenant_claims(&query, &PageQuery::all())
            .await
            .unwrap();
        claims
    }

    pub async fn count(&self, registration_id: &str, state: ClaimState) -> usize {
        self.claims(registration_id, state).await.len()
    }

    /// Every audit record, once the queued writes have landed.
    pub async fn audit_logs(&self) -> Vec<AuditLog> {
        self.manager.flush_audit().await;
        let (logs, _) = self
            .manager
            .get_audit_logs(&Default::default(), &PageQuery::all())
            .await
            .unwrap();
        logs
    }
}
