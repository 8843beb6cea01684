//! SQLite claim store: the system of record for registrations, claims,
//! edge contexts and audit logs.
//!
//! Every write to a claim's state goes through a [`StateGuard`] evaluated in
//! the same statement as the write. A guard that no longer holds leaves the
//! row untouched and the caller sees `RecordNotFound`.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};

use super::filter::{CLAIM_KEYS, Filter, REGISTRATION_KEYS, order_by_clause};
use super::models::{
    AuditLogRow, AuditQuery, ClaimQuery, ClaimRow, CreateRegistration, EdgeContextRow,
    MAX_PAGE_SIZE, PageInfo, PageQuery, RegistrationRow, UpdateRegistration, format_ts,
};
use crate::types::{
    AuditAction, AuditLog, ClaimState, EdgeContext, PoolError, PoolResult, Registration,
    RegistrationState, TenantClaim, validate_registration_fields,
};

/// Condition a claim row must still meet for a write to apply.
#[derive(Debug, Clone, Default)]
pub struct StateGuard {
    pub expected: Option<ClaimState>,
    pub unexpected: Option<ClaimState>,
    pub version: Option<i64>,
}

impl StateGuard {
    pub fn expect(state: ClaimState) -> Self {
        Self {
            expected: Some(state),
            ..Self::default()
        }
    }

    pub fn except(state: ClaimState) -> Self {
        Self {
            unexpected: Some(state),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    fn push_to(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(state) = self.expected {
            qb.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(state) = self.unexpected {
            qb.push(" AND state != ").push_bind(state.as_str());
        }
        if let Some(version) = self.version {
            qb.push(" AND version = ").push_bind(version);
        }
    }
}

/// A state transition plus the timestamps that travel with it.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub state: ClaimState,
    /// Written only when set.
    pub assigned_at: Option<DateTime<Utc>>,
    /// Written only when set.
    pub expires_at: Option<DateTime<Utc>>,
    /// Always written; leaving `RESERVED` clears it.
    pub reserve_expires_at: Option<DateTime<Utc>>,
}

impl StateChange {
    pub fn to(state: ClaimState) -> Self {
        Self {
            state,
            assigned_at: None,
            expires_at: None,
            reserve_expires_at: None,
        }
    }
}

/// SQLite-backed claim store.
#[derive(Debug, Clone)]
pub struct ClaimStore {
    pool: SqlitePool,
}

impl ClaimStore {
    /// Open or create the database at the given path.
    pub async fn open(db_path: &Path) -> PoolResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PoolError::Internal(format!("create database directory: {}", e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| PoolError::from_db("open database", e))?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Private in-memory database, alive as long as the store.
    #[cfg(test)]
    pub async fn open_in_memory() -> PoolResult<Self> {
        let options = "sqlite::memory:".parse::<SqliteConnectOptions>()?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| PoolError::from_db("open database", e))?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction; dropping it without commit rolls back.
    pub async fn begin(&self) -> PoolResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Run database migrations.
    async fn migrate(&self) -> PoolResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS registrations (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL DEFAULT '',
                config TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_claims (
                id TEXT PRIMARY KEY,
                registration_id TEXT NOT NULL,
                state TEXT NOT NULL,
                trial INTEGER NOT NULL,
                assigned_at TEXT,
                expires_at TEXT,
                reserve_expires_at TEXT,
                system_user TEXT NOT NULL,
                system_password TEXT NOT NULL,
                resources TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (registration_id) REFERENCES registrations(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS edge_contexts (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                edge_id TEXT,
                state TEXT NOT NULL,
                edge_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (tenant_id) REFERENCES tenant_claims(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT,
                registration_id TEXT,
                email TEXT,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                response TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_claims_registration_state ON tenant_claims(registration_id, state)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_edge_contexts_tenant ON edge_contexts(tenant_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_registration ON audit_logs(registration_id, action, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Registration Operations ====================

    /// Validate and insert a registration.
    pub async fn create_registration(
        &self,
        input: &CreateRegistration,
        now: DateTime<Utc>,
    ) -> PoolResult<Registration> {
        validate_registration_fields(&input.id, &input.description)?;
        input.config.validate()?;
        if input.state == RegistrationState::Deleting {
            return Err(PoolError::bad_request(
                "a registration cannot be created in DELETING state",
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO registrations (id, description, config, state, created_at, updated_at, version)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&input.id)
        .bind(&input.description)
        .bind(input.config.to_json()?)
        .bind(input.state.as_str())
        .bind(format_ts(now))
        .bind(format_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| PoolError::from_db(&format!("registration {}", input.id), e))?;

        Ok(Registration {
            id: input.id.clone(),
            description: input.description.clone(),
            config: input.config.clone(),
            state: input.state,
            created_at: now,
            updated_at: now,
            version: 1,
        })
    }

    pub async fn get_registration(&self, id: &str) -> PoolResult<Option<Registration>> {
        let row = sqlx::query_as::<_, RegistrationRow>("SELECT * FROM registrations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Registration::try_from).transpose()
    }

    /// The registration, provided it is `ACTIVE`.
    pub async fn get_active_registration(&self, id: &str) -> PoolResult<Registration> {
        match self.get_registration(id).await? {
            Some(registration) if registration.is_active() => Ok(registration),
            _ => Err(PoolError::not_found(format!("active registration {}", id))),
        }
    }

    /// Filtered, paginated registration scan.
    pub async fn get_registrations(
        &self,
        id: Option<&str>,
        states: &[RegistrationState],
        page: &PageQuery,
    ) -> PoolResult<(Vec<Registration>, PageInfo)> {
        let filter = Filter::parse_opt(page.filter.as_deref(), REGISTRATION_KEYS)?;
        let order_by = order_by_clause(page.order_by.as_deref(), REGISTRATION_KEYS)?;

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM registrations WHERE 1 = 1");
        push_registration_where(&mut count, id, states, &filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM registrations WHERE 1 = 1");
        push_registration_where(&mut select, id, states, &filter);
        push_page(&mut select, &order_by, page);
        let rows = select
            .build_query_as::<RegistrationRow>()
            .fetch_all(&self.pool)
            .await?;

        let registrations = rows
            .into_iter()
            .map(Registration::try_from)
            .collect::<PoolResult<Vec<_>>>()?;

        Ok((registrations, PageInfo::new(page, total as u64)))
    }

    /// Update description, config or state. `edgeCount`, `instanceType`
    /// and the config version cannot change.
    pub async fn update_registration(
        &self,
        update: &UpdateRegistration,
        now: DateTime<Utc>,
    ) -> PoolResult<Registration> {
        let mut current = self
            .get_registration(&update.id)
            .await?
            .ok_or_else(|| PoolError::not_found(format!("registration {}", update.id)))?;

        if current.state == RegistrationState::Deleting {
            return Err(PoolError::bad_request(format!(
                "registration {} is being deleted",
                update.id
            )));
        }
        if update.state == Some(RegistrationState::Deleting) {
            return Err(PoolError::bad_request(
                "use delete to remove a registration",
            ));
        }
        if let Some(description) = &update.description {
            validate_registration_fields(&update.id, description)?;
            current.description = description.clone();
        }
        if let Some(config) = &update.config {
            config.validate()?;
            current.config.check_modifiable(config)?;
            current.config = config.clone();
        }
        if let Some(state) = update.state {
            current.state = state;
        }

        let result = sqlx::query(
            r#"
            UPDATE registrations
            SET description = ?, config = ?, state = ?, updated_at = ?, version = version + 1
            WHERE id = ? AND version = ? AND state != 'DELETING'
            "#,
        )
        .bind(&current.description)
        .bind(current.config.to_json()?)
        .bind(current.state.as_str())
        .bind(format_ts(now))
        .bind(&current.id)
        .bind(current.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PoolError::not_found(format!(
                "registration {} at version {}",
                current.id, current.version
            )));
        }

        current.updated_at = now;
        current.version += 1;
        Ok(current)
    }

    /// Set the state unless the row is currently in `unexpected`.
    pub async fn update_registration_state(
        &self,
        id: &str,
        state: RegistrationState,
        unexpected: Option<RegistrationState>,
        now: DateTime<Utc>,
    ) -> PoolResult<()> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE registrations SET state = ");
        qb.push_bind(state.as_str())
            .push(", updated_at = ")
            .push_bind(format_ts(now))
            .push(", version = version + 1 WHERE id = ")
            .push_bind(id.to_string());
        if let Some(unexpected) = unexpected {
            qb.push(" AND state != ").push_bind(unexpected.as_str());
        }

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(PoolError::not_found(format!("registration {}", id)));
        }
        Ok(())
    }

    /// Remove the registration row. Fails while claims still reference it.
    pub async fn delete_registration(&self, id: &str) -> PoolResult<()> {
        let result = sqlx::query("DELETE FROM registrations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| PoolError::from_db(&format!("registration {}", id), e))?;

        if result.rows_affected() == 0 {
            return Err(PoolError::not_found(format!("registration {}", id)));
        }
        Ok(())
    }

    // ==================== Tenant Claim Operations ====================

    /// Insert a claim with its edge contexts.
    pub async fn insert_tenant_claim(&self, claim: &TenantClaim) -> PoolResult<()> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tenant_claims (
                id, registration_id, state, trial, assigned_at, expires_at,
                reserve_expires_at, system_user, system_password, resources,
                created_at, updated_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&claim.id)
        .bind(&claim.registration_id)
        .bind(claim.state.as_str())
        .bind(claim.trial)
        .bind(claim.assigned_at.map(format_ts))
        .bind(claim.expires_at.map(format_ts))
        .bind(claim.reserve_expires_at.map(format_ts))
        .bind(&claim.system_user)
        .bind(hex::encode(&claim.system_password))
        .bind(resources_json(claim)?)
        .bind(format_ts(claim.created_at))
        .bind(format_ts(claim.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| PoolError::from_db(&format!("tenant claim {}", claim.id), e))?;

        replace_edge_contexts(&mut tx, claim).await?;
        tx.commit().await?;

        Ok(())
    }

    pub async fn get_tenant_claim(&self, id: &str) -> PoolResult<Option<TenantClaim>> {
        let mut conn = self.pool.acquire().await?;
        load_tenant_claim(&mut conn, id).await
    }

    /// One page of claims matching `query`.
    pub async fn list_tenant_claims(
        &self,
        query: &ClaimQuery,
        page: &PageQuery,
    ) -> PoolResult<(Vec<TenantClaim>, PageInfo)> {
        let filter = Filter::parse_opt(page.filter.as_deref(), CLAIM_KEYS)?;
        let order_by = order_by_clause(page.order_by.as_deref(), CLAIM_KEYS)?;

        let mut conn = self.pool.acquire().await?;

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM tenant_claims WHERE 1 = 1");
        push_claim_where(&mut count, query, &filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&mut *conn).await?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM tenant_claims WHERE 1 = 1");
        push_claim_where(&mut select, query, &filter);
        push_page(&mut select, &order_by, page);
        let rows = select
            .build_query_as::<ClaimRow>()
            .fetch_all(&mut *conn)
            .await?;

        let mut claims = Vec::with_capacity(rows.len());
        for row in rows {
            let contexts = load_edge_contexts(&mut conn, &row.id).await?;
            claims.push(row.into_claim(contexts)?);
        }

        Ok((claims, PageInfo::new(page, total as u64)))
    }

    /// Every claim matching `query`, oldest first.
    pub async fn collect_tenant_claims(&self, query: &ClaimQuery) -> PoolResult<Vec<TenantClaim>> {
        let mut page = PageQuery::all();
        page.order_by = Some("created_at asc, id asc".to_string());

        let mut all = Vec::new();
        loop {
            let (claims, info) = self.list_tenant_claims(query, &page).await?;
            let fetched = claims.len() as u64;
            all.extend(claims);
            if fetched < MAX_PAGE_SIZE as u64 || all.len() as u64 >= info.total_count {
                break;
            }
            page.page_index += 1;
        }
        Ok(all)
    }

    /// Stream one page of matching claims, each with its registration, to
    /// `callback`. Rows are fetched up front so the callback may write
    /// through the store.
    pub async fn scan_tenant_claims<F, Fut>(
        &self,
        query: &ClaimQuery,
        page: &PageQuery,
        mut callback: F,
    ) -> PoolResult<PageInfo>
    where
        F: FnMut(Arc<Registration>, TenantClaim) -> Fut,
        Fut: Future<Output = PoolResult<()>>,
    {
        let (claims, info) = self.list_tenant_claims(query, page).await?;

        let mut registrations: HashMap<String, Arc<Registration>> = HashMap::new();
        for claim in claims {
            let registration = match registrations.get(&claim.registration_id) {
                Some(registration) => registration.clone(),
                None => {
                    let registration = self
                        .get_registration(&claim.registration_id)
                        .await?
                        .map(Arc::new)
                        .ok_or_else(|| {
                            PoolError::Internal(format!(
                                "claim {} references missing registration {}",
                                claim.id, claim.registration_id
                            ))
                        })?;
                    registrations.insert(claim.registration_id.clone(), registration.clone());
                    registration
                }
            };
            callback(registration, claim).await?;
        }

        Ok(info)
    }

    /// Write the whole claim and its contexts in one transaction, if `guard` holds.
    pub async fn update_tenant_claim_txn(
        &self,
        claim: &TenantClaim,
        guard: &StateGuard,
        now: DateTime<Utc>,
    ) -> PoolResult<()> {
        let mut tx = self.begin().await?;
        if !write_claim(&mut tx, claim, guard, now).await? {
            return Err(PoolError::not_found(format!(
                "tenant claim {} in expected state",
                claim.id
            )));
        }
        replace_edge_contexts(&mut tx, claim).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Append one edge context to a claim, whatever state the claim is in,
    /// and return that state. The claim's version moves so that a writer
    /// holding an older snapshot cannot drop the new context.
    pub async fn add_edge_context(
        &self,
        tenant_id: &str,
        context: &EdgeContext,
        now: DateTime<Utc>,
    ) -> PoolResult<ClaimState> {
        let mut tx = self.begin().await?;

        let state: Option<String> = sqlx::query_scalar(
            "UPDATE tenant_claims SET updated_at = ?, version = version + 1 WHERE id = ? RETURNING state",
        )
        .bind(format_ts(now))
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;
        let state = state
            .ok_or_else(|| PoolError::not_found(format!("tenant claim {}", tenant_id)))?
            .parse::<ClaimState>()
            .map_err(PoolError::Internal)?;

        sqlx::query(
            r#"
            INSERT INTO edge_contexts (
                id, tenant_id, position, edge_id, state, edge_type, created_at, updated_at, version
            ) VALUES (
                ?, ?, (SELECT COALESCE(MAX(position) + 1, 0) FROM edge_contexts WHERE tenant_id = ?),
                ?, ?, ?, ?, ?, ?
            )
            "#,
        )
        .bind(&context.id)
        .bind(tenant_id)
        .bind(tenant_id)
        .bind(&context.edge_id)
        .bind(context.state.as_str())
        .bind(&context.kind)
        .bind(format_ts(context.created_at))
        .bind(format_ts(context.updated_at))
        .bind(context.version)
        .execute(&mut *tx)
        .await
        .map_err(|e| PoolError::from_db(&format!("edge context {}", context.id), e))?;

        tx.commit().await?;
        Ok(state)
    }

    /// Guarded state transition outside any caller transaction.
    pub async fn change_claim_state(
        &self,
        id: &str,
        change: &StateChange,
        guard: &StateGuard,
        now: DateTime<Utc>,
    ) -> PoolResult<()> {
        let mut conn = self.pool.acquire().await?;
        if !change_claim_state(&mut conn, id, change, guard, now).await? {
            return Err(PoolError::not_found(format!(
                "tenant claim {} in expected state",
                id
            )));
        }
        Ok(())
    }

    /// Set `trial` and `expires_at`; the only caller-editable claim attributes.
    pub async fn update_claim_attributes(
        &self,
        id: &str,
        trial: Option<bool>,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PoolResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_claims
            SET trial = COALESCE(?, trial), expires_at = COALESCE(?, expires_at),
                updated_at = ?, version = version + 1
            WHERE id = ?
            "#,
        )
        .bind(trial)
        .bind(expires_at.map(format_ts))
        .bind(format_ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PoolError::not_found(format!("tenant claim {}", id)));
        }
        Ok(())
    }

    /// Move matching `AVAILABLE` claims of a registration to `DELETING`.
    /// Returns the affected ids.
    pub async fn trigger_delete_tenant_claims(
        &self,
        registration_id: &str,
        filter: &Filter,
        now: DateTime<Utc>,
    ) -> PoolResult<Vec<String>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE tenant_claims SET state = 'DELETING', reserve_expires_at = NULL, updated_at = ",
        );
        qb.push_bind(format_ts(now))
            .push(", version = version + 1 WHERE registration_id = ")
            .push_bind(registration_id.to_string())
            .push(" AND state = 'AVAILABLE'");
        filter.push_to(&mut qb);
        qb.push(" RETURNING id");

        let ids: Vec<String> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(ids)
    }

    /// Remove a drained claim; its contexts go with it.
    pub async fn delete_tenant_claim(&self, id: &str) -> PoolResult<()> {
        let result = sqlx::query("DELETE FROM tenant_claims WHERE id = ? AND state = 'DELETING'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| PoolError::from_db(&format!("tenant claim {}", id), e))?;

        if result.rows_affected() == 0 {
            return Err(PoolError::not_found(format!("deleting tenant claim {}", id)));
        }
        Ok(())
    }

    /// Hard-delete every claim of a registration, skipping the drain.
    /// Returns the removed ids.
    pub async fn purge_tenants(&self, registration_id: &str) -> PoolResult<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("DELETE FROM tenant_claims WHERE registration_id = ? RETURNING id")
                .bind(registration_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    // ==================== Audit Log Operations ====================

    pub async fn insert_audit_log(&self, log: &AuditLog) -> PoolResult<i64> {
        log.validate()?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO audit_logs (
                tenant_id, registration_id, email, actor, action, response, description, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&log.tenant_id)
        .bind(&log.registration_id)
        .bind(&log.email)
        .bind(log.actor.as_str())
        .bind(log.action.as_str())
        .bind(log.response.as_str())
        .bind(&log.description)
        .bind(format_ts(log.created_at))
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get_audit_logs(
        &self,
        query: &AuditQuery,
        page: &PageQuery,
    ) -> PoolResult<(Vec<AuditLog>, PageInfo)> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_logs WHERE 1 = 1");
        push_audit_where(&mut count, query);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM audit_logs WHERE 1 = 1");
        push_audit_where(&mut select, query);
        push_page(&mut select, "created_at DESC, id DESC", page);
        let rows = select
            .build_query_as::<AuditLogRow>()
            .fetch_all(&self.pool)
            .await?;

        let logs = rows
            .into_iter()
            .map(AuditLog::try_from)
            .collect::<PoolResult<Vec<_>>>()?;

        Ok((logs, PageInfo::new(page, total as u64)))
    }

    /// Count `action` records for a registration created after `since`,
    /// with the newest timestamp seen.
    pub async fn count_audit_logs(
        &self,
        registration_id: &str,
        action: AuditAction,
        since: DateTime<Utc>,
    ) -> PoolResult<(u64, Option<DateTime<Utc>>)> {
        let (count, last): (i64, Option<String>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MAX(created_at) FROM audit_logs
            WHERE registration_id = ? AND action = ? AND created_at > ?
            "#,
        )
        .bind(registration_id)
        .bind(action.as_str())
        .bind(format_ts(since))
        .fetch_one(&self.pool)
        .await?;

        let last = last.as_deref().map(super::models::parse_ts).transpose()?;
        Ok((count as u64, last))
    }
}

// ==================== Query Helpers ====================

fn push_registration_where(
    qb: &mut QueryBuilder<'_, Sqlite>,
    id: Option<&str>,
    states: &[RegistrationState],
    filter: &Filter,
) {
    if let Some(id) = id {
        qb.push(" AND id = ").push_bind(id.to_string());
    }
    if !states.is_empty() {
        qb.push(" AND state IN (");
        let mut list = qb.separated(", ");
        for state in states {
            list.push_bind(state.as_str());
        }
        list.push_unseparated(")");
    }
    filter.push_to(qb);
}

fn push_claim_where(qb: &mut QueryBuilder<'_, Sqlite>, query: &ClaimQuery, filter: &Filter) {
    if let Some(registration_id) = &query.registration_id {
        qb.push(" AND registration_id = ").push_bind(registration_id.clone());
    }
    if let Some(tenant_id) = &query.tenant_id {
        qb.push(" AND id = ").push_bind(tenant_id.clone());
    }
    if !query.states.is_empty() {
        qb.push(" AND state IN (");
        let mut list = qb.separated(", ");
        for state in &query.states {
            list.push_bind(state.as_str());
        }
        list.push_unseparated(")");
    }
    filter.push_to(qb);
}

fn push_audit_where(qb: &mut QueryBuilder<'_, Sqlite>, query: &AuditQuery) {
    if let Some(tenant_id) = &query.tenant_id {
        qb.push(" AND tenant_id = ").push_bind(tenant_id.clone());
    }
    if let Some(registration_id) = &query.registration_id {
        qb.push(" AND registration_id = ").push_bind(registration_id.clone());
    }
    if let Some(email) = &query.email {
        qb.push(" AND email = ").push_bind(email.clone());
    }
    if let Some(action) = query.action {
        qb.push(" AND action = ").push_bind(action.as_str());
    }
    if let Some(since) = query.since {
        qb.push(" AND created_at >= ").push_bind(format_ts(since));
    }
}

fn push_page(qb: &mut QueryBuilder<'_, Sqlite>, order_by: &str, page: &PageQuery) {
    qb.push(" ORDER BY ")
        .push(order_by)
        .push(" LIMIT ")
        .push_bind(page.limit() as i64)
        .push(" OFFSET ")
        .push_bind(page.offset() as i64);
}

// ==================== Transaction Helpers ====================

fn resources_json(claim: &TenantClaim) -> PoolResult<String> {
    if claim.resources.is_empty() {
        Ok(String::new())
    } else {
        Ok(serde_json::to_string(&claim.resources)?)
    }
}

async fn load_edge_contexts(conn: &mut SqliteConnection, tenant_id: &str) -> PoolResult<Vec<EdgeContext>> {
    let rows = sqlx::query_as::<_, EdgeContextRow>(
        r#"
        SELECT id, edge_id, state, edge_type, created_at, updated_at, version
        FROM edge_contexts WHERE tenant_id = ? ORDER BY position
        "#,
    )
    .bind(tenant_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(EdgeContext::try_from).collect()
}

/// Load a claim through an existing connection or transaction.
pub async fn load_tenant_claim(conn: &mut SqliteConnection, id: &str) -> PoolResult<Option<TenantClaim>> {
    let row = sqlx::query_as::<_, ClaimRow>("SELECT * FROM tenant_claims WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => {
            let contexts = load_edge_contexts(conn, &row.id).await?;
            Ok(Some(row.into_claim(contexts)?))
        }
        None => Ok(None),
    }
}

/// Write the claim's mutable columns when `guard` holds. Returns whether a row changed.
pub async fn write_claim(
    conn: &mut SqliteConnection,
    claim: &TenantClaim,
    guard: &StateGuard,
    now: DateTime<Utc>,
) -> PoolResult<bool> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tenant_claims SET state = ");
    qb.push_bind(claim.state.as_str())
        .push(", trial = ")
        .push_bind(claim.trial)
        .push(", resources = ")
        .push_bind(resources_json(claim)?)
        .push(", assigned_at = ")
        .push_bind(claim.assigned_at.map(format_ts))
        .push(", expires_at = ")
        .push_bind(claim.expires_at.map(format_ts))
        .push(", reserve_expires_at = ")
        .push_bind(claim.reserve_expires_at.map(format_ts))
        .push(", updated_at = ")
        .push_bind(format_ts(now))
        .push(", version = version + 1 WHERE id = ")
        .push_bind(claim.id.clone());
    guard.push_to(&mut qb);

    let result = qb.build().execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

/// Guarded state transition. Returns whether a row changed.
pub async fn change_claim_state(
    conn: &mut SqliteConnection,
    id: &str,
    change: &StateChange,
    guard: &StateGuard,
    now: DateTime<Utc>,
) -> PoolResult<bool> {
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tenant_claims SET state = ");
    qb.push_bind(change.state.as_str())
        .push(", assigned_at = COALESCE(")
        .push_bind(change.assigned_at.map(format_ts))
        .push(", assigned_at), expires_at = COALESCE(")
        .push_bind(change.expires_at.map(format_ts))
        .push(", expires_at), reserve_expires_at = ")
        .push_bind(change.reserve_expires_at.map(format_ts))
        .push(", updated_at = ")
        .push_bind(format_ts(now))
        .push(", version = version + 1 WHERE id = ")
        .push_bind(id.to_string());
    guard.push_to(&mut qb);

    let result = qb.build().execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

/// Rewrite the claim's contexts in list order.
pub async fn replace_edge_contexts(conn: &mut SqliteConnection, claim: &TenantClaim) -> PoolResult<()> {
    sqlx::query("DELETE FROM edge_contexts WHERE tenant_id = ?")
        .bind(&claim.id)
        .execute(&mut *conn)
        .await?;

    for (position, context) in claim.edge_contexts.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO edge_contexts (
                id, tenant_id, position, edge_id, state, edge_type, created_at, updated_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&context.id)
        .bind(&claim.id)
        .bind(position as i64)
        .bind(&context.edge_id)
        .bind(context.state.as_str())
        .bind(&context.kind)
        .bind(format_ts(context.created_at))
        .bind(format_ts(context.updated_at))
        .bind(context.version)
        .execute(&mut *conn)
        .await
        .map_err(|e| PoolError::from_db(&format!("edge context {}", context.id), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testing::{ManualClock, new_registration, pool_config, trial_claim};
    use crate::types::{AuditActor, EdgeState, RegistrationConfig};

    async fn store_with_registration(clock: &ManualClock) -> ClaimStore {
        let store = ClaimStore::open_in_memory().await.unwrap();
        store
            .create_registration(&new_registration("reg", pool_config(2, 1, 4, 2)), clock.now())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_registration_crud() {
        let clock = ManualClock::new();
        let store = store_with_registration(&clock).await;

        let duplicate = store
            .create_registration(&new_registration("reg", pool_config(1, 0, 1, 1)), clock.now())
            .await;
        assert!(matches!(duplicate, Err(PoolError::Duplicate(_))));

        let mut config = pool_config(2, 2, 6, 2);
        let updated = store
            .update_registration(
                &UpdateRegistration {
                    id: "reg".into(),
                    description: Some("bigger".into()),
                    config: Some(config.clone()),
                    state: None,
                },
                clock.now(),
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.config.v1().min_tenant_pool_size, 2);

        // edgeCount shapes existing claims and is fixed.
        let RegistrationConfig::V1(v1) = &mut config;
        v1.edge_count = 3;
        let rejected = store
            .update_registration(
                &UpdateRegistration {
                    id: "reg".into(),
                    config: Some(config),
                    ..UpdateRegistration::default()
                },
                clock.now(),
            )
            .await;
        assert!(matches!(rejected, Err(PoolError::BadRequest(_))));

        store.delete_registration("reg").await.unwrap();
        assert!(store.get_registration("reg").await.unwrap().is_none());
        assert!(matches!(
            store.delete_registration("reg").await,
            Err(PoolError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registration_with_claims_cannot_be_removed() {
        let clock = ManualClock::new();
        let store = store_with_registration(&clock).await;
        store
            .insert_tenant_claim(&trial_claim("t1", "reg", ClaimState::Available, clock.now()))
            .await
            .unwrap();

        assert!(matches!(
            store.delete_registration("reg").await,
            Err(PoolError::DependencyConstraint(_))
        ));
    }

    #[tokio::test]
    async fn test_list_registrations_by_state() {
        let clock = ManualClock::new();
        let store = store_with_registration(&clock).await;
        let mut inactive = new_registration("quiet", pool_config(1, 0, 1, 1));
        inactive.state = RegistrationState::Inactive;
        store.create_registration(&inactive, clock.now()).await.unwrap();

        let (active, page) = store
            .get_registrations(None, &[RegistrationState::Active], &PageQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(active[0].id, "reg");

        let (all, _) = store
            .get_registrations(None, &[], &PageQuery::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_round_trip_keeps_context_order() {
        let clock = ManualClock::new();
        let store = store_with_registration(&clock).await;

        let mut claim = trial_claim("t1", "reg", ClaimState::Creating, clock.now());
        claim.system_password = "s3cr3t!".into();
        for id in ["ctx-b", "ctx-a"] {
            claim
                .edge_contexts
                .push(EdgeContext::new(id.to_string(), EdgeState::Creating, clock.now()));
        }
        store.insert_tenant_claim(&claim).await.unwrap();

        let loaded = store.get_tenant_claim("t1").await.unwrap().unwrap();
        assert_eq!(loaded.system_password, "s3cr3t!");
        let ids: Vec<_> = loaded.edge_contexts.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["ctx-b", "ctx-a"]);
    }

    #[tokio::test]
    async fn test_added_contexts_survive_stale_snapshots() {
        let clock = ManualClock::new();
        let store = store_with_registration(&clock).await;
        let mut claim = trial_claim("t1", "reg", ClaimState::Creating, clock.now());
        claim
            .edge_contexts
            .push(EdgeContext::new("ctx-a".to_string(), EdgeState::Creating, clock.now()));
        store.insert_tenant_claim(&claim).await.unwrap();

        let snapshot = store.get_tenant_claim("t1").await.unwrap().unwrap();
        let added = EdgeContext::new("ctx-b".to_string(), EdgeState::Creating, clock.now());
        let state = store.add_edge_context("t1", &added, clock.now()).await.unwrap();
        assert_eq!(state, ClaimState::Creating);

        let loaded = store.get_tenant_claim("t1").await.unwrap().unwrap();
        let ids: Vec<_> = loaded.edge_contexts.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["ctx-a", "ctx-b"]);
        assert_eq!(loaded.version, snapshot.version + 1);

        // The older snapshot would drop ctx-b, so its versioned write misses.
        let guard = StateGuard::expect(ClaimState::Creating).with_version(snapshot.version);
        assert!(matches!(
            store.update_tenant_claim_txn(&snapshot, &guard, clock.now()).await,
            Err(PoolError::RecordNotFound(_))
        ));
        assert_eq!(store.get_tenant_claim("t1").await.unwrap().unwrap().edge_contexts.len(), 2);

        let missing = store.add_edge_context("nope", &added, clock.now()).await;
        assert!(matches!(missing, Err(PoolError::RecordNotFound(_))));
    }

    #[tokio::test]
    async fn test_guarded_transition_applies_once() {
        let clock = ManualClock::new();
        let store = store_with_registration(&clock).await;
        store
            .insert_tenant_claim(&trial_claim("t1", "reg", ClaimState::Available, clock.now()))
            .await
            .unwrap();

        let reserve = StateChange {
            reserve_expires_at: Some(clock.now() + chrono::Duration::minutes(30)),
            ..StateChange::to(ClaimState::Reserved)
        };
        let guard = StateGuard::expect(ClaimState::Available);
        store
            .change_claim_state("t1", &reserve, &guard, clock.now())
            .await
            .unwrap();
        assert!(matches!(
            store.change_claim_state("t1", &reserve, &guard, clock.now()).await,
            Err(PoolError::RecordNotFound(_))
        ));

        let claim = store.get_tenant_claim("t1").await.unwrap().unwrap();
        assert_eq!(claim.state, ClaimState::Reserved);
        assert_eq!(claim.version, 2);
        assert!(claim.reserve_expires_at.is_some());

        // A stale version loses against the newer write.
        let mut stale = claim.clone();
        stale.state = ClaimState::Available;
        let guard = StateGuard::default().with_version(1);
        assert!(
            store
                .update_tenant_claim_txn(&stale, &guard, clock.now())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_filtered_trigger_delete() {
        let clock = ManualClock::new();
        let store = store_with_registration(&clock).await;
        store
            .insert_tenant_claim(&trial_claim("old", "reg", ClaimState::Available, clock.now()))
            .await
            .unwrap();
        clock.advance(chrono::Duration::hours(1));
        store
            .insert_tenant_claim(&trial_claim("new", "reg", ClaimState::Available, clock.now()))
            .await
            .unwrap();
        store
            .insert_tenant_claim(&trial_claim("held", "reg", ClaimState::Reserved, clock.now()))
            .await
            .unwrap();

        let filter = Filter::parse("created_at < '2026-01-01T00:30:00Z'", CLAIM_KEYS).unwrap();
        let ids = store
            .trigger_delete_tenant_claims("reg", &filter, clock.now())
            .await
            .unwrap();
        assert_eq!(ids, vec!["old".to_string()]);

        let ids = store
            .trigger_delete_tenant_claims("reg", &Filter::default(), clock.now())
            .await
            .unwrap();
        assert_eq!(ids, vec!["new".to_string()]);

        let held = store.get_tenant_claim("held").await.unwrap().unwrap();
        assert_eq!(held.state, ClaimState::Reserved);
    }

    #[tokio::test]
    async fn test_list_claims_paging_and_filter() {
        let clock = ManualClock::new();
        let store = store_with_registration(&clock).await;
        for i in 0..5 {
            let mut claim = trial_claim(&format!("t{}", i), "reg", ClaimState::Available, clock.now());
            claim.trial = i % 2 == 0;
            store.insert_tenant_claim(&claim).await.unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }

        let page = PageQuery {
            page_index: 1,
            page_size: 2,
            filter: None,
            order_by: Some("created_at asc".into()),
        };
        let (claims, info) = store
            .list_tenant_claims(&ClaimQuery::registration("reg"), &page)
            .await
            .unwrap();
        assert_eq!(info.total_count, 5);
        assert_eq!(claims[0].id, "t2");
        assert_eq!(claims[1].id, "t3");

        let page = PageQuery {
            filter: Some("trial = false".into()),
            ..PageQuery::default()
        };
        let (claims, info) = store
            .list_tenant_claims(&ClaimQuery::registration("reg"), &page)
            .await
            .unwrap();
        assert_eq!(info.total_count, 2);
        assert!(claims.iter().all(|c| !c.trial));

        let bad = PageQuery {
            filter: Some("system_password = 'x'".into()),
            ..PageQuery::default()
        };
        assert!(matches!(
            store.list_tenant_claims(&ClaimQuery::default(), &bad).await,
            Err(PoolError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_requires_deleting_state() {
        let clock = ManualClock::new();
        let store = store_with_registration(&clock).await;
        let mut claim = trial_claim("t1", "reg", ClaimState::Available, clock.now());
        claim
            .edge_contexts
            .push(EdgeContext::new("ctx".into(), EdgeState::Created, clock.now()));
        store.insert_tenant_claim(&claim).await.unwrap();

        assert!(store.delete_tenant_claim("t1").await.is_err());
        store
            .change_claim_state(
                "t1",
                &StateChange::to(ClaimState::Deleting),
                &StateGuard::default(),
                clock.now(),
            )
            .await
            .unwrap();
        store.delete_tenant_claim("t1").await.unwrap();

        let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edge_contexts")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn test_audit_count_since() {
        let clock = ManualClock::new();
        let store = store_with_registration(&clock).await;
        let start = clock.now();

        for _ in 0..3 {
            clock.advance(chrono::Duration::seconds(1));
            let log = AuditLog::new(AuditAction::ReserveTenantClaim, AuditActor::User, clock.now())
                .registration("reg");
            store.insert_audit_log(&log).await.unwrap();
        }
        let log = AuditLog::new(AuditAction::DeleteTenantClaim, AuditActor::User, clock.now())
            .tenant("t1");
        store.insert_audit_log(&log).await.unwrap();

        let (count, last) = store
            .count_audit_logs("reg", AuditAction::ReserveTenantClaim, start)
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(last, Some(clock.now()));

        let (count, _) = store
            .count_audit_logs("reg", AuditAction::ReserveTenantClaim, clock.now())
            .await
            .unwrap();
        assert_eq!(count, 0);

        let anonymous = AuditLog::new(AuditAction::DeleteTenantClaim, AuditActor::User, clock.now());
        assert!(store.insert_audit_log(&anonymous).await.is_err());

        let query = AuditQuery {
            tenant_id: Some("t1".into()),
            ..AuditQuery::default()
        };
        let (logs, _) = store.get_audit_logs(&query, &PageQuery::default()).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, AuditAction::DeleteTenantClaim);
    }

    #[tokio::test]
    async fn test_scan_joins_registration() {
        let clock = ManualClock::new();
        let store = store_with_registration(&clock).await;
        for id in ["t1", "t2", "t3"] {
            store
                .insert_tenant_claim(&trial_claim(id, "reg", ClaimState::Available, clock.now()))
                .await
                .unwrap();
        }

        let seen = std::sync::Mutex::new(Vec::new());
        let page = PageQuery {
            page_size: 2,
            order_by: Some("id asc".into()),
            ..PageQuery::default()
        };
        let info = store
            .scan_tenant_claims(&ClaimQuery::registration("reg"), &page, |registration, claim| {
                seen.lock().unwrap().push((registration.id.clone(), claim.id));
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(info.total_count, 3);
        assert_eq!(
            seen.into_inner().unwrap(),
            vec![("reg".to_string(), "t1".to_string()), ("reg".to_string(), "t2".to_string())]
        );
    }
}
