//! Row models and query inputs for the claim store.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{
    AuditLog, ClaimState, EdgeContext, PoolError, PoolResult, Registration, RegistrationConfig,
    TenantClaim, TenantResource,
};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Fixed-width UTC timestamps, so text comparison in SQL orders correctly.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> PoolResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PoolError::Internal(format!("invalid timestamp {}: {}", raw, e)))
}

fn parse_opt_ts(raw: Option<&str>) -> PoolResult<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

fn parse_state<T: std::str::FromStr<Err = String>>(raw: &str) -> PoolResult<T> {
    raw.parse().map_err(PoolError::Internal)
}

// ============================================================================
// Paging
// ============================================================================

/// Page request shared by every list operation.
#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    pub page_index: u32,
    /// 0 means the default page size.
    pub page_size: u32,
    /// Conjunction of `attr op value` terms, e.g. `trial = true and created_at < '2026-01-01T00:00:00Z'`.
    pub filter: Option<String>,
    /// Comma-separated `attr [asc|desc]`.
    pub order_by: Option<String>,
}

impl PageQuery {
    /// Unbounded scan used internally by the reconciler.
    pub fn all() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            ..Self::default()
        }
    }

    pub fn limit(&self) -> u32 {
        match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        self.page_index as u64 * self.limit() as u64
    }
}

/// Position of a page within the full result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page_index: u32,
    pub page_size: u32,
    pub total_count: u64,
}

impl PageInfo {
    pub fn new(query: &PageQuery, total_count: u64) -> Self {
        Self {
            page_index: query.page_index,
            page_size: query.limit(),
            total_count,
        }
    }
}

// ============================================================================
// Registration Models
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct RegistrationRow {
    pub id: String,
    pub description: String,
    pub config: String,
    pub state: String,
    pub created_at: String,
    pub updated_at: String,
    pub version: i64,
}

impl TryFrom<RegistrationRow> for Registration {
    type Error = PoolError;

    fn try_from(row: RegistrationRow) -> PoolResult<Self> {
        Ok(Registration {
            config: RegistrationConfig::parse(&row.config)
                .map_err(|e| PoolError::Internal(format!("stored config of {}: {}", row.id, e)))?,
            state: parse_state(&row.state)?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            id: row.id,
            description: row.description,
            version: row.version,
        })
    }
}

/// Input for creating a registration.
#[derive(Debug, Clone)]
pub struct CreateRegistration {
    pub id: String,
    pub description: String,
    pub config: RegistrationConfig,
    pub state: crate::types::RegistrationState,
}

/// Input for updating a registration. Unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct UpdateRegistration {
    pub id: String,
    pub description: Option<String>,
    pub config: Option<RegistrationConfig>,
    pub state: Option<crate::types::RegistrationState>,
}

// ============================================================================
// Tenant Claim Models
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct ClaimRow {
    pub id: String,
    pub registration_id: String,
    pub state: String,
    pub trial: bool,
    pub assigned_at: Option<String>,
    pub expires_at: Option<String>,
    pub reserve_expires_at: Option<String>,
    pub system_user: String,
    /// Hex-encoded.
    pub system_password: String,
    /// JSON map of resource id to resource.
    pub resources: String,
    pub created_at: String,
    pub updated_at: String,
    pub version: i64,
}

impl ClaimRow {
    pub fn into_claim(self, edge_contexts: Vec<EdgeContext>) -> PoolResult<TenantClaim> {
        let password = hex::decode(&self.system_password)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| PoolError::Internal(format!("stored password of {}", self.id)))?;
        let resources: BTreeMap<String, TenantResource> = if self.resources.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&self.resources)?
        };

        Ok(TenantClaim {
            state: parse_state(&self.state)?,
            assigned_at: parse_opt_ts(self.assigned_at.as_deref())?,
            expires_at: parse_opt_ts(self.expires_at.as_deref())?,
            reserve_expires_at: parse_opt_ts(self.reserve_expires_at.as_deref())?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            registration_id: self.registration_id,
            trial: self.trial,
            system_user: self.system_user,
            system_password: password,
            resources,
            edge_contexts,
            version: self.version,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EdgeContextRow {
    pub id: String,
    pub edge_id: Option<String>,
    pub state: String,
    pub edge_type: String,
    pub created_at: String,
    pub updated_at: String,
    pub version: i64,
}

impl TryFrom<EdgeContextRow> for EdgeContext {
    type Error = PoolError;

    fn try_from(row: EdgeContextRow) -> PoolResult<Self> {
        Ok(EdgeContext {
            state: parse_state(&row.state)?,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            id: row.id,
            edge_id: row.edge_id,
            kind: row.edge_type,
            version: row.version,
            details: None,
        })
    }
}

/// Which claims a scan visits.
#[derive(Debug, Clone, Default)]
pub struct ClaimQuery {
    pub registration_id: Option<String>,
    pub tenant_id: Option<String>,
    /// Empty means every state.
    pub states: Vec<ClaimState>,
}

impl ClaimQuery {
    pub fn registration(registration_id: &str) -> Self {
        Self {
            registration_id: Some(registration_id.to_string()),
            ..Self::default()
        }
    }

    pub fn in_states(mut self, states: &[ClaimState]) -> Self {
        self.states = states.to_vec();
        self
    }
}

// ============================================================================
// Audit Models
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct AuditLogRow {
    pub id: i64,
    pub tenant_id: Option<String>,
    pub registration_id: Option<String>,
    pub email: Option<String>,
    pub actor: String,
    pub action: String,
    pub response: String,
    pub description: String,
    pub created_at: String,
}

impl TryFrom<AuditLogRow> for AuditLog {
    type Error = PoolError;

    fn try_from(row: AuditLogRow) -> PoolResult<Self> {
        Ok(AuditLog {
            actor: parse_state(&row.actor)?,
            action: parse_state(&row.action)?,
            response: parse_state(&row.response)?,
            created_at: parse_ts(&row.created_at)?,
            id: row.id,
            tenant_id: row.tenant_id,
            registration_id: row.registration_id,
            email: row.email,
            description: row.description,
        })
    }
}

/// Filter for audit listings; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub tenant_id: Option<String>,
    pub registration_id: Option<String>,
    pub email: Option<String>,
    pub action: Option<crate::types::AuditAction>,
    pub since: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        assert_eq!(format_ts(a), "2026-01-01T00:00:00.000Z");
        assert_eq!(format_ts(b), "2026-01-01T00:00:01.500Z");
        assert!(format_ts(a) < format_ts(b));
        assert_eq!(parse_ts(&format_ts(b)).unwrap(), b);
    }

    #[test]
    fn test_page_limits() {
        let page = PageQuery::default();
        assert_eq!(page.limit(), DEFAULT_PAGE_SIZE);
        assert_eq!(page.offset(), 0);

        let page = PageQuery {
            page_index: 2,
            page_size: 10,
            ..PageQuery::default()
        };
        assert_eq!(page.offset(), 20);

        let huge = PageQuery {
            page_size: 50_000,
            ..PageQuery::default()
        };
        assert_eq!(huge.limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_claim_row_rejects_bad_password_encoding() {
        let row = ClaimRow {
            id: "t1".into(),
            registration_id: "reg".into(),
            state: "AVAILABLE".into(),
            trial: true,
            assigned_at: None,
            expires_at: None,
            reserve_expires_at: None,
            system_user: "u".into(),
            system_password: "zz".into(),
            resources: String::new(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
            updated_at: "2026-01-01T00:00:00.000Z".into(),
            version: 1,
        };
        assert!(row.into_claim(vec![]).is_err());
    }
}
