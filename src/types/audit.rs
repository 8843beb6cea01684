use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{PoolError, PoolResult};

/// Who triggered an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditActor {
    User,
    System,
}

impl AuditActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditActor::User => "USER",
            AuditActor::System => "SYSTEM",
        }
    }
}

impl std::fmt::Display for AuditActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for AuditActor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "USER" => Ok(AuditActor::User),
            "SYSTEM" => Ok(AuditActor::System),
            _ => Err(format!("unknown audit actor: {}", s)),
        }
    }
}

/// Externally triggered lifecycle actions that get an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    ReserveTenantClaim,
    ConfirmTenantClaim,
    DeleteTenantClaim,
    RecreateTenantClaims,
    AssignTenantClaim,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ReserveTenantClaim => "RESERVE_TENANT_CLAIM",
            AuditAction::ConfirmTenantClaim => "CONFIRM_TENANT_CLAIM",
            AuditAction::DeleteTenantClaim => "DELETE_TENANT_CLAIM",
            AuditAction::RecreateTenantClaims => "RECREATE_TENANT_CLAIMS",
            AuditAction::AssignTenantClaim => "ASSIGN_TENANT_CLAIM",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "RESERVE_TENANT_CLAIM" => Ok(AuditAction::ReserveTenantClaim),
            "CONFIRM_TENANT_CLAIM" => Ok(AuditAction::ConfirmTenantClaim),
            "DELETE_TENANT_CLAIM" => Ok(AuditAction::DeleteTenantClaim),
            "RECREATE_TENANT_CLAIMS" => Ok(AuditAction::RecreateTenantClaims),
            "ASSIGN_TENANT_CLAIM" => Ok(AuditAction::AssignTenantClaim),
            _ => Err(format!("unknown audit action: {}", s)),
        }
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResponse {
    Success,
    Failed,
}

impl AuditResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResponse::Success => "SUCCESS",
            AuditResponse::Failed => "FAILED",
        }
    }

    pub fn from_outcome<T, E>(outcome: &Result<T, E>) -> Self {
        if outcome.is_ok() {
            AuditResponse::Success
        } else {
            AuditResponse::Failed
        }
    }
}

impl std::fmt::Display for AuditResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for AuditResponse {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SUCCESS" => Ok(AuditResponse::Success),
            "FAILED" => Ok(AuditResponse::Failed),
            _ => Err(format!("unknown audit response: {}", s)),
        }
    }
}

/// Immutable record of one externally triggered action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    #[serde(default)]
    pub id: i64,
    pub tenant_id: Option<String>,
    pub registration_id: Option<String>,
    pub email: Option<String>,
    pub actor: AuditActor,
    pub action: AuditAction,
    pub response: AuditResponse,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    pub fn new(action: AuditAction, actor: AuditActor, created_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            tenant_id: None,
            registration_id: None,
            email: None,
            actor,
            action,
            response: AuditResponse::Success,
            description: String::new(),
            created_at,
        }
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn registration(mut self, registration_id: impl Into<String>) -> Self {
        self.registration_id = Some(registration_id.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn response(mut self, response: AuditResponse) -> Self {
        self.response = response;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// At least one of tenant, registration or email must be present.
    pub fn validate(&self) -> PoolResult<()> {
        let present = |field: &Option<String>| field.as_deref().is_some_and(|v| !v.is_empty());
        if present(&self.tenant_id) || present(&self.registration_id) || present(&self.email) {
            Ok(())
        } else {
            Err(PoolError::bad_request(
                "audit log requires a tenant, registration or email",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_required() {
        let now = Utc::now();
        let bare = AuditLog::new(AuditAction::ReserveTenantClaim, AuditActor::User, now);
        assert!(bare.validate().is_err());

        let blank = bare.clone().tenant("");
        assert!(blank.validate().is_err());

        assert!(bare.clone().registration("reg").validate().is_ok());
        assert!(bare.email("a@b.com").validate().is_ok());
    }

    #[test]
    fn test_action_from_str() {
        assert_eq!(
            "reserve-tenant-claim".parse::<AuditAction>().unwrap(),
            AuditAction::ReserveTenantClaim
        );
        assert_eq!(
            "RECREATE_TENANT_CLAIMS".parse::<AuditAction>().unwrap(),
            AuditAction::RecreateTenantClaims
        );
        assert!("PURGE".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_response_from_outcome() {
        let ok: Result<(), ()> = Ok(());
        let err: Result<(), ()> = Err(());
        assert_eq!(AuditResponse::from_outcome(&ok), AuditResponse::Success);
        assert_eq!(AuditResponse::from_outcome(&err), AuditResponse::Failed);
    }
}
