use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{PoolError, PoolResult};

pub const MAX_ID_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 200;
pub const MAX_EDGE_COUNT: u32 = 10;

/// Lifecycle state of a registration.
///
/// `Deleting` is the soft-delete marker: the reconciler drains the claims
/// and then removes the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationState {
    Active,
    Inactive,
    Deleting,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Active => "ACTIVE",
            RegistrationState::Inactive => "INACTIVE",
            RegistrationState::Deleting => "DELETING",
        }
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for RegistrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(RegistrationState::Active),
            "INACTIVE" => Ok(RegistrationState::Inactive),
            "DELETING" => Ok(RegistrationState::Deleting),
            _ => Err(format!("unknown registration state: {}", s)),
        }
    }
}

/// Version 1 of the pool policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationConfigV1 {
    /// Resources provisioned per claim.
    pub edge_count: u32,
    pub instance_type: String,
    pub min_tenant_pool_size: u32,
    pub max_tenant_pool_size: u32,
    /// Upper bound on claims in `CREATING` at once.
    pub max_pending_tenant_count: u32,
    /// Trial period in seconds, applied on confirmation.
    pub trial_expiry: u64,
    #[serde(default)]
    pub deploy_apps: bool,
    /// Reservation window in seconds. Falls back to the service default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_expiry: Option<u64>,
}

/// Versioned pool policy, tagged by `version` in its JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum RegistrationConfig {
    #[serde(rename = "v1")]
    V1(RegistrationConfigV1),
}

impl RegistrationConfig {
    /// Parse the JSON form. Unknown versions and malformed payloads are bad requests.
    pub fn parse(json: &str) -> PoolResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| PoolError::bad_request(format!("invalid registration config: {}", e)))
    }

    pub fn to_json(&self) -> PoolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn version(&self) -> &'static str {
        match self {
            RegistrationConfig::V1(_) => "v1",
        }
    }

    pub fn v1(&self) -> &RegistrationConfigV1 {
        match self {
            RegistrationConfig::V1(cfg) => cfg,
        }
    }

    pub fn trial_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.v1().trial_expiry as i64)
    }

    /// Reservation window, using `default` when the policy does not set one.
    pub fn reserve_window(&self, default: Duration) -> chrono::Duration {
        let secs = self.v1().reserve_expiry.unwrap_or(default.as_secs());
        chrono::Duration::seconds(secs as i64)
    }

    pub fn validate(&self) -> PoolResult<()> {
        let cfg = self.v1();
        if cfg.edge_count < 1 || cfg.edge_count > MAX_EDGE_COUNT {
            return Err(PoolError::bad_request(format!(
                "edgeCount must be between 1 and {}",
                MAX_EDGE_COUNT
            )));
        }
        if cfg.instance_type.trim().is_empty() {
            return Err(PoolError::bad_request("instanceType is required"));
        }
        if cfg.max_tenant_pool_size < cfg.min_tenant_pool_size {
            return Err(PoolError::bad_request(
                "maxTenantPoolSize must not be less than minTenantPoolSize",
            ));
        }
        if cfg.max_pending_tenant_count < 1 {
            return Err(PoolError::bad_request(
                "maxPendingTenantCount must be at least 1",
            ));
        }
        if cfg.trial_expiry == 0 {
            return Err(PoolError::bad_request("trialExpiry must be positive"));
        }
        if cfg.reserve_expiry == Some(0) {
            return Err(PoolError::bad_request("reserveExpiry must be positive"));
        }
        Ok(())
    }

    /// Reject changes to fields that shape already-provisioned claims.
    pub fn check_modifiable(&self, updated: &RegistrationConfig) -> PoolResult<()> {
        if self.version() != updated.version() {
            return Err(PoolError::bad_request("non-modifiable value: version"));
        }
        let (old, new) = (self.v1(), updated.v1());
        if old.edge_count != new.edge_count {
            return Err(PoolError::bad_request("non-modifiable value: edgeCount"));
        }
        if old.instance_type != new.instance_type {
            return Err(PoolError::bad_request("non-modifiable value: instanceType"));
        }
        Ok(())
    }
}

/// A named provisioning policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: String,
    pub description: String,
    pub config: RegistrationConfig,
    pub state: RegistrationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Registration {
    pub fn is_active(&self) -> bool {
        self.state == RegistrationState::Active
    }
}

/// Validate the identity fields shared by create and update.
pub fn validate_registration_fields(id: &str, description: &str) -> PoolResult<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(PoolError::bad_request(format!(
            "id length must be between 1 and {}",
            MAX_ID_LEN
        )));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(PoolError::bad_request(format!(
            "description length must not exceed {}",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_json(edge_count: u32, min: u32, max: u32, pending: u32) -> String {
        format!(
            r#"{{"version":"v1","edgeCount":{},"instanceType":"t2.medium","minTenantPoolSize":{},"maxTenantPoolSize":{},"maxPendingTenantCount":{},"trialExpiry":3600}}"#,
            edge_count, min, max, pending
        )
    }

    #[test]
    fn test_parse_v1_config() {
        let cfg = RegistrationConfig::parse(&config_json(1, 2, 5, 2)).unwrap();
        assert_eq!(cfg.version(), "v1");
        assert_eq!(cfg.v1().min_tenant_pool_size, 2);
        assert!(!cfg.v1().deploy_apps);
        assert_eq!(cfg.trial_period(), chrono::Duration::hours(1));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_unknown_version_is_bad_request() {
        let err = RegistrationConfig::parse(r#"{"version":"v9","edgeCount":1}"#).unwrap_err();
        assert!(matches!(err, PoolError::BadRequest(_)));
    }

    #[test]
    fn test_validate_ranges() {
        let zero_edges = RegistrationConfig::parse(&config_json(0, 1, 2, 1)).unwrap();
        assert!(zero_edges.validate().is_err());

        let too_many_edges = RegistrationConfig::parse(&config_json(11, 1, 2, 1)).unwrap();
        assert!(too_many_edges.validate().is_err());

        let inverted = RegistrationConfig::parse(&config_json(1, 5, 2, 1)).unwrap();
        assert!(inverted.validate().is_err());

        let no_pending = RegistrationConfig::parse(&config_json(1, 1, 2, 0)).unwrap();
        assert!(no_pending.validate().is_err());

        let empty_pool = RegistrationConfig::parse(&config_json(1, 0, 0, 1)).unwrap();
        assert!(empty_pool.validate().is_ok());
    }

    #[test]
    fn test_edge_count_is_not_modifiable() {
        let old = RegistrationConfig::parse(&config_json(1, 2, 5, 2)).unwrap();
        let resized = RegistrationConfig::parse(&config_json(1, 3, 8, 4)).unwrap();
        assert!(old.check_modifiable(&resized).is_ok());

        let reshaped = RegistrationConfig::parse(&config_json(2, 2, 5, 2)).unwrap();
        let err = old.check_modifiable(&reshaped).unwrap_err();
        assert!(err.to_string().contains("edgeCount"));
    }

    #[test]
    fn test_reserve_window_override() {
        let mut cfg = RegistrationConfig::parse(&config_json(1, 2, 5, 2)).unwrap();
        let default = Duration::from_secs(1800);
        assert_eq!(cfg.reserve_window(default), chrono::Duration::minutes(30));

        let RegistrationConfig::V1(v1) = &mut cfg;
        v1.reserve_expiry = Some(60);
        assert_eq!(cfg.reserve_window(default), chrono::Duration::minutes(1));
    }

    #[test]
    fn test_registration_state_from_str() {
        assert_eq!(
            "active".parse::<RegistrationState>().unwrap(),
            RegistrationState::Active
        );
        assert_eq!(
            "DELETING".parse::<RegistrationState>().unwrap(),
            RegistrationState::Deleting
        );
        assert!("gone".parse::<RegistrationState>().is_err());
    }

    #[test]
    fn test_validate_registration_fields() {
        assert!(validate_registration_fields("trial-reg", "").is_ok());
        assert!(validate_registration_fields("", "").is_err());
        assert!(validate_registration_fields(&"x".repeat(201), "").is_err());
        assert!(validate_registration_fields("ok", &"d".repeat(201)).is_err());
    }
}
