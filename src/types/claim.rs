use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Only edge type provisioned today.
pub const EDGE_TYPE_VIRTUAL: &str = "VIRTUAL";

/// Resource type reported for cloud projects attached to an edge.
pub const RESOURCE_TYPE_PROJECT: &str = "PROJECT";

/// State of a tenant claim.
///
/// ```text
/// CREATING -> AVAILABLE -> RESERVED -> ASSIGNED
///     |
///     +-> FAILED -> DELETING <- (any of the four above)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimState {
    Creating,
    Available,
    Reserved,
    Assigned,
    Deleting,
    Failed,
}

impl ClaimState {
    pub const ALL: [ClaimState; 6] = [
        ClaimState::Creating,
        ClaimState::Available,
        ClaimState::Reserved,
        ClaimState::Assigned,
        ClaimState::Deleting,
        ClaimState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimState::Creating => "CREATING",
            ClaimState::Available => "AVAILABLE",
            ClaimState::Reserved => "RESERVED",
            ClaimState::Assigned => "ASSIGNED",
            ClaimState::Deleting => "DELETING",
            ClaimState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ClaimState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClaimState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown claim state: {}", s))
    }
}

/// State of a single provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeState {
    Creating,
    Created,
    Failed,
    Deleting,
    Deleted,
}

impl EdgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeState::Creating => "CREATING",
            EdgeState::Created => "CREATED",
            EdgeState::Failed => "FAILED",
            EdgeState::Deleting => "DELETING",
            EdgeState::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for EdgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for EdgeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATING" => Ok(EdgeState::Creating),
            "CREATED" => Ok(EdgeState::Created),
            "FAILED" => Ok(EdgeState::Failed),
            "DELETING" => Ok(EdgeState::Deleting),
            "DELETED" => Ok(EdgeState::Deleted),
            _ => Err(format!("unknown edge state: {}", s)),
        }
    }
}

/// An entity created alongside an edge, such as a cloud project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub id: String,
}

/// A resource plus the edges that reported it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantResource {
    #[serde(flatten)]
    pub resource: Resource,
    pub edge_ids: Vec<String>,
}

/// One resource unit within a claim, correlated with the provisioning backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeContext {
    /// Correlation id returned by the provisioning backend.
    pub id: String,
    pub edge_id: Option<String>,
    pub state: EdgeState,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
    /// Backend description, filled only for verbose listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EdgeContext {
    pub fn new(id: String, state: EdgeState, now: DateTime<Utc>) -> Self {
        Self {
            id,
            edge_id: None,
            state,
            kind: EDGE_TYPE_VIRTUAL.to_string(),
            created_at: now,
            updated_at: now,
            version: 0,
            details: None,
        }
    }
}

/// One pool slot: a provisioned or in-flight tenant environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantClaim {
    /// Tenant id in the identity service.
    pub id: String,
    pub registration_id: String,
    pub state: ClaimState,
    pub trial: bool,
    pub assigned_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_expires_at: Option<DateTime<Utc>>,
    pub system_user: String,
    #[serde(skip_serializing, default)]
    pub system_password: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, TenantResource>,
    pub edge_contexts: Vec<EdgeContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl TenantClaim {
    /// Record the resources an edge reported once it finished provisioning.
    pub fn add_resources(&mut self, edge_id: &str, resources: &BTreeMap<String, Resource>) {
        for (resource_id, resource) in resources {
            if resource_id.is_empty() {
                continue;
            }
            let entry = self
                .resources
                .entry(resource_id.clone())
                .or_insert_with(|| TenantResource {
                    resource: resource.clone(),
                    edge_ids: Vec::new(),
                });
            if !entry.edge_ids.iter().any(|id| id == edge_id) {
                entry.edge_ids.push(edge_id.to_string());
            }
        }
    }

    pub fn system_password_secret(&self) -> secrecy::SecretString {
        secrecy::SecretString::from(self.system_password.clone())
    }
}

/// Name of the `index`-th edge of a claim: `edge`, `edge-1`, `edge-2`, ...
pub fn edge_name(index: usize) -> String {
    if index == 0 {
        "edge".to_string()
    } else {
        format!("edge-{}", index)
    }
}

/// System user that the provisioning backend logs in as for a tenant.
pub fn system_user_email(tenant_id: &str) -> String {
    format!("{}@system.tenantpool.local", tenant_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim() -> TenantClaim {
        let now = Utc::now();
        TenantClaim {
            id: "t1".into(),
            registration_id: "reg".into(),
            state: ClaimState::Creating,
            trial: true,
            assigned_at: None,
            expires_at: None,
            reserve_expires_at: None,
            system_user: system_user_email("t1"),
            system_password: "secret".into(),
            resources: BTreeMap::new(),
            edge_contexts: vec![],
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[test]
    fn test_claim_state_from_str() {
        for state in ClaimState::ALL {
            assert_eq!(state.as_str().parse::<ClaimState>().unwrap(), state);
        }
        assert_eq!("reserved".parse::<ClaimState>().unwrap(), ClaimState::Reserved);
        assert!("CONFIRMED".parse::<ClaimState>().is_err());
    }

    #[test]
    fn test_edge_names() {
        assert_eq!(edge_name(0), "edge");
        assert_eq!(edge_name(2), "edge-2");
    }

    #[test]
    fn test_add_resources_merges_edges() {
        let mut claim = claim();
        let mut reported = BTreeMap::new();
        reported.insert(
            "p1".to_string(),
            Resource {
                kind: RESOURCE_TYPE_PROJECT.into(),
                name: "Default Project".into(),
                id: "p1".into(),
            },
        );

        claim.add_resources("e1", &reported);
        claim.add_resources("e2", &reported);
        claim.add_resources("e2", &reported);

        assert_eq!(claim.resources.len(), 1);
        assert_eq!(claim.resources["p1"].edge_ids, vec!["e1", "e2"]);
    }

    #[test]
    fn test_password_not_serialized() {
        let json = serde_json::to_value(claim()).unwrap();
        assert!(json.get("systemPassword").is_none());
        assert_eq!(json["state"], "CREATING");
        assert_eq!(json["registrationId"], "reg");
    }
}
