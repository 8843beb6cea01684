//! Provisioner trait and common types.

use std::collections::BTreeMap;
use std::future::Future;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::error::ProvisionError;
use crate::types::{EdgeState, Resource};

/// Everything the backend needs to stand up one edge for a tenant.
#[derive(Debug, Clone)]
pub struct CreateResourceConfig {
    pub tenant_id: String,
    pub name: String,
    pub system_user: String,
    pub system_password: SecretString,
    pub instance_type: String,
    pub tags: Vec<String>,
    pub deploy_app: bool,
    pub app_chart_version: String,
}

/// Backend view of one edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// Correlation id; stored as the edge context id.
    pub context_id: String,
    pub state: EdgeState,
    #[serde(default)]
    pub edge_id: Option<String>,
    #[serde(default)]
    pub resources: BTreeMap<String, Resource>,
}

impl ResourceInfo {
    pub fn new(context_id: impl Into<String>, state: EdgeState) -> Self {
        Self {
            context_id: context_id.into(),
            state,
            edge_id: None,
            resources: BTreeMap::new(),
        }
    }
}

/// Capability over the external provisioning backend.
///
/// Every call must be safe to repeat: the reconciler retries on the next
/// tick after any error.
pub trait Provisioner: Send + Sync {
    /// Start creating one edge. Returns the correlation id and initial state.
    fn create_resource(
        &self,
        config: &CreateResourceConfig,
    ) -> impl Future<Output = Result<ResourceInfo, ProvisionError>> + Send;

    /// Current state of an edge. A vanished edge reports `DELETED`.
    fn get_resource_status(
        &self,
        tenant_id: &str,
        context_id: &str,
    ) -> impl Future<Output = Result<ResourceInfo, ProvisionError>> + Send;

    /// Start deleting an edge.
    fn delete_resource(
        &self,
        tenant_id: &str,
        context_id: &str,
    ) -> impl Future<Output = Result<ResourceInfo, ProvisionError>> + Send;

    /// Tenant-wide cleanup, called once after all of a claim's edges are gone.
    fn post_delete_cleanup(
        &self,
        tenant_id: &str,
    ) -> impl Future<Output = Result<(), ProvisionError>> + Send;

    /// Free-form details for verbose listings.
    fn describe_resource(
        &self,
        tenant_id: &str,
        context_id: &str,
    ) -> impl Future<Output = Result<serde_json::Value, ProvisionError>> + Send;
}
