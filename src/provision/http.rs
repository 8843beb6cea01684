//! HTTP provisioning backend client.

use std::collections::BTreeMap;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::client::{CreateResourceConfig, Provisioner, ResourceInfo};
use super::error::ProvisionError;
use crate::types::{EdgeState, Resource};

const TOKEN_HEADER: &str = "x-provisioner-token";

/// Client for the REST provisioning backend.
pub struct HttpProvisioner {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpProvisioner {
    pub fn with_base_url(base_url: &str, token: Option<SecretString>) -> Result<Self, ProvisionError> {
        let parsed = Url::parse(base_url)?;
        Ok(Self {
            client: Client::new(),
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn edges_url(&self, tenant_id: &str) -> String {
        format!("{}/v1/tenants/{}/edges", self.base_url, tenant_id)
    }

    fn edge_url(&self, tenant_id: &str, context_id: &str) -> String {
        format!("{}/{}", self.edges_url(tenant_id), context_id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token.expose_secret()),
            None => request,
        }
    }

    async fn check(response: Response, what: &str) -> Result<Response, ProvisionError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProvisionError::NotFound(what.to_string()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProvisionError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

// Backend request/response types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateEdgeRequest<'a> {
    name: &'a str,
    system_user: &'a str,
    system_password: &'a str,
    instance_type: &'a str,
    tags: String,
    deploy_app: bool,
    app_chart_version: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EdgeResponse {
    context_id: String,
    status: String,
    #[serde(default)]
    edge_id: Option<String>,
    #[serde(default)]
    resources: BTreeMap<String, Resource>,
}

impl EdgeResponse {
    fn into_info(self) -> ResourceInfo {
        ResourceInfo {
            state: convert_app_status(&self.status),
            context_id: self.context_id,
            edge_id: self.edge_id.filter(|id| !id.is_empty()),
            resources: self.resources,
        }
    }
}

/// Map the backend's application status onto an edge state.
fn convert_app_status(status: &str) -> EdgeState {
    match status {
        "Done" => EdgeState::Created,
        "InfraDone" | "Creating" | "Pending" => EdgeState::Creating,
        "Deleting" => EdgeState::Deleting,
        _ => EdgeState::Failed,
    }
}

impl Provisioner for HttpProvisioner {
    async fn create_resource(&self, config: &CreateResourceConfig) -> Result<ResourceInfo, ProvisionError> {
        let url = self.edges_url(&config.tenant_id);
        debug!(tenant = %config.tenant_id, name = %config.name, url = %url, "creating edge");

        let body = CreateEdgeRequest {
            name: &config.name,
            system_user: &config.system_user,
            system_password: config.system_password.expose_secret(),
            instance_type: &config.instance_type,
            tags: config.tags.join(","),
            deploy_app: config.deploy_app,
            app_chart_version: &config.app_chart_version,
        };

        let response = self.authorize(self.client.post(&url)).json(&body).send().await?;
        let response = Self::check(response, &config.tenant_id).await?;
        let edge: EdgeResponse = response.json().await?;
        if edge.context_id.is_empty() {
            return Err(ProvisionError::InvalidResponse(
                "missing context id in create response".to_string(),
            ));
        }
        Ok(edge.into_info())
    }

    async fn get_resource_status(&self, tenant_id: &str, context_id: &str) -> Result<ResourceInfo, ProvisionError> {
        let url = self.edge_url(tenant_id, context_id);
        debug!(tenant = tenant_id, context = context_id, "fetching edge status");

        let response = self.authorize(self.client.get(&url)).send().await?;
        match Self::check(response, context_id).await {
            Ok(response) => {
                let edge: EdgeResponse = response.json().await?;
                Ok(edge.into_info())
            }
            Err(ProvisionError::NotFound(_)) => Ok(ResourceInfo::new(context_id, EdgeState::Deleted)),
            Err(e) => Err(e),
        }
    }

    async fn delete_resource(&self, tenant_id: &str, context_id: &str) -> Result<ResourceInfo, ProvisionError> {
        let url = self.edge_url(tenant_id, context_id);
        debug!(tenant = tenant_id, context = context_id, "deleting edge");

        let response = self.authorize(self.client.delete(&url)).send().await?;
        match Self::check(response, context_id).await {
            Ok(_) => Ok(ResourceInfo::new(context_id, EdgeState::Deleting)),
            Err(ProvisionError::NotFound(_)) => Ok(ResourceInfo::new(context_id, EdgeState::Deleted)),
            Err(e) => Err(e),
        }
    }

    async fn post_delete_cleanup(&self, tenant_id: &str) -> Result<(), ProvisionError> {
        let url = format!("{}/v1/tenants/{}", self.base_url, tenant_id);
        debug!(tenant = tenant_id, "cleaning up tenant context");

        let response = self.authorize(self.client.delete(&url)).send().await?;
        match Self::check(response, tenant_id).await {
            Ok(_) | Err(ProvisionError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn describe_resource(&self, tenant_id: &str, context_id: &str) -> Result<serde_json::Value, ProvisionError> {
        let url = format!("{}/describe", self.edge_url(tenant_id, context_id));
        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = Self::check(response, context_id).await?;
        Ok(response.json().await?)
    }
}
