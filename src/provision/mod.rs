//! Provisioning adapter: creates, inspects and destroys tenant edges.
//!
//! Only the reconciler and the lifecycle operations call into this module.
//! The real backend speaks HTTP; the fake keeps edges in memory so tests
//! can drive every transition.

mod client;
mod error;
mod fake;
mod http;

pub use client::{CreateResourceConfig, Provisioner, ResourceInfo};
pub use error::ProvisionError;
pub use fake::FakeProvisioner;
pub use http::HttpProvisioner;

/// Provisioner selected at startup, dispatching to the configured backend.
pub enum Provisioners {
    Http(HttpProvisioner),
    Fake(FakeProvisioner),
}

impl Provisioner for Provisioners {
    async fn create_resource(&self, config: &CreateResourceConfig) -> Result<ResourceInfo, ProvisionError> {
        match self {
            Self::Http(p) => p.create_resource(config).await,
            Self::Fake(p) => p.create_resource(config).await,
        }
    }

    async fn get_resource_status(&self, tenant_id: &str, context_id: &str) -> Result<ResourceInfo, ProvisionError> {
        match self {
            Self::Http(p) => p.get_resource_status(tenant_id, context_id).await,
            Self::Fake(p) => p.get_resource_status(tenant_id, context_id).await,
        }
    }

    async fn delete_resource(&self, tenant_id: &str, context_id: &str) -> Result<ResourceInfo, ProvisionError> {
        match self {
            Self::Http(p) => p.delete_resource(tenant_id, context_id).await,
            Self::Fake(p) => p.delete_resource(tenant_id, context_id).await,
        }
    }

    async fn post_delete_cleanup(&self, tenant_id: &str) -> Result<(), ProvisionError> {
        match self {
            Self::Http(p) => p.post_delete_cleanup(tenant_id).await,
            Self::Fake(p) => p.post_delete_cleanup(tenant_id).await,
        }
    }

    async fn describe_resource(&self, tenant_id: &str, context_id: &str) -> Result<serde_json::Value, ProvisionError> {
        match self {
            Self::Http(p) => p.describe_resource(tenant_id, context_id).await,
            Self::Fake(p) => p.describe_resource(tenant_id, context_id).await,
        }
    }
}
