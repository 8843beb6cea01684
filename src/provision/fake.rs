//! In-memory provisioner with deterministic status injection.
//!
//! Edges stay in `CREATING` until a test moves them with
//! [`FakeProvisioner::set_status_by_count`]. Deletion completes on the next
//! status poll, mirroring a backend that tears down quickly.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use super::client::{CreateResourceConfig, Provisioner, ResourceInfo};
use super::error::ProvisionError;
use crate::types::{EdgeState, RESOURCE_TYPE_PROJECT, Resource};

#[derive(Debug, Clone)]
struct FakeEdge {
    tenant_id: String,
    registration_id: String,
    state: EdgeState,
    edge_id: Option<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    next_id: u64,
    edges: BTreeMap<String, FakeEdge>,
    post_delete_calls: HashMap<String, u32>,
    fail_creates: bool,
}

/// Shared handle; clones observe the same backend.
#[derive(Debug, Clone, Default)]
pub struct FakeProvisioner {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        // A panicking test thread must not hide the backend from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move up to `count` `CREATING` edges of a registration to `state`.
    ///
    /// Only `CREATED` and `FAILED` are accepted as targets. Returns how many
    /// edges changed.
    #[cfg(test)]
    pub fn set_status_by_count(&self, count: usize, registration_id: &str, state: EdgeState) -> usize {
        if !matches!(state, EdgeState::Created | EdgeState::Failed) {
            return 0;
        }
        let mut guard = self.lock();
        let mut changed = 0;
        for (context_id, edge) in guard.edges.iter_mut() {
            if changed >= count {
                break;
            }
            if edge.registration_id != registration_id || edge.state != EdgeState::Creating {
                continue;
            }
            edge.state = state;
            if state == EdgeState::Created {
                edge.edge_id = Some(format!("edge-{}", context_id));
            }
            changed += 1;
        }
        changed
    }

    /// Edges of a registration that still exist on the backend.
    #[cfg(test)]
    pub fn edge_count(&self, registration_id: &str) -> usize {
        self.lock()
            .edges
            .values()
            .filter(|e| e.registration_id == registration_id && e.state != EdgeState::Deleted)
            .count()
    }

    /// Edges of a registration currently in `state`.
    #[cfg(test)]
    pub fn edge_count_in(&self, registration_id: &str, state: EdgeState) -> usize {
        self.lock()
            .edges
            .values()
            .filter(|e| e.registration_id == registration_id && e.state == state)
            .count()
    }

    #[cfg(test)]
    pub fn post_delete_calls(&self, tenant_id: &str) -> u32 {
        self.lock()
            .post_delete_calls
            .get(tenant_id)
            .copied()
            .unwrap_or(0)
    }

    /// Make subsequent creates fail with a backend error.
    #[cfg(test)]
    pub fn set_fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    fn info(context_id: &str, edge: &FakeEdge) -> ResourceInfo {
        let mut info = ResourceInfo::new(context_id, edge.state);
        if let Some(edge_id) = &edge.edge_id {
            info.edge_id = Some(edge_id.clone());
            let project_id = format!("project-{}", edge.tenant_id);
            info.resources.insert(
                project_id.clone(),
                Resource {
                    kind: RESOURCE_TYPE_PROJECT.to_string(),
                    name: "Default Project".to_string(),
                    id: project_id,
                },
            );
        }
        info
    }
}

fn tag_value<'a>(tags: &'a [String], key: &str) -> Option<&'a str> {
    tags.iter()
        .filter_map(|tag| tag.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

impl Provisioner for FakeProvisioner {
    async fn create_resource(&self, config: &CreateResourceConfig) -> Result<ResourceInfo, ProvisionError> {
        let mut guard = self.lock();
        if guard.fail_creates {
            return Err(ProvisionError::Api {
                status: 500,
                message: "create disabled".to_string(),
            });
        }
        guard.next_id += 1;
        let context_id = format!("ctx-{:06}", guard.next_id);
        let edge = FakeEdge {
            tenant_id: config.tenant_id.clone(),
            registration_id: tag_value(&config.tags, "registration")
                .unwrap_or_default()
                .to_string(),
            state: EdgeState::Creating,
            edge_id: None,
        };
        let info = Self::info(&context_id, &edge);
        guard.edges.insert(context_id, edge);
        Ok(info)
    }

    async fn get_resource_status(&self, _tenant_id: &str, context_id: &str) -> Result<ResourceInfo, ProvisionError> {
        let mut guard = self.lock();
        match guard.edges.get_mut(context_id) {
            Some(edge) => {
                if edge.state == EdgeState::Deleting {
                    edge.state = EdgeState::Deleted;
                }
                Ok(Self::info(context_id, edge))
            }
            None => Ok(ResourceInfo::new(context_id, EdgeState::Deleted)),
        }
    }

    async fn delete_resource(&self, _tenant_id: &str, context_id: &str) -> Result<ResourceInfo, ProvisionError> {
        let mut guard = self.lock();
        match guard.edges.get_mut(context_id) {
            Some(edge) if edge.state != EdgeState::Deleted => {
                edge.state = EdgeState::Deleting;
                Ok(Self::info(context_id, edge))
            }
            _ => Ok(ResourceInfo::new(context_id, EdgeState::Deleted)),
        }
    }

    async fn post_delete_cleanup(&self, tenant_id: &str) -> Result<(), ProvisionError> {
        let mut guard = self.lock();
        let remaining = guard
            .edges
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.state != EdgeState::Deleted)
            .count();
        if remaining > 0 {
            return Err(ProvisionError::Api {
                status: 409,
                message: format!("{} edges remain for tenant {}", remaining, tenant_id),
            });
        }
        *guard.post_delete_calls.entry(tenant_id.to_string()).or_default() += 1;
        Ok(())
    }

    async fn describe_resource(&self, tenant_id: &str, context_id: &str) -> Result<serde_json::Value, ProvisionError> {
        let guard = self.lock();
        let edge = guard
            .edges
            .get(context_id)
            .ok_or_else(|| ProvisionError::NotFound(context_id.to_string()))?;
        Ok(serde_json::json!({
            "contextId": context_id,
            "tenantId": tenant_id,
            "state": edge.state.as_str(),
            "edgeId": edge.edge_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn config(tenant: &str, registration: &str) -> CreateResourceConfig {
        CreateResourceConfig {
            tenant_id: tenant.to_string(),
            name: "edge".to_string(),
            system_user: format!("{}@system", tenant),
            system_password: SecretString::from("pw".to_string()),
            instance_type: "t2.medium".to_string(),
            tags: vec![format!("registration={}", registration), format!("tenant={}", tenant)],
            deploy_app: false,
            app_chart_version: "0.24.0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_status_injection_only_touches_creating() {
        let fake = FakeProvisioner::new();
        let a = fake.create_resource(&config("t1", "reg")).await.unwrap();
        fake.create_resource(&config("t2", "reg")).await.unwrap();
        fake.create_resource(&config("t3", "other")).await.unwrap();

        assert_eq!(fake.set_status_by_count(1, "reg", EdgeState::Created), 1);
        assert_eq!(fake.set_status_by_count(5, "reg", EdgeState::Failed), 1);
        assert_eq!(fake.set_status_by_count(5, "reg", EdgeState::Deleting), 0);

        let status = fake.get_resource_status("t1", &a.context_id).await.unwrap();
        assert_eq!(status.state, EdgeState::Created);
        assert!(status.edge_id.is_some());
        assert_eq!(status.resources.len(), 1);
        assert_eq!(fake.edge_count_in("other", EdgeState::Creating), 1);
    }

    #[tokio::test]
    async fn test_delete_then_poll_reports_deleted() {
        let fake = FakeProvisioner::new();
        let info = fake.create_resource(&config("t1", "reg")).await.unwrap();

        let deleting = fake.delete_resource("t1", &info.context_id).await.unwrap();
        assert_eq!(deleting.state, EdgeState::Deleting);
        assert!(fake.post_delete_cleanup("t1").await.is_err());

        let polled = fake.get_resource_status("t1", &info.context_id).await.unwrap();
        assert_eq!(polled.state, EdgeState::Deleted);
        assert_eq!(fake.edge_count("reg"), 0);

        fake.post_delete_cleanup("t1").await.unwrap();
        assert_eq!(fake.post_delete_calls("t1"), 1);
    }

    #[tokio::test]
    async fn test_unknown_context_is_deleted() {
        let fake = FakeProvisioner::new();
        let status = fake.get_resource_status("t1", "missing").await.unwrap();
        assert_eq!(status.state, EdgeState::Deleted);
    }

    #[tokio::test]
    async fn test_fail_creates() {
        let fake = FakeProvisioner::new();
        fake.set_fail_creates(true);
        assert!(fake.create_resource(&config("t1", "reg")).await.is_err());
    }
}
