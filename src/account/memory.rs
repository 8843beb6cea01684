//! In-memory identity service used by tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::client::{AccountService, NewUser, UserInfo};
use super::error::AccountError;

#[derive(Debug, Default)]
struct Directory {
    next_id: u64,
    tenants: HashSet<String>,
    users: HashMap<String, UserInfo>,
    fail_user_creates: bool,
}

/// Shared handle; clones observe the same directory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAccountService {
    directory: Arc<Mutex<Directory>>,
}

impl MemoryAccountService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Directory> {
        self.directory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub fn has_tenant(&self, tenant_id: &str) -> bool {
        self.lock().tenants.contains(tenant_id)
    }

    #[cfg(test)]
    pub fn user_count(&self, tenant_id: &str) -> usize {
        self.lock()
            .users
            .values()
            .filter(|u| u.tenant_id == tenant_id)
            .count()
    }

    /// Make subsequent user creations fail with a service error.
    #[cfg(test)]
    pub fn set_fail_user_creates(&self, fail: bool) {
        self.lock().fail_user_creates = fail;
    }
}

impl AccountService for MemoryAccountService {
    async fn create_tenant(&self, tenant_id: &str, _name: &str) -> Result<(), AccountError> {
        if !self.lock().tenants.insert(tenant_id.to_string()) {
            return Err(AccountError::AlreadyExists(tenant_id.to_string()));
        }
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), AccountError> {
        self.lock().tenants.remove(tenant_id);
        Ok(())
    }

    async fn create_tenant_user(&self, user: &NewUser) -> Result<UserInfo, AccountError> {
        let mut dir = self.lock();
        if dir.fail_user_creates {
            return Err(AccountError::Api {
                status: 503,
                message: "user creation unavailable".to_string(),
            });
        }
        if dir.users.contains_key(&user.email) {
            return Err(AccountError::AlreadyExists(user.email.clone()));
        }
        dir.next_id += 1;
        let info = UserInfo {
            id: format!("user-{}", dir.next_id),
            tenant_id: user.tenant_id.clone(),
            email: user.email.clone(),
        };
        dir.users.insert(user.email.clone(), info.clone());
        Ok(info)
    }

    async fn lookup_user_by_email(&self, email: &str) -> Result<Option<UserInfo>, AccountError> {
        Ok(self.lock().users.get(email).cloned())
    }

    async fn delete_tenant_users(&self, tenant_id: &str) -> Result<(), AccountError> {
        self.lock().users.retain(|_, u| u.tenant_id != tenant_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn user(tenant: &str, email: &str) -> NewUser {
        NewUser::new(tenant, "Trial User", email, SecretString::from("pw".to_string()))
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let svc = MemoryAccountService::new();
        svc.create_tenant_user(&user("t1", "a@b.com")).await.unwrap();
        let err = svc.create_tenant_user(&user("t2", "a@b.com")).await.unwrap_err();
        assert!(matches!(err, AccountError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_delete_tenant_users() {
        let svc = MemoryAccountService::new();
        svc.create_tenant("t1", "trial").await.unwrap();
        svc.create_tenant_user(&user("t1", "a@b.com")).await.unwrap();
        svc.create_tenant_user(&user("t1", "c@d.com")).await.unwrap();
        svc.create_tenant_user(&user("t2", "e@f.com")).await.unwrap();

        svc.delete_tenant_users("t1").await.unwrap();
        assert_eq!(svc.user_count("t1"), 0);
        assert_eq!(svc.user_count("t2"), 1);
        assert!(svc.lookup_user_by_email("a@b.com").await.unwrap().is_none());
        assert!(svc.has_tenant("t1"));
    }
}
