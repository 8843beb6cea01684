//! Identity service trait and common types.

use std::future::Future;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::error::AccountError;

pub const SYSTEM_USER_NAME: &str = "Tenant Pool Admin";
pub const TRIAL_USER_NAME: &str = "Trial User";
pub const DEFAULT_USER_ROLE: &str = "INFRA_ADMIN";

/// A user to create under a tenant.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub tenant_id: String,
    pub name: String,
    pub email: String,
    pub password: SecretString,
    pub role: String,
}

impl NewUser {
    pub fn new(tenant_id: &str, name: &str, email: &str, password: SecretString) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            password,
            role: DEFAULT_USER_ROLE.to_string(),
        }
    }
}

/// A user as known to the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub tenant_id: String,
    pub email: String,
}

/// Tenant and user management in the external identity service.
pub trait AccountService: Send + Sync {
    /// Create a trial tenant with the given id.
    fn create_tenant(&self, tenant_id: &str, name: &str) -> impl Future<Output = Result<(), AccountError>> + Send;

    /// Delete a tenant. Missing tenants are not an error.
    fn delete_tenant(&self, tenant_id: &str) -> impl Future<Output = Result<(), AccountError>> + Send;

    fn create_tenant_user(&self, user: &NewUser) -> impl Future<Output = Result<UserInfo, AccountError>> + Send;

    fn lookup_user_by_email(&self, email: &str) -> impl Future<Output = Result<Option<UserInfo>, AccountError>> + Send;

    /// Remove every user of a tenant.
    fn delete_tenant_users(&self, tenant_id: &str) -> impl Future<Output = Result<(), AccountError>> + Send;
}
