//! Identity service adapter: tenants and their users.

mod client;
mod error;
mod http;
mod memory;

pub use client::{AccountService, NewUser, SYSTEM_USER_NAME, TRIAL_USER_NAME, UserInfo};
pub use error::AccountError;
pub use http::HttpAccountService;
pub use memory::MemoryAccountService;

/// Account service selected at startup.
pub enum AccountClients {
    Http(HttpAccountService),
    Memory(MemoryAccountService),
}

impl AccountService for AccountClients {
    async fn create_tenant(&self, tenant_id: &str, name: &str) -> Result<(), AccountError> {
        match self {
            Self::Http(c) => c.create_tenant(tenant_id, name).await,
            Self::Memory(c) => c.create_tenant(tenant_id, name).await,
        }
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), AccountError> {
        match self {
            Self::Http(c) => c.delete_tenant(tenant_id).await,
            Self::Memory(c) => c.delete_tenant(tenant_id).await,
        }
    }

    async fn create_tenant_user(&self, user: &NewUser) -> Result<UserInfo, AccountError> {
        match self {
            Self::Http(c) => c.create_tenant_user(user).await,
            Self::Memory(c) => c.create_tenant_user(user).await,
        }
    }

    async fn lookup_user_by_email(&self, email: &str) -> Result<Option<UserInfo>, AccountError> {
        match self {
            Self::Http(c) => c.lookup_user_by_email(email).await,
            Self::Memory(c) => c.lookup_user_by_email(email).await,
        }
    }

    async fn delete_tenant_users(&self, tenant_id: &str) -> Result<(), AccountError> {
        match self {
            Self::Http(c) => c.delete_tenant_users(tenant_id).await,
            Self::Memory(c) => c.delete_tenant_users(tenant_id).await,
        }
    }
}
