//! HTTP identity service client.

use reqwest::{Client, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::client::{AccountService, NewUser, UserInfo};
use super::error::AccountError;

/// Client for the account service REST API.
pub struct HttpAccountService {
    client: Client,
    base_url: String,
}

impl HttpAccountService {
    pub fn with_base_url(base_url: &str) -> Result<Self, AccountError> {
        let parsed = Url::parse(base_url)?;
        Ok(Self {
            client: Client::new(),
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: Response, what: &str) -> Result<Response, AccountError> {
        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => Err(AccountError::NotFound(what.to_string())),
            StatusCode::CONFLICT => Err(AccountError::AlreadyExists(what.to_string())),
            StatusCode::BAD_REQUEST => Err(AccountError::InvalidInput(
                response.text().await.unwrap_or_default(),
            )),
            s if s.is_success() => Ok(response),
            s => Err(AccountError::Api {
                status: s.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateTenantRequest<'a> {
    id: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateUserRequest<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
    role: &'a str,
}

impl AccountService for HttpAccountService {
    async fn create_tenant(&self, tenant_id: &str, name: &str) -> Result<(), AccountError> {
        let url = format!("{}/v1/tenants", self.base_url);
        debug!(tenant = tenant_id, "creating tenant");

        let body = CreateTenantRequest { id: tenant_id, name };
        let response = self.client.post(&url).json(&body).send().await?;
        Self::check(response, tenant_id).await?;
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), AccountError> {
        let url = format!("{}/v1/tenants/{}", self.base_url, tenant_id);
        debug!(tenant = tenant_id, "deleting tenant");

        let response = self.client.delete(&url).send().await?;
        match Self::check(response, tenant_id).await {
            Ok(_) | Err(AccountError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_tenant_user(&self, user: &NewUser) -> Result<UserInfo, AccountError> {
        let url = format!("{}/v1/tenants/{}/users", self.base_url, user.tenant_id);
        debug!(tenant = %user.tenant_id, "creating user");

        let body = CreateUserRequest {
            name: &user.name,
            email: &user.email,
            password: user.password.expose_secret(),
            role: &user.role,
        };
        let response = self.client.post(&url).json(&body).send().await?;
        let response = Self::check(response, &user.email).await?;
        Ok(response.json().await?)
    }

    async fn lookup_user_by_email(&self, email: &str) -> Result<Option<UserInfo>, AccountError> {
        let url = format!("{}/v1/users", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("email", email)])
            .send()
            .await?;
        match Self::check(response, email).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(AccountError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_tenant_users(&self, tenant_id: &str) -> Result<(), AccountError> {
        let url = format!("{}/v1/tenants/{}/users", self.base_url, tenant_id);
        debug!(tenant = tenant_id, "deleting tenant users");

        let response = self.client.delete(&url).send().await?;
        match Self::check(response, tenant_id).await {
            Ok(_) | Err(AccountError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
