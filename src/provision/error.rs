//! Provisioning backend errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("backend returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("invalid provisioner url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,
}
