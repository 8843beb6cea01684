//! Identity service errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("identity service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid account service url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
