use thiserror::Error;

use crate::account::AccountError;
use crate::coord::LockError;
use crate::provision::ProvisionError;

pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by the claim store and the lifecycle operations.
///
/// Callers branch on the variant to decide between rejecting a request
/// and polling again later (see [`PoolError::is_retryable`]).
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("dependency constraint violated: {0}")]
    DependencyConstraint(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    /// Translate a database error for the given entity.
    pub fn from_db(entity: &str, err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::RecordNotFound(entity.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Duplicate(entity.to_string())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                Self::DependencyConstraint(entity.to_string())
            }
            _ => Self::Internal(format!("{}: {}", entity, err)),
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RecordNotFound(_) | Self::Internal(_)
        )
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::RecordNotFound(what.to_string())
    }

    pub fn bad_request(what: impl std::fmt::Display) -> Self {
        Self::BadRequest(what.to_string())
    }
}

impl From<sqlx::Error> for PoolError {
    fn from(err: sqlx::Error) -> Self {
        Self::from_db("database", err)
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {}", err))
    }
}

impl From<ProvisionError> for PoolError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::NotFound(what) => Self::RecordNotFound(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<AccountError> for PoolError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::NotFound(what) => Self::RecordNotFound(what),
            AccountError::AlreadyExists(what) => Self::Duplicate(what),
            AccountError::InvalidInput(msg) => Self::BadRequest(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<LockError> for PoolError {
    fn from(err: LockError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(PoolError::not_found("tenant claim").is_retryable());
        assert!(PoolError::Internal("timed out".into()).is_retryable());
        assert!(!PoolError::bad_request("edgeCount").is_retryable());
        assert!(!PoolError::Duplicate("registration".into()).is_retryable());
    }

    #[test]
    fn test_row_not_found_maps_to_record_not_found() {
        let err = PoolError::from_db("registration", sqlx::Error::RowNotFound);
        assert!(matches!(err, PoolError::RecordNotFound(ref e) if e == "registration"));
    }

    #[test]
    fn test_account_conflict_maps_to_duplicate() {
        let err: PoolError = AccountError::AlreadyExists("a@b.com".into()).into();
        assert!(matches!(err, PoolError::Duplicate(_)));
    }
}
