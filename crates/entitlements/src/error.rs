//! Entitlement engine error types

use dojogate_shared::DomainError;
use thiserror::Error;

/// Errors returned by the entitlement engine.
///
/// `NotFound`, `Conflict` and `InvalidState` are caller mistakes and are never
/// retried. `Unavailable` means storage could not be reached; readers must
/// fail closed and the sweep retries on its next tick.
#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl EntitlementError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Short machine-readable code for structured log fields
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidState(_) => "invalid_state",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

impl From<sqlx::Error> for EntitlementError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => EntitlementError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // PostgreSQL unique violation
                if db_err.code().as_deref() == Some("23505") {
                    return EntitlementError::Conflict(db_err.message().to_string());
                }
                EntitlementError::Unavailable(db_err.to_string())
            }
            other => EntitlementError::Unavailable(other.to_string()),
        }
    }
}

impl From<DomainError> for EntitlementError {
    fn from(err: DomainError) -> Self {
        EntitlementError::InvalidState(err.to_string())
    }
}

pub type EntitlementResult<T> = Result<T, EntitlementError>;
