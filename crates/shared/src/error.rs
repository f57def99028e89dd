//! Error types for DojoGate domain values

use thiserror::Error;

/// Errors raised while parsing or validating domain values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Invalid subscription status: {0}")]
    InvalidSubscriptionStatus(String),

    #[error("Invalid trial status: {0}")]
    InvalidTrialStatus(String),

    #[error("Invalid access source: {0}")]
    InvalidAccessSource(String),

    #[error("Invalid feature key: {0}")]
    InvalidFeatureKey(String),

    #[error("Invalid plan name: {0}")]
    InvalidPlanName(String),
}
