//! Billing error types

use thiserror::Error;

use crate::pending::ChangeStatus;
use crate::provider::ProviderError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    /// Transient; retried on the next scheduled cycle
    #[error("Payment provider call failed: {0}")]
    Provider(#[from] ProviderError),

    /// The affected row is skipped and logged, never crashed past
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid pending change transition: {from} -> {to}")]
    InvalidTransition { from: ChangeStatus, to: ChangeStatus },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl BillingError {
    /// Whether the next scheduled run may succeed without intervention
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::Provider(_) | BillingError::Database(_))
    }
}
