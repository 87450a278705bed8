//! Payment provider seam
//!
//! Only the logical operations the engine needs are modeled here. Every call
//! carries a [`CorrelationId`] so a failure can be traced across both systems.

mod http;

pub use http::{HttpProviderClient, ProviderClientConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::agreements::AgreementStatus;
use crate::plans::BillingPlan;

/// Per-call id sent to the provider and attached to every log line and error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provider call failure. A timeout is never treated as success.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider call timed out (correlation_id={correlation_id})")]
    Timeout { correlation_id: CorrelationId },

    #[error("provider transport error: {message} (correlation_id={correlation_id})")]
    Transport {
        correlation_id: CorrelationId,
        message: String,
    },

    #[error("provider returned HTTP {code}: {body} (correlation_id={correlation_id})")]
    Status {
        correlation_id: CorrelationId,
        code: u16,
        body: String,
    },

    #[error("could not decode provider response: {message} (correlation_id={correlation_id})")]
    Decode {
        correlation_id: CorrelationId,
        message: String,
    },

    #[error("provider rejected the request: {reason} (correlation_id={correlation_id})")]
    Rejected {
        correlation_id: CorrelationId,
        reason: String,
    },
}

impl ProviderError {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            ProviderError::Timeout { correlation_id }
            | ProviderError::Transport { correlation_id, .. }
            | ProviderError::Status { correlation_id, .. }
            | ProviderError::Decode { correlation_id, .. }
            | ProviderError::Rejected { correlation_id, .. } => *correlation_id,
        }
    }

    /// Worth retrying within the same call (network trouble or a 5xx)
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout { .. } | ProviderError::Transport { .. } => true,
            ProviderError::Status { code, .. } => *code >= 500 || *code == 429,
            ProviderError::Decode { .. } | ProviderError::Rejected { .. } => false,
        }
    }
}

/// Result of starting a checkout at the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedAgreement {
    pub agreement_id: String,
    pub checkout_url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Mirror a billing plan at the provider, returning its external plan id
    async fn create_plan(
        &self,
        plan: &BillingPlan,
        correlation_id: CorrelationId,
    ) -> Result<String, ProviderError>;

    /// Start a recurring-payment checkout for `plan`
    async fn create_agreement(
        &self,
        plan: &BillingPlan,
        payer_back_url: &str,
        external_reference: &str,
        correlation_id: CorrelationId,
    ) -> Result<CreatedAgreement, ProviderError>;

    async fn cancel_agreement(
        &self,
        agreement_id: &str,
        correlation_id: CorrelationId,
    ) -> Result<(), ProviderError>;

    async fn get_agreement_status(
        &self,
        agreement_id: &str,
        correlation_id: CorrelationId,
    ) -> Result<AgreementStatus, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_carries_correlation_id() {
        let id = CorrelationId::new();
        let err = ProviderError::Status {
            correlation_id: id,
            code: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(err.correlation_id(), id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_retryable_classification() {
        let id = CorrelationId::new();
        assert!(ProviderError::Timeout { correlation_id: id }.is_retryable());
        assert!(ProviderError::Status { correlation_id: id, code: 503, body: String::new() }.is_retryable());
        assert!(!ProviderError::Status { correlation_id: id, code: 404, body: String::new() }.is_retryable());
        assert!(!ProviderError::Rejected { correlation_id: id, reason: "nope".into() }.is_retryable());
    }
}
