//! Agreement registry records
//!
//! Every recurring-payment agreement ever created at the provider for a tenant
//! is kept as a link row. At most one link per tenant is primary; the store
//! enforces that with a single atomic "clear all, set one" operation.

use serde::{Deserialize, Serialize};
use tally_shared::TenantId;
use time::OffsetDateTime;
use uuid::Uuid;

/// Mirror of the provider's agreement status
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AgreementStatus {
    /// Checkout created, payer has not authorized yet
    Pending,
    Authorized,
    Paused,
    /// Cancellation requested locally, provider has not confirmed
    CancelPending,
    Canceled,
    /// Any provider status this crate doesn't model
    Other(String),
}

impl AgreementStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => AgreementStatus::Pending,
            "authorized" | "active" => AgreementStatus::Authorized,
            "paused" => AgreementStatus::Paused,
            "cancel_pending" => AgreementStatus::CancelPending,
            "canceled" | "cancelled" => AgreementStatus::Canceled,
            other => AgreementStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AgreementStatus::Pending => "pending",
            AgreementStatus::Authorized => "authorized",
            AgreementStatus::Paused => "paused",
            AgreementStatus::CancelPending => "cancel_pending",
            AgreementStatus::Canceled => "canceled",
            AgreementStatus::Other(s) => s,
        }
    }

    /// Provider is (or may be) collecting money on this agreement
    pub fn is_active(&self) -> bool {
        matches!(self, AgreementStatus::Authorized)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgreementStatus::Canceled)
    }
}

impl std::fmt::Display for AgreementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for AgreementStatus {
    fn from(s: String) -> Self {
        AgreementStatus::parse(&s)
    }
}

impl From<AgreementStatus> for String {
    fn from(s: AgreementStatus) -> Self {
        s.as_str().to_string()
    }
}

/// One external agreement belonging to a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementLink {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub external_agreement_id: String,
    pub status: AgreementStatus,
    pub is_primary: bool,
    /// Last cancellation attempt, used to order and age retries
    pub last_attempt_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl AgreementLink {
    pub fn new(
        tenant_id: TenantId,
        external_agreement_id: impl Into<String>,
        status: AgreementStatus,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            external_agreement_id: external_agreement_id.into(),
            status,
            is_primary: false,
            last_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A `cancel_pending` link whose last attempt is older than `threshold`
    pub fn is_stale_cancel(&self, now: OffsetDateTime, threshold: time::Duration) -> bool {
        self.status == AgreementStatus::CancelPending
            && self.last_attempt_at.map_or(true, |at| now - at > threshold)
    }
}
