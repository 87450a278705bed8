//! Pending subscription changes
//!
//! A plan change (upgrade, downgrade, renewal) is recorded before checkout and
//! only becomes part of the subscription once the provider confirms payment
//! and its effective instant arrives.
//!
//! Lifecycle: `CREATED -> CHECKOUT_STARTED -> PAID -> APPLIED`. Any non-terminal
//! state may instead move to `CANCELED` or `EXPIRED`. Status never moves
//! backwards and `APPLIED`, `CANCELED` and `EXPIRED` are terminal.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Kind of plan change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Upgrade,
    Downgrade,
    Renewal,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Upgrade => "UPGRADE",
            ChangeType::Downgrade => "DOWNGRADE",
            ChangeType::Renewal => "RENEWAL",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChangeType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UPGRADE" => Ok(ChangeType::Upgrade),
            "DOWNGRADE" => Ok(ChangeType::Downgrade),
            "RENEWAL" => Ok(ChangeType::Renewal),
            other => Err(BillingError::InvariantViolation(format!(
                "unknown change type '{}'",
                other
            ))),
        }
    }
}

/// Pending change lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeStatus {
    Created,
    CheckoutStarted,
    Paid,
    Canceled,
    Expired,
    Applied,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Created => "CREATED",
            ChangeStatus::CheckoutStarted => "CHECKOUT_STARTED",
            ChangeStatus::Paid => "PAID",
            ChangeStatus::Canceled => "CANCELED",
            ChangeStatus::Expired => "EXPIRED",
            ChangeStatus::Applied => "APPLIED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChangeStatus::Applied | ChangeStatus::Canceled | ChangeStatus::Expired
        )
    }

    /// Forward-only transition table
    pub fn can_transition_to(&self, next: ChangeStatus) -> bool {
        use ChangeStatus::*;
        match (self, next) {
            (Created, CheckoutStarted) => true,
            (Created, Paid) | (CheckoutStarted, Paid) => true,
            (Paid, Applied) => true,
            (Created | CheckoutStarted | Paid, Canceled) => true,
            (Created | CheckoutStarted | Paid, Expired) => true,
            _ => false,
        }
    }

    /// Every status from which `next` may be reached
    pub fn predecessors(next: ChangeStatus) -> Vec<ChangeStatus> {
        ChangeStatus::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    pub const ALL: [ChangeStatus; 6] = [
        ChangeStatus::Created,
        ChangeStatus::CheckoutStarted,
        ChangeStatus::Paid,
        ChangeStatus::Canceled,
        ChangeStatus::Expired,
        ChangeStatus::Applied,
    ];
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChangeStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Ok(ChangeStatus::Created),
            "CHECKOUT_STARTED" => Ok(ChangeStatus::CheckoutStarted),
            "PAID" => Ok(ChangeStatus::Paid),
            "CANCELED" | "CANCELLED" => Ok(ChangeStatus::Canceled),
            "EXPIRED" => Ok(ChangeStatus::Expired),
            "APPLIED" => Ok(ChangeStatus::Applied),
            other => Err(BillingError::InvariantViolation(format!(
                "unknown pending change status '{}'",
                other
            ))),
        }
    }
}

/// A requested plan transition awaiting payment and its effective instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSubscriptionChange {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub change_type: ChangeType,
    pub status: ChangeStatus,
    pub target_plan_id: Uuid,
    /// `None` applies as soon as the change is paid
    pub effective_at: Option<OffsetDateTime>,

    // Checkout correlation
    pub external_agreement_id: Option<String>,
    pub external_reference: Option<String>,
    pub checkout_url: Option<String>,

    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
    pub applied_at: Option<OffsetDateTime>,
}

impl PendingSubscriptionChange {
    pub fn new(
        subscription_id: Uuid,
        change_type: ChangeType,
        target_plan_id: Uuid,
        effective_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            subscription_id,
            change_type,
            status: ChangeStatus::Created,
            target_plan_id,
            effective_at,
            external_agreement_id: None,
            // The change id doubles as the checkout reference echoed back by the provider
            external_reference: Some(id.to_string()),
            checkout_url: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
            applied_at: None,
        }
    }

    /// Paid and its effective instant has arrived
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.status == ChangeStatus::Paid && self.effective_at.map_or(true, |at| at <= now)
    }

    /// Instant the change takes effect when applied at `now`
    pub fn effective_date(&self, now: OffsetDateTime) -> OffsetDateTime {
        self.effective_at.unwrap_or(now)
    }

    /// Move to `next`, stamping the matching timestamp
    pub fn transition(&mut self, next: ChangeStatus, now: OffsetDateTime) -> BillingResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(BillingError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        match next {
            ChangeStatus::Paid => self.paid_at = Some(now),
            ChangeStatus::Applied => self.applied_at = Some(now),
            _ => {}
        }
        Ok(())
    }
}
