//! Access resolution
//!
//! Maps a tenant's subscription (or its absence) to the access mode the
//! request layer enforces. Evaluation order, first match wins:
//!
//! 1. No subscription: `Blocked`
//! 2. Unexpired admin override: the override mode
//! 3. Trial: `Full` until `trial_ends_at`, then `ReadOnly`
//! 4. Active: `Full`
//! 5. Past due / suspended: `ReadOnly`
//! 6. Canceled: `ReadOnly` while a paid-for period remains, then `Blocked`
//! 7. Pending: `ReadOnly`

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_shared::TenantId;
use time::OffsetDateTime;

use crate::error::BillingError;
use crate::store::BillingStore;
use crate::subscription::{Subscription, SubscriptionStatus};

/// What a tenant is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Unrestricted
    Full,
    /// Reads and exports allowed, writes blocked
    ReadOnly,
    /// No access
    Blocked,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Full => "full",
            AccessMode::ReadOnly => "readonly",
            AccessMode::Blocked => "blocked",
        }
    }

    pub fn allows_writes(&self) -> bool {
        matches!(self, AccessMode::Full)
    }

    pub fn allows_reads(&self) -> bool {
        !matches!(self, AccessMode::Blocked)
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AccessMode {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(AccessMode::Full),
            "readonly" | "read_only" => Ok(AccessMode::ReadOnly),
            "blocked" => Ok(AccessMode::Blocked),
            other => Err(BillingError::InvalidInput(format!(
                "unknown access mode '{}'",
                other
            ))),
        }
    }
}

/// Why a mode was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    NoSubscription,
    AdminOverride,
    Trial,
    TrialExpired,
    Active,
    PastDue,
    Suspended,
    CanceledGracePeriod,
    Canceled,
    Pending,
    /// The subscription could not be loaded; fail closed
    Unavailable,
}

impl AccessReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessReason::NoSubscription => "no_subscription",
            AccessReason::AdminOverride => "admin_override",
            AccessReason::Trial => "trial",
            AccessReason::TrialExpired => "trial_expired",
            AccessReason::Active => "active",
            AccessReason::PastDue => "past_due",
            AccessReason::Suspended => "suspended",
            AccessReason::CanceledGracePeriod => "canceled_grace_period",
            AccessReason::Canceled => "canceled",
            AccessReason::Pending => "pending",
            AccessReason::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for AccessReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of resolving a tenant's access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub mode: AccessMode,
    pub reason: AccessReason,
    /// When the decision stops holding without any write, if known
    pub valid_until: Option<OffsetDateTime>,
}

impl AccessDecision {
    fn new(mode: AccessMode, reason: AccessReason, valid_until: Option<OffsetDateTime>) -> Self {
        Self {
            mode,
            reason,
            valid_until,
        }
    }
}

/// Resolve the access mode for a subscription at `now`. Never fails.
pub fn resolve_access(subscription: Option<&Subscription>, now: OffsetDateTime) -> AccessDecision {
    let Some(sub) = subscription else {
        return AccessDecision::new(AccessMode::Blocked, AccessReason::NoSubscription, None);
    };

    if let Some((mode, until)) = sub.active_override(now) {
        return AccessDecision::new(mode, AccessReason::AdminOverride, Some(until));
    }

    match sub.status {
        SubscriptionStatus::Trial => match sub.trial_ends_at {
            Some(ends) if ends <= now => {
                AccessDecision::new(AccessMode::ReadOnly, AccessReason::TrialExpired, None)
            }
            ends => AccessDecision::new(AccessMode::Full, AccessReason::Trial, ends),
        },
        SubscriptionStatus::Active => {
            AccessDecision::new(AccessMode::Full, AccessReason::Active, sub.end_at)
        }
        SubscriptionStatus::PastDue => {
            AccessDecision::new(AccessMode::ReadOnly, AccessReason::PastDue, None)
        }
        SubscriptionStatus::Suspended => {
            AccessDecision::new(AccessMode::ReadOnly, AccessReason::Suspended, None)
        }
        SubscriptionStatus::Canceled => match sub.end_at {
            Some(end) if end > now => AccessDecision::new(
                AccessMode::ReadOnly,
                AccessReason::CanceledGracePeriod,
                Some(end),
            ),
            _ => AccessDecision::new(AccessMode::Blocked, AccessReason::Canceled, None),
        },
        SubscriptionStatus::Pending => {
            AccessDecision::new(AccessMode::ReadOnly, AccessReason::Pending, None)
        }
    }
}

/// Store-backed resolver used by the request layer
#[derive(Clone)]
pub struct AccessResolver {
    store: Arc<dyn BillingStore>,
}

impl AccessResolver {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Load the tenant's subscription and resolve it, failing closed on store errors
    pub async fn resolve_for_tenant(&self, tenant_id: TenantId, now: OffsetDateTime) -> AccessDecision {
        match self.store.get_subscription(tenant_id).await {
            Ok(sub) => resolve_access(sub.as_ref(), now),
            Err(e) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Failed to load subscription for access check - blocking"
                );
                AccessDecision::new(AccessMode::Blocked, AccessReason::Unavailable, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

    fn sub_with(status: SubscriptionStatus) -> Subscription {
        let mut sub = Subscription::new_trial(TenantId::new(), None, NOW - Duration::days(30));
        sub.status = status;
        sub
    }

    #[test]
    fn test_no_subscription_is_blocked() {
        let decision = resolve_access(None, NOW);
        assert_eq!(decision.mode, AccessMode::Blocked);
        assert_eq!(decision.reason.as_str(), "no_subscription");
        assert!(decision.valid_until.is_none());
    }

    #[test]
    fn test_trial_without_end_is_full() {
        let decision = resolve_access(Some(&sub_with(SubscriptionStatus::Trial)), NOW);
        assert_eq!(decision.mode, AccessMode::Full);
        assert_eq!(decision.reason, AccessReason::Trial);
    }

    #[test]
    fn test_trial_in_progress_is_full_until_trial_end() {
        let mut sub = sub_with(SubscriptionStatus::Trial);
        sub.trial_ends_at = Some(NOW + Duration::days(3));
        let decision = resolve_access(Some(&sub), NOW);
        assert_eq!(decision.mode, AccessMode::Full);
        assert_eq!(decision.valid_until, Some(NOW + Duration::days(3)));
    }

    #[test]
    fn test_expired_trial_is_readonly() {
        let mut sub = sub_with(SubscriptionStatus::Trial);
        sub.trial_ends_at = Some(NOW - Duration::minutes(1));
        let decision = resolve_access(Some(&sub), NOW);
        assert_eq!(decision.mode, AccessMode::ReadOnly);
        assert_eq!(decision.reason.as_str(), "trial_expired");
    }

    #[test]
    fn test_past_due_and_suspended_use_lowercased_status_reason() {
        let past_due = resolve_access(Some(&sub_with(SubscriptionStatus::PastDue)), NOW);
        assert_eq!(past_due.mode, AccessMode::ReadOnly);
        assert_eq!(past_due.reason.as_str(), "past_due");

        let suspended = resolve_access(Some(&sub_with(SubscriptionStatus::Suspended)), NOW);
        assert_eq!(suspended.mode, AccessMode::ReadOnly);
        assert_eq!(suspended.reason.as_str(), "suspended");
    }

    #[test]
    fn test_canceled_without_end_is_blocked() {
        let decision = resolve_access(Some(&sub_with(SubscriptionStatus::Canceled)), NOW);
        assert_eq!(decision.mode, AccessMode::Blocked);
    }

    #[test]
    fn test_pending_is_readonly() {
        let decision = resolve_access(Some(&sub_with(SubscriptionStatus::Pending)), NOW);
        assert_eq!(decision.mode, AccessMode::ReadOnly);
        assert_eq!(decision.reason, AccessReason::Pending);
    }

    #[test]
    fn test_readonly_override_beats_expired_trial() {
        let mut sub = sub_with(SubscriptionStatus::Trial);
        sub.trial_ends_at = Some(NOW - Duration::days(1));
        sub.override_mode = Some(AccessMode::Full);
        sub.override_until = Some(NOW + Duration::days(7));
        let decision = resolve_access(Some(&sub), NOW);
        assert_eq!(decision.mode, AccessMode::Full);
        assert_eq!(decision.reason, AccessReason::AdminOverride);
        assert_eq!(decision.valid_until, Some(NOW + Duration::days(7)));
    }

    #[test]
    fn test_access_mode_permissions() {
        assert!(AccessMode::Full.allows_writes());
        assert!(!AccessMode::ReadOnly.allows_writes());
        assert!(AccessMode::ReadOnly.allows_reads());
        assert!(!AccessMode::Blocked.allows_reads());
    }

    #[test]
    fn test_access_mode_parse() {
        assert_eq!("READONLY".parse::<AccessMode>().unwrap(), AccessMode::ReadOnly);
        assert!("admin".parse::<AccessMode>().is_err());
    }
}
