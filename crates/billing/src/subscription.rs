//! Subscription records
//!
//! One subscription per tenant. The record mirrors the provider-side plan and
//! agreement and carries an optional, time-bound admin override of the access
//! mode. Expired overrides are ignored on read (lazy expiry), so nothing has to
//! sweep them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_shared::TenantId;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::access::AccessMode;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Subscription lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
    Suspended,
    Pending,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Pending => "pending",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            "suspended" => Ok(SubscriptionStatus::Suspended),
            "pending" => Ok(SubscriptionStatus::Pending),
            other => Err(BillingError::InvariantViolation(format!(
                "unknown subscription status '{}'",
                other
            ))),
        }
    }
}

/// A tenant's subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub status: SubscriptionStatus,
    pub start_at: OffsetDateTime,
    pub end_at: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub next_payment_at: Option<OffsetDateTime>,

    // Provider mirror
    pub external_agreement_id: Option<String>,
    pub external_plan_id: Option<String>,
    pub payer_email: Option<String>,
    pub last_synced_at: Option<OffsetDateTime>,

    // Admin override; both set or both unset
    pub override_mode: Option<AccessMode>,
    pub override_until: Option<OffsetDateTime>,

    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// New subscription in its trial period
    pub fn new_trial(
        tenant_id: TenantId,
        trial_ends_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            status: SubscriptionStatus::Trial,
            start_at: now,
            end_at: None,
            trial_ends_at,
            next_payment_at: None,
            external_agreement_id: None,
            external_plan_id: None,
            payer_email: None,
            last_synced_at: None,
            override_mode: None,
            override_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The admin override, if one is set and has not yet expired
    pub fn active_override(&self, now: OffsetDateTime) -> Option<(AccessMode, OffsetDateTime)> {
        match (self.override_mode, self.override_until) {
            (Some(mode), Some(until)) if until > now => Some((mode, until)),
            _ => None,
        }
    }
}

/// Validates an admin override before it is written
pub fn validate_override(until: OffsetDateTime, now: OffsetDateTime) -> BillingResult<()> {
    if until <= now {
        return Err(BillingError::InvalidInput(format!(
            "override must end in the future (until={}, now={})",
            until, now
        )));
    }
    Ok(())
}

/// Subscription lifecycle and admin operations
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, tenant_id: TenantId) -> BillingResult<Option<Subscription>> {
        self.store.get_subscription(tenant_id).await
    }

    /// Open a trial subscription for a tenant that has none
    pub async fn start_trial(
        &self,
        tenant_id: TenantId,
        trial_ends_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        if self.store.get_subscription(tenant_id).await?.is_some() {
            return Err(BillingError::InvalidInput(format!(
                "tenant {} already has a subscription",
                tenant_id
            )));
        }
        let subscription = Subscription::new_trial(tenant_id, trial_ends_at, now);
        self.store.insert_subscription(&subscription).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %subscription.id,
            trial_ends_at = ?trial_ends_at,
            "Trial subscription created"
        );
        Ok(subscription)
    }

    /// Force an access mode until `until`
    pub async fn set_access_override(
        &self,
        tenant_id: TenantId,
        mode: AccessMode,
        until: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        validate_override(until, now)?;
        if !self
            .store
            .set_access_override(tenant_id, Some((mode, until)), now)
            .await?
        {
            return Err(BillingError::NotFound(format!(
                "subscription for tenant {}",
                tenant_id
            )));
        }

        tracing::info!(
            tenant_id = %tenant_id,
            mode = %mode,
            until = %until,
            "Admin access override set"
        );
        Ok(())
    }

    pub async fn clear_access_override(
        &self,
        tenant_id: TenantId,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        if !self.store.set_access_override(tenant_id, None, now).await? {
            return Err(BillingError::NotFound(format!(
                "subscription for tenant {}",
                tenant_id
            )));
        }
        tracing::info!(tenant_id = %tenant_id, "Admin access override cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    fn sample(now: OffsetDateTime) -> Subscription {
        Subscription::new_trial(TenantId::new(), None, now)
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            SubscriptionStatus::Trial,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Suspended,
            SubscriptionStatus::Pending,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!(
            "PAST_DUE".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
        assert!("frozen".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_expired_override_is_ignored() {
        let now = datetime!(2024-06-01 12:00 UTC);
        let mut sub = sample(now);
        sub.override_mode = Some(AccessMode::Blocked);
        sub.override_until = Some(now - Duration::seconds(1));
        assert!(sub.active_override(now).is_none());

        sub.override_until = Some(now + Duration::hours(1));
        assert_eq!(
            sub.active_override(now),
            Some((AccessMode::Blocked, now + Duration::hours(1)))
        );
    }

    #[test]
    fn test_override_ending_exactly_now_is_expired() {
        let now = datetime!(2024-06-01 12:00 UTC);
        let mut sub = sample(now);
        sub.override_mode = Some(AccessMode::Full);
        sub.override_until = Some(now);
        assert!(sub.active_override(now).is_none());
        assert!(validate_override(now, now).is_err());
        assert!(validate_override(now + Duration::minutes(1), now).is_ok());
    }

    #[tokio::test]
    async fn test_override_set_and_clear() {
        use crate::store::InMemoryBillingStore;

        let now = datetime!(2024-06-01 12:00 UTC);
        let store = Arc::new(InMemoryBillingStore::new());
        let service = SubscriptionService::new(store.clone());
        let tenant = TenantId::new();
        service.start_trial(tenant, None, now).await.unwrap();

        let err = service
            .set_access_override(tenant, AccessMode::Blocked, now - Duration::hours(1), now)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        service
            .set_access_override(tenant, AccessMode::ReadOnly, now + Duration::hours(1), now)
            .await
            .unwrap();
        let sub = service.get(tenant).await.unwrap().unwrap();
        assert_eq!(sub.active_override(now), Some((AccessMode::ReadOnly, now + Duration::hours(1))));

        service.clear_access_override(tenant, now).await.unwrap();
        let sub = service.get(tenant).await.unwrap().unwrap();
        assert!(sub.override_mode.is_none());
        assert!(sub.override_until.is_none());
    }

    #[tokio::test]
    async fn test_override_requires_subscription() {
        use crate::store::InMemoryBillingStore;

        let now = datetime!(2024-06-01 12:00 UTC);
        let service = SubscriptionService::new(Arc::new(InMemoryBillingStore::new()));
        let err = service
            .set_access_override(TenantId::new(), AccessMode::Full, now + Duration::days(1), now)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
