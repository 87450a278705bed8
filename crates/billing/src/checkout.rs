//! Checkout initiation and abandonment
//!
//! A plan change is recorded as a CREATED pending change before the provider
//! is called, so a failed provider call leaves a visible CREATED row that the
//! expiry sweep eventually closes.

use std::sync::Arc;

use serde::Serialize;
use tally_shared::TenantId;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::agreements::{AgreementLink, AgreementStatus};
use crate::error::{BillingError, BillingResult};
use crate::pending::{ChangeStatus, ChangeType, PendingSubscriptionChange};
use crate::provider::{CorrelationId, PaymentProvider};
use crate::store::BillingStore;

/// Where to send the payer for a started change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutResponse {
    pub change_id: Uuid,
    pub agreement_id: String,
    pub checkout_url: String,
}

/// Counts for one expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpireSummary {
    pub candidates: usize,
    pub expired: usize,
    pub failed: usize,
}

pub struct CheckoutService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    payer_back_url: String,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        payer_back_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            payer_back_url: payer_back_url.into(),
        }
    }

    /// Record a plan change and start its checkout at the provider
    pub async fn start_change(
        &self,
        tenant_id: TenantId,
        change_type: ChangeType,
        plan_id: Uuid,
        effective_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> BillingResult<CheckoutResponse> {
        let subscription = self
            .store
            .get_subscription(tenant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription for tenant {}", tenant_id)))?;

        let mut plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("billing plan {}", plan_id)))?;
        if !plan.is_active {
            return Err(BillingError::InvalidInput(format!(
                "billing plan {} is not active",
                plan.id
            )));
        }

        let change =
            PendingSubscriptionChange::new(subscription.id, change_type, plan.id, effective_at, now);
        self.store.insert_change(&change).await?;

        if !plan.is_synced() {
            let correlation_id = CorrelationId::new();
            let external_plan_id = self.provider.create_plan(&plan, correlation_id).await?;
            self.store
                .set_external_plan_id(plan.id, &external_plan_id)
                .await?;
            plan.external_plan_id = Some(external_plan_id);
        }

        let reference = change
            .external_reference
            .clone()
            .unwrap_or_else(|| change.id.to_string());
        let correlation_id = CorrelationId::new();
        let created = self
            .provider
            .create_agreement(&plan, &self.payer_back_url, &reference, correlation_id)
            .await
            .map_err(|e| {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    change_id = %change.id,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to start checkout, change left CREATED"
                );
                e
            })?;

        let link = AgreementLink::new(
            tenant_id,
            created.agreement_id.clone(),
            AgreementStatus::Pending,
            now,
        );
        self.store.upsert_agreement_link(&link).await?;

        if !self
            .store
            .record_checkout(change.id, &created.agreement_id, &created.checkout_url, now)
            .await?
        {
            return Err(BillingError::InvariantViolation(format!(
                "pending change {} left CREATED before checkout was recorded",
                change.id
            )));
        }

        tracing::info!(
            tenant_id = %tenant_id,
            change_id = %change.id,
            change_type = %change_type,
            agreement_id = %created.agreement_id,
            correlation_id = %correlation_id,
            "Checkout started"
        );

        Ok(CheckoutResponse {
            change_id: change.id,
            agreement_id: created.agreement_id,
            checkout_url: created.checkout_url,
        })
    }

    /// Cancel a change that has not been applied yet
    pub async fn cancel_change(&self, change_id: Uuid, now: OffsetDateTime) -> BillingResult<()> {
        let change = self
            .store
            .get_change(change_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("pending change {}", change_id)))?;

        if !change.status.can_transition_to(ChangeStatus::Canceled) {
            return Err(BillingError::InvalidTransition {
                from: change.status,
                to: ChangeStatus::Canceled,
            });
        }

        if !self
            .store
            .transition_change(change_id, ChangeStatus::Canceled, now)
            .await?
        {
            // Lost a race with the applier or the expiry sweep
            let status = self
                .store
                .get_change(change_id)
                .await?
                .map(|c| c.status)
                .unwrap_or(change.status);
            return Err(BillingError::InvalidTransition {
                from: status,
                to: ChangeStatus::Canceled,
            });
        }

        tracing::info!(change_id = %change_id, "Pending change canceled");
        Ok(())
    }

    /// Expire CREATED / CHECKOUT_STARTED changes older than `max_age`
    pub async fn expire_abandoned_checkouts(
        &self,
        max_age: Duration,
        now: OffsetDateTime,
    ) -> BillingResult<ExpireSummary> {
        let cutoff = now.checked_sub(max_age).ok_or_else(|| {
            BillingError::InvalidInput(format!("checkout max age {} is out of range", max_age))
        })?;
        let abandoned = self.store.list_abandoned_checkouts(cutoff).await?;
        let mut summary = ExpireSummary {
            candidates: abandoned.len(),
            ..ExpireSummary::default()
        };

        for change in &abandoned {
            match self
                .store
                .transition_change(change.id, ChangeStatus::Expired, now)
                .await
            {
                Ok(true) => summary.expired += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        change_id = %change.id,
                        error = %e,
                        "Failed to expire abandoned checkout"
                    );
                }
            }
        }

        tracing::info!(
            candidates = summary.candidates,
            expired = summary.expired,
            failed = summary.failed,
            "Abandoned checkout sweep complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::BillingPlan;
    use crate::store::{AgreementStore, InMemoryBillingStore, PendingChangeStore, PlanCatalog};
    use crate::test_support::{seed_plan, seed_tenant, ScriptedProvider, NOW};

    fn service(store: &Arc<InMemoryBillingStore>, provider: &Arc<ScriptedProvider>) -> CheckoutService {
        CheckoutService::new(store.clone(), provider.clone(), "https://app.test/billing/return")
    }

    #[tokio::test]
    async fn test_start_change_records_checkout() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = ScriptedProvider::new();
        let (tenant, sub) = seed_tenant(&store).await;
        let plan = seed_plan(&store, 1, "months").await;

        let response = service(&store, &provider)
            .start_change(tenant, ChangeType::Upgrade, plan.id, None, NOW)
            .await
            .unwrap();

        let change = store.get_change(response.change_id).await.unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::CheckoutStarted);
        assert_eq!(change.subscription_id, sub.id);
        assert_eq!(change.external_agreement_id.as_deref(), Some(response.agreement_id.as_str()));
        assert_eq!(change.checkout_url.as_deref(), Some(response.checkout_url.as_str()));

        let link = store.get_agreement_link(&response.agreement_id).await.unwrap().unwrap();
        assert_eq!(link.status, AgreementStatus::Pending);
        assert!(!link.is_primary);
    }

    #[tokio::test]
    async fn test_unsynced_plan_is_created_at_provider() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = ScriptedProvider::new();
        let (tenant, _) = seed_tenant(&store).await;
        let plan = BillingPlan::new("Team", 9900, "USD", 1, "Years");
        store.insert_plan(&plan).await.unwrap();

        service(&store, &provider)
            .start_change(tenant, ChangeType::Upgrade, plan.id, None, NOW)
            .await
            .unwrap();

        let stored = store.get_plan(plan.id).await.unwrap().unwrap();
        assert!(stored.is_synced());
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_change_created() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = ScriptedProvider::new();
        provider.fail_create(true);
        let (tenant, _) = seed_tenant(&store).await;
        let plan = seed_plan(&store, 1, "months").await;

        let err = service(&store, &provider)
            .start_change(tenant, ChangeType::Upgrade, plan.id, None, NOW)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let abandoned = store
            .list_abandoned_checkouts(NOW + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].status, ChangeStatus::Created);
    }

    #[tokio::test]
    async fn test_inactive_plan_rejected() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = ScriptedProvider::new();
        let (tenant, _) = seed_tenant(&store).await;
        let mut plan = BillingPlan::new("Legacy", 100, "USD", 1, "months");
        plan.is_active = false;
        store.insert_plan(&plan).await.unwrap();

        let err = service(&store, &provider)
            .start_change(tenant, ChangeType::Downgrade, plan.id, None, NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cancel_change() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = ScriptedProvider::new();
        let (tenant, _) = seed_tenant(&store).await;
        let plan = seed_plan(&store, 1, "months").await;
        let svc = service(&store, &provider);
        let response = svc
            .start_change(tenant, ChangeType::Upgrade, plan.id, None, NOW)
            .await
            .unwrap();

        svc.cancel_change(response.change_id, NOW).await.unwrap();
        let err = svc.cancel_change(response.change_id, NOW).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::InvalidTransition { from: ChangeStatus::Canceled, .. }
        ));
    }

    #[tokio::test]
    async fn test_expire_abandoned_checkouts() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = ScriptedProvider::new();
        let (tenant, _) = seed_tenant(&store).await;
        let plan = seed_plan(&store, 1, "months").await;
        let svc = service(&store, &provider);

        let old = svc
            .start_change(tenant, ChangeType::Upgrade, plan.id, None, NOW - Duration::hours(72))
            .await
            .unwrap();
        let fresh = svc
            .start_change(tenant, ChangeType::Upgrade, plan.id, None, NOW - Duration::hours(1))
            .await
            .unwrap();

        let summary = svc
            .expire_abandoned_checkouts(Duration::hours(48), NOW)
            .await
            .unwrap();
        assert_eq!(summary.expired, 1);

        let old = store.get_change(old.change_id).await.unwrap().unwrap();
        assert_eq!(old.status, ChangeStatus::Expired);
        let fresh = store.get_change(fresh.change_id).await.unwrap().unwrap();
        assert_eq!(fresh.status, ChangeStatus::CheckoutStarted);
    }

    #[tokio::test]
    async fn test_expiry_with_unrepresentable_max_age_is_rejected() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = ScriptedProvider::new();

        let err = service(&store, &provider)
            .expire_abandoned_checkouts(Duration::MAX, NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }
}
