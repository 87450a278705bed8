//! Persistence seams
//!
//! One trait per record kind, combined into [`BillingStore`]. Operations that
//! must hold an invariant across rows (single primary agreement, applying a
//! change together with its subscription update, committing a retry batch)
//! are single store calls so each implementation can make them atomic.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use tally_shared::TenantId;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::access::AccessMode;
use crate::agreements::{AgreementLink, AgreementStatus};
use crate::error::BillingResult;
use crate::pending::{ChangeStatus, PendingSubscriptionChange};
use crate::plans::BillingPlan;
use crate::subscription::Subscription;
use crate::webhooks::WebhookEvent;

/// Everything written when a paid change is applied
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeApplication {
    pub change_id: Uuid,
    pub start_at: OffsetDateTime,
    pub end_at: OffsetDateTime,
    pub applied_at: OffsetDateTime,
    /// Copied onto the subscription when present
    pub external_plan_id: Option<String>,
    /// Copied onto the subscription when present
    pub external_agreement_id: Option<String>,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(&self, tenant_id: TenantId) -> BillingResult<Option<Subscription>>;

    async fn get_subscription_by_id(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    /// Set (`Some`) or clear (`None`) the admin override. Returns false if the tenant has no subscription.
    async fn set_access_override(
        &self,
        tenant_id: TenantId,
        access_override: Option<(AccessMode, OffsetDateTime)>,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Mirror the reconciled primary agreement onto the subscription
    async fn record_agreement_sync(
        &self,
        tenant_id: TenantId,
        external_agreement_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Tenants whose subscription is not canceled
    async fn list_reconcilable_tenants(&self) -> BillingResult<Vec<TenantId>>;
}

#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<BillingPlan>>;

    async fn insert_plan(&self, plan: &BillingPlan) -> BillingResult<()>;

    async fn set_external_plan_id(&self, id: Uuid, external_plan_id: &str) -> BillingResult<()>;
}

#[async_trait]
pub trait PendingChangeStore: Send + Sync {
    async fn insert_change(&self, change: &PendingSubscriptionChange) -> BillingResult<()>;

    async fn get_change(&self, id: Uuid) -> BillingResult<Option<PendingSubscriptionChange>>;

    async fn find_change_by_reference(
        &self,
        external_reference: &str,
    ) -> BillingResult<Option<PendingSubscriptionChange>>;

    /// Most recent change that started checkout on this agreement
    async fn find_change_by_agreement(
        &self,
        external_agreement_id: &str,
    ) -> BillingResult<Option<PendingSubscriptionChange>>;

    /// PAID changes with no effective instant or one at or before `now`, oldest first
    async fn list_due_changes(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PendingSubscriptionChange>>;

    /// CREATED / CHECKOUT_STARTED changes created before `created_before`
    async fn list_abandoned_checkouts(
        &self,
        created_before: OffsetDateTime,
    ) -> BillingResult<Vec<PendingSubscriptionChange>>;

    /// Move a change to `to` if its current status allows it. Returns whether it moved.
    async fn transition_change(
        &self,
        id: Uuid,
        to: ChangeStatus,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// CREATED -> CHECKOUT_STARTED with the provider's checkout details
    async fn record_checkout(
        &self,
        id: Uuid,
        external_agreement_id: &str,
        checkout_url: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Atomically mark the change APPLIED and update its subscription.
    ///
    /// Returns `None` without writing anything if the change is no longer PAID.
    async fn commit_applied_change(
        &self,
        application: &ChangeApplication,
    ) -> BillingResult<Option<Subscription>>;
}

#[async_trait]
pub trait AgreementStore: Send + Sync {
    async fn list_agreement_links(&self, tenant_id: TenantId) -> BillingResult<Vec<AgreementLink>>;

    async fn get_agreement_link(
        &self,
        external_agreement_id: &str,
    ) -> BillingResult<Option<AgreementLink>>;

    /// Insert, or update the status of the existing row with the same external id
    async fn upsert_agreement_link(&self, link: &AgreementLink) -> BillingResult<AgreementLink>;

    async fn update_agreement_status(
        &self,
        external_agreement_id: &str,
        status: &AgreementStatus,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// `cancel_pending`, not primary, `last_attempt_at = now`
    async fn mark_cancel_pending(
        &self,
        external_agreement_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Clear the primary flag on every link of the tenant and set it on one, atomically
    async fn set_primary_agreement(
        &self,
        tenant_id: TenantId,
        external_agreement_id: &str,
    ) -> BillingResult<()>;

    async fn clear_primary_agreement(&self, tenant_id: TenantId) -> BillingResult<()>;

    /// Up to `limit` `cancel_pending` links, never-attempted and oldest attempts first
    async fn list_cancel_pending(&self, limit: usize) -> BillingResult<Vec<AgreementLink>>;

    async fn touch_cancel_attempt(
        &self,
        external_agreement_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Mark confirmed cancellations in one commit. Returns the number of rows changed.
    async fn mark_agreements_canceled(
        &self,
        external_agreement_ids: &[String],
        now: OffsetDateTime,
    ) -> BillingResult<usize>;
}

#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// A processed event with the same event id, or, for `resource_id`, a
    /// processed event that itself had no event id and the same resource id
    async fn find_processed_webhook(
        &self,
        event_id: Option<&str>,
        resource_id: Option<&str>,
    ) -> BillingResult<Option<WebhookEvent>>;

    async fn insert_webhook(&self, event: &WebhookEvent) -> BillingResult<()>;

    async fn mark_webhook_processed(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<()>;
}

/// Full persistence surface used by the billing services
pub trait BillingStore:
    SubscriptionStore + PlanCatalog + PendingChangeStore + AgreementStore + WebhookStore
{
}

impl<T> BillingStore for T where
    T: SubscriptionStore + PlanCatalog + PendingChangeStore + AgreementStore + WebhookStore
{
}
