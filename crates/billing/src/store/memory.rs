//! In-memory store
//!
//! Suitable for tests and local development. A single lock guards all
//! records, so every trait call is atomic with respect to every other.

use std::collections::HashMap;

use async_trait::async_trait;
use tally_shared::TenantId;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AgreementStore, ChangeApplication, PendingChangeStore, PlanCatalog, SubscriptionStore,
    WebhookStore,
};
use crate::access::AccessMode;
use crate::agreements::{AgreementLink, AgreementStatus};
use crate::error::{BillingError, BillingResult};
use crate::pending::{ChangeStatus, PendingSubscriptionChange};
use crate::plans::BillingPlan;
use crate::subscription::{Subscription, SubscriptionStatus};
use crate::webhooks::WebhookEvent;

#[derive(Default)]
struct State {
    subscriptions: HashMap<TenantId, Subscription>,
    plans: HashMap<Uuid, BillingPlan>,
    changes: HashMap<Uuid, PendingSubscriptionChange>,
    /// Keyed by external agreement id
    links: HashMap<String, AgreementLink>,
    webhooks: Vec<WebhookEvent>,
}

impl State {
    fn subscription_by_id_mut(&mut self, id: Uuid) -> Option<&mut Subscription> {
        self.subscriptions.values_mut().find(|s| s.id == id)
    }
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded webhook event, in arrival order
    pub async fn webhook_events(&self) -> Vec<WebhookEvent> {
        self.state.lock().await.webhooks.clone()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryBillingStore {
    async fn get_subscription(&self, tenant_id: TenantId) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&tenant_id).cloned())
    }

    async fn get_subscription_by_id(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if state.subscriptions.contains_key(&subscription.tenant_id) {
            return Err(BillingError::InvalidInput(format!(
                "tenant {} already has a subscription",
                subscription.tenant_id
            )));
        }
        state
            .subscriptions
            .insert(subscription.tenant_id, subscription.clone());
        Ok(())
    }

    async fn set_access_override(
        &self,
        tenant_id: TenantId,
        access_override: Option<(AccessMode, OffsetDateTime)>,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let Some(sub) = state.subscriptions.get_mut(&tenant_id) else {
            return Ok(false);
        };
        sub.override_mode = access_override.map(|(mode, _)| mode);
        sub.override_until = access_override.map(|(_, until)| until);
        sub.updated_at = now;
        Ok(true)
    }

    async fn record_agreement_sync(
        &self,
        tenant_id: TenantId,
        external_agreement_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(sub) = state.subscriptions.get_mut(&tenant_id) {
            if let Some(id) = external_agreement_id {
                sub.external_agreement_id = Some(id.to_string());
            }
            sub.last_synced_at = Some(now);
            sub.updated_at = now;
        }
        Ok(())
    }

    async fn list_reconcilable_tenants(&self) -> BillingResult<Vec<TenantId>> {
        let state = self.state.lock().await;
        let mut tenants: Vec<TenantId> = state
            .subscriptions
            .values()
            .filter(|s| s.status != SubscriptionStatus::Canceled)
            .map(|s| s.tenant_id)
            .collect();
        tenants.sort();
        Ok(tenants)
    }
}

#[async_trait]
impl PlanCatalog for InMemoryBillingStore {
    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<BillingPlan>> {
        Ok(self.state.lock().await.plans.get(&id).cloned())
    }

    async fn insert_plan(&self, plan: &BillingPlan) -> BillingResult<()> {
        self.state.lock().await.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn set_external_plan_id(&self, id: Uuid, external_plan_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let plan = state
            .plans
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("billing plan {}", id)))?;
        plan.external_plan_id = Some(external_plan_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl PendingChangeStore for InMemoryBillingStore {
    async fn insert_change(&self, change: &PendingSubscriptionChange) -> BillingResult<()> {
        self.state.lock().await.changes.insert(change.id, change.clone());
        Ok(())
    }

    async fn get_change(&self, id: Uuid) -> BillingResult<Option<PendingSubscriptionChange>> {
        Ok(self.state.lock().await.changes.get(&id).cloned())
    }

    async fn find_change_by_reference(
        &self,
        external_reference: &str,
    ) -> BillingResult<Option<PendingSubscriptionChange>> {
        Ok(self
            .state
            .lock()
            .await
            .changes
            .values()
            .find(|c| c.external_reference.as_deref() == Some(external_reference))
            .cloned())
    }

    async fn find_change_by_agreement(
        &self,
        external_agreement_id: &str,
    ) -> BillingResult<Option<PendingSubscriptionChange>> {
        Ok(self
            .state
            .lock()
            .await
            .changes
            .values()
            .filter(|c| c.external_agreement_id.as_deref() == Some(external_agreement_id))
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn list_due_changes(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PendingSubscriptionChange>> {
        let state = self.state.lock().await;
        let mut due: Vec<PendingSubscriptionChange> = state
            .changes
            .values()
            .filter(|c| c.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|c| (c.effective_at.unwrap_or(c.created_at), c.created_at));
        Ok(due)
    }

    async fn list_abandoned_checkouts(
        &self,
        created_before: OffsetDateTime,
    ) -> BillingResult<Vec<PendingSubscriptionChange>> {
        let state = self.state.lock().await;
        let mut stale: Vec<PendingSubscriptionChange> = state
            .changes
            .values()
            .filter(|c| {
                matches!(c.status, ChangeStatus::Created | ChangeStatus::CheckoutStarted)
                    && c.created_at < created_before
            })
            .cloned()
            .collect();
        stale.sort_by_key(|c| c.created_at);
        Ok(stale)
    }

    async fn transition_change(
        &self,
        id: Uuid,
        to: ChangeStatus,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let Some(change) = state.changes.get_mut(&id) else {
            return Ok(false);
        };
        if !change.status.can_transition_to(to) {
            return Ok(false);
        }
        change.transition(to, now)?;
        Ok(true)
    }

    async fn record_checkout(
        &self,
        id: Uuid,
        external_agreement_id: &str,
        checkout_url: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let Some(change) = state.changes.get_mut(&id) else {
            return Ok(false);
        };
        if change.status != ChangeStatus::Created {
            return Ok(false);
        }
        change.transition(ChangeStatus::CheckoutStarted, now)?;
        change.external_agreement_id = Some(external_agreement_id.to_string());
        change.checkout_url = Some(checkout_url.to_string());
        Ok(true)
    }

    async fn commit_applied_change(
        &self,
        application: &ChangeApplication,
    ) -> BillingResult<Option<Subscription>> {
        let mut state = self.state.lock().await;

        let subscription_id = match state.changes.get(&application.change_id) {
            Some(change) if change.status == ChangeStatus::Paid => change.subscription_id,
            _ => return Ok(None),
        };

        // Check the subscription before touching the change so nothing is half-written
        if state.subscription_by_id_mut(subscription_id).is_none() {
            return Err(BillingError::InvariantViolation(format!(
                "pending change {} references missing subscription {}",
                application.change_id, subscription_id
            )));
        }

        if let Some(change) = state.changes.get_mut(&application.change_id) {
            change.transition(ChangeStatus::Applied, application.applied_at)?;
        }

        let Some(sub) = state.subscription_by_id_mut(subscription_id) else {
            return Ok(None);
        };
        sub.status = SubscriptionStatus::Active;
        sub.start_at = application.start_at;
        sub.end_at = Some(application.end_at);
        sub.next_payment_at = Some(application.end_at);
        if let Some(plan_id) = &application.external_plan_id {
            sub.external_plan_id = Some(plan_id.clone());
        }
        if let Some(agreement_id) = &application.external_agreement_id {
            sub.external_agreement_id = Some(agreement_id.clone());
        }
        sub.updated_at = application.applied_at;
        Ok(Some(sub.clone()))
    }
}

#[async_trait]
impl AgreementStore for InMemoryBillingStore {
    async fn list_agreement_links(&self, tenant_id: TenantId) -> BillingResult<Vec<AgreementLink>> {
        let state = self.state.lock().await;
        let mut links: Vec<AgreementLink> = state
            .links
            .values()
            .filter(|l| l.tenant_id == tenant_id)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.created_at);
        Ok(links)
    }

    async fn get_agreement_link(
        &self,
        external_agreement_id: &str,
    ) -> BillingResult<Option<AgreementLink>> {
        Ok(self
            .state
            .lock()
            .await
            .links
            .get(external_agreement_id)
            .cloned())
    }

    async fn upsert_agreement_link(&self, link: &AgreementLink) -> BillingResult<AgreementLink> {
        let mut state = self.state.lock().await;
        let stored = state
            .links
            .entry(link.external_agreement_id.clone())
            .and_modify(|existing| {
                existing.status = link.status.clone();
                existing.updated_at = link.updated_at;
            })
            .or_insert_with(|| AgreementLink {
                is_primary: false,
                ..link.clone()
            });
        Ok(stored.clone())
    }

    async fn update_agreement_status(
        &self,
        external_agreement_id: &str,
        status: &AgreementStatus,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let Some(link) = state.links.get_mut(external_agreement_id) else {
            return Ok(false);
        };
        link.status = status.clone();
        if status.is_terminal() {
            link.is_primary = false;
        }
        link.updated_at = now;
        Ok(true)
    }

    async fn mark_cancel_pending(
        &self,
        external_agreement_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(link) = state.links.get_mut(external_agreement_id) {
            link.status = AgreementStatus::CancelPending;
            link.is_primary = false;
            link.last_attempt_at = Some(now);
            link.updated_at = now;
        }
        Ok(())
    }

    async fn set_primary_agreement(
        &self,
        tenant_id: TenantId,
        external_agreement_id: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        match state.links.get(external_agreement_id) {
            Some(link) if link.tenant_id == tenant_id => {}
            _ => {
                return Err(BillingError::NotFound(format!(
                    "agreement {} for tenant {}",
                    external_agreement_id, tenant_id
                )))
            }
        }
        for link in state.links.values_mut().filter(|l| l.tenant_id == tenant_id) {
            link.is_primary = link.external_agreement_id == external_agreement_id;
        }
        Ok(())
    }

    async fn clear_primary_agreement(&self, tenant_id: TenantId) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        for link in state.links.values_mut().filter(|l| l.tenant_id == tenant_id) {
            link.is_primary = false;
        }
        Ok(())
    }

    async fn list_cancel_pending(&self, limit: usize) -> BillingResult<Vec<AgreementLink>> {
        let state = self.state.lock().await;
        let mut pending: Vec<AgreementLink> = state
            .links
            .values()
            .filter(|l| l.status == AgreementStatus::CancelPending)
            .cloned()
            .collect();
        // None sorts before Some: never-attempted first
        pending.sort_by_key(|l| (l.last_attempt_at, l.created_at));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn touch_cancel_attempt(
        &self,
        external_agreement_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(link) = state.links.get_mut(external_agreement_id) {
            link.last_attempt_at = Some(now);
        }
        Ok(())
    }

    async fn mark_agreements_canceled(
        &self,
        external_agreement_ids: &[String],
        now: OffsetDateTime,
    ) -> BillingResult<usize> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for id in external_agreement_ids {
            if let Some(link) = state.links.get_mut(id) {
                link.status = AgreementStatus::Canceled;
                link.is_primary = false;
                link.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl WebhookStore for InMemoryBillingStore {
    async fn find_processed_webhook(
        &self,
        event_id: Option<&str>,
        resource_id: Option<&str>,
    ) -> BillingResult<Option<WebhookEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .webhooks
            .iter()
            .filter(|w| w.processed_at.is_some())
            .find(|w| {
                (event_id.is_some() && w.event_id.as_deref() == event_id)
                    || (resource_id.is_some()
                        && w.event_id.is_none()
                        && w.resource_id.as_deref() == resource_id)
            })
            .cloned())
    }

    async fn insert_webhook(&self, event: &WebhookEvent) -> BillingResult<()> {
        self.state.lock().await.webhooks.push(event.clone());
        Ok(())
    }

    async fn mark_webhook_processed(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(event) = state
            .webhooks
            .iter_mut()
            .find(|w| w.id == id && w.processed_at.is_none())
        {
            event.processed_at = Some(now);
        }
        Ok(())
    }
}
