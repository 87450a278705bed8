//! Fakes shared by the unit tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tally_shared::TenantId;
use time::macros::datetime;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::agreements::{AgreementLink, AgreementStatus};
use crate::error::{BillingError, BillingResult};
use crate::notify::BillingNotifier;
use crate::plans::BillingPlan;
use crate::provider::{CorrelationId, CreatedAgreement, PaymentProvider, ProviderError};
use crate::store::{AgreementStore, InMemoryBillingStore, PlanCatalog, SubscriptionStore};
use crate::subscription::{Subscription, SubscriptionStatus};

pub const NOW: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

/// Provider whose answers are scripted per agreement id
#[derive(Default)]
pub struct ScriptedProvider {
    statuses: Mutex<HashMap<String, AgreementStatus>>,
    failing_cancels: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
    fail_create: Mutex<bool>,
    cancel_calls: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, agreement_id: &str, status: AgreementStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(agreement_id.to_string(), status);
    }

    pub fn status_of(&self, agreement_id: &str) -> Option<AgreementStatus> {
        self.statuses.lock().unwrap().get(agreement_id).cloned()
    }

    pub fn fail_cancel(&self, agreement_id: &str) {
        self.failing_cancels
            .lock()
            .unwrap()
            .insert(agreement_id.to_string());
    }

    pub fn heal_cancel(&self, agreement_id: &str) {
        self.failing_cancels.lock().unwrap().remove(agreement_id);
    }

    pub fn fail_status_read(&self, agreement_id: &str) {
        self.failing_reads
            .lock()
            .unwrap()
            .insert(agreement_id.to_string());
    }

    pub fn fail_create(&self, fail: bool) {
        *self.fail_create.lock().unwrap() = fail;
    }

    pub fn cancel_calls(&self) -> Vec<String> {
        self.cancel_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    async fn create_plan(
        &self,
        _plan: &BillingPlan,
        _correlation_id: CorrelationId,
    ) -> Result<String, ProviderError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("plan_ext_{}", n))
    }

    async fn create_agreement(
        &self,
        _plan: &BillingPlan,
        _payer_back_url: &str,
        _external_reference: &str,
        correlation_id: CorrelationId,
    ) -> Result<CreatedAgreement, ProviderError> {
        if *self.fail_create.lock().unwrap() {
            return Err(ProviderError::Timeout { correlation_id });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let agreement_id = format!("agr_new_{}", n);
        self.set_status(&agreement_id, AgreementStatus::Pending);
        Ok(CreatedAgreement {
            checkout_url: format!("https://pay.test/checkout/{}", agreement_id),
            agreement_id,
        })
    }

    async fn cancel_agreement(
        &self,
        agreement_id: &str,
        correlation_id: CorrelationId,
    ) -> Result<(), ProviderError> {
        self.cancel_calls
            .lock()
            .unwrap()
            .push(agreement_id.to_string());
        if self.failing_cancels.lock().unwrap().contains(agreement_id) {
            return Err(ProviderError::Transport {
                correlation_id,
                message: "connection reset".into(),
            });
        }
        self.set_status(agreement_id, AgreementStatus::Canceled);
        Ok(())
    }

    async fn get_agreement_status(
        &self,
        agreement_id: &str,
        correlation_id: CorrelationId,
    ) -> Result<AgreementStatus, ProviderError> {
        if self.failing_reads.lock().unwrap().contains(agreement_id) {
            return Err(ProviderError::Timeout { correlation_id });
        }
        self.status_of(agreement_id)
            .ok_or_else(|| ProviderError::Status {
                correlation_id,
                code: 404,
                body: "not found".into(),
            })
    }
}

/// Notifier that records every call
#[derive(Default)]
pub struct RecordingNotifier {
    pub applied: Mutex<Vec<(Uuid, String)>>,
    pub inconsistencies: Mutex<Vec<(TenantId, usize)>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn inconsistency_count(&self) -> usize {
        self.inconsistencies.lock().unwrap().len()
    }

    fn result(&self) -> BillingResult<()> {
        if self.fail {
            Err(BillingError::InvalidInput("smtp relay down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BillingNotifier for RecordingNotifier {
    async fn notify_change_applied(
        &self,
        subscription: &Subscription,
        plan_name: &str,
    ) -> BillingResult<()> {
        self.applied
            .lock()
            .unwrap()
            .push((subscription.id, plan_name.to_string()));
        self.result()
    }

    async fn notify_reconciliation_inconsistency(
        &self,
        tenant_id: TenantId,
        active_before: usize,
    ) -> BillingResult<()> {
        self.inconsistencies
            .lock()
            .unwrap()
            .push((tenant_id, active_before));
        self.result()
    }
}

/// A tenant with an active subscription
pub async fn seed_tenant(store: &InMemoryBillingStore) -> (TenantId, Subscription) {
    let tenant = TenantId::new();
    let mut sub = Subscription::new_trial(tenant, None, NOW - time::Duration::days(60));
    sub.status = SubscriptionStatus::Active;
    store.insert_subscription(&sub).await.unwrap();
    (tenant, sub)
}

/// A synced monthly plan
pub async fn seed_plan(store: &InMemoryBillingStore, frequency: i32, frequency_type: &str) -> BillingPlan {
    let mut plan = BillingPlan::new("Pro", 4900, "USD", frequency, frequency_type);
    plan.external_plan_id = Some(format!("plan_ext_{}", plan.id));
    store.insert_plan(&plan).await.unwrap();
    plan
}

/// Register an agreement link both locally and at the provider
pub async fn seed_link(
    store: &InMemoryBillingStore,
    provider: &ScriptedProvider,
    tenant: TenantId,
    agreement_id: &str,
    status: AgreementStatus,
    created_at: OffsetDateTime,
) -> AgreementLink {
    let link = AgreementLink::new(tenant, agreement_id, status.clone(), created_at);
    provider.set_status(agreement_id, status);
    store.upsert_agreement_link(&link).await.unwrap()
}
