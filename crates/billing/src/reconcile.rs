//! Agreement reconciliation
//!
//! Aligns a tenant's agreement registry with the provider: refresh every
//! non-terminal link, elect one live agreement as primary and request
//! cancellation of any other live duplicates. Provider failures are logged
//! per link and never abort the tenant's run; the cancellation retry worker
//! picks up whatever is left in `cancel_pending`.

use std::sync::Arc;

use serde::Serialize;
use tally_shared::TenantId;
use time::{Duration, OffsetDateTime};

use crate::agreements::{AgreementLink, AgreementStatus};
use crate::config::ElectionPolicy;
use crate::error::{BillingError, BillingResult};
use crate::notify::BillingNotifier;
use crate::provider::{CorrelationId, PaymentProvider};
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// `cancel_pending` links older than this are reported as stale
    pub stale_cancel_threshold: Duration,
    pub election: ElectionPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stale_cancel_threshold: Duration::minutes(60),
            election: ElectionPolicy::MostRecent,
        }
    }
}

/// Outcome of reconciling one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub tenant_id: TenantId,
    pub active_before: usize,
    pub active_after: usize,
    pub kept_agreement_id: Option<String>,
    /// Duplicates demoted to `cancel_pending` in this run
    pub canceled_agreement_ids: Vec<String>,
    pub stale_pending_canceled: usize,
    /// Duplicates whose cancel call failed (left for the retry worker)
    pub cancel_failures: usize,
    /// Links whose status could not be refreshed (local mirror used)
    pub refresh_failures: usize,
}

impl ReconciliationResult {
    fn empty(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            active_before: 0,
            active_after: 0,
            kept_agreement_id: None,
            canceled_agreement_ids: Vec::new(),
            stale_pending_canceled: 0,
            cancel_failures: 0,
            refresh_failures: 0,
        }
    }

    pub fn has_inconsistency(&self) -> bool {
        self.active_before > 1 || self.stale_pending_canceled > 0
    }
}

/// Aggregate counts for a run over every reconcilable tenant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileAllSummary {
    pub tenants: usize,
    pub inconsistent: usize,
    pub duplicates_canceled: usize,
    pub failed: usize,
}

pub struct ReconciliationEngine {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    notifier: Arc<dyn BillingNotifier>,
    config: ReconcileConfig,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn BillingNotifier>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            provider,
            notifier,
            config,
        }
    }

    pub async fn reconcile_tenant(
        &self,
        tenant_id: TenantId,
        now: OffsetDateTime,
    ) -> BillingResult<ReconciliationResult> {
        let mut result = ReconciliationResult::empty(tenant_id);
        let mut links = self.store.list_agreement_links(tenant_id).await?;

        for link in links.iter_mut() {
            if !self.refresh_link(tenant_id, link, now).await? {
                result.refresh_failures += 1;
            }
        }

        let active: Vec<&AgreementLink> = links.iter().filter(|l| l.status.is_active()).collect();
        result.active_before = active.len();

        match active.as_slice() {
            [] => {
                self.store.clear_primary_agreement(tenant_id).await?;
            }
            [only] => {
                self.store
                    .set_primary_agreement(tenant_id, &only.external_agreement_id)
                    .await?;
                result.kept_agreement_id = Some(only.external_agreement_id.clone());
            }
            several => {
                let Some(kept) = elect(several, self.config.election) else {
                    return Err(BillingError::InvariantViolation(format!(
                        "no agreement elected for tenant {}",
                        tenant_id
                    )));
                };
                let kept_id = kept.external_agreement_id.clone();

                tracing::warn!(
                    tenant_id = %tenant_id,
                    active = several.len(),
                    kept_agreement_id = %kept_id,
                    "Tenant has several live agreements, canceling duplicates"
                );

                self.store.set_primary_agreement(tenant_id, &kept_id).await?;

                for duplicate in several.iter().filter(|l| l.external_agreement_id != kept_id) {
                    let agreement_id = &duplicate.external_agreement_id;
                    self.store.mark_cancel_pending(agreement_id, now).await?;
                    result.canceled_agreement_ids.push(agreement_id.clone());

                    let correlation_id = CorrelationId::new();
                    match self.provider.cancel_agreement(agreement_id, correlation_id).await {
                        Ok(()) => {
                            tracing::info!(
                                tenant_id = %tenant_id,
                                agreement_id = %agreement_id,
                                correlation_id = %correlation_id,
                                "Duplicate agreement cancellation requested"
                            );
                        }
                        Err(e) => {
                            result.cancel_failures += 1;
                            tracing::warn!(
                                tenant_id = %tenant_id,
                                agreement_id = %agreement_id,
                                correlation_id = %correlation_id,
                                error = %e,
                                "Failed to cancel duplicate agreement, left cancel_pending for retry"
                            );
                        }
                    }
                }

                result.kept_agreement_id = Some(kept_id);
            }
        }
        result.active_after = usize::from(result.kept_agreement_id.is_some());

        result.stale_pending_canceled = links
            .iter()
            .filter(|l| !result.canceled_agreement_ids.contains(&l.external_agreement_id))
            .filter(|l| l.is_stale_cancel(now, self.config.stale_cancel_threshold))
            .count();

        self.store
            .record_agreement_sync(tenant_id, result.kept_agreement_id.as_deref(), now)
            .await?;

        if result.has_inconsistency() {
            if let Err(e) = self
                .notifier
                .notify_reconciliation_inconsistency(tenant_id, result.active_before)
                .await
            {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Failed to send reconciliation alert"
                );
            }
        }

        tracing::info!(
            tenant_id = %tenant_id,
            active_before = result.active_before,
            active_after = result.active_after,
            kept_agreement_id = ?result.kept_agreement_id,
            canceled = result.canceled_agreement_ids.len(),
            stale_pending_canceled = result.stale_pending_canceled,
            cancel_failures = result.cancel_failures,
            refresh_failures = result.refresh_failures,
            "Tenant agreements reconciled"
        );

        Ok(result)
    }

    /// Reconcile every tenant whose subscription is not canceled
    pub async fn reconcile_all(&self, now: OffsetDateTime) -> BillingResult<ReconcileAllSummary> {
        let tenants = self.store.list_reconcilable_tenants().await?;
        let mut summary = ReconcileAllSummary {
            tenants: tenants.len(),
            ..ReconcileAllSummary::default()
        };

        for tenant_id in tenants {
            match self.reconcile_tenant(tenant_id, now).await {
                Ok(result) => {
                    if result.has_inconsistency() {
                        summary.inconsistent += 1;
                    }
                    summary.duplicates_canceled += result.canceled_agreement_ids.len();
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        tenant_id = %tenant_id,
                        error = %e,
                        "Reconciliation failed for tenant"
                    );
                }
            }
        }

        tracing::info!(
            tenants = summary.tenants,
            inconsistent = summary.inconsistent,
            duplicates_canceled = summary.duplicates_canceled,
            failed = summary.failed,
            "Reconciliation run complete"
        );
        Ok(summary)
    }

    /// Mirror the provider's status onto `link`. Returns false if the provider could not be read.
    async fn refresh_link(
        &self,
        tenant_id: TenantId,
        link: &mut AgreementLink,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        if link.status.is_terminal() {
            return Ok(true);
        }

        let correlation_id = CorrelationId::new();
        let remote = match self
            .provider
            .get_agreement_status(&link.external_agreement_id, correlation_id)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    agreement_id = %link.external_agreement_id,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to refresh agreement status, using local mirror"
                );
                return Ok(false);
            }
        };

        // A requested cancellation stays pending until the provider confirms it
        let next = if link.status == AgreementStatus::CancelPending && !remote.is_terminal() {
            AgreementStatus::CancelPending
        } else {
            remote
        };

        if next != link.status {
            tracing::info!(
                tenant_id = %tenant_id,
                agreement_id = %link.external_agreement_id,
                from = %link.status,
                to = %next,
                "Agreement status changed at provider"
            );
            self.store
                .update_agreement_status(&link.external_agreement_id, &next, now)
                .await?;
            if next.is_terminal() {
                link.is_primary = false;
            }
            link.status = next;
        }
        Ok(true)
    }
}

/// The link to keep among `active`; `None` only for an empty slice
fn elect<'a>(active: &[&'a AgreementLink], policy: ElectionPolicy) -> Option<&'a AgreementLink> {
    let most_recent = || {
        active
            .iter()
            .copied()
            .max_by(|a, b| {
                (a.created_at, &a.external_agreement_id)
                    .cmp(&(b.created_at, &b.external_agreement_id))
            })
    };

    match policy {
        ElectionPolicy::MostRecent => most_recent(),
        ElectionPolicy::KeepPrimary => active
            .iter()
            .copied()
            .find(|l| l.is_primary)
            .or_else(most_recent),
    }
}
