//! Pending change applier
//!
//! Promotes PAID changes whose effective instant has arrived into the
//! subscription. Each change is committed atomically with its subscription
//! update, and a change that is no longer PAID is skipped, so re-running a
//! batch (or two workers racing) never applies anything twice.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::notify::BillingNotifier;
use crate::pending::PendingSubscriptionChange;
use crate::store::{BillingStore, ChangeApplication};
use crate::subscription::Subscription;

/// Counts for one applier run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub due: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// What happened to a single change
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(Box<Subscription>),
    /// Already terminal, not yet due, or claimed by a concurrent run
    Skipped,
}

pub struct PendingChangeApplier {
    store: Arc<dyn BillingStore>,
    notifier: Arc<dyn BillingNotifier>,
}

impl PendingChangeApplier {
    pub fn new(store: Arc<dyn BillingStore>, notifier: Arc<dyn BillingNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Apply every PAID change due at `now`. A failing change is logged and left PAID.
    pub async fn apply_due(&self, now: OffsetDateTime) -> BillingResult<ApplySummary> {
        let due = self.store.list_due_changes(now).await?;
        let mut summary = ApplySummary {
            due: due.len(),
            ..ApplySummary::default()
        };

        for change in &due {
            match self.apply_one(change, now).await {
                Ok(ApplyOutcome::Applied(_)) => summary.applied += 1,
                Ok(ApplyOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        change_id = %change.id,
                        subscription_id = %change.subscription_id,
                        error = %e,
                        "Failed to apply pending change, will retry next run"
                    );
                }
            }
        }

        tracing::info!(
            due = summary.due,
            applied = summary.applied,
            skipped = summary.skipped,
            failed = summary.failed,
            "Pending change applier run complete"
        );
        Ok(summary)
    }

    pub async fn apply_one(
        &self,
        change: &PendingSubscriptionChange,
        now: OffsetDateTime,
    ) -> BillingResult<ApplyOutcome> {
        // Work from the stored row, not the batch snapshot
        let current = self
            .store
            .get_change(change.id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("pending change {}", change.id)))?;

        if current.status.is_terminal() || !current.is_due(now) {
            tracing::debug!(
                change_id = %current.id,
                status = %current.status,
                "Pending change not applicable, skipping"
            );
            return Ok(ApplyOutcome::Skipped);
        }

        let plan = self
            .store
            .get_plan(current.target_plan_id)
            .await?
            .ok_or_else(|| {
                BillingError::InvariantViolation(format!(
                    "pending change {} targets missing plan {}",
                    current.id, current.target_plan_id
                ))
            })?;

        let effective_date = current.effective_date(now);
        let end_at = plan.interval().add_to(effective_date)?;

        let application = ChangeApplication {
            change_id: current.id,
            start_at: effective_date,
            end_at,
            applied_at: now,
            external_plan_id: plan.external_plan_id.clone(),
            external_agreement_id: current.external_agreement_id.clone(),
        };

        let Some(subscription) = self.store.commit_applied_change(&application).await? else {
            tracing::info!(
                change_id = %current.id,
                "Pending change claimed by a concurrent run, skipping"
            );
            return Ok(ApplyOutcome::Skipped);
        };

        tracing::info!(
            change_id = %current.id,
            tenant_id = %subscription.tenant_id,
            change_type = %current.change_type,
            plan = %plan.name,
            start_at = %effective_date,
            end_at = %end_at,
            "Pending change applied"
        );

        // Best-effort; the change is already committed
        if let Err(e) = self
            .notifier
            .notify_change_applied(&subscription, &plan.name)
            .await
        {
            tracing::warn!(
                change_id = %current.id,
                tenant_id = %subscription.tenant_id,
                error = %e,
                "Failed to send change-applied notification"
            );
        }

        Ok(ApplyOutcome::Applied(Box::new(subscription)))
    }
}
