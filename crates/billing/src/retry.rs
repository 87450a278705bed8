//! Cancellation retry worker
//!
//! Re-attempts provider cancellation for links left in `cancel_pending`.
//! No backoff counter is persisted: the schedule interval and batch size
//! bound the retry rate.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::provider::{CorrelationId, PaymentProvider};
use crate::store::BillingStore;

/// Counts for one retry run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub attempted: usize,
    pub canceled: usize,
    pub failed: usize,
}

pub struct CancellationRetryWorker {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
}

impl CancellationRetryWorker {
    pub fn new(store: Arc<dyn BillingStore>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { store, provider }
    }

    /// Retry up to `limit` pending cancellations, oldest attempt first.
    ///
    /// Confirmed cancellations are committed together at the end of the run.
    pub async fn retry_pending_cancellations(
        &self,
        limit: usize,
        now: OffsetDateTime,
    ) -> BillingResult<RetrySummary> {
        let pending = self.store.list_cancel_pending(limit).await?;
        let mut summary = RetrySummary {
            attempted: pending.len(),
            ..RetrySummary::default()
        };
        let mut confirmed = Vec::with_capacity(pending.len());

        for link in &pending {
            let agreement_id = &link.external_agreement_id;

            if let Err(e) = self.store.touch_cancel_attempt(agreement_id, now).await {
                summary.failed += 1;
                tracing::error!(
                    agreement_id = %agreement_id,
                    error = %e,
                    "Failed to record cancellation attempt, skipping"
                );
                continue;
            }

            let correlation_id = CorrelationId::new();
            match self.provider.cancel_agreement(agreement_id, correlation_id).await {
                Ok(()) => confirmed.push(agreement_id.clone()),
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        tenant_id = %link.tenant_id,
                        agreement_id = %agreement_id,
                        correlation_id = %correlation_id,
                        error = %e,
                        "Agreement cancellation retry failed"
                    );
                }
            }
        }

        summary.canceled = self.store.mark_agreements_canceled(&confirmed, now).await?;

        tracing::info!(
            attempted = summary.attempted,
            canceled = summary.canceled,
            failed = summary.failed,
            "Cancellation retry run complete"
        );
        Ok(summary)
    }
}
