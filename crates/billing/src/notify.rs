//! Notification sink
//!
//! Notifications are fire-and-forget. Callers log a failed send and carry on;
//! a notification never rolls back the state change that triggered it.

use async_trait::async_trait;
use tally_shared::TenantId;

use crate::error::BillingResult;
use crate::subscription::Subscription;

#[async_trait]
pub trait BillingNotifier: Send + Sync {
    /// A paid pending change has been applied to the subscription
    async fn notify_change_applied(
        &self,
        subscription: &Subscription,
        plan_name: &str,
    ) -> BillingResult<()>;

    /// Reconciliation found duplicate live agreements or stuck cancellations
    async fn notify_reconciliation_inconsistency(
        &self,
        tenant_id: TenantId,
        active_before: usize,
    ) -> BillingResult<()>;
}

/// Emits notifications as structured log events
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl TracingNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BillingNotifier for TracingNotifier {
    async fn notify_change_applied(
        &self,
        subscription: &Subscription,
        plan_name: &str,
    ) -> BillingResult<()> {
        tracing::info!(
            tenant_id = %subscription.tenant_id,
            subscription_id = %subscription.id,
            plan = %plan_name,
            end_at = ?subscription.end_at,
            "Subscription change applied"
        );
        Ok(())
    }

    async fn notify_reconciliation_inconsistency(
        &self,
        tenant_id: TenantId,
        active_before: usize,
    ) -> BillingResult<()> {
        tracing::warn!(
            tenant_id = %tenant_id,
            active_before = active_before,
            "ALERT: agreement reconciliation found an inconsistency"
        );
        Ok(())
    }
}
