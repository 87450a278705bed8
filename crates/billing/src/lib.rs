// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::Provider carries the full provider error body
#![allow(clippy::too_many_arguments)] // Checkout and store operations take many scalars
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tally Billing Module
//!
//! Subscription lifecycle and payment-provider consistency for tenants.
//!
//! ## Features
//!
//! - **Access Resolution**: Derive the effective access mode from a tenant's subscription
//! - **Plan Changes**: Record, pay for, and apply upgrades, downgrades and renewals
//! - **Reconciliation**: Converge each tenant on exactly one live recurring agreement
//! - **Cancellation Retries**: Keep retrying provider cancellations that failed
//! - **Webhooks**: Deduplicated intake of provider notifications
//! - **Invariants**: Read-only SQL checks over the billing tables

pub mod access;
pub mod agreements;
pub mod applier;
pub mod checkout;
pub mod config;
pub mod error;
pub mod invariants;
pub mod notify;
pub mod pending;
pub mod plans;
pub mod provider;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod subscription;
pub mod webhooks;

#[cfg(test)]
mod test_support;


use std::sync::Arc;

use sqlx::PgPool;

// Access
pub use access::{resolve_access, AccessDecision, AccessMode, AccessReason, AccessResolver};

// Agreements
pub use agreements::{AgreementLink, AgreementStatus};

// Applier
pub use applier::{ApplyOutcome, ApplySummary, PendingChangeApplier};

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService, ExpireSummary};

// Config
pub use config::{BillingConfig, ElectionPolicy};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notify::{BillingNotifier, TracingNotifier};

// Pending changes
pub use pending::{ChangeStatus, ChangeType, PendingSubscriptionChange};

// Plans
pub use plans::{BillingInterval, BillingPlan, IntervalUnit};

// Provider
pub use provider::{
    CorrelationId, CreatedAgreement, HttpProviderClient, PaymentProvider, ProviderClientConfig,
    ProviderError,
};

// Reconciliation
pub use reconcile::{
    ReconcileAllSummary, ReconcileConfig, ReconciliationEngine, ReconciliationResult,
};

// Retry
pub use retry::{CancellationRetryWorker, RetrySummary};

// Store
pub use store::{BillingStore, ChangeApplication, InMemoryBillingStore, PgBillingStore};

// Subscriptions
pub use subscription::{Subscription, SubscriptionService, SubscriptionStatus};

// Webhooks
pub use webhooks::{WebhookEvent, WebhookHandler, WebhookKind, WebhookNotification, WebhookOutcome};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub access: AccessResolver,
    pub applier: PendingChangeApplier,
    pub checkout: CheckoutService,
    pub reconciliation: ReconciliationEngine,
    pub retry: CancellationRetryWorker,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub config: BillingConfig,
}

impl BillingService {
    /// Create a new billing service backed by Postgres and the HTTP provider,
    /// configured from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let provider = HttpProviderClient::new(config.provider_client_config())?;

        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(provider),
            Arc::new(TracingNotifier::new()),
            &config,
        ))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn BillingNotifier>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            access: AccessResolver::new(store.clone()),
            applier: PendingChangeApplier::new(store.clone(), notifier.clone()),
            checkout: CheckoutService::new(
                store.clone(),
                provider.clone(),
                config.provider_back_url.clone(),
            ),
            reconciliation: ReconciliationEngine::new(
                store.clone(),
                provider.clone(),
                notifier,
                config.reconcile_config(),
            ),
            retry: CancellationRetryWorker::new(store.clone(), provider),
            subscriptions: SubscriptionService::new(store.clone()),
            webhooks: WebhookHandler::new(store),
            config: config.clone(),
        }
    }
}
