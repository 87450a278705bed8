//! Postgres store
//!
//! State transitions are conditional `UPDATE ... WHERE status = ...` statements
//! so that two workers racing on the same row cannot both win. Multi-row
//! invariants run inside one transaction.

use async_trait::async_trait;
use sqlx::PgPool;
use tally_shared::TenantId;
use time::OffsetDateTime;
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
use crate::subscription::Subscription;
use crate::webhooks::WebhookEvent;

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, status, start_at, end_at, trial_ends_at, \
     next_payment_at, external_agreement_id, external_plan_id, payer_email, last_synced_at, \
     override_mode, override_until, created_at, updated_at";

const PLAN_COLUMNS: &str =
    "id, name, price_cents, currency, frequency, frequency_type, is_active, external_plan_id";

const CHANGE_COLUMNS: &str = "id, subscription_id, change_type, status, target_plan_id, \
     effective_at, external_agreement_id, external_reference, checkout_url, created_at, \
     updated_at, paid_at, applied_at";

const LINK_COLUMNS: &str = "id, tenant_id, external_agreement_id, status, is_primary, \
     last_attempt_at, created_at, updated_at";

const WEBHOOK_COLUMNS: &str = "id, event_id, resource_id, payload, received_at, processed_at";

/// Row type for subscriptions
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    status: String,
    start_at: OffsetDateTime,
    end_at: Option<OffsetDateTime>,
    trial_ends_at: Option<OffsetDateTime>,
    next_payment_at: Option<OffsetDateTime>,
    external_agreement_id: Option<String>,
    external_plan_id: Option<String>,
    payer_email: Option<String>,
    last_synced_at: Option<OffsetDateTime>,
    override_mode: Option<String>,
    override_until: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let override_mode = row
            .override_mode
            .as_deref()
            .map(str::parse::<AccessMode>)
            .transpose()
            .map_err(|e| BillingError::InvariantViolation(e.to_string()))?;

        Ok(Subscription {
            id: row.id,
            tenant_id: TenantId(row.tenant_id),
            status: row.status.parse()?,
            start_at: row.start_at,
            end_at: row.end_at,
            trial_ends_at: row.trial_ends_at,
            next_payment_at: row.next_payment_at,
            external_agreement_id: row.external_agreement_id,
            external_plan_id: row.external_plan_id,
            payer_email: row.payer_email,
            last_synced_at: row.last_synced_at,
            override_mode,
            override_until: row.override_until,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row type for billing plans
#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    price_cents: i64,
    currency: String,
    frequency: i32,
    frequency_type: String,
    is_active: bool,
    external_plan_id: Option<String>,
}

impl From<PlanRow> for BillingPlan {
    fn from(row: PlanRow) -> Self {
        BillingPlan {
            id: row.id,
            name: row.name,
            price_cents: row.price_cents,
            currency: row.currency,
            frequency: row.frequency,
            frequency_type: row.frequency_type,
            is_active: row.is_active,
            external_plan_id: row.external_plan_id,
        }
    }
}

/// Row type for pending subscription changes
#[derive(Debug, sqlx::FromRow)]
struct ChangeRow {
    id: Uuid,
    subscription_id: Uuid,
    change_type: String,
    status: String,
    target_plan_id: Uuid,
    effective_at: Option<OffsetDateTime>,
    external_agreement_id: Option<String>,
    external_reference: Option<String>,
    checkout_url: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    paid_at: Option<OffsetDateTime>,
    applied_at: Option<OffsetDateTime>,
}

impl TryFrom<ChangeRow> for PendingSubscriptionChange {
    type Error = BillingError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(PendingSubscriptionChange {
            id: row.id,
            subscription_id: row.subscription_id,
            change_type: row.change_type.parse()?,
            status: row.status.parse()?,
            target_plan_id: row.target_plan_id,
            effective_at: row.effective_at,
            external_agreement_id: row.external_agreement_id,
            external_reference: row.external_reference,
            checkout_url: row.checkout_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
            paid_at: row.paid_at,
            applied_at: row.applied_at,
        })
    }
}

/// Row type for agreement links
#[derive(Debug, sqlx::FromRow)]
struct LinkRow {
    id: Uuid,
    tenant_id: Uuid,
    external_agreement_id: String,
    status: String,
    is_primary: bool,
    last_attempt_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<LinkRow> for AgreementLink {
    fn from(row: LinkRow) -> Self {
        AgreementLink {
            id: row.id,
            tenant_id: TenantId(row.tenant_id),
            external_agreement_id: row.external_agreement_id,
            status: AgreementStatus::parse(&row.status),
            is_primary: row.is_primary,
            last_attempt_at: row.last_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Row type for webhook events
#[derive(Debug, sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    event_id: Option<String>,
    resource_id: Option<String>,
    payload: Vec<u8>,
    received_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl From<WebhookRow> for WebhookEvent {
    fn from(row: WebhookRow) -> Self {
        WebhookEvent {
            id: row.id,
            event_id: row.event_id,
            resource_id: row.resource_id,
            payload: row.payload,
            received_at: row.received_at,
            processed_at: row.processed_at,
        }
    }
}

fn collect_changes(rows: Vec<ChangeRow>) -> BillingResult<Vec<PendingSubscriptionChange>> {
    rows.into_iter().map(PendingSubscriptionChange::try_from).collect()
}

/// sqlx-backed implementation of every store trait
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn get_subscription(&self, tenant_id: TenantId) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE tenant_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn get_subscription_by_id(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, tenant_id, status, start_at, end_at, trial_ends_at, next_payment_at,
                external_agreement_id, external_plan_id, payer_email, last_synced_at,
                override_mode, override_until, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.tenant_id.as_uuid())
        .bind(subscription.status.as_str())
        .bind(subscription.start_at)
        .bind(subscription.end_at)
        .bind(subscription.trial_ends_at)
        .bind(subscription.next_payment_at)
        .bind(&subscription.external_agreement_id)
        .bind(&subscription.external_plan_id)
        .bind(&subscription.payer_email)
        .bind(subscription.last_synced_at)
        .bind(subscription.override_mode.map(|m| m.as_str()))
        .bind(subscription.override_until)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_access_override(
        &self,
        tenant_id: TenantId,
        access_override: Option<(AccessMode, OffsetDateTime)>,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET override_mode = $2,
                override_until = $3,
                updated_at = $4
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(access_override.map(|(mode, _)| mode.as_str()))
        .bind(access_override.map(|(_, until)| until))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_agreement_sync(
        &self,
        tenant_id: TenantId,
        external_agreement_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET external_agreement_id = COALESCE($2, external_agreement_id),
                last_synced_at = $3,
                updated_at = $3
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(external_agreement_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_reconcilable_tenants(&self) -> BillingResult<Vec<TenantId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT tenant_id FROM subscriptions WHERE status <> 'canceled' ORDER BY tenant_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| TenantId(id)).collect())
    }
}

#[async_trait]
impl PlanCatalog for PgBillingStore {
    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<BillingPlan>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_plans WHERE id = $1",
            PLAN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BillingPlan::from))
    }

    async fn insert_plan(&self, plan: &BillingPlan) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_plans
                (id, name, price_cents, currency, frequency, frequency_type, is_active, external_plan_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(plan.price_cents)
        .bind(&plan.currency)
        .bind(plan.frequency)
        .bind(&plan.frequency_type)
        .bind(plan.is_active)
        .bind(&plan.external_plan_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_external_plan_id(&self, id: Uuid, external_plan_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE billing_plans SET external_plan_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(external_plan_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("billing plan {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl PendingChangeStore for PgBillingStore {
    async fn insert_change(&self, change: &PendingSubscriptionChange) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_subscription_changes (
                id, subscription_id, change_type, status, target_plan_id, effective_at,
                external_agreement_id, external_reference, checkout_url,
                created_at, updated_at, paid_at, applied_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(change.id)
        .bind(change.subscription_id)
        .bind(change.change_type.as_str())
        .bind(change.status.as_str())
        .bind(change.target_plan_id)
        .bind(change.effective_at)
        .bind(&change.external_agreement_id)
        .bind(&change.external_reference)
        .bind(&change.checkout_url)
        .bind(change.created_at)
        .bind(change.updated_at)
        .bind(change.paid_at)
        .bind(change.applied_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_change(&self, id: Uuid) -> BillingResult<Option<PendingSubscriptionChange>> {
        let row: Option<ChangeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pending_subscription_changes WHERE id = $1",
            CHANGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PendingSubscriptionChange::try_from).transpose()
    }

    async fn find_change_by_reference(
        &self,
        external_reference: &str,
    ) -> BillingResult<Option<PendingSubscriptionChange>> {
        let row: Option<ChangeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pending_subscription_changes WHERE external_reference = $1",
            CHANGE_COLUMNS
        ))
        .bind(external_reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PendingSubscriptionChange::try_from).transpose()
    }

    async fn find_change_by_agreement(
        &self,
        external_agreement_id: &str,
    ) -> BillingResult<Option<PendingSubscriptionChange>> {
        let row: Option<ChangeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM pending_subscription_changes
            WHERE external_agreement_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            CHANGE_COLUMNS
        ))
        .bind(external_agreement_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PendingSubscriptionChange::try_from).transpose()
    }

    async fn list_due_changes(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PendingSubscriptionChange>> {
        let rows: Vec<ChangeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM pending_subscription_changes
            WHERE status = 'PAID'
              AND (effective_at IS NULL OR effective_at <= $1)
            ORDER BY COALESCE(effective_at, created_at), created_at
            "#,
            CHANGE_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        collect_changes(rows)
    }

    async fn list_abandoned_checkouts(
        &self,
        created_before: OffsetDateTime,
    ) -> BillingResult<Vec<PendingSubscriptionChange>> {
        let rows: Vec<ChangeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM pending_subscription_changes
            WHERE status IN ('CREATED', 'CHECKOUT_STARTED')
              AND created_at < $1
            ORDER BY created_at
            "#,
            CHANGE_COLUMNS
        ))
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;

        collect_changes(rows)
    }

    async fn transition_change(
        &self,
        id: Uuid,
        to: ChangeStatus,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let from: Vec<String> = ChangeStatus::predecessors(to)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE pending_subscription_changes
            SET status = $2,
                updated_at = $3,
                paid_at = CASE WHEN $2 = 'PAID' THEN $3 ELSE paid_at END,
                applied_at = CASE WHEN $2 = 'APPLIED' THEN $3 ELSE applied_at END
            WHERE id = $1
              AND status = ANY($4)
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(now)
        .bind(&from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_checkout(
        &self,
        id: Uuid,
        external_agreement_id: &str,
        checkout_url: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_subscription_changes
            SET status = 'CHECKOUT_STARTED',
                external_agreement_id = $2,
                checkout_url = $3,
                updated_at = $4
            WHERE id = $1
              AND status = 'CREATED'
            "#,
        )
        .bind(id)
        .bind(external_agreement_id)
        .bind(checkout_url)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit_applied_change(
        &self,
        application: &ChangeApplication,
    ) -> BillingResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;

        // ATOMIC CLAIM: only one runner can move the change out of PAID
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE pending_subscription_changes
            SET status = 'APPLIED',
                applied_at = $2,
                updated_at = $2
            WHERE id = $1
              AND status = 'PAID'
            RETURNING subscription_id
            "#,
        )
        .bind(application.change_id)
        .bind(application.applied_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((subscription_id,)) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'active',
                start_at = $2,
                end_at = $3,
                next_payment_at = $3,
                external_plan_id = COALESCE($4, external_plan_id),
                external_agreement_id = COALESCE($5, external_agreement_id),
                updated_at = $6
            WHERE id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .bind(application.start_at)
        .bind(application.end_at)
        .bind(&application.external_plan_id)
        .bind(&application.external_agreement_id)
        .bind(application.applied_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(BillingError::InvariantViolation(format!(
                "pending change {} references missing subscription {}",
                application.change_id, subscription_id
            )));
        };

        let subscription = Subscription::try_from(row)?;
        tx.commit().await?;
        Ok(Some(subscription))
    }
}

#[async_trait]
impl AgreementStore for PgBillingStore {
    async fn list_agreement_links(&self, tenant_id: TenantId) -> BillingResult<Vec<AgreementLink>> {
        let rows: Vec<LinkRow> = sqlx::query_as(&format!(
            "SELECT {} FROM agreement_links WHERE tenant_id = $1 ORDER BY created_at",
            LINK_COLUMNS
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AgreementLink::from).collect())
    }

    async fn get_agreement_link(
        &self,
        external_agreement_id: &str,
    ) -> BillingResult<Option<AgreementLink>> {
        let row: Option<LinkRow> = sqlx::query_as(&format!(
            "SELECT {} FROM agreement_links WHERE external_agreement_id = $1",
            LINK_COLUMNS
        ))
        .bind(external_agreement_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(AgreementLink::from))
    }

    async fn upsert_agreement_link(&self, link: &AgreementLink) -> BillingResult<AgreementLink> {
        let row: LinkRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO agreement_links
                (id, tenant_id, external_agreement_id, status, is_primary, last_attempt_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, FALSE, $5, $6, $7)
            ON CONFLICT (external_agreement_id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            LINK_COLUMNS
        ))
        .bind(link.id)
        .bind(link.tenant_id.as_uuid())
        .bind(&link.external_agreement_id)
        .bind(link.status.as_str())
        .bind(link.last_attempt_at)
        .bind(link.created_at)
        .bind(link.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(AgreementLink::from(row))
    }

    async fn update_agreement_status(
        &self,
        external_agreement_id: &str,
        status: &AgreementStatus,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agreement_links
            SET status = $2,
                is_primary = CASE WHEN $3 THEN FALSE ELSE is_primary END,
                updated_at = $4
            WHERE external_agreement_id = $1
            "#,
        )
        .bind(external_agreement_id)
        .bind(status.as_str())
        .bind(status.is_terminal())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_cancel_pending(
        &self,
        external_agreement_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE agreement_links
            SET status = 'cancel_pending',
                is_primary = FALSE,
                last_attempt_at = $2,
                updated_at = $2
            WHERE external_agreement_id = $1
            "#,
        )
        .bind(external_agreement_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_primary_agreement(
        &self,
        tenant_id: TenantId,
        external_agreement_id: &str,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        // Lock every link of the tenant so concurrent elections serialize
        sqlx::query("SELECT id FROM agreement_links WHERE tenant_id = $1 FOR UPDATE")
            .bind(tenant_id.as_uuid())
            .fetch_all(&mut *tx)
            .await?;

        // Clear first: the partial unique index allows one primary per tenant at any instant
        sqlx::query(
            r#"
            UPDATE agreement_links
            SET is_primary = FALSE, updated_at = NOW()
            WHERE tenant_id = $1
              AND is_primary
              AND external_agreement_id <> $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(external_agreement_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE agreement_links
            SET is_primary = TRUE, updated_at = NOW()
            WHERE tenant_id = $1
              AND external_agreement_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(external_agreement_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(BillingError::NotFound(format!(
                "agreement {} for tenant {}",
                external_agreement_id, tenant_id
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn clear_primary_agreement(&self, tenant_id: TenantId) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE agreement_links
            SET is_primary = FALSE, updated_at = NOW()
            WHERE tenant_id = $1 AND is_primary
            "#,
        )
        .bind(tenant_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_cancel_pending(&self, limit: usize) -> BillingResult<Vec<AgreementLink>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<LinkRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM agreement_links
            WHERE status = 'cancel_pending'
            ORDER BY last_attempt_at ASC NULLS FIRST, created_at ASC
            LIMIT $1
            "#,
            LINK_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AgreementLink::from).collect())
    }

    async fn touch_cancel_attempt(
        &self,
        external_agreement_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE agreement_links SET last_attempt_at = $2 WHERE external_agreement_id = $1",
        )
        .bind(external_agreement_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_agreements_canceled(
        &self,
        external_agreement_ids: &[String],
        now: OffsetDateTime,
    ) -> BillingResult<usize> {
        if external_agreement_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE agreement_links
            SET status = 'canceled',
                is_primary = FALSE,
                updated_at = $2
            WHERE external_agreement_id = ANY($1)
            "#,
        )
        .bind(external_agreement_ids)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

#[async_trait]
impl WebhookStore for PgBillingStore {
    async fn find_processed_webhook(
        &self,
        event_id: Option<&str>,
        resource_id: Option<&str>,
    ) -> BillingResult<Option<WebhookEvent>> {
        let row: Option<WebhookRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM webhook_events
            WHERE processed_at IS NOT NULL
              AND ((event_id IS NOT NULL AND event_id = $1)
                OR (event_id IS NULL AND resource_id IS NOT NULL AND resource_id = $2))
            ORDER BY received_at
            LIMIT 1
            "#,
            WEBHOOK_COLUMNS
        ))
        .bind(event_id)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(WebhookEvent::from))
    }

    async fn insert_webhook(&self, event: &WebhookEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (id, event_id, resource_id, payload, received_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(&event.event_id)
        .bind(&event.resource_id)
        .bind(&event.payload)
        .bind(event.received_at)
        .bind(event.processed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_webhook_processed(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<()> {
        // Stamped exactly once
        sqlx::query(
            "UPDATE webhook_events SET processed_at = $2 WHERE id = $1 AND processed_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
