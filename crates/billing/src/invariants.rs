//! Billing Invariants Module
//!
//! Runnable consistency checks over the Postgres schema. They only read, and
//! can be run after any batch job or webhook replay to confirm the store is
//! in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Tenant(s) affected
    pub tenant_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - provider may be charging twice
    Critical,
    /// High - access decisions may be wrong
    High,
    /// Medium - audit trail incomplete
    Medium,
    /// Low - mirror drift, corrected by reconciliation
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Log every violation at a level matching its severity, then the totals
    pub fn log(&self) {
        for v in &self.violations {
            match v.severity {
                ViolationSeverity::Critical | ViolationSeverity::High => tracing::error!(
                    invariant = %v.invariant,
                    severity = %v.severity,
                    tenant_ids = ?v.tenant_ids,
                    context = %v.context,
                    "{}",
                    v.description
                ),
                ViolationSeverity::Medium | ViolationSeverity::Low => tracing::warn!(
                    invariant = %v.invariant,
                    severity = %v.severity,
                    tenant_ids = ?v.tenant_ids,
                    context = %v.context,
                    "{}",
                    v.description
                ),
            }
        }

        tracing::info!(
            checks_run = self.checks_run,
            checks_passed = self.checks_passed,
            checks_failed = self.checks_failed,
            healthy = self.healthy,
            "Billing invariant checks complete"
        );
    }
}

/// Row type for multiple primary agreements violation
#[derive(Debug, sqlx::FromRow)]
struct MultiplePrimaryRow {
    tenant_id: Uuid,
    primary_count: i64,
}

/// Row type for half-set override violation
#[derive(Debug, sqlx::FromRow)]
struct OverrideMismatchRow {
    tenant_id: Uuid,
    override_mode: Option<String>,
    override_until: Option<OffsetDateTime>,
}

/// Row type for pending change missing a lifecycle timestamp
#[derive(Debug, sqlx::FromRow)]
struct ChangeMissingStampRow {
    change_id: Uuid,
    tenant_id: Uuid,
    status: String,
}

/// Row type for subscription pointing at an unregistered agreement
#[derive(Debug, sqlx::FromRow)]
struct UnregisteredAgreementRow {
    tenant_id: Uuid,
    external_agreement_id: String,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self, now: OffsetDateTime) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_single_primary_agreement().await?);
        violations.extend(self.check_override_consistency().await?);
        violations.extend(self.check_applied_changes_stamped().await?);
        violations.extend(self.check_paid_changes_stamped().await?);
        violations.extend(self.check_subscription_agreement_registered().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: At most one primary agreement per tenant
    ///
    /// Two primaries means two agreements are considered canonical and
    /// reconciliation will not cancel either.
    async fn check_single_primary_agreement(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultiplePrimaryRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, COUNT(*) as primary_count
            FROM agreement_links
            WHERE is_primary
            GROUP BY tenant_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_primary_agreement".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant has {} primary agreements (expected at most 1)",
                    row.primary_count
                ),
                context: serde_json::json!({
                    "primary_count": row.primary_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Override mode and override end are set together
    async fn check_override_consistency(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverrideMismatchRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, override_mode, override_until
            FROM subscriptions
            WHERE (override_mode IS NULL) <> (override_until IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "override_consistency".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: "Subscription has a half-set admin override".to_string(),
                context: serde_json::json!({
                    "override_mode": row.override_mode,
                    "override_until": row.override_until.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: APPLIED changes carry `applied_at`
    async fn check_applied_changes_stamped(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ChangeMissingStampRow> = sqlx::query_as(
            r#"
            SELECT c.id as change_id, s.tenant_id, c.status
            FROM pending_subscription_changes c
            JOIN subscriptions s ON s.id = c.subscription_id
            WHERE c.status = 'APPLIED'
              AND c.applied_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| missing_stamp("applied_changes_stamped", "applied_at", row))
            .collect())
    }

    /// Invariant 4: PAID and APPLIED changes carry `paid_at`
    async fn check_paid_changes_stamped(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ChangeMissingStampRow> = sqlx::query_as(
            r#"
            SELECT c.id as change_id, s.tenant_id, c.status
            FROM pending_subscription_changes c
            JOIN subscriptions s ON s.id = c.subscription_id
            WHERE c.status IN ('PAID', 'APPLIED')
              AND c.paid_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| missing_stamp("paid_changes_stamped", "paid_at", row))
            .collect())
    }

    /// Invariant 5: The subscription's agreement is in the tenant's registry
    ///
    /// Reconciliation only sees registered links, so an unregistered agreement
    /// could keep charging without ever being checked.
    async fn check_subscription_agreement_registered(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnregisteredAgreementRow> = sqlx::query_as(
            r#"
            SELECT s.tenant_id, s.external_agreement_id
            FROM subscriptions s
            WHERE s.external_agreement_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM agreement_links l
                  WHERE l.tenant_id = s.tenant_id
                    AND l.external_agreement_id = s.external_agreement_id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_agreement_registered".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Subscription references agreement {} which is not registered for the tenant",
                    row.external_agreement_id
                ),
                context: serde_json::json!({
                    "external_agreement_id": row.external_agreement_id,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_primary_agreement" => self.check_single_primary_agreement().await,
            "override_consistency" => self.check_override_consistency().await,
            "applied_changes_stamped" => self.check_applied_changes_stamped().await,
            "paid_changes_stamped" => self.check_paid_changes_stamped().await,
            "subscription_agreement_registered" => {
                self.check_subscription_agreement_registered().await
            }
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_primary_agreement",
            "override_consistency",
            "applied_changes_stamped",
            "paid_changes_stamped",
            "subscription_agreement_registered",
        ]
    }
}

fn missing_stamp(invariant: &str, column: &str, row: ChangeMissingStampRow) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        tenant_ids: vec![row.tenant_id],
        description: format!(
            "Pending change {} is {} but has no {}",
            row.change_id, row.status, column
        ),
        context: serde_json::json!({
            "change_id": row.change_id,
            "status": row.status,
        }),
        severity: ViolationSeverity::Medium,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            tenant_ids: vec![Uuid::new_v4()],
            description: "test".to_string(),
            context: serde_json::json!({}),
            severity: ViolationSeverity::Medium,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_primary_agreement"));
        assert!(checks.contains(&"subscription_agreement_registered"));
    }

    #[test]
    fn test_summary_counts_failed_checks_not_rows() {
        let now = datetime!(2024-06-01 00:00 UTC);
        let summary = InvariantCheckSummary::from_violations(
            now,
            5,
            vec![
                violation("paid_changes_stamped"),
                violation("paid_changes_stamped"),
                violation("override_consistency"),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 3);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(now, 5, vec![]);
        assert!(clean.healthy);
        assert_eq!(clean.checks_passed, 5);
    }
}
