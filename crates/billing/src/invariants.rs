//! Ledger invariants
//!
//! Runnable consistency checks over purchases, schedules and credit batches.
//! Run them after a webhook replay, a manual repair or on a schedule to catch
//! double grants and lost grants.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
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
    /// Owner or record ids affected
    pub subject_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - credits granted twice or never
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
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
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
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
}

#[derive(Debug, sqlx::FromRow)]
struct UngrantedPurchaseRow {
    purchase_id: Uuid,
    owner_id: Uuid,
    checkout_session_id: String,
    credits_purchased: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateGrantRow {
    source_reference_id: Uuid,
    batch_count: i64,
    total_credits: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleCountRow {
    schedule_id: Uuid,
    stripe_subscription_id: String,
    installments_paid: i32,
    installment_count: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct BatchAmountRow {
    batch_id: Uuid,
    owner_id: Uuid,
    original_amount: i64,
    remaining_amount: i64,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UngrantedScheduleRow {
    schedule_id: Uuid,
    owner_id: Uuid,
    stripe_subscription_id: String,
}

/// Service for running ledger invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_completed_purchase_has_batch().await?);
        violations.extend(self.check_single_batch_per_reference().await?);
        violations.extend(self.check_completed_schedule_fully_paid().await?);
        violations.extend(self.check_batch_amounts_in_range().await?);
        violations.extend(self.check_depleted_status_consistent().await?);
        violations.extend(self.check_schedule_has_batch().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: Every completed purchase produced a batch
    ///
    /// A completed purchase without a batch is a lost grant. The next
    /// confirmation of that session repairs it.
    async fn check_completed_purchase_has_batch(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UngrantedPurchaseRow> = sqlx::query_as(
            r#"
            SELECT p.id AS purchase_id, p.owner_id, p.checkout_session_id, p.credits_purchased
            FROM credit_purchases p
            WHERE p.status = 'completed'
              AND NOT EXISTS (
                  SELECT 1 FROM credit_batches b
                  WHERE b.source_type = 'purchase' AND b.source_reference_id = p.id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_purchase_has_batch".to_string(),
                subject_ids: vec![row.purchase_id, row.owner_id],
                description: format!(
                    "Purchase for session {} is completed but {} credits were never granted",
                    row.checkout_session_id, row.credits_purchased
                ),
                context: serde_json::json!({
                    "checkout_session_id": row.checkout_session_id,
                    "credits_purchased": row.credits_purchased,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: At most one purchase batch per source reference
    async fn check_single_batch_per_reference(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateGrantRow> = sqlx::query_as(
            r#"
            SELECT source_reference_id,
                   COUNT(*) AS batch_count,
                   SUM(original_amount)::BIGINT AS total_credits
            FROM credit_batches
            WHERE source_type = 'purchase'
            GROUP BY source_reference_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_batch_per_reference".to_string(),
                subject_ids: vec![row.source_reference_id],
                description: format!(
                    "Reference has {} purchase batches (expected 1)",
                    row.batch_count
                ),
                context: serde_json::json!({
                    "batch_count": row.batch_count,
                    "total_credits": row.total_credits,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: Completed schedules are fully paid
    async fn check_completed_schedule_fully_paid(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ScheduleCountRow> = sqlx::query_as(
            r#"
            SELECT id AS schedule_id, stripe_subscription_id, installments_paid, installment_count
            FROM payment_schedules
            WHERE status = 'completed'
              AND installments_paid <> installment_count
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_schedule_fully_paid".to_string(),
                subject_ids: vec![row.schedule_id],
                description: format!(
                    "Schedule for {} is completed with {}/{} installments paid",
                    row.stripe_subscription_id, row.installments_paid, row.installment_count
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "installments_paid": row.installments_paid,
                    "installment_count": row.installment_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: `0 <= remaining <= original`
    async fn check_batch_amounts_in_range(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BatchAmountRow> = sqlx::query_as(
            r#"
            SELECT id AS batch_id, owner_id, original_amount, remaining_amount, status
            FROM credit_batches
            WHERE remaining_amount < 0 OR remaining_amount > original_amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "batch_amounts_in_range".to_string(),
                subject_ids: vec![row.batch_id, row.owner_id],
                description: format!(
                    "Batch has remaining {} outside [0, {}]",
                    row.remaining_amount, row.original_amount
                ),
                context: serde_json::json!({
                    "original_amount": row.original_amount,
                    "remaining_amount": row.remaining_amount,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: Live batches with nothing left are marked depleted
    async fn check_depleted_status_consistent(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BatchAmountRow> = sqlx::query_as(
            r#"
            SELECT id AS batch_id, owner_id, original_amount, remaining_amount, status
            FROM credit_batches
            WHERE (remaining_amount = 0 AND status IN ('active', 'partial'))
               OR (remaining_amount > 0 AND status = 'depleted')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "depleted_status_consistent".to_string(),
                subject_ids: vec![row.batch_id, row.owner_id],
                description: format!(
                    "Batch has remaining {} but status '{}'",
                    row.remaining_amount, row.status
                ),
                context: serde_json::json!({
                    "original_amount": row.original_amount,
                    "remaining_amount": row.remaining_amount,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: Every schedule received its upfront grant
    async fn check_schedule_has_batch(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UngrantedScheduleRow> = sqlx::query_as(
            r#"
            SELECT s.id AS schedule_id, s.owner_id, s.stripe_subscription_id
            FROM payment_schedules s
            WHERE NOT EXISTS (
                SELECT 1 FROM credit_batches b
                WHERE b.source_type = 'purchase' AND b.source_reference_id = s.id
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "schedule_has_batch".to_string(),
                subject_ids: vec![row.schedule_id, row.owner_id],
                description: format!(
                    "Installment plan {} has no credit batch",
                    row.stripe_subscription_id
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "completed_purchase_has_batch" => self.check_completed_purchase_has_batch().await,
            "single_batch_per_reference" => self.check_single_batch_per_reference().await,
            "completed_schedule_fully_paid" => self.check_completed_schedule_fully_paid().await,
            "batch_amounts_in_range" => self.check_batch_amounts_in_range().await,
            "depleted_status_consistent" => self.check_depleted_status_consistent().await,
            "schedule_has_batch" => self.check_schedule_has_batch().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "completed_purchase_has_batch",
            "single_batch_per_reference",
            "completed_schedule_fully_paid",
            "batch_amounts_in_range",
            "depleted_status_consistent",
            "schedule_has_batch",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            subject_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::Critical,
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
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"completed_purchase_has_batch"));
        assert!(checks.contains(&"single_batch_per_reference"));
    }

    #[test]
    fn test_summary_counts_failed_checks_not_violations() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            6,
            vec![
                violation("completed_purchase_has_batch"),
                violation("completed_purchase_has_batch"),
                violation("batch_amounts_in_range"),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 4);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), 6, vec![]);
        assert!(clean.healthy);
    }
}
