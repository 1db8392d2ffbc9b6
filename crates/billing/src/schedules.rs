//! Installment payment schedules
//!
//! A schedule is opened when an installment checkout completes. The full
//! package value is granted at that point; later invoices only advance the
//! counters and move the schedule through its states:
//!
//! ```text
//! active <-> outstanding --> completed | defaulted
//! ```
//!
//! Every transition is a conditional write guarded on the status and
//! `installments_paid` that were read, so replayed or concurrent events
//! cannot over-count. A writer that loses the race re-reads and re-evaluates.

use std::sync::Arc;

use async_trait::async_trait;
use coachledger_shared::{CreditSourceType, OwnerRef, ScheduleStatus};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::effects::SideEffect;
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::ledger::{CreditLedger, GrantRequest};

/// Upper bound on re-read/retry rounds for a single transition
const MAX_TRANSITION_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct PaymentSchedule {
    pub id: Uuid,
    pub owner: OwnerRef,
    pub package_id: Uuid,
    pub stripe_subscription_id: String,
    pub total_amount_minor_units: i64,
    pub installment_count: i32,
    pub installment_amount_minor_units: i64,
    pub installments_paid: i32,
    pub amount_paid_minor_units: i64,
    pub currency: String,
    pub next_payment_date: Option<OffsetDateTime>,
    pub credits_granted: i64,
    pub credit_batch_id: Option<Uuid>,
    /// Invoices already counted toward `installments_paid`
    pub paid_invoice_ids: Vec<String>,
    pub status: ScheduleStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl PaymentSchedule {
    pub fn is_fully_paid(&self) -> bool {
        self.installments_paid >= self.installment_count
    }

    pub fn has_counted(&self, invoice_id: &str) -> bool {
        self.paid_invoice_ids.iter().any(|id| id == invoice_id)
    }
}

/// Fields for a newly opened schedule. The first installment is already paid.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub owner: OwnerRef,
    pub package_id: Uuid,
    pub stripe_subscription_id: String,
    pub total_amount_minor_units: i64,
    pub installment_count: i32,
    pub installment_amount_minor_units: i64,
    pub currency: String,
    pub next_payment_date: Option<OffsetDateTime>,
    pub credits_granted: i64,
}

impl NewSchedule {
    pub fn validate(&self) -> BillingResult<()> {
        if self.installment_count < 1 {
            return Err(BillingError::InvalidInput(format!(
                "installment_count must be at least 1, got {}",
                self.installment_count
            )));
        }
        if self.stripe_subscription_id.is_empty() {
            return Err(BillingError::InvalidInput(
                "Installment plan requires a subscription id".to_string(),
            ));
        }
        Ok(())
    }

    /// A single-installment plan is settled by its first payment
    pub fn initial_status(&self) -> ScheduleStatus {
        if self.installment_count <= 1 {
            ScheduleStatus::Completed
        } else {
            ScheduleStatus::Active
        }
    }

    pub(crate) fn into_schedule(self, id: Uuid, now: OffsetDateTime) -> PaymentSchedule {
        let status = self.initial_status();
        PaymentSchedule {
            id,
            owner: self.owner,
            package_id: self.package_id,
            stripe_subscription_id: self.stripe_subscription_id,
            total_amount_minor_units: self.total_amount_minor_units,
            installment_count: self.installment_count,
            installment_amount_minor_units: self.installment_amount_minor_units,
            installments_paid: 1,
            amount_paid_minor_units: self.installment_amount_minor_units,
            currency: self.currency,
            next_payment_date: self.next_payment_date,
            credits_granted: self.credits_granted,
            credit_batch_id: None,
            paid_invoice_ids: Vec::new(),
            status,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Target state for a guarded schedule update
#[derive(Debug, Clone)]
pub struct ScheduleTransition {
    pub status: ScheduleStatus,
    pub installments_paid: i32,
    pub amount_paid_minor_units: i64,
    pub next_payment_date: Option<OffsetDateTime>,
    pub paid_invoice_ids: Vec<String>,
}

impl ScheduleTransition {
    /// Same counters, new status
    pub fn status_only(current: &PaymentSchedule, status: ScheduleStatus) -> Self {
        Self {
            status,
            installments_paid: current.installments_paid,
            amount_paid_minor_units: current.amount_paid_minor_units,
            next_payment_date: current.next_payment_date,
            paid_invoice_ids: current.paid_invoice_ids.clone(),
        }
    }
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert a schedule unless one exists for the subscription. Returns the stored row
    /// and whether this call created it.
    async fn create_if_absent(&self, schedule: NewSchedule)
        -> BillingResult<(PaymentSchedule, bool)>;

    /// Record the batch granted for a schedule (first writer wins)
    async fn attach_batch(&self, schedule_id: Uuid, batch_id: Uuid) -> BillingResult<()>;

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<PaymentSchedule>>;

    async fn schedules_for_owner(&self, owner: OwnerRef) -> BillingResult<Vec<PaymentSchedule>>;

    /// Apply `next` only if the row still matches the status and paid count of `current`
    async fn transition(
        &self,
        current: &PaymentSchedule,
        next: ScheduleTransition,
    ) -> BillingResult<Option<PaymentSchedule>>;
}

/// Terms of an installment plan taken from checkout metadata
#[derive(Debug, Clone)]
pub struct InstallmentPlan {
    pub schedule: NewSchedule,
    pub feature_key: Option<String>,
    pub expires_at: OffsetDateTime,
    pub package_name: String,
}

/// Result of opening a plan
#[derive(Debug, Clone, Serialize)]
pub struct OpenedPlan {
    pub schedule: PaymentSchedule,
    pub batch_id: Uuid,
    /// False when the checkout had already been processed
    pub created: bool,
}

/// Counters after an installment payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProgress {
    pub installments_paid: i32,
    pub installment_count: i32,
    pub schedule_complete: bool,
}

impl From<&PaymentSchedule> for PaymentProgress {
    fn from(schedule: &PaymentSchedule) -> Self {
        Self {
            installments_paid: schedule.installments_paid,
            installment_count: schedule.installment_count,
            schedule_complete: schedule.status == ScheduleStatus::Completed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailureOutcome {
    pub locked: bool,
}

/// Owns every state change of a payment schedule
#[derive(Clone)]
pub struct InstallmentScheduleManager {
    schedules: Arc<dyn ScheduleStore>,
    ledger: Arc<dyn CreditLedger>,
    gateway: Arc<dyn PaymentGateway>,
}

impl InstallmentScheduleManager {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        ledger: Arc<dyn CreditLedger>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            schedules,
            ledger,
            gateway,
        }
    }

    async fn load(&self, subscription_id: &str) -> BillingResult<PaymentSchedule> {
        self.schedules
            .find_by_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::ScheduleNotFound(subscription_id.to_string()))
    }

    pub async fn find(&self, subscription_id: &str) -> BillingResult<Option<PaymentSchedule>> {
        self.schedules.find_by_subscription(subscription_id).await
    }

    /// Open a plan: create the schedule and grant the full package value once
    pub async fn open(&self, plan: InstallmentPlan) -> BillingResult<OpenedPlan> {
        plan.schedule.validate()?;

        let owner = plan.schedule.owner;
        let credits = plan.schedule.credits_granted;
        let (schedule, created) = self.schedules.create_if_absent(plan.schedule).await?;

        if !created {
            tracing::info!(
                subscription_id = %schedule.stripe_subscription_id,
                schedule_id = %schedule.id,
                "Installment plan already open, skipping"
            );
        }

        // Keyed on the schedule id, so a replay or a crash between the two writes
        // converges on the same batch.
        let grant = self
            .ledger
            .grant_batch(GrantRequest {
                owner,
                amount: credits,
                expires_at: plan.expires_at,
                source_type: CreditSourceType::Purchase,
                feature_key: plan.feature_key,
                source_reference_id: schedule.id,
                description: format!(
                    "{} ({} installments)",
                    plan.package_name, schedule.installment_count
                ),
            })
            .await?;

        if schedule.credit_batch_id.is_none() {
            self.schedules
                .attach_batch(schedule.id, grant.batch_id)
                .await?;
        }

        if created {
            tracing::info!(
                owner = %owner,
                subscription_id = %schedule.stripe_subscription_id,
                schedule_id = %schedule.id,
                installments = schedule.installment_count,
                credits = credits,
                "Opened installment plan"
            );
        }

        Ok(OpenedPlan {
            schedule: PaymentSchedule {
                credit_batch_id: Some(schedule.credit_batch_id.unwrap_or(grant.batch_id)),
                ..schedule
            },
            batch_id: grant.batch_id,
            created,
        })
    }

    /// Count a paid installment
    ///
    /// Re-applying the same invoice, or paying into a terminal schedule, is a
    /// no-op that reports the current counters.
    pub async fn record_payment(
        &self,
        subscription_id: &str,
        invoice_id: &str,
        amount_paid: i64,
        next_due: Option<OffsetDateTime>,
    ) -> BillingResult<PaymentProgress> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let current = self.load(subscription_id).await?;

            if current.status.is_terminal() {
                tracing::info!(
                    subscription_id = %subscription_id,
                    status = %current.status,
                    "Payment on closed schedule ignored"
                );
                return Ok(PaymentProgress::from(&current));
            }

            if current.has_counted(invoice_id) {
                tracing::info!(
                    subscription_id = %subscription_id,
                    invoice_id = %invoice_id,
                    "Invoice already counted"
                );
                return Ok(PaymentProgress::from(&current));
            }

            let installments_paid = (current.installments_paid + 1).min(current.installment_count);
            let status = if installments_paid >= current.installment_count {
                ScheduleStatus::Completed
            } else {
                ScheduleStatus::Active
            };

            let mut paid_invoice_ids = current.paid_invoice_ids.clone();
            paid_invoice_ids.push(invoice_id.to_string());

            let next = ScheduleTransition {
                status,
                installments_paid,
                amount_paid_minor_units: current.amount_paid_minor_units + amount_paid,
                next_payment_date: next_due.or(current.next_payment_date),
                paid_invoice_ids,
            };

            if let Some(updated) = self.schedules.transition(&current, next).await? {
                tracing::info!(
                    subscription_id = %subscription_id,
                    installments_paid = updated.installments_paid,
                    installment_count = updated.installment_count,
                    status = %updated.status,
                    "Recorded installment payment"
                );

                if updated.status == ScheduleStatus::Completed {
                    self.end_billing(subscription_id).await;
                }

                return Ok(PaymentProgress::from(&updated));
            }

            tracing::debug!(
                subscription_id = %subscription_id,
                "Schedule changed underneath payment, re-reading"
            );
        }

        Err(BillingError::Internal(format!(
            "Schedule {} kept changing while recording payment",
            subscription_id
        )))
    }

    /// Lock the schedule after a failed installment. Credits are left untouched.
    pub async fn record_failure(&self, subscription_id: &str) -> BillingResult<FailureOutcome> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let current = self.load(subscription_id).await?;

            if current.status != ScheduleStatus::Active {
                if current.status == ScheduleStatus::Completed {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        "Payment failure reported for a completed schedule"
                    );
                }
                return Ok(FailureOutcome {
                    locked: current.status.locks_access(),
                });
            }

            let next = ScheduleTransition::status_only(&current, ScheduleStatus::Outstanding);
            if self.schedules.transition(&current, next).await?.is_some() {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    owner = %current.owner,
                    installments_paid = current.installments_paid,
                    "Installment payment failed, schedule outstanding"
                );
                return Ok(FailureOutcome { locked: true });
            }
        }

        Err(BillingError::Internal(format!(
            "Schedule {} kept changing while recording failure",
            subscription_id
        )))
    }

    /// Close a schedule whose gateway subscription ended
    ///
    /// Fully paid schedules complete; anything less defaults and stays locked.
    pub async fn close_on_cancel(&self, subscription_id: &str) -> BillingResult<ScheduleStatus> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let current = self.load(subscription_id).await?;

            if current.status.is_terminal() {
                return Ok(current.status);
            }

            let target = if current.is_fully_paid() {
                ScheduleStatus::Completed
            } else {
                ScheduleStatus::Defaulted
            };

            let next = ScheduleTransition::status_only(&current, target);
            if let Some(updated) = self.schedules.transition(&current, next).await? {
                if target == ScheduleStatus::Defaulted {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        owner = %updated.owner,
                        installments_paid = updated.installments_paid,
                        installment_count = updated.installment_count,
                        "Installment plan defaulted"
                    );
                } else {
                    tracing::info!(
                        subscription_id = %subscription_id,
                        "Installment plan completed"
                    );
                }
                return Ok(updated.status);
            }
        }

        Err(BillingError::Internal(format!(
            "Schedule {} kept changing while closing",
            subscription_id
        )))
    }

    /// Whether any of the owner's schedules currently locks access
    pub async fn is_locked(&self, owner: OwnerRef) -> BillingResult<bool> {
        let schedules = self.schedules.schedules_for_owner(owner).await?;
        Ok(schedules.iter().any(|s| s.status.locks_access()))
    }

    /// Stop further invoices once the plan is paid off
    async fn end_billing(&self, subscription_id: &str) -> SideEffect {
        SideEffect::from_result(
            "cancel_subscription",
            self.gateway.cancel_subscription(subscription_id).await,
        )
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    owner_type: String,
    owner_id: Uuid,
    package_id: Uuid,
    stripe_subscription_id: String,
    total_amount_minor_units: i64,
    installment_count: i32,
    installment_amount_minor_units: i64,
    installments_paid: i32,
    amount_paid_minor_units: i64,
    currency: String,
    next_payment_date: Option<OffsetDateTime>,
    credits_granted: i64,
    credit_batch_id: Option<Uuid>,
    paid_invoice_ids: Vec<String>,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<ScheduleRow> for PaymentSchedule {
    type Error = BillingError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        Ok(PaymentSchedule {
            id: row.id,
            owner: OwnerRef {
                owner_type: row.owner_type.parse()?,
                owner_id: row.owner_id,
            },
            package_id: row.package_id,
            stripe_subscription_id: row.stripe_subscription_id,
            total_amount_minor_units: row.total_amount_minor_units,
            installment_count: row.installment_count,
            installment_amount_minor_units: row.installment_amount_minor_units,
            installments_paid: row.installments_paid,
            amount_paid_minor_units: row.amount_paid_minor_units,
            currency: row.currency,
            next_payment_date: row.next_payment_date,
            credits_granted: row.credits_granted,
            credit_batch_id: row.credit_batch_id,
            paid_invoice_ids: row.paid_invoice_ids,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SCHEDULE_COLUMNS: &str = "id, owner_type, owner_id, package_id, stripe_subscription_id, \
     total_amount_minor_units, installment_count, installment_amount_minor_units, \
     installments_paid, amount_paid_minor_units, currency, next_payment_date, credits_granted, \
     credit_batch_id, paid_invoice_ids, status, created_at, updated_at";

#[derive(Clone)]
pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn create_if_absent(
        &self,
        schedule: NewSchedule,
    ) -> BillingResult<(PaymentSchedule, bool)> {
        let status = schedule.initial_status();

        let inserted: Option<ScheduleRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO payment_schedules (
                owner_type, owner_id, package_id, stripe_subscription_id,
                total_amount_minor_units, installment_count, installment_amount_minor_units,
                installments_paid, amount_paid_minor_units, currency, next_payment_date,
                credits_granted, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 1, $7, $8, $9, $10, $11)
            ON CONFLICT (stripe_subscription_id) DO NOTHING
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(schedule.owner.owner_type.as_str())
        .bind(schedule.owner.owner_id)
        .bind(schedule.package_id)
        .bind(&schedule.stripe_subscription_id)
        .bind(schedule.total_amount_minor_units)
        .bind(schedule.installment_count)
        .bind(schedule.installment_amount_minor_units)
        .bind(&schedule.currency)
        .bind(schedule.next_payment_date)
        .bind(schedule.credits_granted)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((PaymentSchedule::try_from(row)?, true));
        }

        let existing = self
            .find_by_subscription(&schedule.stripe_subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "Schedule for {} vanished after conflict",
                    schedule.stripe_subscription_id
                ))
            })?;

        Ok((existing, false))
    }

    async fn attach_batch(&self, schedule_id: Uuid, batch_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_schedules
            SET credit_batch_id = $2, updated_at = NOW()
            WHERE id = $1 AND credit_batch_id IS NULL
            "#,
        )
        .bind(schedule_id)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<PaymentSchedule>> {
        let row: Option<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM payment_schedules WHERE stripe_subscription_id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentSchedule::try_from).transpose()
    }

    async fn schedules_for_owner(&self, owner: OwnerRef) -> BillingResult<Vec<PaymentSchedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM payment_schedules
            WHERE owner_type = $1 AND owner_id = $2
            ORDER BY created_at
            "#
        ))
        .bind(owner.owner_type.as_str())
        .bind(owner.owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PaymentSchedule::try_from).collect()
    }

    async fn transition(
        &self,
        current: &PaymentSchedule,
        next: ScheduleTransition,
    ) -> BillingResult<Option<PaymentSchedule>> {
        let row: Option<ScheduleRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payment_schedules
            SET status = $4,
                installments_paid = $5,
                amount_paid_minor_units = $6,
                next_payment_date = $7,
                paid_invoice_ids = $8,
                updated_at = NOW()
            WHERE id = $1
              AND status = $2
              AND installments_paid = $3
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(current.id)
        .bind(current.status.as_str())
        .bind(current.installments_paid)
        .bind(next.status.as_str())
        .bind(next.installments_paid)
        .bind(next.amount_paid_minor_units)
        .bind(next.next_payment_date)
        .bind(&next.paid_invoice_ids)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentSchedule::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_schedule(count: i32) -> NewSchedule {
        NewSchedule {
            owner: OwnerRef::user(Uuid::new_v4()),
            package_id: Uuid::new_v4(),
            stripe_subscription_id: "sub_test".to_string(),
            total_amount_minor_units: 120_000,
            installment_count: count,
            installment_amount_minor_units: 20_000,
            currency: "usd".to_string(),
            next_payment_date: None,
            credits_granted: 1_000,
        }
    }

    #[test]
    fn test_new_schedule_starts_with_first_installment_paid() {
        let schedule = new_schedule(6).into_schedule(Uuid::new_v4(), OffsetDateTime::now_utc());
        assert_eq!(schedule.installments_paid, 1);
        assert_eq!(schedule.amount_paid_minor_units, 20_000);
        assert_eq!(schedule.status, ScheduleStatus::Active);
        assert!(!schedule.is_fully_paid());
    }

    #[test]
    fn test_single_installment_plan_is_complete_immediately() {
        assert_eq!(new_schedule(1).initial_status(), ScheduleStatus::Completed);
    }

    #[test]
    fn test_zero_installments_rejected() {
        assert!(matches!(
            new_schedule(0).validate(),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_progress_serializes_camel_case() {
        let schedule = new_schedule(6).into_schedule(Uuid::new_v4(), OffsetDateTime::now_utc());
        let json = serde_json::to_value(PaymentProgress::from(&schedule)).unwrap();
        assert_eq!(json["installmentsPaid"], 1);
        assert_eq!(json["installmentCount"], 6);
        assert_eq!(json["scheduleComplete"], false);
    }
}
