//! Credit ledger primitives
//!
//! Grant, expire and rollover against the `credit_batches` table. Every
//! primitive is safe to repeat:
//!
//! - **grant**: unique on `(owner_type, owner_id, source_type, source_reference_id)`;
//!   a repeated grant returns the existing batch instead of creating another.
//! - **expire**: a status-scoped update, so overlapping sweeps expire each batch once.
//! - **rollover**: drains the source batches under row locks in one transaction;
//!   a concurrent run skips locked rows and finds nothing left to move.

use async_trait::async_trait;
use coachledger_shared::{BatchStatus, CreditSourceType, OwnerRef, OwnerType};
use serde::Serialize;
use sqlx::PgPool;
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Allowance batches expiring within this horizon are eligible for rollover
pub const ROLLOVER_HORIZON: Duration = Duration::hours(24);

/// A discrete, expiring grant of credits
#[derive(Debug, Clone, Serialize)]
pub struct CreditBatch {
    pub id: Uuid,
    pub owner: OwnerRef,
    pub original_amount: i64,
    pub remaining_amount: i64,
    pub source_type: CreditSourceType,
    pub feature_key: Option<String>,
    pub source_reference_id: Uuid,
    pub description: String,
    pub expires_at: OffsetDateTime,
    pub status: BatchStatus,
    pub created_at: OffsetDateTime,
}

/// Parameters for the grant primitive
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub owner: OwnerRef,
    pub amount: i64,
    pub expires_at: OffsetDateTime,
    pub source_type: CreditSourceType,
    pub feature_key: Option<String>,
    pub source_reference_id: Uuid,
    pub description: String,
}

impl GrantRequest {
    pub fn validate(&self) -> BillingResult<()> {
        if self.amount <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "Grant amount must be positive, got {}",
                self.amount
            )));
        }
        Ok(())
    }
}

/// Result of a grant call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantOutcome {
    pub batch_id: Uuid,
    /// False when the reference had already been granted
    pub created: bool,
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Create a batch, or return the existing one for the same source reference
    async fn grant_batch(&self, request: GrantRequest) -> BillingResult<GrantOutcome>;

    /// Mark every live batch past its expiry as expired
    async fn expire_batches(&self, now: OffsetDateTime) -> BillingResult<u64>;

    /// Move up to `max_amount` of unused allowance into a new rollover batch
    async fn rollover(
        &self,
        owner: OwnerRef,
        max_amount: i64,
        now: OffsetDateTime,
    ) -> BillingResult<i64>;

    /// Live batches with remaining credits expiring in `(from, until]`
    async fn batches_expiring_between(
        &self,
        owner_type: OwnerType,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<CreditBatch>>;

    /// Every batch granted for a source reference
    async fn batches_for_reference(
        &self,
        source_type: CreditSourceType,
        source_reference_id: Uuid,
    ) -> BillingResult<Vec<CreditBatch>>;
}

/// Add calendar months, clamping the day to the target month's length
pub fn add_months(at: OffsetDateTime, months: u32) -> OffsetDateTime {
    let date = at.date();
    let zero_based = i64::from(date.year()) * 12 + i64::from(u8::from(date.month()) - 1)
        + i64::from(months);
    let year = zero_based.div_euclid(12) as i32;
    let month = Month::January.nth_next(zero_based.rem_euclid(12) as u8);
    let day = date
        .day()
        .min(time::util::days_in_year_month(year, month));

    match Date::from_calendar_date(year, month, day) {
        Ok(target) => at.replace_date(target),
        Err(_) => at + Duration::days(30 * i64::from(months)),
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BatchRow {
    id: Uuid,
    owner_type: String,
    owner_id: Uuid,
    original_amount: i64,
    remaining_amount: i64,
    source_type: String,
    feature_key: Option<String>,
    source_reference_id: Uuid,
    description: String,
    expires_at: OffsetDateTime,
    status: String,
    created_at: OffsetDateTime,
}

impl TryFrom<BatchRow> for CreditBatch {
    type Error = BillingError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(CreditBatch {
            id: row.id,
            owner: OwnerRef {
                owner_type: row.owner_type.parse()?,
                owner_id: row.owner_id,
            },
            original_amount: row.original_amount,
            remaining_amount: row.remaining_amount,
            source_type: row.source_type.parse()?,
            feature_key: row.feature_key,
            source_reference_id: row.source_reference_id,
            description: row.description,
            expires_at: row.expires_at,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

const BATCH_COLUMNS: &str = "id, owner_type, owner_id, original_amount, remaining_amount, \
     source_type, feature_key, source_reference_id, description, expires_at, status, created_at";

/// Postgres-backed ledger
#[derive(Clone)]
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn grant_batch(&self, request: GrantRequest) -> BillingResult<GrantOutcome> {
        request.validate()?;

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO credit_batches (
                owner_type, owner_id, original_amount, remaining_amount, source_type,
                feature_key, source_reference_id, description, expires_at, status
            )
            VALUES ($1, $2, $3, $3, $4, $5, $6, $7, $8, 'active')
            ON CONFLICT (owner_type, owner_id, source_type, source_reference_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(request.owner.owner_type.as_str())
        .bind(request.owner.owner_id)
        .bind(request.amount)
        .bind(request.source_type.as_str())
        .bind(&request.feature_key)
        .bind(request.source_reference_id)
        .bind(&request.description)
        .bind(request.expires_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((batch_id,)) = inserted {
            tracing::info!(
                owner = %request.owner,
                batch_id = %batch_id,
                amount = request.amount,
                source_type = %request.source_type,
                source_reference_id = %request.source_reference_id,
                "Granted credit batch"
            );
            return Ok(GrantOutcome {
                batch_id,
                created: true,
            });
        }

        let (batch_id,): (Uuid,) = sqlx::query_as(
            r#"
            SELECT id FROM credit_batches
            WHERE owner_type = $1 AND owner_id = $2
              AND source_type = $3 AND source_reference_id = $4
            "#,
        )
        .bind(request.owner.owner_type.as_str())
        .bind(request.owner.owner_id)
        .bind(request.source_type.as_str())
        .bind(request.source_reference_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::warn!(
            owner = %request.owner,
            batch_id = %batch_id,
            source_reference_id = %request.source_reference_id,
            "Grant refused: source reference already granted"
        );

        Ok(GrantOutcome {
            batch_id,
            created: false,
        })
    }

    async fn expire_batches(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE credit_batches
            SET status = 'expired'
            WHERE status IN ('active', 'partial')
              AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn rollover(
        &self,
        owner: OwnerRef,
        max_amount: i64,
        now: OffsetDateTime,
    ) -> BillingResult<i64> {
        if max_amount <= 0 {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let sources: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT id, remaining_amount
            FROM credit_batches
            WHERE owner_type = $1 AND owner_id = $2
              AND source_type = 'subscription_allowance'
              AND status IN ('active', 'partial')
              AND remaining_amount > 0
              AND expires_at <= $3
            ORDER BY expires_at, id
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(owner.owner_type.as_str())
        .bind(owner.owner_id)
        .bind(now + ROLLOVER_HORIZON)
        .fetch_all(&mut *tx)
        .await?;

        let Some((anchor_id, _)) = sources.first().copied() else {
            tx.commit().await?;
            return Ok(0);
        };

        let unused: i64 = sources.iter().map(|(_, remaining)| remaining).sum();
        let rolled = unused.min(max_amount);
        let source_ids: Vec<Uuid> = sources.iter().map(|(id, _)| *id).collect();

        sqlx::query(
            r#"
            UPDATE credit_batches
            SET remaining_amount = 0, status = 'depleted'
            WHERE id = ANY($1)
            "#,
        )
        .bind(&source_ids)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO credit_batches (
                owner_type, owner_id, original_amount, remaining_amount, source_type,
                source_reference_id, description, expires_at, status
            )
            VALUES ($1, $2, $3, $3, 'rollover', $4, $5, $6, 'active')
            ON CONFLICT (owner_type, owner_id, source_type, source_reference_id) DO NOTHING
            "#,
        )
        .bind(owner.owner_type.as_str())
        .bind(owner.owner_id)
        .bind(rolled)
        .bind(anchor_id)
        .bind(format!("Rollover of {} unused credits", rolled))
        .bind(add_months(now, 1))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            owner = %owner,
            unused = unused,
            rolled = rolled,
            forfeited = unused - rolled,
            "Rolled over unused allowance"
        );

        Ok(rolled)
    }

    async fn batches_expiring_between(
        &self,
        owner_type: OwnerType,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<CreditBatch>> {
        let rows: Vec<BatchRow> = sqlx::query_as(&format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM credit_batches
            WHERE owner_type = $1
              AND status IN ('active', 'partial')
              AND remaining_amount > 0
              AND expires_at > $2
              AND expires_at <= $3
            ORDER BY owner_id, expires_at
            "#
        ))
        .bind(owner_type.as_str())
        .bind(from)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditBatch::try_from).collect()
    }

    async fn batches_for_reference(
        &self,
        source_type: CreditSourceType,
        source_reference_id: Uuid,
    ) -> BillingResult<Vec<CreditBatch>> {
        let rows: Vec<BatchRow> = sqlx::query_as(&format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM credit_batches
            WHERE source_type = $1 AND source_reference_id = $2
            ORDER BY created_at
            "#
        ))
        .bind(source_type.as_str())
        .bind(source_reference_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditBatch::try_from).collect()
    }
}
