//! Credit packages and purchase records
//!
//! `checkout_session_id` is the idempotency key for a purchase. Transitions
//! are status-scoped so that when several callers race on the same session,
//! exactly one write takes effect and the rest observe it on re-read.

use async_trait::async_trait;
use coachledger_shared::{OwnerRef, PurchaseStatus};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A purchasable bundle of credits
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CreditPackage {
    pub id: Uuid,
    pub name: String,
    pub credits: i64,
    pub price_minor_units: i64,
    pub currency: String,
    pub validity_months: Option<i32>,
    pub feature_key: Option<String>,
    pub is_active: bool,
}

impl CreditPackage {
    /// Validity in months if the package sets a usable one
    pub fn validity(&self) -> Option<u32> {
        self.validity_months
            .and_then(|m| u32::try_from(m).ok())
            .filter(|m| *m > 0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseRecord {
    pub id: Uuid,
    pub owner: OwnerRef,
    pub purchaser_user_id: Uuid,
    pub package_id: Uuid,
    pub credits_purchased: i64,
    pub amount_minor_units: i64,
    pub currency: String,
    pub checkout_session_id: String,
    pub payment_intent_id: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub status: PurchaseStatus,
    pub completed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl PurchaseRecord {
    pub fn is_completed(&self) -> bool {
        self.status == PurchaseStatus::Completed
    }
}

/// Fields supplied when a purchase row is first written
#[derive(Debug, Clone)]
pub struct NewPurchase {
    pub owner: OwnerRef,
    pub purchaser_user_id: Uuid,
    pub package_id: Uuid,
    pub credits_purchased: i64,
    pub amount_minor_units: i64,
    pub currency: String,
    pub checkout_session_id: String,
    pub payment_intent_id: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

impl NewPurchase {
    pub fn validate(&self) -> BillingResult<()> {
        if self.checkout_session_id.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "checkout_session_id is required".to_string(),
            ));
        }
        if self.credits_purchased <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "credits_purchased must be positive, got {}",
                self.credits_purchased
            )));
        }
        Ok(())
    }

    pub(crate) fn into_record(
        self,
        id: Uuid,
        status: PurchaseStatus,
        now: OffsetDateTime,
    ) -> PurchaseRecord {
        PurchaseRecord {
            id,
            owner: self.owner,
            purchaser_user_id: self.purchaser_user_id,
            package_id: self.package_id,
            credits_purchased: self.credits_purchased,
            amount_minor_units: self.amount_minor_units,
            currency: self.currency,
            checkout_session_id: self.checkout_session_id,
            payment_intent_id: self.payment_intent_id,
            expires_at: self.expires_at,
            status,
            completed_at: (status == PurchaseStatus::Completed).then_some(now),
            created_at: now,
        }
    }
}

#[async_trait]
pub trait PurchaseStore: Send + Sync {
    async fn find_package(&self, package_id: Uuid) -> BillingResult<Option<CreditPackage>>;

    async fn find_by_session(&self, session_id: &str) -> BillingResult<Option<PurchaseRecord>>;

    /// Record a pending purchase, or return the row already holding the session
    async fn create_pending(&self, purchase: NewPurchase) -> BillingResult<PurchaseRecord>;

    /// Move a pending row to completed. `None` when no pending row was there to move.
    async fn complete_pending(
        &self,
        session_id: &str,
        payment_intent_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseRecord>>;

    /// Insert directly as completed. `None` when another writer already holds the session.
    async fn insert_completed(
        &self,
        purchase: NewPurchase,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseRecord>>;
}

#[derive(Debug, sqlx::FromRow)]
struct PurchaseRow {
    id: Uuid,
    owner_type: String,
    owner_id: Uuid,
    purchaser_user_id: Uuid,
    package_id: Uuid,
    credits_purchased: i64,
    amount_minor_units: i64,
    currency: String,
    checkout_session_id: String,
    payment_intent_id: Option<String>,
    expires_at: Option<OffsetDateTime>,
    status: String,
    completed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<PurchaseRow> for PurchaseRecord {
    type Error = BillingError;

    fn try_from(row: PurchaseRow) -> Result<Self, Self::Error> {
        Ok(PurchaseRecord {
            id: row.id,
            owner: OwnerRef {
                owner_type: row.owner_type.parse()?,
                owner_id: row.owner_id,
            },
            purchaser_user_id: row.purchaser_user_id,
            package_id: row.package_id,
            credits_purchased: row.credits_purchased,
            amount_minor_units: row.amount_minor_units,
            currency: row.currency,
            checkout_session_id: row.checkout_session_id,
            payment_intent_id: row.payment_intent_id,
            expires_at: row.expires_at,
            status: row.status.parse()?,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

const PURCHASE_COLUMNS: &str = "id, owner_type, owner_id, purchaser_user_id, package_id, \
     credits_purchased, amount_minor_units, currency, checkout_session_id, payment_intent_id, \
     expires_at, status, completed_at, created_at";

#[derive(Clone)]
pub struct PgPurchaseStore {
    pool: PgPool,
}

impl PgPurchaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(
        &self,
        purchase: &NewPurchase,
        status: PurchaseStatus,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseRecord>> {
        let completed_at = (status == PurchaseStatus::Completed).then_some(now);

        let row: Option<PurchaseRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO credit_purchases (
                owner_type, owner_id, purchaser_user_id, package_id, credits_purchased,
                amount_minor_units, currency, checkout_session_id, payment_intent_id,
                expires_at, status, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (checkout_session_id) DO NOTHING
            RETURNING {PURCHASE_COLUMNS}
            "#
        ))
        .bind(purchase.owner.owner_type.as_str())
        .bind(purchase.owner.owner_id)
        .bind(purchase.purchaser_user_id)
        .bind(purchase.package_id)
        .bind(purchase.credits_purchased)
        .bind(purchase.amount_minor_units)
        .bind(&purchase.currency)
        .bind(&purchase.checkout_session_id)
        .bind(&purchase.payment_intent_id)
        .bind(purchase.expires_at)
        .bind(status.as_str())
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PurchaseRecord::try_from).transpose()
    }
}

#[async_trait]
impl PurchaseStore for PgPurchaseStore {
    async fn find_package(&self, package_id: Uuid) -> BillingResult<Option<CreditPackage>> {
        let package = sqlx::query_as::<_, CreditPackage>(
            r#"
            SELECT id, name, credits, price_minor_units, currency, validity_months,
                   feature_key, is_active
            FROM credit_packages
            WHERE id = $1
            "#,
        )
        .bind(package_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(package)
    }

    async fn find_by_session(&self, session_id: &str) -> BillingResult<Option<PurchaseRecord>> {
        let row: Option<PurchaseRow> = sqlx::query_as(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM credit_purchases WHERE checkout_session_id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PurchaseRecord::try_from).transpose()
    }

    async fn create_pending(&self, purchase: NewPurchase) -> BillingResult<PurchaseRecord> {
        purchase.validate()?;

        if let Some(record) = self
            .insert(&purchase, PurchaseStatus::Pending, OffsetDateTime::now_utc())
            .await?
        {
            return Ok(record);
        }

        self.find_by_session(&purchase.checkout_session_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "Purchase for session {} vanished after conflict",
                    purchase.checkout_session_id
                ))
            })
    }

    async fn complete_pending(
        &self,
        session_id: &str,
        payment_intent_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseRecord>> {
        let row: Option<PurchaseRow> = sqlx::query_as(&format!(
            r#"
            UPDATE credit_purchases
            SET status = 'completed',
                completed_at = $2,
                payment_intent_id = COALESCE($3, payment_intent_id)
            WHERE checkout_session_id = $1
              AND status = 'pending'
            RETURNING {PURCHASE_COLUMNS}
            "#
        ))
        .bind(session_id)
        .bind(now)
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PurchaseRecord::try_from).transpose()
    }

    async fn insert_completed(
        &self,
        purchase: NewPurchase,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseRecord>> {
        purchase.validate()?;
        self.insert(&purchase, PurchaseStatus::Completed, now).await
    }
}
