//! Plans, price resolution and subscription links
//!
//! The payer's current plan reference lives on the profile (individuals) or
//! the organization row. Only webhook handlers write these links.

use async_trait::async_trait;
use coachledger_shared::{OwnerRef, OwnerType};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Organization subscription states we record
pub const ORG_SUBSCRIPTION_ACTIVE: &str = "active";
pub const ORG_SUBSCRIPTION_CANCELED: &str = "canceled";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    pub monthly_credit_allowance: i64,
}

/// Owner with a live subscription and the allowance of its plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOwner {
    pub owner: OwnerRef,
    pub plan_id: Uuid,
    pub monthly_credit_allowance: i64,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Resolve a gateway price to a plan
    async fn plan_for_price(&self, price_id: &str) -> BillingResult<Option<Plan>>;

    async fn plan_by_key(&self, key: &str) -> BillingResult<Option<Plan>>;

    /// Point a user's plan reference at `plan_id`
    async fn set_user_plan(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        subscription_id: Option<&str>,
    ) -> BillingResult<()>;

    /// Link a subscription to an organization and record its status
    async fn link_org_subscription(
        &self,
        org_id: Uuid,
        subscription_id: &str,
        status: &str,
        plan_id: Option<Uuid>,
    ) -> BillingResult<()>;

    /// Update the status of whichever organization holds the subscription.
    /// Returns false when no organization does.
    async fn set_org_subscription_status(
        &self,
        subscription_id: &str,
        status: &str,
    ) -> BillingResult<bool>;

    async fn user_for_subscription(&self, subscription_id: &str) -> BillingResult<Option<Uuid>>;

    async fn org_for_subscription(&self, subscription_id: &str) -> BillingResult<Option<Uuid>>;

    /// Owners whose active plan carries a periodic allowance
    async fn active_subscription_owners(&self) -> BillingResult<Vec<SubscriptionOwner>>;

    /// Users who should hear about an owner's credits
    async fn recipients_for(&self, owner: OwnerRef) -> BillingResult<Vec<Uuid>>;
}

#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn plan_for_price(&self, price_id: &str) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            r#"
            SELECT p.id, p.key, p.name, p.monthly_credit_allowance
            FROM plan_prices pp
            JOIN plans p ON p.id = pp.plan_id
            WHERE pp.stripe_price_id = $1
            "#,
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    async fn plan_by_key(&self, key: &str) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            "SELECT id, key, name, monthly_credit_allowance FROM plans WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    async fn set_user_plan(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        subscription_id: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, plan_id, stripe_subscription_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn link_org_subscription(
        &self,
        org_id: Uuid,
        subscription_id: &str,
        status: &str,
        plan_id: Option<Uuid>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE organizations
            SET stripe_subscription_id = $2,
                subscription_status = $3,
                plan_id = COALESCE($4, plan_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .bind(subscription_id)
        .bind(status)
        .bind(plan_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_org_subscription_status(
        &self,
        subscription_id: &str,
        status: &str,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET subscription_status = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn user_for_subscription(&self, subscription_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM profiles WHERE stripe_subscription_id = $1")
                .bind(subscription_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn org_for_subscription(&self, subscription_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM organizations WHERE stripe_subscription_id = $1")
                .bind(subscription_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn active_subscription_owners(&self) -> BillingResult<Vec<SubscriptionOwner>> {
        let rows: Vec<(String, Uuid, Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT 'user' AS owner_type, pr.id, p.id, p.monthly_credit_allowance
            FROM profiles pr
            JOIN plans p ON p.id = pr.plan_id
            WHERE pr.stripe_subscription_id IS NOT NULL
              AND p.monthly_credit_allowance > 0
            UNION ALL
            SELECT 'org' AS owner_type, o.id, p.id, p.monthly_credit_allowance
            FROM organizations o
            JOIN plans p ON p.id = o.plan_id
            WHERE o.subscription_status = 'active'
              AND p.monthly_credit_allowance > 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(owner_type, owner_id, plan_id, allowance)| {
                Ok(SubscriptionOwner {
                    owner: OwnerRef {
                        owner_type: owner_type.parse()?,
                        owner_id,
                    },
                    plan_id,
                    monthly_credit_allowance: allowance,
                })
            })
            .collect()
    }

    async fn recipients_for(&self, owner: OwnerRef) -> BillingResult<Vec<Uuid>> {
        match owner.owner_type {
            OwnerType::User => Ok(vec![owner.owner_id]),
            OwnerType::Org => {
                let rows: Vec<(Uuid,)> = sqlx::query_as(
                    r#"
                    SELECT user_id
                    FROM organization_members
                    WHERE org_id = $1 AND role IN ('owner', 'admin')
                    ORDER BY user_id
                    "#,
                )
                .bind(owner.owner_id)
                .fetch_all(&self.pool)
                .await?;

                Ok(rows.into_iter().map(|(id,)| id).collect())
            }
        }
    }
}
