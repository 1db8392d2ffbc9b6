//! In-app notification records
//!
//! Rendering and delivery happen elsewhere; this module only writes the row
//! and answers the dedup question.

use async_trait::async_trait;
use coachledger_shared::OwnerRef;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::effects::SideEffect;
use crate::error::BillingResult;

pub const TYPE_CREDITS_EXPIRING: &str = "credits_expiring";
pub const TYPE_CREDITS_ADDED: &str = "credits_added";

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub type_key: String,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn create_notification(&self, notification: NewNotification) -> BillingResult<Uuid>;

    /// Whether the user received a notification with this title about
    /// `owner` since `since`
    ///
    /// The owner is matched on the `owner_type`/`owner_id` metadata keys.
    async fn was_notified_since(
        &self,
        user_id: Uuid,
        title: &str,
        owner: OwnerRef,
        since: OffsetDateTime,
    ) -> BillingResult<bool>;
}

/// Create a notification without letting a failure escape
pub async fn notify(notifier: &dyn Notifier, notification: NewNotification) -> SideEffect {
    let user_id = notification.user_id;
    let type_key = notification.type_key.clone();

    match notifier.create_notification(notification).await {
        Ok(id) => {
            tracing::debug!(
                user_id = %user_id,
                notification_id = %id,
                type_key = %type_key,
                "Notification created"
            );
            SideEffect::Done
        }
        Err(e) => {
            tracing::warn!(
                user_id = %user_id,
                type_key = %type_key,
                error = %e,
                "Failed to create notification"
            );
            SideEffect::Failed(e.to_string())
        }
    }
}

#[derive(Clone)]
pub struct PgNotifier {
    pool: PgPool,
}

impl PgNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn create_notification(&self, notification: NewNotification) -> BillingResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO notifications (user_id, type_key, title, message, link, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(notification.user_id)
        .bind(&notification.type_key)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.link)
        .bind(&notification.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn was_notified_since(
        &self,
        user_id: Uuid,
        title: &str,
        owner: OwnerRef,
        since: OffsetDateTime,
    ) -> BillingResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM notifications
                WHERE user_id = $1
                  AND title = $2
                  AND metadata->>'owner_type' = $3
                  AND metadata->>'owner_id' = $4
                  AND created_at >= $5
            )
            "#,
        )
        .bind(user_id)
        .bind(title)
        .bind(owner.owner_type.as_str())
        .bind(owner.owner_id.to_string())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}
