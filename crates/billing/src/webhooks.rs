//! Stripe webhook handling
//!
//! Verifies the signature over the raw body, claims the event id so a
//! redelivery is not processed twice, then routes the event to the plan,
//! purchase and installment handlers. Every handler is idempotent on its
//! own; the event claim only saves repeated work.

use std::sync::Arc;

use async_trait::async_trait;
use coachledger_shared::OwnerRef;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::accounts::{AccountStore, ORG_SUBSCRIPTION_ACTIVE, ORG_SUBSCRIPTION_CANCELED};
use crate::config::BillingConfig;
use crate::confirmation::PurchaseReconciler;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    metadata_i64, metadata_uuid, metadata_uuid_opt, CheckoutSession, EventEnvelope, GatewayEvent,
    Invoice, PurchaseType, Subscription, SubscriptionStatus,
};
use crate::gateway::PaymentGateway;
use crate::ledger::add_months;
use crate::purchases::PurchaseStore;
use crate::schedules::{InstallmentPlan, InstallmentScheduleManager, NewSchedule};

type HmacSha256 = Hmac<Sha256>;

/// Events stuck in `processing` longer than this may be claimed again
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Compute the `v1` signature for a payload
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `t=<ts>,v1=<hex>` signature header against the raw payload
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => candidates.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if now.abs_diff(timestamp) > u64::try_from(tolerance_secs).unwrap_or(0) {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = compute_signature(secret, timestamp, payload)?;
    let matched = candidates
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Result of an attempt to claim an event for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventClaim {
    Claimed,
    /// Another delivery holds or finished the event; carries its recorded result
    Duplicate(String),
}

#[async_trait]
pub trait WebhookEventLog: Send + Sync {
    /// Atomically claim an event id. Failed and stuck events can be claimed again.
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<EventClaim>;

    async fn record_result(&self, event_id: &str, error: Option<&str>) -> BillingResult<()>;
}

/// Outcome of a verified delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    webhook_secret: String,
    tolerance_secs: i64,
    events: Arc<dyn WebhookEventLog>,
    gateway: Arc<dyn PaymentGateway>,
    accounts: Arc<dyn AccountStore>,
    purchases: Arc<dyn PurchaseStore>,
    reconciler: PurchaseReconciler,
    schedules: InstallmentScheduleManager,
    config: Arc<BillingConfig>,
}

impl WebhookHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        webhook_secret: String,
        tolerance_secs: i64,
        events: Arc<dyn WebhookEventLog>,
        gateway: Arc<dyn PaymentGateway>,
        accounts: Arc<dyn AccountStore>,
        purchases: Arc<dyn PurchaseStore>,
        reconciler: PurchaseReconciler,
        schedules: InstallmentScheduleManager,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            webhook_secret,
            tolerance_secs,
            events,
            gateway,
            accounts,
            purchases,
            reconciler,
            schedules,
            config,
        }
    }

    /// Verify the signature, then parse the envelope
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<EventEnvelope> {
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            self.tolerance_secs,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::InvalidInput(format!("Malformed event: {}", e))
        })
    }

    /// Verify and process a raw delivery
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<WebhookOutcome> {
        let envelope = self.verify_event(payload, signature)?;
        self.handle_event(envelope).await
    }

    /// Handle a verified event under an exclusive claim on its id
    pub async fn handle_event(&self, envelope: EventEnvelope) -> BillingResult<WebhookOutcome> {
        let event_timestamp = GatewayEvent::created_at(&envelope);

        match self
            .events
            .claim(&envelope.id, &envelope.event_type, event_timestamp)
            .await?
        {
            EventClaim::Claimed => {}
            EventClaim::Duplicate(status) => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    status = %status,
                    "Duplicate webhook event"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
        }

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            "Processing Stripe webhook event"
        );

        let result = match GatewayEvent::from_envelope(&envelope) {
            Ok(event) => self.dispatch(event).await,
            Err(e) => Err(e),
        };

        let error_message = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self
            .events
            .record_result(&envelope.id, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %envelope.id,
                error = %e,
                "Failed to record webhook result; event stays claimed until the processing timeout"
            );
        }

        if let Err(e) = &result {
            tracing::error!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                error = %e,
                "Webhook handler failed"
            );
        }

        result.map(|()| WebhookOutcome::Processed)
    }

    /// Route a typed event to its handler
    pub async fn dispatch(&self, event: GatewayEvent) -> BillingResult<()> {
        match event {
            GatewayEvent::CheckoutSessionCompleted(session) => {
                self.handle_checkout_completed(session).await
            }
            GatewayEvent::SubscriptionUpdated(subscription) => {
                self.handle_subscription_updated(subscription).await
            }
            GatewayEvent::SubscriptionDeleted(subscription) => {
                self.handle_subscription_deleted(subscription).await
            }
            GatewayEvent::InvoicePaid(invoice) => self.handle_invoice_paid(invoice).await,
            GatewayEvent::InvoicePaymentFailed(invoice) => {
                self.handle_invoice_payment_failed(invoice).await
            }
            GatewayEvent::Unhandled(event_type) => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event type");
                Ok(())
            }
        }
    }

    async fn handle_checkout_completed(&self, session: CheckoutSession) -> BillingResult<()> {
        match session.purchase_type() {
            PurchaseType::UserSubscription => self.activate_user_subscription(&session).await,
            PurchaseType::OrgPlatformSubscription => {
                self.activate_org_subscription(&session).await
            }
            PurchaseType::CreditInstallment => self.open_installment_plan(&session).await,
            PurchaseType::CreditPurchase | PurchaseType::OrgCreditPurchase => {
                let outcome = self.reconciler.complete_from_session(&session).await?;
                tracing::info!(
                    session_id = %session.id,
                    credits = outcome.credits_added,
                    already_processed = outcome.is_already_processed(),
                    "Checkout reconciled from webhook"
                );
                Ok(())
            }
            PurchaseType::Unrecognized(tag) => {
                tracing::warn!(
                    session_id = %session.id,
                    purchase_type = %tag,
                    "Ignoring checkout with unrecognized type"
                );
                Ok(())
            }
            PurchaseType::Untagged => {
                tracing::info!(session_id = %session.id, "Ignoring untagged checkout");
                Ok(())
            }
        }
    }

    fn session_subscription_id(session: &CheckoutSession) -> BillingResult<&str> {
        session.subscription.as_deref().ok_or_else(|| {
            BillingError::GatewayPayload(format!(
                "Checkout {} carries no subscription",
                session.id
            ))
        })
    }

    async fn activate_user_subscription(&self, session: &CheckoutSession) -> BillingResult<()> {
        let user_id = metadata_uuid(&session.metadata, "user_id")?;
        let subscription_id = Self::session_subscription_id(session)?;

        let subscription = self.gateway.retrieve_subscription(subscription_id).await?;
        let plan_id = self.resolve_plan(&subscription).await?;

        self.accounts
            .set_user_plan(user_id, plan_id, Some(subscription_id))
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            plan_id = %plan_id,
            "User subscription activated"
        );
        Ok(())
    }

    async fn activate_org_subscription(&self, session: &CheckoutSession) -> BillingResult<()> {
        let org_id = metadata_uuid(&session.metadata, "org_id")?;
        let subscription_id = Self::session_subscription_id(session)?;

        // The plan link is a convenience for allowance sweeps; the subscription id is what matters.
        let plan_id = match self.gateway.retrieve_subscription(subscription_id).await {
            Ok(subscription) => self.resolve_plan(&subscription).await.ok(),
            Err(e) => {
                tracing::warn!(
                    org_id = %org_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Could not fetch subscription to resolve org plan"
                );
                None
            }
        };

        self.accounts
            .link_org_subscription(org_id, subscription_id, ORG_SUBSCRIPTION_ACTIVE, plan_id)
            .await?;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription_id,
            "Organization subscription activated"
        );
        Ok(())
    }

    async fn open_installment_plan(&self, session: &CheckoutSession) -> BillingResult<()> {
        let metadata = &session.metadata;
        let subscription_id = Self::session_subscription_id(session)?;

        let user_id = metadata_uuid(metadata, "user_id")?;
        let owner = match metadata_uuid_opt(metadata, "org_id")? {
            Some(org_id) => OwnerRef::org(org_id),
            None => OwnerRef::user(user_id),
        };

        let package_id = metadata_uuid(metadata, "package_id")?;
        let package = self
            .purchases
            .find_package(package_id)
            .await?
            .ok_or(BillingError::PackageNotFound(package_id))?;

        let installment_count = i32::try_from(metadata_i64(metadata, "installment_count")?)
            .map_err(|_| BillingError::GatewayPayload("installment_count out of range".into()))?;
        let installment_amount = metadata_i64(metadata, "installment_amount")?;
        let total_amount = metadata_i64(metadata, "total_amount")
            .unwrap_or(installment_amount * i64::from(installment_count));

        let now = OffsetDateTime::now_utc();
        let validity = package
            .validity()
            .unwrap_or(self.config.default_validity_months);

        let opened = self
            .schedules
            .open(InstallmentPlan {
                schedule: NewSchedule {
                    owner,
                    package_id,
                    stripe_subscription_id: subscription_id.to_string(),
                    total_amount_minor_units: total_amount,
                    installment_count,
                    installment_amount_minor_units: installment_amount,
                    currency: session
                        .currency
                        .clone()
                        .unwrap_or_else(|| package.currency.clone()),
                    next_payment_date: Some(add_months(now, 1)),
                    credits_granted: package.credits,
                },
                feature_key: package.feature_key.clone(),
                expires_at: add_months(now, validity),
                package_name: package.name.clone(),
            })
            .await?;

        tracing::info!(
            session_id = %session.id,
            schedule_id = %opened.schedule.id,
            batch_id = %opened.batch_id,
            created = opened.created,
            "Installment checkout handled"
        );
        Ok(())
    }

    async fn handle_subscription_updated(&self, subscription: Subscription) -> BillingResult<()> {
        if subscription.status != SubscriptionStatus::Active {
            tracing::debug!(
                subscription_id = %subscription.id,
                status = ?subscription.status,
                "Ignoring non-active subscription update"
            );
            return Ok(());
        }

        match subscription.purchase_type() {
            PurchaseType::CreditInstallment => Ok(()),
            PurchaseType::OrgPlatformSubscription => {
                let Some(org_id) = self.org_for(&subscription).await? else {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        "No organization for updated subscription"
                    );
                    return Ok(());
                };
                let plan_id = self.resolve_plan(&subscription).await?;
                self.accounts
                    .link_org_subscription(
                        org_id,
                        &subscription.id,
                        ORG_SUBSCRIPTION_ACTIVE,
                        Some(plan_id),
                    )
                    .await?;
                tracing::info!(
                    org_id = %org_id,
                    plan_id = %plan_id,
                    "Organization plan updated"
                );
                Ok(())
            }
            _ => {
                let Some(user_id) = self.user_for(&subscription).await? else {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        "No user for updated subscription"
                    );
                    return Ok(());
                };
                let plan_id = self.resolve_plan(&subscription).await?;
                self.accounts
                    .set_user_plan(user_id, plan_id, Some(&subscription.id))
                    .await?;
                tracing::info!(
                    user_id = %user_id,
                    plan_id = %plan_id,
                    "User plan updated"
                );
                Ok(())
            }
        }
    }

    async fn handle_subscription_deleted(&self, subscription: Subscription) -> BillingResult<()> {
        if self.schedules.find(&subscription.id).await?.is_some() {
            let status = self.schedules.close_on_cancel(&subscription.id).await?;
            tracing::info!(
                subscription_id = %subscription.id,
                status = %status,
                "Installment subscription ended"
            );
            return Ok(());
        }

        if subscription.purchase_type() == PurchaseType::CreditInstallment {
            tracing::warn!(
                subscription_id = %subscription.id,
                "Installment subscription ended without a schedule"
            );
            return Ok(());
        }

        if subscription.purchase_type() == PurchaseType::OrgPlatformSubscription
            || self
                .accounts
                .org_for_subscription(&subscription.id)
                .await?
                .is_some()
        {
            let updated = self
                .accounts
                .set_org_subscription_status(&subscription.id, ORG_SUBSCRIPTION_CANCELED)
                .await?;
            tracing::info!(
                subscription_id = %subscription.id,
                updated = updated,
                "Organization subscription canceled"
            );
            return Ok(());
        }

        let Some(user_id) = self.user_for(&subscription).await? else {
            tracing::warn!(
                subscription_id = %subscription.id,
                "No owner for deleted subscription"
            );
            return Ok(());
        };

        let free_plan = self
            .accounts
            .plan_by_key(&self.config.free_plan_key)
            .await?
            .ok_or_else(|| {
                BillingError::Config(format!(
                    "Free plan '{}' is not configured",
                    self.config.free_plan_key
                ))
            })?;

        self.accounts
            .set_user_plan(user_id, free_plan.id, None)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "User downgraded to free plan"
        );
        Ok(())
    }

    async fn handle_invoice_paid(&self, invoice: Invoice) -> BillingResult<()> {
        let Some(subscription_id) = self.installment_subscription(&invoice).await? else {
            return Ok(());
        };

        if invoice.is_first_invoice() {
            tracing::debug!(
                invoice_id = %invoice.id,
                "First installment is counted at checkout"
            );
            return Ok(());
        }

        let progress = self
            .schedules
            .record_payment(
                &subscription_id,
                &invoice.id,
                invoice.amount_paid,
                invoice.billing_period_end(),
            )
            .await?;

        tracing::info!(
            invoice_id = %invoice.id,
            subscription_id = %subscription_id,
            installments_paid = progress.installments_paid,
            installment_count = progress.installment_count,
            complete = progress.schedule_complete,
            "Installment invoice paid"
        );
        Ok(())
    }

    async fn handle_invoice_payment_failed(&self, invoice: Invoice) -> BillingResult<()> {
        let Some(subscription_id) = self.installment_subscription(&invoice).await? else {
            return Ok(());
        };

        let outcome = self.schedules.record_failure(&subscription_id).await?;
        tracing::warn!(
            invoice_id = %invoice.id,
            subscription_id = %subscription_id,
            locked = outcome.locked,
            "Installment invoice payment failed"
        );
        Ok(())
    }

    /// Subscription id of an invoice that belongs to an installment plan
    async fn installment_subscription(&self, invoice: &Invoice) -> BillingResult<Option<String>> {
        let Some(subscription_id) = invoice.subscription_id() else {
            return Ok(None);
        };

        let tagged = invoice
            .subscription_metadata()
            .map(PurchaseType::from_metadata);

        if let Some(purchase_type) = &tagged {
            if *purchase_type != PurchaseType::CreditInstallment {
                return Ok(None);
            }
        }

        if self.schedules.find(subscription_id).await?.is_some() {
            return Ok(Some(subscription_id.to_string()));
        }

        match tagged {
            // Tagged as installment but the checkout has not been processed yet:
            // fail so the gateway redelivers.
            Some(_) if !invoice.is_first_invoice() => {
                Err(BillingError::ScheduleNotFound(subscription_id.to_string()))
            }
            _ => Ok(None),
        }
    }

    async fn resolve_plan(&self, subscription: &Subscription) -> BillingResult<Uuid> {
        let price_id = subscription.current_price_id().ok_or_else(|| {
            BillingError::GatewayPayload(format!(
                "Subscription {} has no price",
                subscription.id
            ))
        })?;

        let plan = self
            .accounts
            .plan_for_price(price_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan for price {}", price_id)))?;

        Ok(plan.id)
    }

    async fn user_for(&self, subscription: &Subscription) -> BillingResult<Option<Uuid>> {
        match metadata_uuid_opt(&subscription.metadata, "user_id")? {
            Some(id) => Ok(Some(id)),
            None => self.accounts.user_for_subscription(&subscription.id).await,
        }
    }

    async fn org_for(&self, subscription: &Subscription) -> BillingResult<Option<Uuid>> {
        match metadata_uuid_opt(&subscription.metadata, "org_id")? {
            Some(id) => Ok(Some(id)),
            None => self.accounts.org_for_subscription(&subscription.id).await,
        }
    }
}

/// Event log backed by `stripe_webhook_events`
#[derive(Clone)]
pub struct PgWebhookEventLog {
    pool: PgPool,
}

impl PgWebhookEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventLog for PgWebhookEventLog {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(EventClaim::Duplicate(
            existing
                .map(|(status,)| status)
                .unwrap_or_else(|| "unknown".to_string()),
        ))
    }

    async fn record_result(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        let processing_result = if error.is_some() { "error" } else { "success" };

        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(error)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
