//! Payment gateway access
//!
//! Reconciliation only needs three calls from the gateway. They sit behind a
//! trait so the engine can be exercised without network access.

use async_trait::async_trait;
use stripe::{CancelSubscription, CheckoutSessionId, StripeError, SubscriptionId};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutPaymentStatus, CheckoutSession, Price, Subscription, SubscriptionItem,
    SubscriptionItems, SubscriptionStatus,
};

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Fetch a checkout session by id
    async fn retrieve_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSession>;

    /// Fetch a subscription by id
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<Subscription>;

    /// Cancel a subscription immediately
    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()>;
}

fn is_not_found(err: &StripeError) -> bool {
    matches!(err, StripeError::Stripe(req) if req.http_status == 404)
}

impl From<stripe::CheckoutSession> for CheckoutSession {
    fn from(session: stripe::CheckoutSession) -> Self {
        CheckoutSession {
            id: session.id.to_string(),
            payment_status: CheckoutPaymentStatus::from_gateway(session.payment_status.as_str()),
            metadata: session.metadata.unwrap_or_default(),
            amount_total: session.amount_total,
            currency: session.currency.map(|c| c.to_string()),
            payment_intent: session.payment_intent.map(|pi| pi.id().to_string()),
            subscription: session.subscription.map(|sub| sub.id().to_string()),
        }
    }
}

impl From<stripe::Subscription> for Subscription {
    fn from(subscription: stripe::Subscription) -> Self {
        let items = subscription
            .items
            .data
            .iter()
            .map(|item| SubscriptionItem {
                price: item.price.as_ref().map(|p| Price {
                    id: p.id.to_string(),
                }),
            })
            .collect();

        Subscription {
            id: subscription.id.to_string(),
            status: SubscriptionStatus::from_gateway(subscription.status.as_str()),
            metadata: subscription.metadata.clone(),
            items: SubscriptionItems { data: items },
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn retrieve_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSession> {
        let id: CheckoutSessionId = session_id.parse().map_err(|e| {
            BillingError::InvalidInput(format!("Invalid checkout session id: {}", e))
        })?;

        let session = stripe::CheckoutSession::retrieve(self.inner(), &id, &[])
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    BillingError::CheckoutSessionNotFound(session_id.to_string())
                } else {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to retrieve checkout session from Stripe"
                    );
                    BillingError::from(e)
                }
            })?;

        Ok(CheckoutSession::from(session))
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        let id: SubscriptionId = subscription_id.parse().map_err(|e| {
            BillingError::GatewayPayload(format!("Invalid subscription id: {}", e))
        })?;

        let subscription = stripe::Subscription::retrieve(self.inner(), &id, &[])
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    BillingError::NotFound(format!("subscription {}", subscription_id))
                } else {
                    BillingError::from(e)
                }
            })?;

        Ok(Subscription::from(subscription))
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let id: SubscriptionId = subscription_id.parse().map_err(|e| {
            BillingError::GatewayPayload(format!("Invalid subscription id: {}", e))
        })?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        stripe::Subscription::cancel(self.inner(), &id, params).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            "Cancelled Stripe subscription"
        );

        Ok(())
    }
}
