//! Purchase reconciliation
//!
//! A paid checkout reaches us twice: the payer is redirected back to
//! `confirm`, and the gateway independently sends `checkout.session.completed`.
//! Both paths run the same reconciliation so that each session produces
//! exactly one completed purchase and exactly one credit batch:
//!
//! 1. **Fast path**: the purchase is already completed, return what it granted.
//! 2. **Race path**: a pending purchase exists, move it to completed with a
//!    status-scoped update. The loser re-reads and takes the fast path.
//! 3. **Bootstrap path**: no purchase yet, insert it as completed keyed on the
//!    session id. A conflicting insert re-reads and takes the fast path.
//!
//! The grant itself is keyed on the purchase id, so a crash between marking
//! the purchase completed and granting is repaired by the next caller.

use std::sync::Arc;

use coachledger_shared::{CreditSourceType, OwnerRef};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{metadata_uuid, metadata_uuid_opt, CheckoutSession, PurchaseType};
use crate::gateway::PaymentGateway;
use crate::ledger::{add_months, CreditLedger, GrantRequest};
use crate::notifications::{notify, NewNotification, Notifier, TYPE_CREDITS_ADDED};
use crate::purchases::{CreditPackage, NewPurchase, PurchaseRecord, PurchaseStore};

/// Re-read rounds before giving up on a session that keeps changing
const MAX_RECONCILE_ATTEMPTS: usize = 3;

/// Response of a confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmOutcome {
    pub success: bool,
    pub credits_added: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_processed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    /// Gateway payment status when the checkout is not paid yet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ConfirmOutcome {
    fn granted(credits: i64, batch_id: Uuid) -> Self {
        Self {
            success: true,
            credits_added: credits,
            already_processed: None,
            batch_id: Some(batch_id),
            status: None,
        }
    }

    fn already_processed(credits: i64, batch_id: Uuid) -> Self {
        Self {
            already_processed: Some(true),
            ..Self::granted(credits, batch_id)
        }
    }

    fn not_paid(status: &str) -> Self {
        Self {
            success: false,
            credits_added: 0,
            already_processed: None,
            batch_id: None,
            status: Some(status.to_string()),
        }
    }

    pub fn is_already_processed(&self) -> bool {
        self.already_processed == Some(true)
    }
}

/// Who paid, and whose ledger receives the credits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurchaseIdentity {
    pub purchaser_user_id: Uuid,
    pub owner: OwnerRef,
    pub package_id: Uuid,
}

impl PurchaseIdentity {
    /// Read the identity recorded in checkout metadata
    pub fn from_session(session: &CheckoutSession) -> BillingResult<Self> {
        let purchase_type = session.purchase_type();
        if !purchase_type.is_credit_purchase() {
            return Err(BillingError::UnsupportedPurchaseType(
                purchase_type.as_str().to_string(),
            ));
        }

        let purchaser_user_id = metadata_uuid(&session.metadata, "user_id")?;
        let package_id = metadata_uuid(&session.metadata, "package_id")?;

        let owner = match purchase_type {
            PurchaseType::OrgCreditPurchase => {
                let org_id = metadata_uuid_opt(&session.metadata, "org_id")?.ok_or_else(|| {
                    BillingError::InvalidInput(
                        "Organization purchase is missing org_id".to_string(),
                    )
                })?;
                OwnerRef::org(org_id)
            }
            _ => OwnerRef::user(purchaser_user_id),
        };

        Ok(Self {
            purchaser_user_id,
            owner,
            package_id,
        })
    }
}

/// Converts confirmed checkouts into purchases and ledger grants
#[derive(Clone)]
pub struct PurchaseReconciler {
    gateway: Arc<dyn PaymentGateway>,
    purchases: Arc<dyn PurchaseStore>,
    ledger: Arc<dyn CreditLedger>,
    notifier: Arc<dyn Notifier>,
    config: Arc<BillingConfig>,
}

impl PurchaseReconciler {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        purchases: Arc<dyn PurchaseStore>,
        ledger: Arc<dyn CreditLedger>,
        notifier: Arc<dyn Notifier>,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            gateway,
            purchases,
            ledger,
            notifier,
            config,
        }
    }

    /// Record a pending purchase when checkout starts
    pub async fn begin_purchase(
        &self,
        identity: PurchaseIdentity,
        checkout_session_id: &str,
    ) -> BillingResult<PurchaseRecord> {
        let package = self.active_package(identity.package_id).await?;
        let now = OffsetDateTime::now_utc();

        let record = self
            .purchases
            .create_pending(NewPurchase {
                owner: identity.owner,
                purchaser_user_id: identity.purchaser_user_id,
                package_id: package.id,
                credits_purchased: package.credits,
                amount_minor_units: package.price_minor_units,
                currency: package.currency.clone(),
                checkout_session_id: checkout_session_id.to_string(),
                payment_intent_id: None,
                expires_at: Some(self.expiry_for(&package, now)),
            })
            .await?;

        tracing::info!(
            session_id = %checkout_session_id,
            owner = %identity.owner,
            package_id = %package.id,
            "Recorded pending purchase"
        );

        Ok(record)
    }

    /// Confirm a checkout on behalf of the authenticated payer
    pub async fn confirm(&self, session_id: &str, caller: Uuid) -> BillingResult<ConfirmOutcome> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(BillingError::InvalidInput("sessionId is required".to_string()));
        }

        let session = self.gateway.retrieve_checkout_session(session_id).await?;
        let identity = PurchaseIdentity::from_session(&session)?;

        if identity.purchaser_user_id != caller {
            tracing::warn!(
                session_id = %session_id,
                caller = %caller,
                payer = %identity.purchaser_user_id,
                "Confirmation attempted by someone other than the payer"
            );
            return Err(BillingError::PayerMismatch(
                "Checkout session belongs to another payer".to_string(),
            ));
        }

        if !session.is_paid() {
            tracing::info!(
                session_id = %session_id,
                payment_status = session.payment_status.as_str(),
                "Checkout not paid yet"
            );
            return Ok(ConfirmOutcome::not_paid(session.payment_status.as_str()));
        }

        self.reconcile(&session, identity).await
    }

    /// Complete a purchase from a `checkout.session.completed` event
    pub async fn complete_from_session(
        &self,
        session: &CheckoutSession,
    ) -> BillingResult<ConfirmOutcome> {
        let identity = PurchaseIdentity::from_session(session)?;

        if !session.is_paid() {
            tracing::info!(
                session_id = %session.id,
                payment_status = session.payment_status.as_str(),
                "Completed checkout is not paid, waiting for payment"
            );
            return Ok(ConfirmOutcome::not_paid(session.payment_status.as_str()));
        }

        self.reconcile(session, identity).await
    }

    async fn reconcile(
        &self,
        session: &CheckoutSession,
        identity: PurchaseIdentity,
    ) -> BillingResult<ConfirmOutcome> {
        let now = OffsetDateTime::now_utc();

        for _ in 0..MAX_RECONCILE_ATTEMPTS {
            match self.purchases.find_by_session(&session.id).await? {
                Some(record) if record.is_completed() => {
                    return self.replay(record).await;
                }
                Some(_pending) => {
                    match self
                        .purchases
                        .complete_pending(&session.id, session.payment_intent.as_deref(), now)
                        .await?
                    {
                        Some(record) => return self.grant(record, now).await,
                        None => {
                            tracing::debug!(
                                session_id = %session.id,
                                "Lost completion race, re-reading"
                            );
                        }
                    }
                }
                None => {
                    let package = self.active_package(identity.package_id).await?;
                    let purchase = NewPurchase {
                        owner: identity.owner,
                        purchaser_user_id: identity.purchaser_user_id,
                        package_id: package.id,
                        credits_purchased: package.credits,
                        amount_minor_units: session
                            .amount_total
                            .unwrap_or(package.price_minor_units),
                        currency: session
                            .currency
                            .clone()
                            .unwrap_or_else(|| package.currency.clone()),
                        checkout_session_id: session.id.clone(),
                        payment_intent_id: session.payment_intent.clone(),
                        expires_at: Some(self.expiry_for(&package, now)),
                    };

                    match self.purchases.insert_completed(purchase, now).await? {
                        Some(record) => return self.grant(record, now).await,
                        None => {
                            tracing::debug!(
                                session_id = %session.id,
                                "Purchase bootstrapped concurrently, re-reading"
                            );
                        }
                    }
                }
            }
        }

        Err(BillingError::Internal(format!(
            "Purchase for session {} did not settle",
            session.id
        )))
    }

    /// Fast path. Normally read-only; re-grants only if a previous caller
    /// completed the purchase but never reached the grant.
    async fn replay(&self, record: PurchaseRecord) -> BillingResult<ConfirmOutcome> {
        let batches = self
            .ledger
            .batches_for_reference(CreditSourceType::Purchase, record.id)
            .await?;

        let batch_id = match batches.first() {
            Some(batch) => batch.id,
            None => {
                tracing::warn!(
                    session_id = %record.checkout_session_id,
                    purchase_id = %record.id,
                    "Completed purchase has no batch, granting now"
                );
                let outcome = self.grant(record.clone(), OffsetDateTime::now_utc()).await?;
                outcome.batch_id.unwrap_or_default()
            }
        };

        tracing::info!(
            session_id = %record.checkout_session_id,
            credits = record.credits_purchased,
            "Purchase already processed"
        );

        Ok(ConfirmOutcome::already_processed(
            record.credits_purchased,
            batch_id,
        ))
    }

    async fn grant(
        &self,
        record: PurchaseRecord,
        now: OffsetDateTime,
    ) -> BillingResult<ConfirmOutcome> {
        let package = self.purchases.find_package(record.package_id).await?;
        let expires_at = match (record.expires_at, package.as_ref()) {
            (Some(at), _) => at,
            (None, Some(package)) => self.expiry_for(package, now),
            (None, None) => add_months(now, self.config.default_validity_months),
        };

        let grant = self
            .ledger
            .grant_batch(GrantRequest {
                owner: record.owner,
                amount: record.credits_purchased,
                expires_at,
                source_type: CreditSourceType::Purchase,
                feature_key: package.as_ref().and_then(|p| p.feature_key.clone()),
                source_reference_id: record.id,
                description: package
                    .as_ref()
                    .map(|p| format!("Purchase: {}", p.name))
                    .unwrap_or_else(|| "Credit purchase".to_string()),
            })
            .await?;

        tracing::info!(
            session_id = %record.checkout_session_id,
            owner = %record.owner,
            purchase_id = %record.id,
            batch_id = %grant.batch_id,
            credits = record.credits_purchased,
            "Purchase completed"
        );

        if grant.created {
            notify(
                self.notifier.as_ref(),
                NewNotification {
                    user_id: record.purchaser_user_id,
                    type_key: TYPE_CREDITS_ADDED.to_string(),
                    title: "Credits added".to_string(),
                    message: format!(
                        "{} credits were added to your balance.",
                        record.credits_purchased
                    ),
                    link: Some(self.config.credits_link.clone()),
                    metadata: serde_json::json!({
                        "purchase_id": record.id,
                        "batch_id": grant.batch_id,
                        "owner_type": record.owner.owner_type,
                        "owner_id": record.owner.owner_id,
                    }),
                },
            )
            .await;
        }

        Ok(ConfirmOutcome::granted(
            record.credits_purchased,
            grant.batch_id,
        ))
    }

    async fn active_package(&self, package_id: Uuid) -> BillingResult<CreditPackage> {
        match self.purchases.find_package(package_id).await? {
            Some(package) if package.is_active => Ok(package),
            _ => Err(BillingError::PackageNotFound(package_id)),
        }
    }

    fn expiry_for(&self, package: &CreditPackage, now: OffsetDateTime) -> OffsetDateTime {
        add_months(
            now,
            package
                .validity()
                .unwrap_or(self.config.default_validity_months),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CheckoutPaymentStatus, Metadata};
    use crate::error::ErrorClass;

    fn session(metadata: &[(&str, String)]) -> CheckoutSession {
        CheckoutSession {
            id: "cs_test".to_string(),
            payment_status: CheckoutPaymentStatus::Paid,
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Metadata>(),
            amount_total: Some(5000),
            currency: Some("usd".to_string()),
            payment_intent: None,
            subscription: None,
        }
    }

    #[test]
    fn test_identity_for_org_purchase_targets_org_ledger() {
        let user = Uuid::new_v4();
        let org = Uuid::new_v4();
        let package = Uuid::new_v4();
        let identity = PurchaseIdentity::from_session(&session(&[
            ("type", "org_credit_purchase".to_string()),
            ("user_id", user.to_string()),
            ("org_id", org.to_string()),
            ("package_id", package.to_string()),
        ]))
        .unwrap();

        assert_eq!(identity.owner, OwnerRef::org(org));
        assert_eq!(identity.purchaser_user_id, user);
    }

    #[test]
    fn test_identity_rejects_subscription_checkouts() {
        let result = PurchaseIdentity::from_session(&session(&[
            ("type", "user_subscription".to_string()),
            ("user_id", Uuid::new_v4().to_string()),
            ("package_id", Uuid::new_v4().to_string()),
        ]));
        assert!(matches!(
            result,
            Err(BillingError::UnsupportedPurchaseType(_))
        ));
    }

    #[test]
    fn test_identity_rejects_non_purchase_tags_before_reading_metadata() {
        let cases = [
            vec![
                ("type", "user_subscription".to_string()),
                ("user_id", Uuid::new_v4().to_string()),
            ],
            vec![
                ("type", "org_platform_subscription".to_string()),
                ("org_id", Uuid::new_v4().to_string()),
            ],
            vec![
                ("type", "credit_installment".to_string()),
                ("user_id", Uuid::new_v4().to_string()),
                ("installment_count", "6".to_string()),
            ],
            vec![],
        ];

        for pairs in cases {
            let err = PurchaseIdentity::from_session(&session(&pairs)).unwrap_err();
            assert!(matches!(err, BillingError::UnsupportedPurchaseType(_)));
            assert_eq!(err.class(), ErrorClass::Validation);
        }
    }

    #[test]
    fn test_outcome_shapes() {
        let batch = Uuid::new_v4();
        let first = serde_json::to_value(ConfirmOutcome::granted(100, batch)).unwrap();
        assert_eq!(first["success"], true);
        assert_eq!(first["creditsAdded"], 100);
        assert!(first.get("alreadyProcessed").is_none());

        let second = serde_json::to_value(ConfirmOutcome::already_processed(100, batch)).unwrap();
        assert_eq!(second["alreadyProcessed"], true);

        let unpaid = serde_json::to_value(ConfirmOutcome::not_paid("unpaid")).unwrap();
        assert_eq!(unpaid["success"], false);
        assert_eq!(unpaid["status"], "unpaid");
    }
}
