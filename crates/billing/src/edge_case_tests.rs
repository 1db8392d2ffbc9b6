// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Credit Ledger Engine
//!
//! Runs the engine end to end over the in-memory store:
//! - Purchase confirmation (idempotency, concurrent confirm, payer checks)
//! - Webhook delivery (signatures, replays, redelivery after failure)
//! - Installment plans (progress, failure lock, default on cancel)
//! - Subscriptions (user and org activation, free-plan downgrade)
//! - Maintenance (expiry sweep, rollover cap, expiry notifications)

#[cfg(test)]
mod support {
    use std::collections::HashMap;
    use std::sync::Arc;

    use coachledger_shared::{CreditSourceType, OwnerRef};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use crate::accounts::Plan;
    use crate::config::BillingConfig;
    use crate::events::{
        CheckoutPaymentStatus, CheckoutSession, Invoice, InvoiceLines, Price, Subscription,
        SubscriptionDetails, SubscriptionItem, SubscriptionItems, SubscriptionStatus,
    };
    use crate::ledger::{CreditLedger, GrantRequest};
    use crate::memory::{InMemoryBilling, InMemoryGateway};
    use crate::purchases::CreditPackage;
    use crate::webhooks::compute_signature;
    use crate::BillingService;

    pub const WEBHOOK_SECRET: &str = "whsec_edge_case_secret";

    pub struct Harness {
        pub store: Arc<InMemoryBilling>,
        pub gateway: Arc<InMemoryGateway>,
        pub service: BillingService,
        pub package: CreditPackage,
    }

    /// 100 credits for 50.00, valid 12 months
    pub async fn harness() -> Harness {
        let store = Arc::new(InMemoryBilling::new());
        let gateway = Arc::new(InMemoryGateway::new());
        let package = CreditPackage {
            id: Uuid::new_v4(),
            name: "Starter pack".to_string(),
            credits: 100,
            price_minor_units: 5000,
            currency: "usd".to_string(),
            validity_months: Some(12),
            feature_key: None,
            is_active: true,
        };
        store.add_package(package.clone()).await;

        let service = BillingService::in_memory(
            store.clone(),
            gateway.clone(),
            WEBHOOK_SECRET,
            BillingConfig::default(),
        );

        Harness {
            store,
            gateway,
            service,
            package,
        }
    }

    pub fn metadata(pairs: &[(&str, String)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    pub fn credit_session(id: &str, user: Uuid, package_id: Uuid) -> CheckoutSession {
        CheckoutSession {
            id: id.to_string(),
            payment_status: CheckoutPaymentStatus::Paid,
            metadata: metadata(&[
                ("type", "credit_purchase".to_string()),
                ("user_id", user.to_string()),
                ("package_id", package_id.to_string()),
            ]),
            amount_total: Some(5000),
            currency: Some("usd".to_string()),
            payment_intent: Some(format!("pi_{}", id)),
            subscription: None,
        }
    }

    pub fn installment_session(
        subscription_id: &str,
        user: Uuid,
        package_id: Uuid,
        count: i32,
        installment_amount: i64,
    ) -> CheckoutSession {
        CheckoutSession {
            id: format!("cs_{}", subscription_id),
            payment_status: CheckoutPaymentStatus::Paid,
            metadata: metadata(&[
                ("type", "credit_installment".to_string()),
                ("user_id", user.to_string()),
                ("package_id", package_id.to_string()),
                ("installment_count", count.to_string()),
                ("installment_amount", installment_amount.to_string()),
                (
                    "total_amount",
                    (installment_amount * i64::from(count)).to_string(),
                ),
            ]),
            amount_total: Some(installment_amount),
            currency: Some("usd".to_string()),
            payment_intent: None,
            subscription: Some(subscription_id.to_string()),
        }
    }

    pub fn subscription_session(id: &str, tag: &str, key: &str, owner: Uuid, sub: &str) -> CheckoutSession {
        CheckoutSession {
            id: id.to_string(),
            payment_status: CheckoutPaymentStatus::Paid,
            metadata: metadata(&[("type", tag.to_string()), (key, owner.to_string())]),
            amount_total: Some(2900),
            currency: Some("usd".to_string()),
            payment_intent: None,
            subscription: Some(sub.to_string()),
        }
    }

    pub fn subscription(id: &str, price_id: &str, status: SubscriptionStatus) -> Subscription {
        Subscription {
            id: id.to_string(),
            status,
            metadata: HashMap::new(),
            items: SubscriptionItems {
                data: vec![SubscriptionItem {
                    price: Some(Price {
                        id: price_id.to_string(),
                    }),
                }],
            },
        }
    }

    pub fn cycle_invoice(id: &str, subscription_id: &str, amount_paid: i64) -> Invoice {
        Invoice {
            id: id.to_string(),
            subscription: Some(subscription_id.to_string()),
            subscription_details: None,
            parent: None,
            billing_reason: Some("subscription_cycle".to_string()),
            amount_paid,
            currency: Some("usd".to_string()),
            period_end: None,
            lines: InvoiceLines::default(),
        }
    }

    pub fn tagged_invoice(id: &str, subscription_id: &str, reason: &str) -> Invoice {
        Invoice {
            subscription_details: Some(SubscriptionDetails {
                subscription: Some(subscription_id.to_string()),
                metadata: metadata(&[("type", "credit_installment".to_string())]),
            }),
            billing_reason: Some(reason.to_string()),
            ..cycle_invoice(id, subscription_id, 20000)
        }
    }

    pub fn plan(key: &str, allowance: i64) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            key: key.to_string(),
            name: key.to_uppercase(),
            monthly_credit_allowance: allowance,
        }
    }

    /// Raw payload and a valid signature header for it
    pub fn signed_event(event_id: &str, event_type: &str, object: serde_json::Value) -> (String, String) {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let payload = serde_json::json!({
            "id": event_id,
            "type": event_type,
            "created": now,
            "data": { "object": object },
        })
        .to_string();
        let signature = compute_signature(WEBHOOK_SECRET, now, &payload).unwrap();
        (payload, format!("t={},v1={}", now, signature))
    }

    pub async fn grant(
        store: &InMemoryBilling,
        owner: OwnerRef,
        amount: i64,
        source_type: CreditSourceType,
        expires_in: Duration,
    ) -> Uuid {
        store
            .grant_batch(GrantRequest {
                owner,
                amount,
                expires_at: OffsetDateTime::now_utc() + expires_in,
                source_type,
                feature_key: None,
                source_reference_id: Uuid::new_v4(),
                description: "seeded".to_string(),
            })
            .await
            .unwrap()
            .batch_id
    }
}

#[cfg(test)]
mod confirmation_tests {
    use std::sync::Arc;

    use coachledger_shared::{BatchStatus, CreditSourceType, OwnerRef, PurchaseStatus};
    use time::OffsetDateTime;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use super::support::*;
    use crate::confirmation::PurchaseIdentity;
    use crate::error::{BillingError, ErrorClass};
    use crate::events::CheckoutPaymentStatus;
    use crate::ledger::add_months;
    use crate::purchases::{NewPurchase, PurchaseStore};

    // =========================================================================
    // Fresh purchase
    // =========================================================================

    #[tokio::test]
    async fn test_first_confirm_grants_package_credits() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.gateway
            .insert_session(credit_session("cs_fresh", user, h.package.id))
            .await;

        let before = OffsetDateTime::now_utc();
        let outcome = h.service.reconciler.confirm("cs_fresh", user).await.unwrap();
        let after = OffsetDateTime::now_utc();

        assert!(outcome.success);
        assert_eq!(outcome.credits_added, 100);
        assert!(!outcome.is_already_processed());

        let purchase = h.store.purchase("cs_fresh").await.unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Completed);
        assert_eq!(purchase.amount_minor_units, 5000);
        assert_eq!(purchase.payment_intent_id.as_deref(), Some("pi_cs_fresh"));

        let batches = h.store.batches_for(OwnerRef::user(user)).await;
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(Some(batch.id), outcome.batch_id);
        assert_eq!(batch.original_amount, 100);
        assert_eq!(batch.remaining_amount, 100);
        assert_eq!(batch.status, BatchStatus::Active);
        assert_eq!(batch.source_type, CreditSourceType::Purchase);
        assert_eq!(batch.source_reference_id, purchase.id);
        assert!(batch.expires_at >= add_months(before, 12));
        assert!(batch.expires_at <= add_months(after, 12));

        let notifications = h.store.notifications_for(user).await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].title, "Credits added");
    }

    #[tokio::test]
    async fn test_second_confirm_reports_already_processed() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.gateway
            .insert_session(credit_session("cs_twice", user, h.package.id))
            .await;

        let first = h.service.reconciler.confirm("cs_twice", user).await.unwrap();
        let second = h.service.reconciler.confirm("cs_twice", user).await.unwrap();

        assert!(second.success);
        assert!(second.is_already_processed());
        assert_eq!(second.credits_added, first.credits_added);
        assert_eq!(second.batch_id, first.batch_id);
        assert_eq!(h.store.batches().await.len(), 1);
        assert_eq!(h.store.notifications().await.len(), 1);
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_confirms_grant_exactly_once() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.gateway
            .insert_session(credit_session("cs_race", user, h.package.id))
            .await;

        let callers = 8;
        let barrier = Arc::new(Barrier::new(callers));
        let mut handles = vec![];

        for _ in 0..callers {
            let service = h.service.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service.reconciler.confirm("cs_race", user).await
            }));
        }

        let mut outcomes = vec![];
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        assert!(outcomes.iter().all(|o| o.success && o.credits_added == 100));
        let batch_id = outcomes[0].batch_id;
        assert!(outcomes.iter().all(|o| o.batch_id == batch_id));
        assert_eq!(
            outcomes.iter().filter(|o| !o.is_already_processed()).count(),
            1,
            "exactly one caller performs the grant"
        );

        assert_eq!(h.store.batches().await.len(), 1);
        assert_eq!(h.store.notifications().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_confirm_racing_webhook_on_pending_purchase() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let session = credit_session("cs_pending", user, h.package.id);
        h.gateway.insert_session(session.clone()).await;

        let identity = PurchaseIdentity::from_session(&session).unwrap();
        let pending = h
            .service
            .reconciler
            .begin_purchase(identity, "cs_pending")
            .await
            .unwrap();
        assert_eq!(pending.status, PurchaseStatus::Pending);

        let barrier = Arc::new(Barrier::new(2));
        let confirm = {
            let service = h.service.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                service.reconciler.confirm("cs_pending", user).await
            })
        };
        let webhook = {
            let service = h.service.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                service.reconciler.complete_from_session(&session).await
            })
        };

        let a = confirm.await.unwrap().unwrap();
        let b = webhook.await.unwrap().unwrap();
        assert_eq!(a.batch_id, b.batch_id);

        let purchase = h.store.purchase("cs_pending").await.unwrap();
        assert_eq!(purchase.id, pending.id);
        assert_eq!(purchase.status, PurchaseStatus::Completed);
        assert_eq!(h.store.batches().await.len(), 1);
    }

    // =========================================================================
    // Repair and rejection
    // =========================================================================

    #[tokio::test]
    async fn test_completed_purchase_without_batch_is_repaired() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.gateway
            .insert_session(credit_session("cs_lost", user, h.package.id))
            .await;

        // Simulates a crash between marking the purchase completed and granting.
        let record = h
            .store
            .insert_completed(
                NewPurchase {
                    owner: OwnerRef::user(user),
                    purchaser_user_id: user,
                    package_id: h.package.id,
                    credits_purchased: 100,
                    amount_minor_units: 5000,
                    currency: "usd".to_string(),
                    checkout_session_id: "cs_lost".to_string(),
                    payment_intent_id: None,
                    expires_at: None,
                },
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(h.store.batches().await.is_empty());

        let outcome = h.service.reconciler.confirm("cs_lost", user).await.unwrap();
        assert!(outcome.is_already_processed());

        let batches = h.store.batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].source_reference_id, record.id);
        assert_eq!(outcome.batch_id, Some(batches[0].id));
    }

    #[tokio::test]
    async fn test_confirm_by_other_user_is_forbidden() {
        let h = harness().await;
        let payer = Uuid::new_v4();
        h.gateway
            .insert_session(credit_session("cs_theft", payer, h.package.id))
            .await;

        let err = h
            .service
            .reconciler
            .confirm("cs_theft", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PayerMismatch(_)));
        assert!(matches!(err.class(), ErrorClass::Forbidden));
        assert!(h.store.purchase("cs_theft").await.is_none());
        assert!(h.store.batches().await.is_empty());
    }

    #[tokio::test]
    async fn test_unpaid_session_grants_nothing() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let mut session = credit_session("cs_unpaid", user, h.package.id);
        session.payment_status = CheckoutPaymentStatus::Unpaid;
        h.gateway.insert_session(session).await;

        let outcome = h.service.reconciler.confirm("cs_unpaid", user).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.credits_added, 0);
        assert_eq!(outcome.status.as_deref(), Some("unpaid"));
        assert!(h.store.purchase("cs_unpaid").await.is_none());
        assert!(h.store.batches().await.is_empty());
    }

    #[tokio::test]
    async fn test_confirming_subscription_checkout_is_a_client_error() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.gateway
            .insert_session(subscription_session(
                "cs_sub_confirm",
                "user_subscription",
                "user_id",
                user,
                "sub_confirm",
            ))
            .await;

        let err = h
            .service
            .reconciler
            .confirm("cs_sub_confirm", user)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::UnsupportedPurchaseType(_)));
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(h.store.purchase("cs_sub_confirm").await.is_none());
        assert!(h.store.batches().await.is_empty());
    }

    #[tokio::test]
    async fn test_blank_session_id_is_rejected() {
        let h = harness().await;
        let err = h
            .service
            .reconciler
            .confirm("   ", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err.class(), ErrorClass::Validation));
    }

    #[tokio::test]
    async fn test_gateway_outage_surfaces_as_gateway_error() {
        let h = harness().await;
        h.gateway.set_unavailable(true).await;
        let err = h
            .service
            .reconciler
            .confirm("cs_any", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err.class(), ErrorClass::Gateway));
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_confirm() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.gateway
            .insert_session(credit_session("cs_quiet", user, h.package.id))
            .await;
        h.store.set_notifications_failing(true).await;

        let outcome = h.service.reconciler.confirm("cs_quiet", user).await.unwrap();
        assert!(outcome.success);
        assert_eq!(h.store.batches().await.len(), 1);
        assert!(h.store.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn test_org_purchase_credits_org_ledger() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let org = Uuid::new_v4();
        let mut session = credit_session("cs_org", user, h.package.id);
        session
            .metadata
            .insert("type".to_string(), "org_credit_purchase".to_string());
        session.metadata.insert("org_id".to_string(), org.to_string());
        h.gateway.insert_session(session).await;

        h.service.reconciler.confirm("cs_org", user).await.unwrap();

        assert_eq!(h.store.batches_for(OwnerRef::org(org)).await.len(), 1);
        assert!(h.store.batches_for(OwnerRef::user(user)).await.is_empty());
    }
}

#[cfg(test)]
mod webhook_tests {
    use coachledger_shared::{OwnerRef, ScheduleStatus};
    use uuid::Uuid;

    use super::support::*;
    use crate::error::BillingError;
    use crate::events::GatewayEvent;
    use crate::webhooks::WebhookOutcome;

    #[tokio::test]
    async fn test_checkout_event_replayed_grants_once() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let session = credit_session("cs_hook", user, h.package.id);

        h.service
            .webhooks
            .dispatch(GatewayEvent::CheckoutSessionCompleted(session.clone()))
            .await
            .unwrap();
        h.service
            .webhooks
            .dispatch(GatewayEvent::CheckoutSessionCompleted(session))
            .await
            .unwrap();

        assert_eq!(h.store.batches_for(OwnerRef::user(user)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_event_is_duplicate() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let session = credit_session("cs_signed", user, h.package.id);
        let (payload, signature) = signed_event(
            "evt_checkout",
            "checkout.session.completed",
            serde_json::to_value(&session).unwrap(),
        );

        let first = h.service.webhooks.handle(&payload, &signature).await.unwrap();
        let second = h.service.webhooks.handle(&payload, &signature).await.unwrap();

        assert_eq!(first, WebhookOutcome::Processed);
        assert_eq!(second, WebhookOutcome::Duplicate);
        assert_eq!(h.store.batches().await.len(), 1);
        assert_eq!(
            h.store.webhook_event_status("evt_checkout").await.as_deref(),
            Some("success")
        );
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected_before_processing() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let session = credit_session("cs_forged", user, h.package.id);
        let (payload, _) = signed_event(
            "evt_forged",
            "checkout.session.completed",
            serde_json::to_value(&session).unwrap(),
        );
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let err = h
            .service
            .webhooks
            .handle(&payload, &format!("t={},v1=00ff", now))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        assert!(h.store.webhook_event_status("evt_forged").await.is_none());
        assert!(h.store.batches().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_event_is_reclaimed_on_redelivery() {
        let h = harness().await;
        let user = Uuid::new_v4();

        // The renewal invoice arrives before the installment checkout was processed.
        let invoice = tagged_invoice("in_early", "sub_early", "subscription_cycle");
        let (payload, signature) = signed_event(
            "evt_early_invoice",
            "invoice.paid",
            serde_json::to_value(&invoice).unwrap(),
        );

        let err = h.service.webhooks.handle(&payload, &signature).await.unwrap_err();
        assert!(matches!(err, BillingError::ScheduleNotFound(_)));
        assert_eq!(
            h.store.webhook_event_status("evt_early_invoice").await.as_deref(),
            Some("error")
        );

        h.service
            .webhooks
            .dispatch(GatewayEvent::CheckoutSessionCompleted(installment_session(
                "sub_early",
                user,
                h.package.id,
                3,
                2000,
            )))
            .await
            .unwrap();

        let outcome = h.service.webhooks.handle(&payload, &signature).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let schedule = h.store.schedule("sub_early").await.unwrap();
        assert_eq!(schedule.installments_paid, 2);
        assert_eq!(schedule.status, ScheduleStatus::Active);
    }

    #[tokio::test]
    async fn test_first_invoice_is_not_counted_twice() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.service
            .webhooks
            .dispatch(GatewayEvent::CheckoutSessionCompleted(installment_session(
                "sub_first",
                user,
                h.package.id,
                4,
                1000,
            )))
            .await
            .unwrap();

        h.service
            .webhooks
            .dispatch(GatewayEvent::InvoicePaid(tagged_invoice(
                "in_first",
                "sub_first",
                "subscription_create",
            )))
            .await
            .unwrap();

        assert_eq!(h.store.schedule("sub_first").await.unwrap().installments_paid, 1);
    }

    #[tokio::test]
    async fn test_untagged_and_unknown_checkouts_are_ignored() {
        let h = harness().await;
        let user = Uuid::new_v4();

        let mut untagged = credit_session("cs_untagged", user, h.package.id);
        untagged.metadata.remove("type");
        let mut unknown = credit_session("cs_unknown", user, h.package.id);
        unknown
            .metadata
            .insert("type".to_string(), "gift_card".to_string());

        for session in [untagged, unknown] {
            h.service
                .webhooks
                .dispatch(GatewayEvent::CheckoutSessionCompleted(session))
                .await
                .unwrap();
        }

        assert!(h.store.batches().await.is_empty());
        assert!(h.store.purchase("cs_untagged").await.is_none());
    }

    #[tokio::test]
    async fn test_unhandled_event_type_is_acknowledged() {
        let h = harness().await;
        let (payload, signature) =
            signed_event("evt_other", "customer.created", serde_json::json!({"id": "cus_1"}));
        let outcome = h.service.webhooks.handle(&payload, &signature).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
    }
}

#[cfg(test)]
mod installment_tests {
    use coachledger_shared::{OwnerRef, ScheduleStatus};
    use uuid::Uuid;

    use super::support::*;
    use crate::events::{GatewayEvent, SubscriptionStatus};

    async fn open_plan(h: &Harness, sub: &str, user: Uuid, count: i32, amount: i64) {
        h.service
            .webhooks
            .dispatch(GatewayEvent::CheckoutSessionCompleted(installment_session(
                sub,
                user,
                h.package.id,
                count,
                amount,
            )))
            .await
            .unwrap();
    }

    async fn pay(h: &Harness, invoice_id: &str, sub: &str, amount: i64) {
        h.service
            .webhooks
            .dispatch(GatewayEvent::InvoicePaid(cycle_invoice(invoice_id, sub, amount)))
            .await
            .unwrap();
    }

    async fn cancel(h: &Harness, sub: &str) {
        let mut subscription = subscription(sub, "price_installment", SubscriptionStatus::Canceled);
        subscription
            .metadata
            .insert("type".to_string(), "credit_installment".to_string());
        h.service
            .webhooks
            .dispatch(GatewayEvent::SubscriptionDeleted(subscription))
            .await
            .unwrap();
    }

    // =========================================================================
    // Plan lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_installment_plan_grants_everything_upfront() {
        let h = harness().await;
        let user = Uuid::new_v4();
        open_plan(&h, "sub_six", user, 6, 20000).await;

        let schedule = h.store.schedule("sub_six").await.unwrap();
        assert_eq!(schedule.installment_count, 6);
        assert_eq!(schedule.installments_paid, 1);
        assert_eq!(schedule.total_amount_minor_units, 120000);
        assert_eq!(schedule.amount_paid_minor_units, 20000);
        assert_eq!(schedule.status, ScheduleStatus::Active);

        let batches = h.store.batches_for(OwnerRef::user(user)).await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].original_amount, 100);
        assert_eq!(schedule.credit_batch_id, Some(batches[0].id));

        pay(&h, "in_2", "sub_six", 20000).await;
        let schedule = h.store.schedule("sub_six").await.unwrap();
        assert_eq!(schedule.installments_paid, 2);
        assert_eq!(schedule.amount_paid_minor_units, 40000);

        h.service
            .webhooks
            .dispatch(GatewayEvent::InvoicePaymentFailed(cycle_invoice(
                "in_3", "sub_six", 0,
            )))
            .await
            .unwrap();

        let schedule = h.store.schedule("sub_six").await.unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Outstanding);
        assert!(h
            .service
            .schedules
            .is_locked(OwnerRef::user(user))
            .await
            .unwrap());

        // Credits are never clawed back.
        let batches = h.store.batches_for(OwnerRef::user(user)).await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].remaining_amount, 100);
    }

    #[tokio::test]
    async fn test_replayed_checkout_keeps_single_schedule_and_batch() {
        let h = harness().await;
        let user = Uuid::new_v4();
        open_plan(&h, "sub_replay", user, 3, 500).await;
        open_plan(&h, "sub_replay", user, 3, 500).await;

        assert_eq!(h.store.schedule_count().await, 1);
        assert_eq!(h.store.batches().await.len(), 1);
    }

    #[tokio::test]
    async fn test_same_invoice_counted_once() {
        let h = harness().await;
        let user = Uuid::new_v4();
        open_plan(&h, "sub_dup", user, 4, 1000).await;

        pay(&h, "in_dup", "sub_dup", 1000).await;
        pay(&h, "in_dup", "sub_dup", 1000).await;

        let schedule = h.store.schedule("sub_dup").await.unwrap();
        assert_eq!(schedule.installments_paid, 2);
        assert_eq!(schedule.amount_paid_minor_units, 2000);
    }

    #[tokio::test]
    async fn test_older_invoice_redelivered_late_is_not_recounted() {
        let h = harness().await;
        let user = Uuid::new_v4();
        open_plan(&h, "sub_late", user, 4, 1000).await;

        let deliveries = [
            ("evt_late_1", "in_second"),
            ("evt_late_2", "in_third"),
            // in_second again, as a fresh event after a newer invoice was counted
            ("evt_late_3", "in_second"),
        ];
        for (event_id, invoice_id) in deliveries {
            let (payload, signature) = signed_event(
                event_id,
                "invoice.paid",
                serde_json::to_value(cycle_invoice(invoice_id, "sub_late", 1000)).unwrap(),
            );
            h.service.webhooks.handle(&payload, &signature).await.unwrap();
        }

        let schedule = h.store.schedule("sub_late").await.unwrap();
        assert_eq!(schedule.installments_paid, 3);
        assert_eq!(schedule.amount_paid_minor_units, 3000);
        assert_eq!(schedule.status, ScheduleStatus::Active);
        assert_eq!(
            schedule.paid_invoice_ids,
            vec!["in_second".to_string(), "in_third".to_string()]
        );
    }

    #[tokio::test]
    async fn test_payment_after_failure_reactivates() {
        let h = harness().await;
        let user = Uuid::new_v4();
        open_plan(&h, "sub_retry", user, 4, 1000).await;

        h.service.schedules.record_failure("sub_retry").await.unwrap();
        assert!(h.service.schedules.is_locked(OwnerRef::user(user)).await.unwrap());

        pay(&h, "in_retry", "sub_retry", 1000).await;
        let schedule = h.store.schedule("sub_retry").await.unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Active);
        assert!(!h.service.schedules.is_locked(OwnerRef::user(user)).await.unwrap());
    }

    #[tokio::test]
    async fn test_final_installment_completes_and_stops_billing() {
        let h = harness().await;
        let user = Uuid::new_v4();
        open_plan(&h, "sub_done", user, 2, 2500).await;

        pay(&h, "in_last", "sub_done", 2500).await;

        let schedule = h.store.schedule("sub_done").await.unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Completed);
        assert_eq!(schedule.installments_paid, 2);
        assert_eq!(h.gateway.cancelled().await, vec!["sub_done".to_string()]);

        // The cancellation we triggered comes back as a deletion event.
        cancel(&h, "sub_done").await;
        assert_eq!(
            h.store.schedule("sub_done").await.unwrap().status,
            ScheduleStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancel_before_fully_paid_defaults() {
        let h = harness().await;
        let user = Uuid::new_v4();
        open_plan(&h, "sub_default", user, 5, 1000).await;
        pay(&h, "in_2", "sub_default", 1000).await;

        cancel(&h, "sub_default").await;

        let schedule = h.store.schedule("sub_default").await.unwrap();
        assert_eq!(schedule.installments_paid, 2);
        assert_eq!(schedule.status, ScheduleStatus::Defaulted);
        assert!(h.service.schedules.is_locked(OwnerRef::user(user)).await.unwrap());

        // A late payment does not revive a defaulted plan.
        pay(&h, "in_late", "sub_default", 1000).await;
        let schedule = h.store.schedule("sub_default").await.unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Defaulted);
        assert_eq!(schedule.installments_paid, 2);
    }

    #[tokio::test]
    async fn test_single_installment_plan_starts_completed() {
        let h = harness().await;
        let user = Uuid::new_v4();
        open_plan(&h, "sub_one", user, 1, 5000).await;

        let schedule = h.store.schedule("sub_one").await.unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Completed);
        assert!(!h.service.schedules.is_locked(OwnerRef::user(user)).await.unwrap());
    }
}

#[cfg(test)]
mod subscription_tests {
    use uuid::Uuid;

    use super::support::*;
    use crate::accounts::ORG_SUBSCRIPTION_CANCELED;
    use crate::error::BillingError;
    use crate::events::{GatewayEvent, SubscriptionStatus};

    #[tokio::test]
    async fn test_user_subscription_links_plan_and_downgrades_on_delete() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let free = plan("free", 0);
        let pro = plan("pro", 500);
        h.store.add_plan(free.clone(), &[]).await;
        h.store.add_plan(pro.clone(), &["price_pro"]).await;
        h.gateway
            .insert_subscription(subscription("sub_user", "price_pro", SubscriptionStatus::Active))
            .await;

        h.service
            .webhooks
            .dispatch(GatewayEvent::CheckoutSessionCompleted(subscription_session(
                "cs_sub",
                "user_subscription",
                "user_id",
                user,
                "sub_user",
            )))
            .await
            .unwrap();
        assert_eq!(h.store.user_plan(user).await, Some(pro.id));

        h.service
            .webhooks
            .dispatch(GatewayEvent::SubscriptionDeleted(subscription(
                "sub_user",
                "price_pro",
                SubscriptionStatus::Canceled,
            )))
            .await
            .unwrap();
        assert_eq!(h.store.user_plan(user).await, Some(free.id));
    }

    #[tokio::test]
    async fn test_subscription_update_switches_plan() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let pro = plan("pro", 500);
        let team = plan("team", 2000);
        h.store.add_plan(pro.clone(), &["price_pro"]).await;
        h.store.add_plan(team.clone(), &["price_team"]).await;

        let mut updated = subscription("sub_upgrade", "price_team", SubscriptionStatus::Active);
        updated
            .metadata
            .insert("user_id".to_string(), user.to_string());
        h.service
            .webhooks
            .dispatch(GatewayEvent::SubscriptionUpdated(updated.clone()))
            .await
            .unwrap();
        assert_eq!(h.store.user_plan(user).await, Some(team.id));

        updated.status = SubscriptionStatus::PastDue;
        updated.items.data[0].price = None;
        h.service
            .webhooks
            .dispatch(GatewayEvent::SubscriptionUpdated(updated))
            .await
            .unwrap();
        assert_eq!(h.store.user_plan(user).await, Some(team.id));
    }

    #[tokio::test]
    async fn test_unknown_price_fails_activation() {
        let h = harness().await;
        let user = Uuid::new_v4();
        h.gateway
            .insert_subscription(subscription("sub_mystery", "price_gone", SubscriptionStatus::Active))
            .await;

        let err = h
            .service
            .webhooks
            .dispatch(GatewayEvent::CheckoutSessionCompleted(subscription_session(
                "cs_mystery",
                "user_subscription",
                "user_id",
                user,
                "sub_mystery",
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert!(h.store.user_plan(user).await.is_none());
    }

    #[tokio::test]
    async fn test_org_subscription_activates_and_cancels() {
        let h = harness().await;
        let org = Uuid::new_v4();
        let team = plan("team", 2000);
        h.store.add_org(org, vec![]).await;
        h.store.add_plan(team.clone(), &["price_team"]).await;
        h.gateway
            .insert_subscription(subscription("sub_org", "price_team", SubscriptionStatus::Active))
            .await;

        h.service
            .webhooks
            .dispatch(GatewayEvent::CheckoutSessionCompleted(subscription_session(
                "cs_org_sub",
                "org_platform_subscription",
                "org_id",
                org,
                "sub_org",
            )))
            .await
            .unwrap();

        let record = h.store.org(org).await.unwrap();
        assert_eq!(record.stripe_subscription_id.as_deref(), Some("sub_org"));
        assert_eq!(record.subscription_status.as_deref(), Some("active"));
        assert_eq!(record.plan_id, Some(team.id));

        h.service
            .webhooks
            .dispatch(GatewayEvent::SubscriptionDeleted(subscription(
                "sub_org",
                "price_team",
                SubscriptionStatus::Canceled,
            )))
            .await
            .unwrap();
        assert_eq!(
            h.store.org(org).await.unwrap().subscription_status.as_deref(),
            Some(ORG_SUBSCRIPTION_CANCELED)
        );
    }

    #[tokio::test]
    async fn test_org_activation_survives_gateway_outage() {
        let h = harness().await;
        let org = Uuid::new_v4();
        h.gateway.set_unavailable(true).await;

        h.service
            .webhooks
            .dispatch(GatewayEvent::CheckoutSessionCompleted(subscription_session(
                "cs_org_offline",
                "org_platform_subscription",
                "org_id",
                org,
                "sub_offline",
            )))
            .await
            .unwrap();

        let record = h.store.org(org).await.unwrap();
        assert_eq!(record.subscription_status.as_deref(), Some("active"));
        assert!(record.plan_id.is_none());
    }
}

#[cfg(test)]
mod maintenance_tests {
    use coachledger_shared::{BatchStatus, CreditSourceType, OwnerRef};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use super::support::*;
    use crate::accounts::AccountStore;
    use crate::maintenance::{
        MaintenanceJob, MaintenanceReport, NotificationResult, RolloverResult, ORG_EXPIRY_TITLE,
        USER_EXPIRY_TITLE,
    };

    // =========================================================================
    // Expiry sweep
    // =========================================================================

    #[tokio::test]
    async fn test_expiry_sweep_only_touches_past_batches() {
        let h = harness().await;
        let owner = OwnerRef::user(Uuid::new_v4());
        let stale = grant(&h.store, owner, 40, CreditSourceType::Purchase, -Duration::hours(1)).await;
        let fresh = grant(&h.store, owner, 60, CreditSourceType::Purchase, Duration::days(3)).await;

        let now = OffsetDateTime::now_utc();
        let summary = h.service.maintenance.expire_credits(now).await.unwrap();
        assert_eq!(summary.expired, 1);

        let batches = h.store.batches_for(owner).await;
        let status = |id: Uuid| batches.iter().find(|b| b.id == id).unwrap().status;
        assert_eq!(status(stale), BatchStatus::Expired);
        assert_eq!(status(fresh), BatchStatus::Active);

        let again = h.service.maintenance.expire_credits(now).await.unwrap();
        assert_eq!(again.expired, 0);
    }

    // =========================================================================
    // Rollover
    // =========================================================================

    #[tokio::test]
    async fn test_rollover_is_capped_at_half_allowance() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let pro = plan("pro", 100);
        h.store.add_plan(pro.clone(), &["price_pro"]).await;
        h.store
            .set_user_plan(user, pro.id, Some("sub_pro"))
            .await
            .unwrap();

        let owner = OwnerRef::user(user);
        let source = grant(
            &h.store,
            owner,
            80,
            CreditSourceType::SubscriptionAllowance,
            Duration::hours(2),
        )
        .await;

        let now = OffsetDateTime::now_utc();
        let summary = h.service.maintenance.rollover_allowances(now).await.unwrap();
        assert_eq!(summary.rolled_over, 1);
        assert_eq!(summary.total_credits, 50);
        assert!(matches!(
            summary.results[0],
            RolloverResult::RolledOver { amount: 50, cap: 50, .. }
        ));

        let batches = h.store.batches_for(owner).await;
        let drained = batches.iter().find(|b| b.id == source).unwrap();
        assert_eq!(drained.remaining_amount, 0);
        assert_eq!(drained.status, BatchStatus::Depleted);

        let rolled: Vec<_> = batches
            .iter()
            .filter(|b| b.source_type == CreditSourceType::Rollover)
            .collect();
        assert_eq!(rolled.len(), 1);
        assert_eq!(rolled[0].original_amount, 50);
        assert_eq!(rolled[0].source_reference_id, source);

        // Nothing left to roll on a second run.
        let again = h.service.maintenance.rollover_allowances(now).await.unwrap();
        assert_eq!(again.rolled_over, 0);
        assert_eq!(
            h.store
                .batches_for(owner)
                .await
                .iter()
                .filter(|b| b.source_type == CreditSourceType::Rollover)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_rollover_failure_for_one_owner_spares_the_rest() {
        let h = harness().await;
        let pro = plan("pro", 100);
        h.store.add_plan(pro.clone(), &[]).await;

        let healthy = Uuid::new_v4();
        let broken = Uuid::new_v4();
        for (user, sub) in [(healthy, "sub_healthy"), (broken, "sub_broken")] {
            h.store.set_user_plan(user, pro.id, Some(sub)).await.unwrap();
            grant(
                &h.store,
                OwnerRef::user(user),
                40,
                CreditSourceType::SubscriptionAllowance,
                Duration::hours(2),
            )
            .await;
        }
        h.store.fail_owner(OwnerRef::user(broken)).await;

        let summary = h
            .service
            .maintenance
            .rollover_allowances(OffsetDateTime::now_utc())
            .await
            .unwrap();

        assert_eq!(summary.owners, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.rolled_over, 1);
        assert_eq!(summary.total_credits, 40);
        assert!(summary.results.iter().any(|r| matches!(
            r,
            RolloverResult::Error { owner, .. } if *owner == OwnerRef::user(broken)
        )));
        assert!(summary.results.iter().any(|r| matches!(
            r,
            RolloverResult::RolledOver { owner, amount: 40, .. } if *owner == OwnerRef::user(healthy)
        )));

        // The failing owner's allowance is left untouched.
        let untouched = h.store.batches_for(OwnerRef::user(broken)).await;
        assert_eq!(untouched.len(), 1);
        assert_eq!(untouched[0].remaining_amount, 40);
    }

    #[tokio::test]
    async fn test_rollover_ignores_purchased_credits() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let pro = plan("pro", 100);
        h.store.add_plan(pro.clone(), &[]).await;
        h.store
            .set_user_plan(user, pro.id, Some("sub_pro"))
            .await
            .unwrap();
        grant(
            &h.store,
            OwnerRef::user(user),
            30,
            CreditSourceType::Purchase,
            Duration::hours(2),
        )
        .await;

        let summary = h
            .service
            .maintenance
            .rollover_allowances(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(summary.owners, 1);
        assert_eq!(summary.rolled_over, 0);
    }

    // =========================================================================
    // Expiry notifications
    // =========================================================================

    #[tokio::test]
    async fn test_user_lookahead_is_seven_days() {
        let h = harness().await;
        let soon = Uuid::new_v4();
        let later = Uuid::new_v4();
        grant(&h.store, OwnerRef::user(soon), 25, CreditSourceType::Purchase, Duration::days(6)).await;
        grant(&h.store, OwnerRef::user(later), 25, CreditSourceType::Purchase, Duration::days(10)).await;

        let summary = h
            .service
            .maintenance
            .notify_expiring(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(summary.notified, 1);

        let sent = h.store.notifications_for(soon).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, USER_EXPIRY_TITLE);
        assert_eq!(sent[0].metadata["credits"], 25);
        assert!(h.store.notifications_for(later).await.is_empty());
    }

    #[tokio::test]
    async fn test_org_lookahead_reaches_admins() {
        let h = harness().await;
        let org = Uuid::new_v4();
        let owner_admin = Uuid::new_v4();
        let admin = Uuid::new_v4();
        h.store.add_org(org, vec![owner_admin, admin]).await;
        grant(&h.store, OwnerRef::org(org), 300, CreditSourceType::Purchase, Duration::days(25)).await;

        let summary = h
            .service
            .maintenance
            .notify_expiring(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(matches!(
            summary.results[0],
            NotificationResult::Notified { recipients: 2, credits: 300, .. }
        ));
        for recipient in [owner_admin, admin] {
            let sent = h.store.notifications_for(recipient).await;
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].title, ORG_EXPIRY_TITLE);
        }
    }

    #[tokio::test]
    async fn test_admin_of_two_orgs_hears_about_both() {
        let h = harness().await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let admin = Uuid::new_v4();
        h.store.add_org(first, vec![admin]).await;
        h.store.add_org(second, vec![admin]).await;
        grant(&h.store, OwnerRef::org(first), 300, CreditSourceType::Purchase, Duration::days(25)).await;
        grant(&h.store, OwnerRef::org(second), 120, CreditSourceType::Purchase, Duration::days(20)).await;

        let summary = h
            .service
            .maintenance
            .notify_expiring(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(summary.notified, 2);
        assert_eq!(summary.suppressed, 0);

        let sent = h.store.notifications_for(admin).await;
        assert_eq!(sent.len(), 2);
        let mut announced: Vec<String> = sent
            .iter()
            .map(|n| n.metadata["owner_id"].as_str().unwrap().to_string())
            .collect();
        announced.sort();
        let mut expected = vec![first.to_string(), second.to_string()];
        expected.sort();
        assert_eq!(announced, expected);

        // A second sweep is still deduplicated per org.
        let again = h
            .service
            .maintenance
            .notify_expiring(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(again.notified, 0);
        assert_eq!(again.suppressed, 2);
        assert_eq!(h.store.notifications_for(admin).await.len(), 2);
    }

    #[tokio::test]
    async fn test_notification_failure_for_one_owner_spares_the_rest() {
        let h = harness().await;
        let healthy = Uuid::new_v4();
        let broken = Uuid::new_v4();
        grant(&h.store, OwnerRef::user(healthy), 15, CreditSourceType::Purchase, Duration::days(3)).await;
        grant(&h.store, OwnerRef::user(broken), 15, CreditSourceType::Purchase, Duration::days(3)).await;
        h.store.fail_owner(OwnerRef::user(broken)).await;

        let summary = h
            .service
            .maintenance
            .notify_expiring(OffsetDateTime::now_utc())
            .await
            .unwrap();

        assert_eq!(summary.owners, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.notified, 1);
        assert!(summary.results.iter().any(|r| matches!(
            r,
            NotificationResult::Error { owner, .. } if *owner == OwnerRef::user(broken)
        )));
        assert_eq!(h.store.notifications_for(healthy).await.len(), 1);
        assert!(h.store.notifications_for(broken).await.is_empty());
    }

    #[tokio::test]
    async fn test_repeat_sweep_is_deduplicated() {
        let h = harness().await;
        let user = Uuid::new_v4();
        grant(&h.store, OwnerRef::user(user), 10, CreditSourceType::Purchase, Duration::days(2)).await;

        let report = h
            .service
            .maintenance
            .run(MaintenanceJob::ExpiryNotifications, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(matches!(report, MaintenanceReport::Notifications(ref s) if s.notified == 1));

        let second = h
            .service
            .maintenance
            .notify_expiring(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(second.notified, 0);
        assert_eq!(second.suppressed, 1);
        assert_eq!(h.store.notifications_for(user).await.len(), 1);
    }

    #[tokio::test]
    async fn test_depleted_batches_are_not_announced() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let pro = plan("pro", 100);
        h.store.add_plan(pro.clone(), &[]).await;
        h.store
            .set_user_plan(user, pro.id, Some("sub_pro"))
            .await
            .unwrap();
        grant(
            &h.store,
            OwnerRef::user(user),
            20,
            CreditSourceType::SubscriptionAllowance,
            Duration::hours(3),
        )
        .await;

        let now = OffsetDateTime::now_utc();
        h.service.maintenance.rollover_allowances(now).await.unwrap();
        h.service.maintenance.notify_expiring(now).await.unwrap();

        // Only the rollover batch remains live and it expires in a month.
        assert!(h.store.notifications_for(user).await.is_empty());
    }
}
