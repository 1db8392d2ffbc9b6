// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries gateway error text
#![allow(clippy::too_many_arguments)] // Webhook handler wiring takes every store
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CoachLedger Billing Module
//!
//! Reconciles gateway payments into the credit ledger.
//!
//! ## Features
//!
//! - **Credit Ledger**: Expiring credit batches, idempotent per payment reference
//! - **Purchase Confirmation**: Client-driven confirm racing the webhook, one grant either way
//! - **Installment Plans**: Upfront grant, per-invoice progress, default on cancel
//! - **Subscriptions**: User and organization plan linking, free-plan downgrade
//! - **Maintenance**: Expiry sweep, allowance rollover, expiry notifications
//! - **Webhooks**: Signed Stripe events with replay protection
//! - **Invariants**: Ledger consistency checks for the worker

pub mod accounts;
pub mod client;
pub mod config;
pub mod confirmation;
pub mod effects;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod maintenance;
pub mod memory;
pub mod notifications;
pub mod purchases;
pub mod schedules;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Accounts
pub use accounts::{AccountStore, PgAccountStore, Plan, SubscriptionOwner};

// Client
pub use client::{StripeClient, StripeConfig};

// Config
pub use config::BillingConfig;

// Confirmation
pub use confirmation::{ConfirmOutcome, PurchaseIdentity, PurchaseReconciler};

// Error
pub use error::{BillingError, BillingResult, ErrorClass};

// Events
pub use events::{CheckoutSession, EventEnvelope, GatewayEvent, Invoice, PurchaseType, Subscription};

// Gateway
pub use gateway::PaymentGateway;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{CreditBatch, CreditLedger, GrantOutcome, GrantRequest, PgCreditLedger};

// Maintenance
pub use maintenance::{
    ExpirySummary, MaintenanceJob, MaintenanceJobs, MaintenanceReport, NotificationResult,
    NotificationSummary, RolloverResult, RolloverSummary,
};

// In-memory store
pub use memory::{InMemoryBilling, InMemoryGateway};

// Notifications
pub use notifications::{NewNotification, Notifier, PgNotifier};

// Purchases
pub use purchases::{CreditPackage, PgPurchaseStore, PurchaseRecord, PurchaseStore};

// Schedules
pub use schedules::{
    InstallmentScheduleManager, PaymentProgress, PaymentSchedule, PgScheduleStore, ScheduleStore,
};

// Side effects
pub use effects::SideEffect;

// Webhooks
pub use webhooks::{PgWebhookEventLog, WebhookEventLog, WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;

/// Every storage seam the engine writes through
#[derive(Clone)]
pub struct BillingStores {
    pub ledger: Arc<dyn CreditLedger>,
    pub purchases: Arc<dyn PurchaseStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub notifier: Arc<dyn Notifier>,
    pub events: Arc<dyn WebhookEventLog>,
}

impl BillingStores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            ledger: Arc::new(PgCreditLedger::new(pool.clone())),
            purchases: Arc::new(PgPurchaseStore::new(pool.clone())),
            schedules: Arc::new(PgScheduleStore::new(pool.clone())),
            accounts: Arc::new(PgAccountStore::new(pool.clone())),
            notifier: Arc::new(PgNotifier::new(pool.clone())),
            events: Arc::new(PgWebhookEventLog::new(pool)),
        }
    }

    pub fn in_memory(store: Arc<InMemoryBilling>) -> Self {
        Self {
            ledger: store.clone(),
            purchases: store.clone(),
            schedules: store.clone(),
            accounts: store.clone(),
            notifier: store.clone(),
            events: store,
        }
    }
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub reconciler: PurchaseReconciler,
    pub schedules: InstallmentScheduleManager,
    pub maintenance: MaintenanceJobs,
    pub webhooks: WebhookHandler,
    /// Only available on a Postgres-backed service
    pub invariants: Option<Arc<InvariantChecker>>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeConfig::from_env()?;
        Ok(Self::new(stripe, BillingConfig::from_env(), pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(stripe: StripeConfig, config: BillingConfig, pool: PgPool) -> Self {
        let webhook_secret = stripe.webhook_secret.clone();
        let tolerance_secs = stripe.webhook_tolerance_secs;
        let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeClient::new(stripe));

        let mut service = Self::assemble(
            BillingStores::postgres(pool.clone()),
            gateway,
            webhook_secret,
            tolerance_secs,
            config,
        );
        service.invariants = Some(Arc::new(InvariantChecker::new(pool)));
        service
    }

    /// Create a billing service over in-process state, without a database or Stripe
    pub fn in_memory(
        store: Arc<InMemoryBilling>,
        gateway: Arc<InMemoryGateway>,
        webhook_secret: impl Into<String>,
        config: BillingConfig,
    ) -> Self {
        Self::assemble(
            BillingStores::in_memory(store),
            gateway,
            webhook_secret.into(),
            client::DEFAULT_WEBHOOK_TOLERANCE_SECS,
            config,
        )
    }

    /// Wire the engine over arbitrary stores and gateway
    pub fn assemble(
        stores: BillingStores,
        gateway: Arc<dyn PaymentGateway>,
        webhook_secret: String,
        tolerance_secs: i64,
        config: BillingConfig,
    ) -> Self {
        let config = Arc::new(config);

        let reconciler = PurchaseReconciler::new(
            gateway.clone(),
            stores.purchases.clone(),
            stores.ledger.clone(),
            stores.notifier.clone(),
            config.clone(),
        );
        let schedules = InstallmentScheduleManager::new(
            stores.schedules.clone(),
            stores.ledger.clone(),
            gateway.clone(),
        );
        let maintenance = MaintenanceJobs::new(
            stores.ledger.clone(),
            stores.accounts.clone(),
            stores.notifier.clone(),
            config.clone(),
        );
        let webhooks = WebhookHandler::new(
            webhook_secret,
            tolerance_secs,
            stores.events,
            gateway,
            stores.accounts,
            stores.purchases,
            reconciler.clone(),
            schedules.clone(),
            config,
        );

        Self {
            reconciler,
            schedules,
            maintenance,
            webhooks,
            invariants: None,
        }
    }
}
