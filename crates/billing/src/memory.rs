//! In-memory store and gateway
//!
//! Implements every storage seam over a single mutex-guarded state with the
//! same conditional-write semantics as the Postgres stores. Each trait call
//! takes the lock once, so interleavings between calls stay possible and the
//! race paths of the engine are exercised for real. Used by the test suites
//! and for running the API without a database.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use coachledger_shared::{
    BatchStatus, CreditSourceType, OwnerRef, OwnerType, PurchaseStatus, ScheduleStatus,
};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::accounts::{AccountStore, Plan, SubscriptionOwner, ORG_SUBSCRIPTION_ACTIVE};
use crate::error::{BillingError, BillingResult};
use crate::events::{CheckoutSession, Subscription, SubscriptionStatus};
use crate::gateway::PaymentGateway;
use crate::ledger::{add_months, CreditBatch, CreditLedger, GrantOutcome, GrantRequest, ROLLOVER_HORIZON};
use crate::notifications::{NewNotification, Notifier};
use crate::purchases::{CreditPackage, NewPurchase, PurchaseRecord, PurchaseStore};
use crate::schedules::{NewSchedule, PaymentSchedule, ScheduleStore, ScheduleTransition};
use crate::webhooks::{EventClaim, WebhookEventLog, PROCESSING_TIMEOUT_MINUTES};

/// A notification as stored
#[derive(Debug, Clone)]
pub struct StoredNotification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub type_key: String,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct OrgRecord {
    pub plan_id: Option<Uuid>,
    pub stripe_subscription_id: Option<String>,
    pub subscription_status: Option<String>,
    pub admins: Vec<Uuid>,
}

#[derive(Debug, Clone)]
struct UserLink {
    plan_id: Uuid,
    stripe_subscription_id: Option<String>,
}

#[derive(Debug, Clone)]
struct WebhookEventRow {
    processing_result: String,
    processing_started_at: OffsetDateTime,
}

#[derive(Default)]
struct State {
    batches: Vec<CreditBatch>,
    packages: HashMap<Uuid, CreditPackage>,
    purchases: HashMap<String, PurchaseRecord>,
    schedules: HashMap<String, PaymentSchedule>,
    plans: Vec<Plan>,
    price_plans: HashMap<String, Uuid>,
    users: HashMap<Uuid, UserLink>,
    orgs: HashMap<Uuid, OrgRecord>,
    notifications: Vec<StoredNotification>,
    webhook_events: HashMap<String, WebhookEventRow>,
    notifications_failing: bool,
    failing_owners: HashSet<OwnerRef>,
}

/// Every billing store over shared in-process state
#[derive(Default)]
pub struct InMemoryBilling {
    state: Mutex<State>,
}

impl InMemoryBilling {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_package(&self, package: CreditPackage) {
        self.state.lock().await.packages.insert(package.id, package);
    }

    /// Register a plan and the gateway prices that resolve to it
    pub async fn add_plan(&self, plan: Plan, price_ids: &[&str]) {
        let mut state = self.state.lock().await;
        for price_id in price_ids {
            state.price_plans.insert(price_id.to_string(), plan.id);
        }
        state.plans.push(plan);
    }

    pub async fn add_org(&self, org_id: Uuid, admins: Vec<Uuid>) {
        self.state.lock().await.orgs.insert(
            org_id,
            OrgRecord {
                admins,
                ..OrgRecord::default()
            },
        );
    }

    /// Make notification writes fail, to exercise best-effort paths
    pub async fn set_notifications_failing(&self, failing: bool) {
        self.state.lock().await.notifications_failing = failing;
    }

    /// Make per-owner reads and writes for `owner` fail, to exercise sweep isolation
    pub async fn fail_owner(&self, owner: OwnerRef) {
        self.state.lock().await.failing_owners.insert(owner);
    }

    pub async fn batches(&self) -> Vec<CreditBatch> {
        self.state.lock().await.batches.clone()
    }

    pub async fn batches_for(&self, owner: OwnerRef) -> Vec<CreditBatch> {
        self.state
            .lock()
            .await
            .batches
            .iter()
            .filter(|b| b.owner == owner)
            .cloned()
            .collect()
    }

    pub async fn purchase(&self, session_id: &str) -> Option<PurchaseRecord> {
        self.state.lock().await.purchases.get(session_id).cloned()
    }

    pub async fn schedule(&self, subscription_id: &str) -> Option<PaymentSchedule> {
        self.state.lock().await.schedules.get(subscription_id).cloned()
    }

    pub async fn schedule_count(&self) -> usize {
        self.state.lock().await.schedules.len()
    }

    pub async fn notifications(&self) -> Vec<StoredNotification> {
        self.state.lock().await.notifications.clone()
    }

    pub async fn notifications_for(&self, user_id: Uuid) -> Vec<StoredNotification> {
        self.state
            .lock()
            .await
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn user_plan(&self, user_id: Uuid) -> Option<Uuid> {
        self.state.lock().await.users.get(&user_id).map(|u| u.plan_id)
    }

    pub async fn org(&self, org_id: Uuid) -> Option<OrgRecord> {
        self.state.lock().await.orgs.get(&org_id).cloned()
    }

    pub async fn webhook_event_status(&self, event_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .webhook_events
            .get(event_id)
            .map(|e| e.processing_result.clone())
    }
}

fn existing_batch<'a>(
    batches: &'a [CreditBatch],
    owner: OwnerRef,
    source_type: CreditSourceType,
    source_reference_id: Uuid,
) -> Option<&'a CreditBatch> {
    batches.iter().find(|b| {
        b.owner == owner
            && b.source_type == source_type
            && b.source_reference_id == source_reference_id
    })
}

#[async_trait]
impl CreditLedger for InMemoryBilling {
    async fn grant_batch(&self, request: GrantRequest) -> BillingResult<GrantOutcome> {
        request.validate()?;
        let mut state = self.state.lock().await;

        if let Some(batch) = existing_batch(
            &state.batches,
            request.owner,
            request.source_type,
            request.source_reference_id,
        ) {
            return Ok(GrantOutcome {
                batch_id: batch.id,
                created: false,
            });
        }

        let batch_id = Uuid::new_v4();
        state.batches.push(CreditBatch {
            id: batch_id,
            owner: request.owner,
            original_amount: request.amount,
            remaining_amount: request.amount,
            source_type: request.source_type,
            feature_key: request.feature_key,
            source_reference_id: request.source_reference_id,
            description: request.description,
            expires_at: request.expires_at,
            status: BatchStatus::Active,
            created_at: OffsetDateTime::now_utc(),
        });

        Ok(GrantOutcome {
            batch_id,
            created: true,
        })
    }

    async fn expire_batches(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for batch in state.batches.iter_mut() {
            if batch.status.is_live() && batch.expires_at <= now {
                batch.status = BatchStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn rollover(
        &self,
        owner: OwnerRef,
        max_amount: i64,
        now: OffsetDateTime,
    ) -> BillingResult<i64> {
        let mut state = self.state.lock().await;
        if state.failing_owners.contains(&owner) {
            return Err(BillingError::Database(format!("rollover failed for {}", owner)));
        }
        if max_amount <= 0 {
            return Ok(0);
        }

        let horizon = now + ROLLOVER_HORIZON;

        let mut sources: Vec<&mut CreditBatch> = state
            .batches
            .iter_mut()
            .filter(|b| {
                b.owner == owner
                    && b.source_type == CreditSourceType::SubscriptionAllowance
                    && b.status.is_live()
                    && b.remaining_amount > 0
                    && b.expires_at <= horizon
            })
            .collect();
        sources.sort_by_key(|b| (b.expires_at, b.id));

        let Some(anchor_id) = sources.first().map(|b| b.id) else {
            return Ok(0);
        };

        let unused: i64 = sources.iter().map(|b| b.remaining_amount).sum();
        let rolled = unused.min(max_amount);
        for batch in sources {
            batch.remaining_amount = 0;
            batch.status = BatchStatus::Depleted;
        }

        if existing_batch(&state.batches, owner, CreditSourceType::Rollover, anchor_id).is_none() {
            state.batches.push(CreditBatch {
                id: Uuid::new_v4(),
                owner,
                original_amount: rolled,
                remaining_amount: rolled,
                source_type: CreditSourceType::Rollover,
                feature_key: None,
                source_reference_id: anchor_id,
                description: format!("Rollover of {} unused credits", rolled),
                expires_at: add_months(now, 1),
                status: BatchStatus::Active,
                created_at: now,
            });
        }

        Ok(rolled)
    }

    async fn batches_expiring_between(
        &self,
        owner_type: OwnerType,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<CreditBatch>> {
        let state = self.state.lock().await;
        let mut batches: Vec<CreditBatch> = state
            .batches
            .iter()
            .filter(|b| {
                b.owner.owner_type == owner_type
                    && b.status.is_live()
                    && b.remaining_amount > 0
                    && b.expires_at > from
                    && b.expires_at <= until
            })
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.owner.owner_id, b.expires_at));
        Ok(batches)
    }

    async fn batches_for_reference(
        &self,
        source_type: CreditSourceType,
        source_reference_id: Uuid,
    ) -> BillingResult<Vec<CreditBatch>> {
        let state = self.state.lock().await;
        Ok(state
            .batches
            .iter()
            .filter(|b| b.source_type == source_type && b.source_reference_id == source_reference_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PurchaseStore for InMemoryBilling {
    async fn find_package(&self, package_id: Uuid) -> BillingResult<Option<CreditPackage>> {
        Ok(self.state.lock().await.packages.get(&package_id).cloned())
    }

    async fn find_by_session(&self, session_id: &str) -> BillingResult<Option<PurchaseRecord>> {
        Ok(self.state.lock().await.purchases.get(session_id).cloned())
    }

    async fn create_pending(&self, purchase: NewPurchase) -> BillingResult<PurchaseRecord> {
        purchase.validate()?;
        let mut state = self.state.lock().await;
        let record = state
            .purchases
            .entry(purchase.checkout_session_id.clone())
            .or_insert_with(|| {
                purchase.into_record(
                    Uuid::new_v4(),
                    PurchaseStatus::Pending,
                    OffsetDateTime::now_utc(),
                )
            });
        Ok(record.clone())
    }

    async fn complete_pending(
        &self,
        session_id: &str,
        payment_intent_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseRecord>> {
        let mut state = self.state.lock().await;
        match state.purchases.get_mut(session_id) {
            Some(record) if record.status == PurchaseStatus::Pending => {
                record.status = PurchaseStatus::Completed;
                record.completed_at = Some(now);
                if let Some(pi) = payment_intent_id {
                    record.payment_intent_id = Some(pi.to_string());
                }
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn insert_completed(
        &self,
        purchase: NewPurchase,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PurchaseRecord>> {
        purchase.validate()?;
        let mut state = self.state.lock().await;
        if state.purchases.contains_key(&purchase.checkout_session_id) {
            return Ok(None);
        }
        let session_id = purchase.checkout_session_id.clone();
        let record = purchase.into_record(Uuid::new_v4(), PurchaseStatus::Completed, now);
        state.purchases.insert(session_id, record.clone());
        Ok(Some(record))
    }
}

#[async_trait]
impl ScheduleStore for InMemoryBilling {
    async fn create_if_absent(
        &self,
        schedule: NewSchedule,
    ) -> BillingResult<(PaymentSchedule, bool)> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.schedules.get(&schedule.stripe_subscription_id) {
            return Ok((existing.clone(), false));
        }
        let subscription_id = schedule.stripe_subscription_id.clone();
        let created = schedule.into_schedule(Uuid::new_v4(), OffsetDateTime::now_utc());
        state.schedules.insert(subscription_id, created.clone());
        Ok((created, true))
    }

    async fn attach_batch(&self, schedule_id: Uuid, batch_id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(schedule) = state.schedules.values_mut().find(|s| s.id == schedule_id) {
            if schedule.credit_batch_id.is_none() {
                schedule.credit_batch_id = Some(batch_id);
            }
        }
        Ok(())
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<PaymentSchedule>> {
        Ok(self.state.lock().await.schedules.get(subscription_id).cloned())
    }

    async fn schedules_for_owner(&self, owner: OwnerRef) -> BillingResult<Vec<PaymentSchedule>> {
        let state = self.state.lock().await;
        Ok(state
            .schedules
            .values()
            .filter(|s| s.owner == owner)
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        current: &PaymentSchedule,
        next: ScheduleTransition,
    ) -> BillingResult<Option<PaymentSchedule>> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.schedules.get_mut(&current.stripe_subscription_id) else {
            return Err(BillingError::ScheduleNotFound(
                current.stripe_subscription_id.clone(),
            ));
        };

        if stored.id != current.id
            || stored.status != current.status
            || stored.installments_paid != current.installments_paid
        {
            return Ok(None);
        }

        // Same rule as the table check constraint.
        if next.status == ScheduleStatus::Completed
            && next.installments_paid < stored.installment_count
        {
            return Err(BillingError::Database(
                "completed schedule must be fully paid".to_string(),
            ));
        }

        stored.status = next.status;
        stored.installments_paid = next.installments_paid;
        stored.amount_paid_minor_units = next.amount_paid_minor_units;
        stored.next_payment_date = next.next_payment_date;
        stored.paid_invoice_ids = next.paid_invoice_ids;
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(Some(stored.clone()))
    }
}

#[async_trait]
impl AccountStore for InMemoryBilling {
    async fn plan_for_price(&self, price_id: &str) -> BillingResult<Option<Plan>> {
        let state = self.state.lock().await;
        Ok(state
            .price_plans
            .get(price_id)
            .and_then(|plan_id| state.plans.iter().find(|p| p.id == *plan_id))
            .cloned())
    }

    async fn plan_by_key(&self, key: &str) -> BillingResult<Option<Plan>> {
        let state = self.state.lock().await;
        Ok(state.plans.iter().find(|p| p.key == key).cloned())
    }

    async fn set_user_plan(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        subscription_id: Option<&str>,
    ) -> BillingResult<()> {
        self.state.lock().await.users.insert(
            user_id,
            UserLink {
                plan_id,
                stripe_subscription_id: subscription_id.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn link_org_subscription(
        &self,
        org_id: Uuid,
        subscription_id: &str,
        status: &str,
        plan_id: Option<Uuid>,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let org = state.orgs.entry(org_id).or_default();
        org.stripe_subscription_id = Some(subscription_id.to_string());
        org.subscription_status = Some(status.to_string());
        if plan_id.is_some() {
            org.plan_id = plan_id;
        }
        Ok(())
    }

    async fn set_org_subscription_status(
        &self,
        subscription_id: &str,
        status: &str,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let mut updated = false;
        for org in state.orgs.values_mut() {
            if org.stripe_subscription_id.as_deref() == Some(subscription_id) {
                org.subscription_status = Some(status.to_string());
                updated = true;
            }
        }
        Ok(updated)
    }

    async fn user_for_subscription(&self, subscription_id: &str) -> BillingResult<Option<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .iter()
            .find(|(_, link)| link.stripe_subscription_id.as_deref() == Some(subscription_id))
            .map(|(id, _)| *id))
    }

    async fn org_for_subscription(&self, subscription_id: &str) -> BillingResult<Option<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .orgs
            .iter()
            .find(|(_, org)| org.stripe_subscription_id.as_deref() == Some(subscription_id))
            .map(|(id, _)| *id))
    }

    async fn active_subscription_owners(&self) -> BillingResult<Vec<SubscriptionOwner>> {
        let state = self.state.lock().await;
        let allowance = |plan_id: Uuid| {
            state
                .plans
                .iter()
                .find(|p| p.id == plan_id)
                .map(|p| p.monthly_credit_allowance)
                .unwrap_or(0)
        };

        let users = state
            .users
            .iter()
            .filter(|(_, link)| link.stripe_subscription_id.is_some())
            .map(|(id, link)| SubscriptionOwner {
                owner: OwnerRef::user(*id),
                plan_id: link.plan_id,
                monthly_credit_allowance: allowance(link.plan_id),
            });

        let orgs = state.orgs.iter().filter_map(|(id, org)| {
            let plan_id = org.plan_id?;
            (org.subscription_status.as_deref() == Some(ORG_SUBSCRIPTION_ACTIVE)).then(|| {
                SubscriptionOwner {
                    owner: OwnerRef::org(*id),
                    plan_id,
                    monthly_credit_allowance: allowance(plan_id),
                }
            })
        });

        Ok(users
            .chain(orgs)
            .filter(|o| o.monthly_credit_allowance > 0)
            .collect())
    }

    async fn recipients_for(&self, owner: OwnerRef) -> BillingResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        if state.failing_owners.contains(&owner) {
            return Err(BillingError::Database(format!(
                "recipient lookup failed for {}",
                owner
            )));
        }
        match owner.owner_type {
            OwnerType::User => Ok(vec![owner.owner_id]),
            OwnerType::Org => Ok(state
                .orgs
                .get(&owner.owner_id)
                .map(|org| org.admins.clone())
                .unwrap_or_default()),
        }
    }
}

#[async_trait]
impl Notifier for InMemoryBilling {
    async fn create_notification(&self, notification: NewNotification) -> BillingResult<Uuid> {
        let mut state = self.state.lock().await;
        if state.notifications_failing {
            return Err(BillingError::Database(
                "notifications table unavailable".to_string(),
            ));
        }
        let id = Uuid::new_v4();
        state.notifications.push(StoredNotification {
            id,
            user_id: notification.user_id,
            type_key: notification.type_key,
            title: notification.title,
            message: notification.message,
            link: notification.link,
            metadata: notification.metadata,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(id)
    }

    async fn was_notified_since(
        &self,
        user_id: Uuid,
        title: &str,
        owner: OwnerRef,
        since: OffsetDateTime,
    ) -> BillingResult<bool> {
        let owner_id = owner.owner_id.to_string();
        let state = self.state.lock().await;
        Ok(state.notifications.iter().any(|n| {
            n.user_id == user_id
                && n.title == title
                && n.created_at >= since
                && n.metadata.get("owner_type").and_then(|v| v.as_str())
                    == Some(owner.owner_type.as_str())
                && n.metadata.get("owner_id").and_then(|v| v.as_str()) == Some(owner_id.as_str())
        }))
    }
}

#[async_trait]
impl WebhookEventLog for InMemoryBilling {
    async fn claim(
        &self,
        event_id: &str,
        _event_type: &str,
        _event_timestamp: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let stuck_before = now - Duration::minutes(i64::from(PROCESSING_TIMEOUT_MINUTES));

        match state.webhook_events.get_mut(event_id) {
            Some(row)
                if row.processing_result == "error"
                    || (row.processing_result == "processing"
                        && row.processing_started_at < stuck_before) =>
            {
                row.processing_result = "processing".to_string();
                row.processing_started_at = now;
                Ok(EventClaim::Claimed)
            }
            Some(row) => Ok(EventClaim::Duplicate(row.processing_result.clone())),
            None => {
                state.webhook_events.insert(
                    event_id.to_string(),
                    WebhookEventRow {
                        processing_result: "processing".to_string(),
                        processing_started_at: now,
                    },
                );
                Ok(EventClaim::Claimed)
            }
        }
    }

    async fn record_result(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.webhook_events.get_mut(event_id) {
            row.processing_result = if error.is_some() { "error" } else { "success" }.to_string();
        }
        Ok(())
    }
}

#[derive(Default)]
struct GatewayState {
    sessions: HashMap<String, CheckoutSession>,
    subscriptions: HashMap<String, Subscription>,
    cancelled: Vec<String>,
    unavailable: bool,
}

/// Gateway double holding sessions and subscriptions in memory
#[derive(Default)]
pub struct InMemoryGateway {
    state: Mutex<GatewayState>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_session(&self, session: CheckoutSession) {
        self.state
            .lock()
            .await
            .sessions
            .insert(session.id.clone(), session);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    /// Simulate the gateway being unreachable
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Subscriptions cancelled through the gateway, in call order
    pub async fn cancelled(&self) -> Vec<String> {
        self.state.lock().await.cancelled.clone()
    }
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    async fn retrieve_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSession> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(BillingError::StripeApi("connection refused".to_string()));
        }
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| BillingError::CheckoutSessionNotFound(session_id.to_string()))
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(BillingError::StripeApi("connection refused".to_string()));
        }
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(BillingError::StripeApi("connection refused".to_string()));
        }
        if let Some(subscription) = state.subscriptions.get_mut(subscription_id) {
            subscription.status = SubscriptionStatus::Canceled;
        }
        state.cancelled.push(subscription_id.to_string());
        Ok(())
    }
}
