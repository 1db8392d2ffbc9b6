//! Scheduled ledger maintenance
//!
//! Three independent sweeps over the ledger: expiry, allowance rollover and
//! expiry notifications. Runs may overlap; each sweep delegates to primitives
//! that are safe to repeat. A failure for one owner is recorded in the
//! summary and does not stop the sweep.

use std::collections::BTreeMap;
use std::sync::Arc;

use coachledger_shared::{OwnerRef, OwnerType};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::accounts::AccountStore;
use crate::config::BillingConfig;
use crate::effects::SideEffect;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{CreditBatch, CreditLedger};
use crate::notifications::{notify, NewNotification, Notifier, TYPE_CREDITS_EXPIRING};

pub const USER_EXPIRY_TITLE: &str = "Your credits are expiring soon";
pub const ORG_EXPIRY_TITLE: &str = "Organization credits are expiring soon";

/// Which sweep to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceJob {
    ExpireCredits,
    Rollover,
    ExpiryNotifications,
}

impl MaintenanceJob {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceJob::ExpireCredits => "expire-credits",
            MaintenanceJob::Rollover => "rollover",
            MaintenanceJob::ExpiryNotifications => "expiry-notifications",
        }
    }
}

impl std::str::FromStr for MaintenanceJob {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expire-credits" => Ok(MaintenanceJob::ExpireCredits),
            "rollover" => Ok(MaintenanceJob::Rollover),
            "expiry-notifications" => Ok(MaintenanceJob::ExpiryNotifications),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown maintenance job: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpirySummary {
    pub expired: u64,
}

/// Per-owner rollover result
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RolloverResult {
    RolledOver { owner: OwnerRef, amount: i64, cap: i64 },
    NothingToRoll { owner: OwnerRef },
    Error { owner: OwnerRef, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloverSummary {
    pub owners: usize,
    pub rolled_over: usize,
    pub total_credits: i64,
    pub errors: usize,
    pub results: Vec<RolloverResult>,
}

impl RolloverSummary {
    fn from_results(results: Vec<RolloverResult>) -> Self {
        let mut summary = RolloverSummary {
            owners: results.len(),
            rolled_over: 0,
            total_credits: 0,
            errors: 0,
            results: Vec::new(),
        };
        for result in &results {
            match result {
                RolloverResult::RolledOver { amount, .. } => {
                    summary.rolled_over += 1;
                    summary.total_credits += amount;
                }
                RolloverResult::NothingToRoll { .. } => {}
                RolloverResult::Error { .. } => summary.errors += 1,
            }
        }
        summary.results = results;
        summary
    }
}

/// Per-owner notification result
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NotificationResult {
    Notified {
        owner: OwnerRef,
        credits: i64,
        recipients: usize,
    },
    Suppressed {
        owner: OwnerRef,
    },
    Error {
        owner: OwnerRef,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationSummary {
    pub owners: usize,
    pub notified: usize,
    pub suppressed: usize,
    pub errors: usize,
    pub results: Vec<NotificationResult>,
}

impl NotificationSummary {
    fn from_results(results: Vec<NotificationResult>) -> Self {
        let count = |pred: fn(&NotificationResult) -> bool| {
            results.iter().filter(|r| pred(r)).count()
        };
        NotificationSummary {
            owners: results.len(),
            notified: count(|r| matches!(r, NotificationResult::Notified { .. })),
            suppressed: count(|r| matches!(r, NotificationResult::Suppressed { .. })),
            errors: count(|r| matches!(r, NotificationResult::Error { .. })),
            results,
        }
    }
}

/// Summary of whichever job ran
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MaintenanceReport {
    Expiry(ExpirySummary),
    Rollover(RolloverSummary),
    Notifications(NotificationSummary),
}

#[derive(Clone)]
pub struct MaintenanceJobs {
    ledger: Arc<dyn CreditLedger>,
    accounts: Arc<dyn AccountStore>,
    notifier: Arc<dyn Notifier>,
    config: Arc<BillingConfig>,
}

impl MaintenanceJobs {
    pub fn new(
        ledger: Arc<dyn CreditLedger>,
        accounts: Arc<dyn AccountStore>,
        notifier: Arc<dyn Notifier>,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            ledger,
            accounts,
            notifier,
            config,
        }
    }

    pub async fn run(
        &self,
        job: MaintenanceJob,
        now: OffsetDateTime,
    ) -> BillingResult<MaintenanceReport> {
        match job {
            MaintenanceJob::ExpireCredits => self
                .expire_credits(now)
                .await
                .map(MaintenanceReport::Expiry),
            MaintenanceJob::Rollover => self
                .rollover_allowances(now)
                .await
                .map(MaintenanceReport::Rollover),
            MaintenanceJob::ExpiryNotifications => self
                .notify_expiring(now)
                .await
                .map(MaintenanceReport::Notifications),
        }
    }

    /// Expire every live batch past its expiry
    pub async fn expire_credits(&self, now: OffsetDateTime) -> BillingResult<ExpirySummary> {
        let expired = self.ledger.expire_batches(now).await?;
        tracing::info!(expired = expired, "Credit expiry sweep complete");
        Ok(ExpirySummary { expired })
    }

    /// Roll unused allowance forward for every active subscription owner
    pub async fn rollover_allowances(&self, now: OffsetDateTime) -> BillingResult<RolloverSummary> {
        let owners = self.accounts.active_subscription_owners().await?;
        let mut results = Vec::with_capacity(owners.len());

        for subscriber in owners {
            let owner = subscriber.owner;
            let cap = self.config.rollover_cap(subscriber.monthly_credit_allowance);

            let result = match self.ledger.rollover(owner, cap, now).await {
                Ok(0) => RolloverResult::NothingToRoll { owner },
                Ok(amount) => RolloverResult::RolledOver { owner, amount, cap },
                Err(e) => {
                    tracing::error!(owner = %owner, error = %e, "Rollover failed");
                    RolloverResult::Error {
                        owner,
                        error: e.to_string(),
                    }
                }
            };
            results.push(result);
        }

        let summary = RolloverSummary::from_results(results);
        tracing::info!(
            owners = summary.owners,
            rolled_over = summary.rolled_over,
            total_credits = summary.total_credits,
            errors = summary.errors,
            "Rollover sweep complete"
        );
        Ok(summary)
    }

    /// Warn owners about credits expiring within their notice window
    pub async fn notify_expiring(&self, now: OffsetDateTime) -> BillingResult<NotificationSummary> {
        let mut results = Vec::new();

        for (owner_type, window) in [
            (OwnerType::User, self.config.user_notice_window),
            (OwnerType::Org, self.config.org_notice_window),
        ] {
            let batches = self
                .ledger
                .batches_expiring_between(owner_type, now, now + window)
                .await?;

            for (owner_id, owner_batches) in group_by_owner(batches) {
                let owner = OwnerRef {
                    owner_type,
                    owner_id,
                };
                let result = match self.notify_owner(owner, &owner_batches, now).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(owner = %owner, error = %e, "Expiry notification failed");
                        NotificationResult::Error {
                            owner,
                            error: e.to_string(),
                        }
                    }
                };
                results.push(result);
            }
        }

        let summary = NotificationSummary::from_results(results);
        tracing::info!(
            owners = summary.owners,
            notified = summary.notified,
            suppressed = summary.suppressed,
            errors = summary.errors,
            "Expiry notification sweep complete"
        );
        Ok(summary)
    }

    async fn notify_owner(
        &self,
        owner: OwnerRef,
        batches: &[CreditBatch],
        now: OffsetDateTime,
    ) -> BillingResult<NotificationResult> {
        let credits: i64 = batches.iter().map(|b| b.remaining_amount).sum();
        let Some(earliest) = batches.iter().map(|b| b.expires_at).min() else {
            return Ok(NotificationResult::Suppressed { owner });
        };

        let title = match owner.owner_type {
            OwnerType::User => USER_EXPIRY_TITLE,
            OwnerType::Org => ORG_EXPIRY_TITLE,
        };
        let since = now - self.config.notification_dedup_window;

        let mut sent = 0;
        for recipient in self.accounts.recipients_for(owner).await? {
            if self
                .notifier
                .was_notified_since(recipient, title, owner, since)
                .await?
            {
                continue;
            }

            let outcome = notify(
                self.notifier.as_ref(),
                NewNotification {
                    user_id: recipient,
                    type_key: TYPE_CREDITS_EXPIRING.to_string(),
                    title: title.to_string(),
                    message: format!(
                        "{} credits expire within {} days, starting {}.",
                        credits,
                        days_until(now, earliest),
                        earliest.date()
                    ),
                    link: Some(self.config.credits_link.clone()),
                    metadata: serde_json::json!({
                        "owner_type": owner.owner_type,
                        "owner_id": owner.owner_id,
                        "credits": credits,
                        "batch_count": batches.len(),
                        "earliest_expiry": earliest.unix_timestamp(),
                    }),
                },
            )
            .await;

            if outcome == SideEffect::Done {
                sent += 1;
            }
        }

        if sent == 0 {
            return Ok(NotificationResult::Suppressed { owner });
        }

        Ok(NotificationResult::Notified {
            owner,
            credits,
            recipients: sent,
        })
    }
}

fn group_by_owner(batches: Vec<CreditBatch>) -> BTreeMap<Uuid, Vec<CreditBatch>> {
    let mut grouped: BTreeMap<Uuid, Vec<CreditBatch>> = BTreeMap::new();
    for batch in batches {
        grouped.entry(batch.owner.owner_id).or_default().push(batch);
    }
    grouped
}

fn days_until(now: OffsetDateTime, at: OffsetDateTime) -> i64 {
    let remaining = at - now;
    (remaining + Duration::hours(23)).whole_days().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_names_round_trip_through_paths() {
        for job in [
            MaintenanceJob::ExpireCredits,
            MaintenanceJob::Rollover,
            MaintenanceJob::ExpiryNotifications,
        ] {
            assert_eq!(job.as_str().parse::<MaintenanceJob>().unwrap(), job);
        }
        assert!("vacuum".parse::<MaintenanceJob>().is_err());
    }

    #[test]
    fn test_days_until_rounds_up() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(days_until(now, now + Duration::hours(1)), 1);
        assert_eq!(days_until(now, now + Duration::days(6)), 6);
        assert_eq!(days_until(now, now + Duration::days(6) + Duration::hours(2)), 7);
    }

    #[test]
    fn test_rollover_summary_counts() {
        let owner = OwnerRef::user(Uuid::new_v4());
        let summary = RolloverSummary::from_results(vec![
            RolloverResult::RolledOver {
                owner,
                amount: 40,
                cap: 50,
            },
            RolloverResult::NothingToRoll { owner },
            RolloverResult::Error {
                owner,
                error: "db".to_string(),
            },
        ]);
        assert_eq!(summary.owners, 3);
        assert_eq!(summary.rolled_over, 1);
        assert_eq!(summary.total_credits, 40);
        assert_eq!(summary.errors, 1);
    }
}
