//! CoachLedger Background Worker
//!
//! Handles scheduled jobs including:
//! - Allowance rollover (monthly, 00:30 UTC on the 1st)
//! - Credit expiry sweep (daily at 01:00 UTC)
//! - Expiry notifications (daily at 09:00 UTC)
//! - Billing invariant checks (daily at 03:00 UTC)
//!
//! Rollover runs ahead of the expiry sweep so allowance batches ending at
//! midnight are rolled before they are expired.

use std::sync::Arc;
use std::time::Duration;

use coachledger_billing::{
    BillingService, InvariantCheckSummary, MaintenanceJob, MaintenanceReport, NotificationResult,
    RolloverResult, ViolationSeverity,
};
use coachledger_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Log results of a maintenance run
fn log_maintenance_results(job: MaintenanceJob, report: &MaintenanceReport) {
    match report {
        MaintenanceReport::Expiry(summary) => {
            info!(job = job.as_str(), expired = summary.expired, "Expiry sweep complete");
        }
        MaintenanceReport::Rollover(summary) => {
            info!(
                job = job.as_str(),
                owners = summary.owners,
                rolled_over = summary.rolled_over,
                total_credits = summary.total_credits,
                errors = summary.errors,
                "Rollover cycle complete"
            );
            for result in &summary.results {
                if let RolloverResult::Error { owner, error } = result {
                    error!(owner = %owner, error = %error, "Failed to roll over allowance");
                }
            }
        }
        MaintenanceReport::Notifications(summary) => {
            info!(
                job = job.as_str(),
                owners = summary.owners,
                notified = summary.notified,
                suppressed = summary.suppressed,
                errors = summary.errors,
                "Expiry notification cycle complete"
            );
            for result in &summary.results {
                if let NotificationResult::Error { owner, error } = result {
                    error!(owner = %owner, error = %error, "Failed to send expiry notification");
                }
            }
        }
    }
}

/// Log results of invariant checks
fn log_invariant_results(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Billing invariant checks passed"
        );
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant violations found"
    );
    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                subjects = ?violation.subject_ids,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                subjects = ?violation.subject_ids,
                "{}",
                violation.description
            ),
        }
    }
}

async fn add_maintenance_job(
    scheduler: &JobScheduler,
    schedule: &str,
    billing: Arc<BillingService>,
    job: MaintenanceJob,
) -> anyhow::Result<()> {
    scheduler
        .add(Job::new_async(schedule, move |_uuid, _l| {
            let billing = billing.clone();
            Box::pin(async move {
                info!(job = job.as_str(), "Running scheduled maintenance job");
                match billing
                    .maintenance
                    .run(job, OffsetDateTime::now_utc())
                    .await
                {
                    Ok(report) => log_maintenance_results(job, &report),
                    Err(e) => error!(job = job.as_str(), error = %e, "Maintenance job failed"),
                }
            })
        })?)
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting CoachLedger Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = match BillingService::from_env(pool) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without Stripe configuration there is nothing safe to sweep
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Cron: 00:30 UTC on the first of each month
    add_maintenance_job(
        &scheduler,
        "0 30 0 1 * *",
        billing.clone(),
        MaintenanceJob::Rollover,
    )
    .await?;
    info!("Scheduled: Allowance rollover (monthly, 00:30 UTC on the 1st)");

    add_maintenance_job(
        &scheduler,
        "0 0 1 * * *",
        billing.clone(),
        MaintenanceJob::ExpireCredits,
    )
    .await?;
    info!("Scheduled: Credit expiry sweep (daily at 01:00 UTC)");

    add_maintenance_job(
        &scheduler,
        "0 0 9 * * *",
        billing.clone(),
        MaintenanceJob::ExpiryNotifications,
    )
    .await?;
    info!("Scheduled: Expiry notifications (daily at 09:00 UTC)");

    if let Some(checker) = billing.invariants.clone() {
        scheduler
            .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
                let checker = checker.clone();
                Box::pin(async move {
                    info!("Running billing invariant checks");
                    match checker.run_all_checks().await {
                        Ok(summary) => log_invariant_results(&summary),
                        Err(e) => error!(error = %e, "Invariant checks failed to run"),
                    }
                })
            })?)
            .await?;
        info!("Scheduled: Billing invariant checks (daily at 03:00 UTC)");
    }

    // Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("CoachLedger Worker started");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
