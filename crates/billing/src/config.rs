//! Ledger policy configuration

use time::Duration;

/// Default validity for purchased credits when a package does not set one
pub const DEFAULT_VALIDITY_MONTHS: u32 = 12;

/// Share of the monthly allowance that may roll into the next period
pub const DEFAULT_ROLLOVER_PERCENT: u8 = 50;

/// Expiry warning lead time for individual owners
pub const USER_EXPIRY_NOTICE_DAYS: i64 = 7;

/// Organizations get a longer lead time to reallocate shared pools
pub const ORG_EXPIRY_NOTICE_DAYS: i64 = 30;

/// Window in which an identical notification is not sent twice
pub const NOTIFICATION_DEDUP_HOURS: i64 = 24;

/// Well-known key of the baseline plan
pub const DEFAULT_FREE_PLAN_KEY: &str = "free";

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub default_validity_months: u32,
    pub rollover_percent: u8,
    pub user_notice_window: Duration,
    pub org_notice_window: Duration,
    pub notification_dedup_window: Duration,
    pub free_plan_key: String,
    /// Link shown in expiry and purchase notifications
    pub credits_link: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            default_validity_months: DEFAULT_VALIDITY_MONTHS,
            rollover_percent: DEFAULT_ROLLOVER_PERCENT,
            user_notice_window: Duration::days(USER_EXPIRY_NOTICE_DAYS),
            org_notice_window: Duration::days(ORG_EXPIRY_NOTICE_DAYS),
            notification_dedup_window: Duration::hours(NOTIFICATION_DEDUP_HOURS),
            free_plan_key: DEFAULT_FREE_PLAN_KEY.to_string(),
            credits_link: "/credits".to_string(),
        }
    }
}

impl BillingConfig {
    /// Load overrides from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let default_validity_months = std::env::var("CREDIT_DEFAULT_VALIDITY_MONTHS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|m| *m > 0)
            .unwrap_or(defaults.default_validity_months);

        let rollover_percent = std::env::var("ROLLOVER_PERCENT")
            .ok()
            .and_then(|v| v.parse::<u8>().ok())
            .map(|p| p.min(100))
            .unwrap_or(defaults.rollover_percent);

        let free_plan_key =
            std::env::var("FREE_PLAN_KEY").unwrap_or(defaults.free_plan_key.clone());

        let credits_link = std::env::var("CREDITS_LINK").unwrap_or(defaults.credits_link.clone());

        Self {
            default_validity_months,
            rollover_percent,
            free_plan_key,
            credits_link,
            ..defaults
        }
    }

    /// Rollover cap for a periodic allowance
    pub fn rollover_cap(&self, monthly_allowance: i64) -> i64 {
        monthly_allowance.max(0) * i64::from(self.rollover_percent) / 100
    }
}
