//! Ledger vocabulary shared across crates
//!
//! All enums are persisted as lowercase/snake_case TEXT columns, so each one
//! carries an `as_str` / `FromStr` pair instead of a database enum type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned when a persisted status string is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Who owns a credit balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    User,
    Org,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::User => "user",
            OwnerType::Org => "org",
        }
    }
}

impl fmt::Display for OwnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OwnerType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(OwnerType::User),
            "org" => Ok(OwnerType::Org),
            other => Err(ParseEnumError::new("owner_type", other)),
        }
    }
}

/// A fully-qualified ledger owner (individual user or organization)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
}

impl OwnerRef {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            owner_type: OwnerType::User,
            owner_id: user_id,
        }
    }

    pub fn org(org_id: Uuid) -> Self {
        Self {
            owner_type: OwnerType::Org,
            owner_id: org_id,
        }
    }

    pub fn is_org(&self) -> bool {
        self.owner_type == OwnerType::Org
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_type, self.owner_id)
    }
}

/// Why a credit batch exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditSourceType {
    Purchase,
    SubscriptionAllowance,
    Rollover,
    Bonus,
}

impl CreditSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditSourceType::Purchase => "purchase",
            CreditSourceType::SubscriptionAllowance => "subscription_allowance",
            CreditSourceType::Rollover => "rollover",
            CreditSourceType::Bonus => "bonus",
        }
    }
}

impl fmt::Display for CreditSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditSourceType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(CreditSourceType::Purchase),
            "subscription_allowance" => Ok(CreditSourceType::SubscriptionAllowance),
            "rollover" => Ok(CreditSourceType::Rollover),
            "bonus" => Ok(CreditSourceType::Bonus),
            other => Err(ParseEnumError::new("source_type", other)),
        }
    }
}

/// Lifecycle of a credit batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Active,
    Partial,
    Depleted,
    Expired,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Active => "active",
            BatchStatus::Partial => "partial",
            BatchStatus::Depleted => "depleted",
            BatchStatus::Expired => "expired",
        }
    }

    /// Batches that can still be consumed, expired or rolled over
    pub fn is_live(&self) -> bool {
        matches!(self, BatchStatus::Active | BatchStatus::Partial)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BatchStatus::Active),
            "partial" => Ok(BatchStatus::Partial),
            "depleted" => Ok(BatchStatus::Depleted),
            "expired" => Ok(BatchStatus::Expired),
            other => Err(ParseEnumError::new("batch_status", other)),
        }
    }
}

/// Lifecycle of a purchase record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Pending,
    Completed,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PurchaseStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PurchaseStatus::Pending),
            "completed" => Ok(PurchaseStatus::Completed),
            other => Err(ParseEnumError::new("purchase_status", other)),
        }
    }
}

/// Installment plan state machine
///
/// `Active <-> Outstanding` until the plan reaches one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Outstanding,
    Completed,
    Defaulted,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Outstanding => "outstanding",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Defaulted => "defaulted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScheduleStatus::Completed | ScheduleStatus::Defaulted)
    }

    /// Whether content access should be withheld from the payer
    pub fn locks_access(&self) -> bool {
        matches!(self, ScheduleStatus::Outstanding | ScheduleStatus::Defaulted)
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ScheduleStatus::Active),
            "outstanding" => Ok(ScheduleStatus::Outstanding),
            "completed" => Ok(ScheduleStatus::Completed),
            "defaulted" => Ok(ScheduleStatus::Defaulted),
            other => Err(ParseEnumError::new("schedule_status", other)),
        }
    }
}
