#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CoachLedger shared types
//!
//! Owner and status vocabularies used by every crate in the workspace, plus
//! Postgres pool helpers and the embedded schema migrations.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{
    BatchStatus, CreditSourceType, OwnerRef, OwnerType, ParseEnumError, PurchaseStatus,
    ScheduleStatus,
};
