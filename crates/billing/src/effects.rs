//! Outcome of a best-effort side effect
//!
//! Notifications and gateway clean-up run after the primary write has
//! committed. Their outcome is logged and reported, never turned into an error.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SideEffect {
    Done,
    Skipped(String),
    Failed(String),
}

impl SideEffect {
    /// Collapse a fallible side effect into an outcome, logging failures
    pub fn from_result<E: std::fmt::Display>(what: &str, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => SideEffect::Done,
            Err(e) => {
                tracing::warn!(effect = %what, error = %e, "Best-effort side effect failed");
                SideEffect::Failed(e.to_string())
            }
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, SideEffect::Done)
    }
}
