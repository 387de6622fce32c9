//! Reasons the engine produces no recommendation for a limit.

use guardrail_core::LimitKind;
use thiserror::Error;

pub type DecisionResult<T> = Result<T, DecisionError>;

/// None of these are fatal: the limit is skipped for this cycle.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecisionError {
    #[error("limit {limit} is disabled")]
    Disabled { limit: String },

    #[error("limit {limit} is {kind:?} and has no manual override")]
    NonNumeric { limit: String, kind: LimitKind },

    #[error("not enough data for {tenant}/{limit}")]
    InsufficientData { tenant: String, limit: String },

    #[error("override for {limit} is {found:?}, expected {expected:?}")]
    KindMismatch {
        limit: String,
        expected: LimitKind,
        found: LimitKind,
    },
}
