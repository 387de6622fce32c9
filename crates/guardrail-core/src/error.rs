//! Error taxonomy for the Guardrail controller.

use thiserror::Error;

/// Result type alias for controller operations.
pub type GuardrailResult<T> = Result<T, GuardrailError>;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while running the decision-and-protection engine.
///
/// None of these abort a reconciliation cycle: collection and apply errors
/// are scoped to one tenant, invariant violations are clamped, and an
/// unavailable pressure signal is read as elevated pressure.
#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("transient collection error for tenant {tenant}: {reason}")]
    TransientCollection { tenant: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("apply conflict for tenant {tenant}: {reason}")]
    ApplyConflict { tenant: String, reason: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("pressure signal unavailable: {0}")]
    PressureUnavailable(String),
}

/// Errors raised while loading or validating configuration.
///
/// A config that fails validation is rejected as a whole; the previous
/// configuration stays active.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("limit {name}: {reason}")]
    InvalidLimit { name: String, reason: String },

    #[error("tier {tier}: {reason}")]
    InvalidTier { tier: String, reason: String },

    #[error("override for tenant {tenant}: {reason}")]
    InvalidOverride { tenant: String, reason: String },

    #[error("{section}: {reason}")]
    Invalid { section: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(section: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            section,
            reason: reason.into(),
        }
    }

    pub(crate) fn limit(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidLimit {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
