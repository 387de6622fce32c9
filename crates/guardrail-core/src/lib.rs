//! guardrail-core — shared vocabulary for the Guardrail controller.
//!
//! Holds the domain types every subsystem exchanges (samples, analysis
//! results, recommendations, breaker and emergency state), the typed limit
//! values, the TOML configuration with its validation rules, the error
//! taxonomy, and the audit/alert sink traits.
//!
//! # Architecture
//!
//! ```text
//! guardrail.toml ──► RawConfig ──validate──► GuardrailConfig
//!                                               │
//!                                   ConfigHandle (watch, last-known-good)
//!                                               │
//!        analyzer · decision · breaker · emergency · reconcile
//! ```

pub mod config;
pub mod duration;
pub mod error;
pub mod events;
pub mod limit;
pub mod types;

pub use config::{
    AnalysisSettings, BreakerSettings, ConfigHandle, EmergencySettings, GuardrailConfig,
    ManualThresholds, Mode, Multipliers, ReconcileSettings, SpikeSettings, ThresholdMode, Tier,
};
pub use error::{ConfigError, ConfigResult, GuardrailError, GuardrailResult};
pub use events::{
    AlertEvent, AlertPriority, AlertSink, AuditAction, AuditEvent, AuditSink, Component,
    MemorySink, TracingSink,
};
pub use limit::{LimitClass, LimitDefinition, LimitKind, LimitValue, TierBounds};
pub use types::*;
