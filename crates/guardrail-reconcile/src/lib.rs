//! guardrail-reconcile — ties the engine together.
//!
//! The [`Reconciler`] runs one Analyzer → Decision Engine → Patcher cycle on
//! a fixed interval. The [`Guardrail`] supervisor owns the reconciler, the
//! breaker registry and the emergency controller, and runs the three
//! independent tickers over that shared state.
//!
//! # Architecture
//!
//! ```text
//!            Collector                     TrafficSource     PressureSource
//!                │                               │                 │
//!   every 5m     ▼                     every 10s ▼       every 15s ▼
//!  ┌────────────────────────┐        ┌────────────────┐  ┌──────────────────────┐
//!  │ Reconciler             │        │ BreakerRegistry│◄─│ EmergencyController  │
//!  │  TrendAnalyzer         │◄───────│  sample/adapt  │  │  escalate / recover  │
//!  │  decide() per limit    │ factor └────────────────┘  └──────────────────────┘
//!  │  effective = value ×   │◄───────────────── limit factor ─────────┘
//!  │    breaker × emergency │
//!  └──────────┬─────────────┘
//!             ▼ (enforce mode only)
//!          Patcher
//! ```

pub mod interfaces;
pub mod reconciler;
pub mod supervisor;

pub use interfaces::{BoxFuture, CollectedMetrics, Collector, Patcher, PressureSource, TrafficSource};
pub use reconciler::{CycleReport, Reconciler, SkippedTenant};
pub use supervisor::{Guardrail, GuardrailParts};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
