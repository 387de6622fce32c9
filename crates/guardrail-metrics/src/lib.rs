//! guardrail-metrics — observability for the Guardrail controller.
//!
//! Counts reconciliation outcomes with lock-free atomics and renders the
//! controller's posture (breakers, emergency level, recommendations) as
//! Prometheus-compatible text.
//!
//! # Architecture
//!
//! ```text
//! CycleStats
//!   ├── record_*() ← called by the reconciler
//!   └── counters() → CycleCounters
//!
//! Prometheus exposition
//!   └── render_prometheus(&GuardrailSnapshot) → text/plain for /metrics
//! ```

pub mod counters;
pub mod prometheus;

pub use counters::CycleStats;
pub use prometheus::render_prometheus;
