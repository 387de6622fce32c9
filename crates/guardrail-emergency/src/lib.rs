//! guardrail-emergency — multi-level escalation on aggregate backend pressure.
//!
//! # Architecture
//!
//! ```text
//! PressureSource ──► normalised % ──► EmergencyController::observe()
//!                                        │
//!      NORMAL ─75─► WARNING ─90─► EMERGENCY ─95─► PANIC   (one level per debounce)
//!                                        │
//!      < 70 sustained ──► recovery steps (factor × 1.1, level − 1) ──► NORMAL
//!                                        │
//!                               Vec<EmergencyEvent> → audit, alerts, breakers
//! ```
//!
//! The controller is a pure state machine over explicit timestamps; the
//! reconcile crate's supervisor owns the sampling loop and applies the
//! events' side effects.

pub mod controller;
pub mod level;

pub use controller::{EmergencyController, EmergencyEvent};
pub use level::{actions_for, level_for};
