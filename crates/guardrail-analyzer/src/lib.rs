//! guardrail-analyzer — rolling statistics over per-tenant metric streams.
//!
//! Keeps a time-ordered window of samples per (tenant, metric) and turns it
//! into an [`AnalysisResult`](guardrail_core::AnalysisResult): percentile,
//! moving average, peak, trend slope, and spike verdict.
//!
//! # Architecture
//!
//! ```text
//! TrendAnalyzer
//!   └── tenant → Arc<Mutex<TenantSeries>>
//!                  └── metric → TenantWindow (VecDeque, oldest first)
//!
//! analyze_window()  ← pure: window + settings + now → AnalysisResult
//!   ├── stats::percentile / stats::mean
//!   └── spike::detect
//! ```

pub mod analyzer;
pub mod spike;
pub mod stats;
pub mod window;

pub use analyzer::{TenantSeries, TrendAnalyzer, analyze_window};
pub use spike::{SpikeVerdict, detect as detect_spike};
pub use window::TenantWindow;
