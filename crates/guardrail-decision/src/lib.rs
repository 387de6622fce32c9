//! guardrail-decision — the Limit Decision Engine.
//!
//! A pure function from an analysis result, a limit definition, tier
//! bounds, an optional manual override, and the previous spike hold to a
//! clamped [`RecommendedLimit`](guardrail_core::RecommendedLimit). No I/O:
//! identical inputs always produce identical output.
//!
//! ```text
//! base  = max(percentile, moving_average?)
//! base  = max(base, peak × peak_safety_factor)?
//! base ×= spike_multiplier            (detected now, or held until expiry)
//! final = base × (1 + buffer_factor/100)
//! final → clamp [min, max] → clamp tier bounds
//! ```

pub mod engine;
pub mod error;

pub use engine::{ClampSide, Decision, DecisionInput, DecisionPolicy, SpikeHold, decide};
pub use error::{DecisionError, DecisionResult};
