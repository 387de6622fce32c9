//! guardrail-breaker — adaptive circuit breakers for tenants and the cluster.
//!
//! Each protected scope (one tenant, or the whole cluster) owns a
//! [`CircuitBreaker`] that watches live traffic against per-metric
//! thresholds. Thresholds come from a [`ThresholdStrategy`] chosen at
//! construction and drift toward recent traffic every adaptation interval.
//!
//! # Architecture
//!
//! ```text
//! BreakerRegistry (16 shards × RwLock<HashMap<Scope, Arc<Mutex<CircuitBreaker>>>>)
//!   ├── sample()       ← traffic observations, every sample interval
//!   ├── tick_all()     → OPEN → HALF_OPEN after the recovery timeout
//!   ├── adapt_all()    → damped move toward strategy target
//!   ├── force_open_all() / release_all()  ← emergency controller
//!   └── effective_factor(tenant)          → reconciler, at the patcher boundary
//!
//!  CLOSED ──breach × N / forced──► OPEN ──timeout──► HALF_OPEN
//!     ▲                              ▲                   │
//!     └────────── probes ok ─────────┼───── probe fails ─┘
//! ```

pub mod adaptive;
pub mod breaker;
pub mod registry;
pub mod threshold;

pub use adaptive::{TrafficHistory, damped_step};
pub use breaker::{BreakerParams, CircuitBreaker, Transition, TransitionCause};
pub use registry::BreakerRegistry;
pub use threshold::{
    AutoStrategy, HybridStrategy, ManualStrategy, ThresholdStrategy, build_strategy,
};
