//! Threshold strategies: manual, auto, and hybrid.

use std::fmt::Debug;
use std::sync::Arc;

use guardrail_core::{BreakerMetric, BreakerSettings, ManualThresholds, Scope, ThresholdMode, Thresholds};

/// Derives a scope's breaker thresholds.
pub trait ThresholdStrategy: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Target thresholds for `scope` given its configured limits and the P95
    /// of its recent traffic, if any.
    fn compute_threshold(
        &self,
        scope: &Scope,
        limits: &Thresholds,
        recent_p95: Option<&Thresholds>,
    ) -> Thresholds;

    /// Whether thresholds drift toward traffic between evaluations.
    fn adapts(&self) -> bool {
        true
    }
}

/// Operator-configured thresholds.
#[derive(Debug, Clone, Default)]
pub struct ManualStrategy {
    thresholds: ManualThresholds,
}

impl ManualStrategy {
    pub fn new(thresholds: ManualThresholds) -> Self {
        Self { thresholds }
    }

    /// Configured thresholds for `scope`: its own entry, else the default.
    pub fn lookup(&self, scope: &Scope) -> Option<Thresholds> {
        let own = match scope {
            Scope::Global => self.thresholds.global,
            Scope::Tenant(t) => self.thresholds.tenants.get(t).copied(),
        };
        own.or(self.thresholds.default)
    }
}

impl ThresholdStrategy for ManualStrategy {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn compute_threshold(&self, scope: &Scope, _: &Thresholds, _: Option<&Thresholds>) -> Thresholds {
        // No entry means the scope is not guarded.
        self.lookup(scope)
            .unwrap_or_else(|| Thresholds::from_fn(|_| f64::INFINITY))
    }

    fn adapts(&self) -> bool {
        false
    }
}

/// `max(limit × multiplier, recentP95 × (1 + margin))` per metric.
#[derive(Debug, Clone)]
pub struct AutoStrategy {
    multipliers: Thresholds,
    /// Fraction, e.g. 0.25 for 25%.
    safety_margin: f64,
}

impl AutoStrategy {
    pub fn new(multipliers: Thresholds, safety_margin_percent: f64) -> Self {
        Self {
            multipliers,
            safety_margin: safety_margin_percent / 100.0,
        }
    }

    fn metric_threshold(&self, metric: BreakerMetric, limit: f64, p95: Option<f64>) -> f64 {
        let from_limit = if limit > 0.0 && limit.is_finite() {
            Some(limit * self.multipliers.get(metric))
        } else {
            None
        };
        let from_traffic = p95
            .filter(|v| *v > 0.0 && v.is_finite())
            .map(|v| v * (1.0 + self.safety_margin));
        match (from_limit, from_traffic) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) | (None, Some(a)) => a,
            // Nothing to derive a threshold from yet.
            (None, None) => f64::INFINITY,
        }
    }
}

impl ThresholdStrategy for AutoStrategy {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn compute_threshold(
        &self,
        _: &Scope,
        limits: &Thresholds,
        recent_p95: Option<&Thresholds>,
    ) -> Thresholds {
        Thresholds::from_fn(|m| self.metric_threshold(m, limits.get(m), recent_p95.map(|p| p.get(m))))
    }
}

/// The auto value capped by the manual threshold where one is configured.
#[derive(Debug, Clone)]
pub struct HybridStrategy {
    auto: AutoStrategy,
    manual: ManualStrategy,
}

impl HybridStrategy {
    pub fn new(auto: AutoStrategy, manual: ManualStrategy) -> Self {
        Self { auto, manual }
    }
}

impl ThresholdStrategy for HybridStrategy {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn compute_threshold(
        &self,
        scope: &Scope,
        limits: &Thresholds,
        recent_p95: Option<&Thresholds>,
    ) -> Thresholds {
        let auto = self.auto.compute_threshold(scope, limits, recent_p95);
        match self.manual.lookup(scope) {
            Some(cap) => Thresholds::from_fn(|m| auto.get(m).min(cap.get(m))),
            None => auto,
        }
    }
}

/// Build the strategy selected by `settings.mode`.
pub fn build_strategy(settings: &BreakerSettings) -> Arc<dyn ThresholdStrategy> {
    let auto = || {
        AutoStrategy::new(
            settings.multipliers.as_thresholds(),
            settings.safety_margin_percent,
        )
    };
    let manual = || ManualStrategy::new(settings.manual.clone());
    match settings.mode {
        ThresholdMode::Manual => Arc::new(manual()),
        ThresholdMode::Auto => Arc::new(auto()),
        ThresholdMode::Hybrid => Arc::new(HybridStrategy::new(auto(), manual())),
    }
}
