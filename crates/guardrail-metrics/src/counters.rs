//! Reconciliation counters.
//!
//! Plain relaxed atomics: the counters are monotonic and read only for
//! exposition, so no ordering between them is required.

use std::sync::atomic::{AtomicU64, Ordering};

use guardrail_core::CycleCounters;

/// Running totals since process start.
#[derive(Debug, Default)]
pub struct CycleStats {
    cycles: AtomicU64,
    tenants_evaluated: AtomicU64,
    tenants_skipped: AtomicU64,
    recommendations: AtomicU64,
    applies: AtomicU64,
    apply_failures: AtomicU64,
    invariant_violations: AtomicU64,
}

impl CycleStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evaluated(&self, tenants: u64) {
        self.tenants_evaluated.fetch_add(tenants, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, tenants: u64) {
        self.tenants_skipped.fetch_add(tenants, Ordering::Relaxed);
    }

    pub fn record_recommendations(&self, count: u64) {
        self.recommendations.fetch_add(count, Ordering::Relaxed);
    }

    /// One patcher call, successful or not.
    pub fn record_apply(&self, ok: bool) {
        if ok {
            self.applies.fetch_add(1, Ordering::Relaxed);
        } else {
            self.apply_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_violation(&self) {
        self.invariant_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> CycleCounters {
        CycleCounters {
            cycles: self.cycles.load(Ordering::Relaxed),
            tenants_evaluated: self.tenants_evaluated.load(Ordering::Relaxed),
            tenants_skipped: self.tenants_skipped.load(Ordering::Relaxed),
            recommendations: self.recommendations.load(Ordering::Relaxed),
            applies: self.applies.load(Ordering::Relaxed),
            apply_failures: self.apply_failures.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = CycleStats::new();
        stats.record_cycle();
        stats.record_cycle();
        stats.record_evaluated(3);
        stats.record_skipped(1);
        stats.record_recommendations(12);
        stats.record_apply(true);
        stats.record_apply(false);
        stats.record_violation();

        let c = stats.counters();
        assert_eq!(c.cycles, 2);
        assert_eq!(c.tenants_evaluated, 3);
        assert_eq!(c.tenants_skipped, 1);
        assert_eq!(c.recommendations, 12);
        assert_eq!(c.applies, 1);
        assert_eq!(c.apply_failures, 1);
        assert_eq!(c.invariant_violations, 1);
    }
}
