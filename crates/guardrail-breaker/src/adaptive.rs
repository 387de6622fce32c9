//! Traffic history and damped threshold adaptation.

use std::collections::VecDeque;

use guardrail_analyzer::stats::percentile;
use guardrail_core::{BreakerMetric, Thresholds, TrafficObservation};

/// Bounded ring of recent traffic observations for one scope.
#[derive(Debug, Clone)]
pub struct TrafficHistory {
    samples: VecDeque<TrafficObservation>,
    capacity: usize,
}

impl TrafficHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, observation: TrafficObservation) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(observation);
    }

    /// Shrink or grow the ring, dropping the oldest samples first.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Per-metric P95 of the retained samples.
    pub fn p95(&self) -> Option<Thresholds> {
        if self.samples.is_empty() {
            return None;
        }
        let column = |m: BreakerMetric| -> Vec<f64> {
            self.samples
                .iter()
                .map(|s| s.get(m))
                .filter(|v| v.is_finite())
                .collect()
        };
        Some(Thresholds::from_fn(|m| {
            percentile(&column(m), 95.0).unwrap_or_default()
        }))
    }
}

/// Move `current` toward `target` by at most `max_change_percent` of
/// `current`.
///
/// An unset (non-finite or non-positive) current value jumps straight to the
/// target. A non-finite target carries no information and leaves `current`
/// unchanged.
pub fn damped_step(current: f64, target: f64, max_change_percent: f64) -> f64 {
    if !current.is_finite() || current <= 0.0 {
        return target;
    }
    if !target.is_finite() {
        return current;
    }
    let max_delta = current * max_change_percent / 100.0;
    current + (target - current).clamp(-max_delta, max_delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(v: f64) -> TrafficObservation {
        Thresholds::from_fn(|_| v)
    }

    #[test]
    fn history_is_bounded() {
        let mut h = TrafficHistory::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            h.push(obs(v));
        }
        assert_eq!(h.len(), 3);
        h.set_capacity(1);
        assert_eq!(h.len(), 1);
        assert_eq!(h.p95().unwrap().ingestion, 4.0);
    }

    #[test]
    fn p95_per_metric() {
        let mut h = TrafficHistory::new(100);
        for v in 1..=100 {
            h.push(obs(v as f64));
        }
        let p95 = h.p95().unwrap();
        // rank = 0.95 × 99 = 94.05 → 95 + 0.05
        assert!((p95.query - 95.05).abs() < 1e-9);
        assert!(TrafficHistory::new(5).p95().is_none());
    }

    #[test]
    fn damped_step_limits_change() {
        assert_eq!(damped_step(100.0, 200.0, 10.0), 110.0);
        assert_eq!(damped_step(100.0, 50.0, 10.0), 90.0);
        assert_eq!(damped_step(100.0, 104.0, 10.0), 104.0);
        assert_eq!(damped_step(f64::INFINITY, 500.0, 10.0), 500.0);
    }

    #[test]
    fn unbounded_target_freezes_finite_threshold() {
        let mut t = 100.0;
        for _ in 0..20 {
            t = damped_step(t, f64::INFINITY, 10.0);
        }
        assert_eq!(t, 100.0);
        assert_eq!(damped_step(100.0, f64::NAN, 10.0), 100.0);
    }
}
