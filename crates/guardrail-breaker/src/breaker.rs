//! Single-scope circuit breaker automaton.
//!
//! The breaker is a plain state machine: every mutating call takes `now`
//! explicitly and returns the transition it caused, so the registry can
//! audit and persist it and tests can drive it without a clock.

use std::time::Duration;

use tracing::{debug, info, warn};

use guardrail_core::{
    BreakerMetric, BreakerSettings, BreakerStatus, CircuitBreakerState, Scope, Thresholds,
    TrafficObservation,
};

use crate::adaptive::{TrafficHistory, damped_step};
use crate::threshold::ThresholdStrategy;

/// Effective-limit factor while HALF_OPEN.
pub const HALF_OPEN_FACTOR: f64 = 0.5;
/// Effective-limit factor while OPEN.
pub const OPEN_FACTOR: f64 = 0.1;

/// Tunables of one breaker, taken from `[breaker]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerParams {
    pub recovery_timeout: Duration,
    pub half_open_max_probes: u32,
    pub breach_samples: u32,
    pub max_change_percent: f64,
    pub history_len: usize,
}

impl Default for BreakerParams {
    fn default() -> Self {
        Self::from_settings(&BreakerSettings::default())
    }
}

impl BreakerParams {
    pub fn from_settings(settings: &BreakerSettings) -> Self {
        Self {
            recovery_timeout: settings.recovery_timeout,
            half_open_max_probes: settings.half_open_max_probes,
            breach_samples: settings.breach_samples,
            max_change_percent: settings.max_change_percent,
            history_len: settings.history_len,
        }
    }
}

/// Why a breaker changed state.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionCause {
    /// A metric stayed above its threshold for the required samples.
    Breach {
        metric: BreakerMetric,
        observed: f64,
        threshold: f64,
    },
    /// Held open by the emergency controller.
    Forced,
    RecoveryTimeout,
    ProbesSucceeded,
    ProbeFailed {
        metric: BreakerMetric,
        observed: f64,
        threshold: f64,
    },
}

impl std::fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Breach {
                metric,
                observed,
                threshold,
            } => write!(
                f,
                "{} {observed:.0} above threshold {threshold:.0}",
                metric.as_str()
            ),
            Self::Forced => f.write_str("forced open by emergency controller"),
            Self::RecoveryTimeout => f.write_str("recovery timeout elapsed"),
            Self::ProbesSucceeded => f.write_str("half-open probes succeeded"),
            Self::ProbeFailed {
                metric,
                observed,
                threshold,
            } => write!(
                f,
                "probe failed: {} {observed:.0} above threshold {threshold:.0}",
                metric.as_str()
            ),
        }
    }
}

/// One state change of one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub scope: Scope,
    pub from: BreakerStatus,
    pub to: BreakerStatus,
    pub at: u64,
    pub cause: TransitionCause,
}

/// Circuit breaker for one scope.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitBreakerState,
    history: TrafficHistory,
    params: BreakerParams,
}

impl CircuitBreaker {
    /// A closed breaker with the given thresholds.
    pub fn new(scope: Scope, thresholds: Thresholds, params: BreakerParams, now: u64) -> Self {
        let history = TrafficHistory::new(params.history_len);
        Self {
            state: CircuitBreakerState {
                scope,
                state: BreakerStatus::Closed,
                thresholds,
                last_transition_time: now,
                consecutive_failures: 0,
                half_open_probe_count: 0,
                forced: false,
                trip_count: 0,
            },
            history,
            params,
        }
    }

    /// Resume from persisted state. Traffic history starts empty.
    pub fn from_state(state: CircuitBreakerState, params: BreakerParams) -> Self {
        Self {
            history: TrafficHistory::new(params.history_len),
            state,
            params,
        }
    }

    pub fn state(&self) -> &CircuitBreakerState {
        &self.state
    }

    pub fn status(&self) -> BreakerStatus {
        self.state.state
    }

    pub fn scope(&self) -> &Scope {
        &self.state.scope
    }

    pub fn history(&self) -> &TrafficHistory {
        &self.history
    }

    pub fn set_params(&mut self, params: BreakerParams) {
        self.history.set_capacity(params.history_len);
        self.params = params;
    }

    /// Factor applied to this scope's effective limits.
    pub fn effective_factor(&self) -> f64 {
        match self.state.state {
            BreakerStatus::Closed => 1.0,
            BreakerStatus::HalfOpen => HALF_OPEN_FACTOR,
            BreakerStatus::Open => OPEN_FACTOR,
        }
    }

    /// First metric above its threshold, if any.
    fn breach(&self, obs: &TrafficObservation) -> Option<(BreakerMetric, f64, f64)> {
        BreakerMetric::ALL.into_iter().find_map(|m| {
            let observed = obs.get(m);
            let threshold = self.state.thresholds.get(m);
            (observed.is_finite() && observed > threshold).then_some((m, observed, threshold))
        })
    }

    /// Feed one traffic observation.
    ///
    /// While CLOSED it counts consecutive breaches; while HALF_OPEN it is a
    /// probe; while OPEN it only extends the history.
    pub fn observe(&mut self, obs: &TrafficObservation, now: u64) -> Option<Transition> {
        self.history.push(*obs);
        let breach = self.breach(obs);

        match self.state.state {
            BreakerStatus::Closed => match breach {
                Some((metric, observed, threshold)) => {
                    self.state.consecutive_failures += 1;
                    debug!(
                        scope = %self.state.scope,
                        metric = metric.as_str(),
                        observed,
                        threshold,
                        failures = self.state.consecutive_failures,
                        "threshold breached"
                    );
                    if self.state.consecutive_failures >= self.params.breach_samples {
                        return Some(self.transition(
                            BreakerStatus::Open,
                            now,
                            TransitionCause::Breach {
                                metric,
                                observed,
                                threshold,
                            },
                        ));
                    }
                    None
                }
                None => {
                    self.state.consecutive_failures = 0;
                    None
                }
            },
            BreakerStatus::HalfOpen => match breach {
                Some((metric, observed, threshold)) => Some(self.transition(
                    BreakerStatus::Open,
                    now,
                    TransitionCause::ProbeFailed {
                        metric,
                        observed,
                        threshold,
                    },
                )),
                None => {
                    self.state.half_open_probe_count += 1;
                    if self.state.half_open_probe_count >= self.params.half_open_max_probes {
                        return Some(self.transition(
                            BreakerStatus::Closed,
                            now,
                            TransitionCause::ProbesSucceeded,
                        ));
                    }
                    None
                }
            },
            BreakerStatus::Open => None,
        }
    }

    /// Move OPEN → HALF_OPEN once the recovery timeout has elapsed, unless
    /// the breaker is held open.
    pub fn tick(&mut self, now: u64) -> Option<Transition> {
        if self.state.state != BreakerStatus::Open || self.state.forced {
            return None;
        }
        let elapsed = now.saturating_sub(self.state.last_transition_time);
        if elapsed < self.params.recovery_timeout.as_secs() {
            return None;
        }
        Some(self.transition(BreakerStatus::HalfOpen, now, TransitionCause::RecoveryTimeout))
    }

    /// Hold the breaker open until [`release`](Self::release).
    pub fn force_open(&mut self, now: u64) -> Option<Transition> {
        self.state.forced = true;
        if self.state.state == BreakerStatus::Open {
            return None;
        }
        Some(self.transition(BreakerStatus::Open, now, TransitionCause::Forced))
    }

    /// Drop the emergency hold. The breaker stays OPEN and recovers through
    /// the normal timeout and probes.
    pub fn release(&mut self) -> bool {
        std::mem::replace(&mut self.state.forced, false)
    }

    /// Recompute the strategy target and move each threshold toward it.
    ///
    /// Returns the previous thresholds when anything changed.
    pub fn adapt(&mut self, strategy: &dyn ThresholdStrategy, limits: &Thresholds) -> Option<Thresholds> {
        let before = self.state.thresholds;
        let p95 = self.history.p95();
        let target = strategy.compute_threshold(&self.state.scope, limits, p95.as_ref());
        let after = if strategy.adapts() {
            Thresholds::from_fn(|m| damped_step(before.get(m), target.get(m), self.params.max_change_percent))
        } else {
            target
        };
        if after == before {
            return None;
        }
        self.state.thresholds = after;
        debug!(
            scope = %self.state.scope,
            strategy = strategy.name(),
            ingestion = after.ingestion,
            query = after.query,
            "thresholds adapted"
        );
        Some(before)
    }

    fn transition(&mut self, to: BreakerStatus, now: u64, cause: TransitionCause) -> Transition {
        let from = self.state.state;
        self.state.state = to;
        self.state.last_transition_time = now;
        self.state.consecutive_failures = 0;
        self.state.half_open_probe_count = 0;
        if to == BreakerStatus::Open {
            self.state.trip_count += 1;
            warn!(scope = %self.state.scope, %from, %cause, "circuit breaker opened");
        } else {
            info!(scope = %self.state.scope, %from, %to, %cause, "circuit breaker transition");
        }
        Transition {
            scope: self.state.scope.clone(),
            from,
            to,
            at: now,
            cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::{AutoStrategy, ManualStrategy};
    use guardrail_core::ManualThresholds;

    fn limits(ingestion: f64) -> Thresholds {
        Thresholds {
            ingestion,
            query: 1_000.0,
            series: 1_000_000.0,
            burst: 1_000_000.0,
        }
    }

    fn traffic(ingestion: f64) -> TrafficObservation {
        Thresholds {
            ingestion,
            ..Default::default()
        }
    }

    fn auto() -> AutoStrategy {
        AutoStrategy::new(
            Thresholds {
                ingestion: 1.5,
                query: 2.0,
                series: 1.8,
                burst: 1.2,
            },
            25.0,
        )
    }

    fn breaker() -> CircuitBreaker {
        let scope = Scope::tenant("acme");
        let thresholds = auto().compute_threshold(&scope, &limits(100_000.0), None);
        CircuitBreaker::new(scope, thresholds, BreakerParams::default(), 0)
    }

    #[test]
    fn sustained_breach_opens_and_probe_closes() {
        let mut b = breaker();
        assert_eq!(b.state().thresholds.ingestion, 150_000.0);

        // One breaching sample is not sustained.
        assert!(b.observe(&traffic(160_000.0), 0).is_none());
        let t = b.observe(&traffic(160_000.0), 10).unwrap();
        assert_eq!((t.from, t.to), (BreakerStatus::Closed, BreakerStatus::Open));
        assert!(matches!(t.cause, TransitionCause::Breach { metric: BreakerMetric::Ingestion, .. }));
        assert_eq!(b.effective_factor(), OPEN_FACTOR);
        assert_eq!(b.state().trip_count, 1);

        // Still OPEN before the timeout; traffic while OPEN is not a probe.
        assert!(b.tick(40).is_none());
        assert!(b.observe(&traffic(80_000.0), 40).is_none());
        assert_eq!(b.status(), BreakerStatus::Open);

        let t = b.tick(70).unwrap();
        assert_eq!(t.to, BreakerStatus::HalfOpen);
        assert_eq!(b.effective_factor(), HALF_OPEN_FACTOR);

        let t = b.observe(&traffic(80_000.0), 75).unwrap();
        assert_eq!((t.from, t.to), (BreakerStatus::HalfOpen, BreakerStatus::Closed));
        assert_eq!(b.effective_factor(), 1.0);
    }

    #[test]
    fn breach_counter_resets_on_good_sample() {
        let mut b = breaker();
        assert!(b.observe(&traffic(160_000.0), 0).is_none());
        assert!(b.observe(&traffic(10.0), 10).is_none());
        assert!(b.observe(&traffic(160_000.0), 20).is_none());
        assert_eq!(b.status(), BreakerStatus::Closed);
    }

    #[test]
    fn failed_probe_reopens() {
        let mut b = breaker();
        b.observe(&traffic(200_000.0), 0);
        b.observe(&traffic(200_000.0), 1);
        b.tick(100).unwrap();
        let t = b.observe(&traffic(200_000.0), 101).unwrap();
        assert_eq!(t.to, BreakerStatus::Open);
        assert!(matches!(t.cause, TransitionCause::ProbeFailed { .. }));
        assert_eq!(b.state().last_transition_time, 101);
        assert_eq!(b.state().trip_count, 2);
    }

    #[test]
    fn multiple_probes_required() {
        let mut b = breaker();
        b.set_params(BreakerParams {
            half_open_max_probes: 3,
            ..BreakerParams::default()
        });
        b.force_open(0);
        b.release();
        b.tick(60).unwrap();
        assert!(b.observe(&traffic(1.0), 61).is_none());
        assert!(b.observe(&traffic(1.0), 62).is_none());
        assert_eq!(b.observe(&traffic(1.0), 63).unwrap().to, BreakerStatus::Closed);
    }

    #[test]
    fn forced_breaker_does_not_time_out() {
        let mut b = breaker();
        let t = b.force_open(5).unwrap();
        assert_eq!(t.cause, TransitionCause::Forced);
        assert!(b.force_open(6).is_none());
        assert!(b.tick(10_000).is_none());

        assert!(b.release());
        assert_eq!(b.tick(10_000).unwrap().to, BreakerStatus::HalfOpen);
    }

    #[test]
    fn adapt_moves_at_most_max_change() {
        let mut b = breaker();
        for _ in 0..50 {
            b.observe(&traffic(140_000.0), 0);
        }
        // Target 175000; 10% of 150000 caps the step at 165000.
        let before = b.adapt(&auto(), &limits(100_000.0)).unwrap();
        assert_eq!(before.ingestion, 150_000.0);
        assert_eq!(b.state().thresholds.ingestion, 165_000.0);
        b.adapt(&auto(), &limits(100_000.0));
        assert_eq!(b.state().thresholds.ingestion, 175_000.0);
        assert!(b.adapt(&auto(), &limits(100_000.0)).is_none());
    }

    #[test]
    fn manual_strategy_sets_thresholds_directly() {
        let mut b = breaker();
        let manual = ManualStrategy::new(ManualThresholds {
            default: Some(Thresholds::from_fn(|_| 5.0)),
            ..Default::default()
        });
        b.adapt(&manual, &limits(100_000.0)).unwrap();
        assert_eq!(b.state().thresholds.ingestion, 5.0);
    }
}
