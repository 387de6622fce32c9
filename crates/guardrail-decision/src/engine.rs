//! Limit Decision Engine.

use std::time::Duration;

use tracing::error;

use guardrail_core::{
    AnalysisResult, GuardrailConfig, LimitDefinition, LimitReason, LimitValue, RecommendedLimit,
    TierBounds,
};

use crate::error::{DecisionError, DecisionResult};

/// Tunables the engine reads from the analysis and spike sections.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionPolicy {
    pub include_moving_average: bool,
    pub include_peaks: bool,
    pub peak_safety_factor: f64,
    pub spike_cooldown: Duration,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            include_moving_average: true,
            include_peaks: true,
            peak_safety_factor: 0.8,
            spike_cooldown: Duration::from_secs(3600),
        }
    }
}

impl DecisionPolicy {
    pub fn from_config(config: &GuardrailConfig) -> Self {
        Self {
            include_moving_average: config.analysis.include_moving_average,
            include_peaks: config.analysis.include_peaks,
            peak_safety_factor: config.analysis.peak_safety_factor,
            spike_cooldown: config.spike.cooldown,
        }
    }
}

/// A spike multiplier that keeps applying until `expires_at`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeHold {
    pub multiplier: f64,
    pub expires_at: u64,
}

impl SpikeHold {
    /// Active while `now <= expires_at`.
    pub fn is_active(&self, now: u64) -> bool {
        now <= self.expires_at
    }
}

/// Which bound, if any, the final value was clamped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClampSide {
    None,
    Min,
    Max,
    TierMin,
    TierMax,
}

impl ClampSide {
    /// The value sits at an upper bound: the limit budget is exhausted.
    pub fn is_max(self) -> bool {
        matches!(self, Self::Max | Self::TierMax)
    }
}

/// Everything the engine needs for one (tenant, limit).
#[derive(Debug, Clone)]
pub struct DecisionInput<'a> {
    pub tenant: &'a str,
    pub definition: &'a LimitDefinition,
    pub analysis: Option<&'a AnalysisResult>,
    pub tier: Option<TierBounds>,
    pub manual: Option<&'a LimitValue>,
    /// Hold carried over from the previous evaluation.
    pub hold: Option<SpikeHold>,
    pub now: u64,
}

/// Engine output for one (tenant, limit).
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub recommendation: RecommendedLimit,
    pub clamped: ClampSide,
    /// Hold to carry into the next evaluation.
    pub hold: Option<SpikeHold>,
    /// Set when the computed value had to be repaired before use.
    pub violation: Option<String>,
}

/// Compute the recommended limit for one (tenant, limit).
pub fn decide(input: &DecisionInput<'_>, policy: &DecisionPolicy) -> DecisionResult<Decision> {
    let def = input.definition;
    if !def.enabled {
        return Err(DecisionError::Disabled {
            limit: def.name.clone(),
        });
    }

    if let Some(manual) = input.manual {
        return decide_manual(input, manual);
    }

    if !def.kind.is_numeric() {
        return Err(DecisionError::NonNumeric {
            limit: def.name.clone(),
            kind: def.kind,
        });
    }

    let analysis = input
        .analysis
        .filter(|a| a.is_actionable())
        .ok_or_else(|| DecisionError::InsufficientData {
            tenant: input.tenant.to_string(),
            limit: def.name.clone(),
        })?;

    let mut base = analysis.percentile;
    if policy.include_moving_average {
        base = base.max(analysis.moving_average);
    }
    if policy.include_peaks {
        base = base.max(analysis.peak * policy.peak_safety_factor);
    }

    let hold = if analysis.spike_detected {
        Some(SpikeHold {
            multiplier: analysis.spike_multiplier,
            expires_at: input.now.saturating_add(policy.spike_cooldown.as_secs()),
        })
    } else {
        input.hold.filter(|h| h.is_active(input.now))
    };
    if let Some(h) = hold {
        base *= h.multiplier;
    }

    let raw = base * (1.0 + def.buffer_factor / 100.0);
    let (value, clamped, tier_changed, violation) = clamp(input, raw);

    let reason = if hold.is_some() {
        LimitReason::Spike
    } else if tier_changed {
        LimitReason::Tier
    } else {
        LimitReason::Trend
    };

    Ok(Decision {
        recommendation: RecommendedLimit {
            tenant: input.tenant.to_string(),
            limit_name: def.name.clone(),
            value,
            reason,
            expires_at: hold.map(|h| h.expires_at),
        },
        clamped,
        hold,
        violation,
    })
}

fn decide_manual(input: &DecisionInput<'_>, manual: &LimitValue) -> DecisionResult<Decision> {
    let def = input.definition;
    if manual.kind() != def.kind {
        return Err(DecisionError::KindMismatch {
            limit: def.name.clone(),
            expected: def.kind,
            found: manual.kind(),
        });
    }

    let (value, clamped, violation) = match (manual.as_f64(), def.bounds()) {
        (Some(v), Some((min, max))) => {
            let (value, side, violation) = clamp_to_definition(def, v);
            if side != ClampSide::None {
                error!(
                    tenant = %input.tenant,
                    limit = %def.name,
                    value = v,
                    min, max,
                    "manual override outside definition bounds, clamped"
                );
            }
            (value, side, violation)
        }
        _ => (manual.clone(), ClampSide::None, None),
    };

    Ok(Decision {
        recommendation: RecommendedLimit {
            tenant: input.tenant.to_string(),
            limit_name: def.name.clone(),
            value,
            reason: LimitReason::Manual,
            expires_at: None,
        },
        clamped,
        hold: None,
        violation,
    })
}

/// Clamp to the definition's bounds, then to the tier's. Returns the typed
/// value, the bound it was clamped to, whether the tier changed it, and an
/// invariant violation message if the value had to be repaired.
fn clamp(input: &DecisionInput<'_>, raw: f64) -> (LimitValue, ClampSide, bool, Option<String>) {
    let def = input.definition;
    let Some((min, max)) = def.bounds() else {
        return (def.default.clone(), ClampSide::None, false, None);
    };

    if !raw.is_finite() {
        let msg = format!("{}/{}: computed non-finite value {raw}", input.tenant, def.name);
        error!(tenant = %input.tenant, limit = %def.name, value = raw, "invariant violation, using default");
        return (def.default.clone(), ClampSide::None, false, Some(msg));
    }

    let mut side = ClampSide::None;
    let mut v = raw;
    if v < min {
        v = min;
        side = ClampSide::Min;
    } else if v > max {
        v = max;
        side = ClampSide::Max;
    }

    let mut tier_changed = false;
    if let Some(tier) = input.tier {
        let t = tier.clamp(v);
        if t != v {
            tier_changed = true;
            side = if t > v { ClampSide::TierMin } else { ClampSide::TierMax };
            v = t;
        }
    }

    let (value, repair, violation) = clamp_to_definition(def, v);
    let side = if repair == ClampSide::None { side } else { repair };
    (value, side, tier_changed, violation)
}

/// Convert to the definition's kind and make sure the rounded value still
/// lies in `[min, max]`.
fn clamp_to_definition(def: &LimitDefinition, v: f64) -> (LimitValue, ClampSide, Option<String>) {
    let Some((min, max)) = def.bounds() else {
        return (def.default.clone(), ClampSide::None, None);
    };
    let (bounded, side) = if v < min {
        (min, ClampSide::Min)
    } else if v > max {
        (max, ClampSide::Max)
    } else {
        (v, ClampSide::None)
    };

    match def.kind.from_f64(bounded) {
        Some(value) if value.as_f64().is_some_and(|f| def.contains(f)) => (value, side, None),
        other => {
            let msg = format!(
                "{}: value {bounded} became {other:?} outside [{min}, {max}]",
                def.name
            );
            error!(limit = %def.name, value = bounded, "invariant violation, using default");
            (def.default.clone(), side, Some(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_core::{LimitClass, LimitKind};

    const NOW: u64 = 1_700_000_000;

    fn definition(kind: LimitKind, min: f64, max: f64) -> LimitDefinition {
        LimitDefinition {
            name: "ingestion_rate".into(),
            kind,
            class: LimitClass::Ingestion,
            default: kind.from_f64(min).unwrap(),
            min: kind.from_f64(min),
            max: kind.from_f64(max),
            buffer_factor: 20.0,
            enabled: true,
            metric_source: "ingestion_rate".into(),
        }
    }

    fn analysis(p95: f64, avg: f64, peak: f64) -> AnalysisResult {
        AnalysisResult {
            tenant: "acme".into(),
            metric: "ingestion_rate".into(),
            current_value: p95,
            percentile: p95,
            moving_average: avg,
            peak,
            trend_slope: 0.0,
            spike_detected: false,
            spike_multiplier: 1.0,
            spike_ratio: Some(1.0),
            sample_count: 500,
            confidence: 1.0,
        }
    }

    fn spiking(mut a: AnalysisResult, ratio: f64) -> AnalysisResult {
        a.spike_detected = true;
        a.spike_ratio = Some(ratio);
        a.spike_multiplier = ratio.min(5.0);
        a
    }

    fn input<'a>(def: &'a LimitDefinition, a: Option<&'a AnalysisResult>) -> DecisionInput<'a> {
        DecisionInput {
            tenant: "acme",
            definition: def,
            analysis: a,
            tier: None,
            manual: None,
            hold: None,
            now: NOW,
        }
    }

    fn as_f64(d: &Decision) -> f64 {
        d.recommendation.value.as_f64().unwrap()
    }

    #[test]
    fn trend_recommendation_adds_buffer() {
        let def = definition(LimitKind::Count, 1_000.0, 100_000.0);
        let a = analysis(9_500.0, 7_000.0, 9_800.0);
        let d = decide(&input(&def, Some(&a)), &DecisionPolicy::default()).unwrap();
        assert_eq!(d.recommendation.value, LimitValue::Count(11_400));
        assert_eq!(d.recommendation.reason, LimitReason::Trend);
        assert_eq!(d.recommendation.expires_at, None);
        assert_eq!(d.clamped, ClampSide::None);
    }

    #[test]
    fn peak_can_dominate_base() {
        let def = definition(LimitKind::Rate, 0.0, 1e9);
        let a = analysis(1_000.0, 900.0, 5_000.0);
        let d = decide(&input(&def, Some(&a)), &DecisionPolicy::default()).unwrap();
        // 5000 × 0.8 × 1.2
        assert!((as_f64(&d) - 4_800.0).abs() < 1e-6);

        let policy = DecisionPolicy {
            include_peaks: false,
            ..Default::default()
        };
        let d = decide(&input(&def, Some(&a)), &policy).unwrap();
        assert!((as_f64(&d) - 1_200.0).abs() < 1e-6);
    }

    #[test]
    fn spike_multiplies_and_expires_after_cooldown() {
        let def = definition(LimitKind::Rate, 0.0, 1e9);
        let a = spiking(analysis(1_000.0, 0.0, 0.0), 3.0);
        let policy = DecisionPolicy::default();
        let d = decide(&input(&def, Some(&a)), &policy).unwrap();
        assert_eq!(d.recommendation.reason, LimitReason::Spike);
        assert_eq!(d.recommendation.expires_at, Some(NOW + 3600));
        assert!((as_f64(&d) - 3_600.0).abs() < 1e-6);
        let hold = d.hold.unwrap();
        assert_eq!(hold.multiplier, 3.0);

        // Spike gone, hold still active.
        let calm = analysis(1_000.0, 0.0, 0.0);
        let mut next = input(&def, Some(&calm));
        next.hold = Some(hold);
        next.now = NOW + 3600;
        let held = decide(&next, &policy).unwrap();
        assert_eq!(held.recommendation.reason, LimitReason::Spike);
        assert_eq!(held.recommendation.expires_at, Some(NOW + 3600));

        // Past expiry the value reverts.
        next.now = NOW + 3601;
        let reverted = decide(&next, &policy).unwrap();
        assert_eq!(reverted.recommendation.reason, LimitReason::Trend);
        assert!(reverted.hold.is_none());
        assert!((as_f64(&reverted) - 1_200.0).abs() < 1e-6);
    }

    #[test]
    fn spike_expiry_saturates_on_huge_cooldown() {
        let def = definition(LimitKind::Rate, 0.0, 1e9);
        let a = spiking(analysis(1_000.0, 0.0, 0.0), 2.0);
        let policy = DecisionPolicy {
            spike_cooldown: std::time::Duration::from_secs(u64::MAX),
            ..Default::default()
        };
        let d = decide(&input(&def, Some(&a)), &policy).unwrap();
        assert_eq!(d.recommendation.expires_at, Some(u64::MAX));
    }

    #[test]
    fn clamps_to_definition_bounds() {
        let def = definition(LimitKind::Count, 1_000.0, 10_000.0);
        let high = analysis(50_000.0, 0.0, 0.0);
        let d = decide(&input(&def, Some(&high)), &DecisionPolicy::default()).unwrap();
        assert_eq!(d.recommendation.value, LimitValue::Count(10_000));
        assert_eq!(d.clamped, ClampSide::Max);
        assert!(d.clamped.is_max());

        let low = analysis(1.0, 0.0, 0.0);
        let d = decide(&input(&def, Some(&low)), &DecisionPolicy::default()).unwrap();
        assert_eq!(d.recommendation.value, LimitValue::Count(1_000));
        assert_eq!(d.clamped, ClampSide::Min);
    }

    #[test]
    fn tier_bounds_apply_after_definition_bounds() {
        let def = definition(LimitKind::Count, 1_000.0, 100_000.0);
        let a = analysis(9_500.0, 0.0, 0.0);
        let mut i = input(&def, Some(&a));
        i.tier = Some(TierBounds {
            min: Some(20_000.0),
            max: None,
        });
        let d = decide(&i, &DecisionPolicy::default()).unwrap();
        assert_eq!(d.recommendation.value, LimitValue::Count(20_000));
        assert_eq!(d.recommendation.reason, LimitReason::Tier);
        assert_eq!(d.clamped, ClampSide::TierMin);
    }

    #[test]
    fn spike_reason_wins_over_tier() {
        let def = definition(LimitKind::Count, 1_000.0, 100_000.0);
        let a = spiking(analysis(10_000.0, 0.0, 0.0), 4.0);
        let mut i = input(&def, Some(&a));
        i.tier = Some(TierBounds {
            min: None,
            max: Some(30_000.0),
        });
        let d = decide(&i, &DecisionPolicy::default()).unwrap();
        assert_eq!(d.recommendation.value, LimitValue::Count(30_000));
        assert_eq!(d.recommendation.reason, LimitReason::Spike);
        assert_eq!(d.clamped, ClampSide::TierMax);
    }

    #[test]
    fn manual_override_bypasses_analysis() {
        let def = definition(LimitKind::Count, 1_000.0, 100_000.0);
        let manual = LimitValue::Count(42_000);
        let mut i = input(&def, None);
        i.manual = Some(&manual);
        let d = decide(&i, &DecisionPolicy::default()).unwrap();
        assert_eq!(d.recommendation.value, manual);
        assert_eq!(d.recommendation.reason, LimitReason::Manual);

        let wrong = LimitValue::Bool(true);
        i.manual = Some(&wrong);
        assert!(matches!(
            decide(&i, &DecisionPolicy::default()),
            Err(DecisionError::KindMismatch { .. })
        ));
    }

    #[test]
    fn non_numeric_needs_manual_override() {
        let mut def = definition(LimitKind::Count, 0.0, 1.0);
        def.kind = LimitKind::Bool;
        def.default = LimitValue::Bool(false);
        def.min = None;
        def.max = None;
        let a = analysis(1.0, 1.0, 1.0);
        assert!(matches!(
            decide(&input(&def, Some(&a)), &DecisionPolicy::default()),
            Err(DecisionError::NonNumeric { .. })
        ));

        let on = LimitValue::Bool(true);
        let mut i = input(&def, None);
        i.manual = Some(&on);
        let d = decide(&i, &DecisionPolicy::default()).unwrap();
        assert_eq!(d.recommendation.value, LimitValue::Bool(true));
    }

    #[test]
    fn disabled_and_low_confidence_produce_nothing() {
        let mut def = definition(LimitKind::Count, 0.0, 10.0);
        let mut a = analysis(1.0, 1.0, 1.0);
        a.confidence = 0.0;
        assert!(matches!(
            decide(&input(&def, Some(&a)), &DecisionPolicy::default()),
            Err(DecisionError::InsufficientData { .. })
        ));
        assert!(decide(&input(&def, None), &DecisionPolicy::default()).is_err());

        def.enabled = false;
        assert!(matches!(
            decide(&input(&def, Some(&a)), &DecisionPolicy::default()),
            Err(DecisionError::Disabled { .. })
        ));
    }

    #[test]
    fn non_finite_input_falls_back_to_default() {
        let def = definition(LimitKind::Count, 1_000.0, 10_000.0);
        let a = analysis(f64::NAN, f64::NAN, f64::NAN);
        let d = decide(&input(&def, Some(&a)), &DecisionPolicy::default()).unwrap();
        assert_eq!(d.recommendation.value, def.default);
        assert!(d.violation.is_some());
    }

    #[test]
    fn identical_inputs_yield_identical_output() {
        let def = definition(LimitKind::Rate, 0.0, 1e9);
        let a = spiking(analysis(2_000.0, 1_500.0, 2_500.0), 2.5);
        let i = input(&def, Some(&a));
        let policy = DecisionPolicy::default();
        assert_eq!(decide(&i, &policy), decide(&i, &policy));
    }

    #[test]
    fn value_always_within_bounds() {
        let def = definition(LimitKind::Count, 500.0, 50_000.0);
        let policy = DecisionPolicy::default();
        for p in [0.0, 1.0, 400.0, 9_999.0, 41_666.0, 1e12] {
            for ratio in [None, Some(3.0), Some(50.0)] {
                let mut a = analysis(p, p / 2.0, p * 1.5);
                if let Some(r) = ratio {
                    a = spiking(a, r);
                }
                let d = decide(&input(&def, Some(&a)), &policy).unwrap();
                assert!(def.contains(as_f64(&d)), "{p} {ratio:?} → {:?}", d.recommendation.value);
            }
        }
    }
}
