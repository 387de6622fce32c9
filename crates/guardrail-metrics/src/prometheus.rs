//! Prometheus text exposition format.
//!
//! Renders a [`GuardrailSnapshot`] in the Prometheus text format
//! (text/plain; version=0.0.4).

use guardrail_core::{BreakerMetric, BreakerStatus, EmergencyLevel, GuardrailSnapshot};

/// Render the controller's posture as Prometheus text.
pub fn render_prometheus(snapshot: &GuardrailSnapshot) -> String {
    let mut out = String::new();

    header(
        &mut out,
        "guardrail_breaker_state",
        "Breaker state (0 closed, 1 half-open, 2 open).",
        "gauge",
    );
    for b in &snapshot.breakers {
        let value = match b.state {
            BreakerStatus::Closed => 0,
            BreakerStatus::HalfOpen => 1,
            BreakerStatus::Open => 2,
        };
        out.push_str(&format!(
            "guardrail_breaker_state{{scope=\"{}\"}} {value}\n",
            b.scope
        ));
    }

    header(
        &mut out,
        "guardrail_breaker_forced",
        "Whether the breaker is held open by the emergency controller.",
        "gauge",
    );
    for b in &snapshot.breakers {
        out.push_str(&format!(
            "guardrail_breaker_forced{{scope=\"{}\"}} {}\n",
            b.scope,
            u8::from(b.forced)
        ));
    }

    header(
        &mut out,
        "guardrail_breaker_trips_total",
        "Times the breaker has opened.",
        "counter",
    );
    for b in &snapshot.breakers {
        out.push_str(&format!(
            "guardrail_breaker_trips_total{{scope=\"{}\"}} {}\n",
            b.scope, b.trip_count
        ));
    }

    header(
        &mut out,
        "guardrail_breaker_threshold",
        "Current breaker threshold per metric.",
        "gauge",
    );
    for b in &snapshot.breakers {
        for metric in BreakerMetric::ALL {
            let v = b.thresholds.get(metric);
            if v.is_finite() {
                out.push_str(&format!(
                    "guardrail_breaker_threshold{{scope=\"{}\",metric=\"{}\"}} {v:.2}\n",
                    b.scope,
                    metric.as_str()
                ));
            }
        }
    }

    let e = &snapshot.emergency;
    header(
        &mut out,
        "guardrail_emergency_level",
        "Emergency level (0 normal, 3 panic).",
        "gauge",
    );
    let level = match e.level {
        EmergencyLevel::Normal => 0,
        EmergencyLevel::Warning => 1,
        EmergencyLevel::Emergency => 2,
        EmergencyLevel::Panic => 3,
    };
    out.push_str(&format!("guardrail_emergency_level {level}\n"));

    header(
        &mut out,
        "guardrail_emergency_limit_factor",
        "Multiplier applied to every effective limit.",
        "gauge",
    );
    out.push_str(&format!(
        "guardrail_emergency_limit_factor {:.4}\n",
        e.limit_factor
    ));

    header(
        &mut out,
        "guardrail_resource_pressure_percent",
        "Last normalised resource pressure.",
        "gauge",
    );
    out.push_str(&format!(
        "guardrail_resource_pressure_percent {:.2}\n",
        e.last_pressure
    ));

    header(
        &mut out,
        "guardrail_recommended_limit",
        "Latest recommended value per tenant and limit.",
        "gauge",
    );
    for (tenant, recs) in &snapshot.recommendations {
        for r in recs {
            if let Some(v) = r.value.as_f64() {
                let labels = format!(
                    "tenant=\"{tenant}\",limit=\"{}\",reason=\"{}\"",
                    r.limit_name, r.reason
                );
                out.push_str(&format!("guardrail_recommended_limit{{{labels}}} {v}\n"));
            }
        }
    }

    let c = &snapshot.counters;
    for (name, help, value) in [
        ("guardrail_cycles_total", "Reconciliation cycles run.", c.cycles),
        (
            "guardrail_tenants_evaluated_total",
            "Tenant evaluations completed.",
            c.tenants_evaluated,
        ),
        (
            "guardrail_tenants_skipped_total",
            "Tenants skipped after collection failures.",
            c.tenants_skipped,
        ),
        (
            "guardrail_recommendations_total",
            "Recommendations produced.",
            c.recommendations,
        ),
        ("guardrail_applies_total", "Successful limit applications.", c.applies),
        (
            "guardrail_apply_failures_total",
            "Failed limit applications.",
            c.apply_failures,
        ),
        (
            "guardrail_invariant_violations_total",
            "Recommendations replaced by defaults.",
            c.invariant_violations,
        ),
    ] {
        header(&mut out, name, help, "counter");
        out.push_str(&format!("{name} {value}\n"));
    }

    out
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} {kind}\n"));
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use guardrail_core::{
        CircuitBreakerState, CycleCounters, EmergencyState, LimitReason, LimitValue,
        RecommendedLimit, Scope, Thresholds,
    };

    fn test_snapshot() -> GuardrailSnapshot {
        let mut recommendations = BTreeMap::new();
        recommendations.insert(
            "acme".to_string(),
            vec![RecommendedLimit {
                tenant: "acme".into(),
                limit_name: "ingestion_rate".into(),
                value: LimitValue::Rate(12000.0),
                reason: LimitReason::Trend,
                expires_at: None,
            }],
        );
        GuardrailSnapshot {
            breakers: vec![CircuitBreakerState {
                scope: Scope::tenant("acme"),
                state: BreakerStatus::Open,
                thresholds: Thresholds {
                    ingestion: 150000.0,
                    query: f64::INFINITY,
                    series: 10.0,
                    burst: 20.0,
                },
                last_transition_time: 10,
                consecutive_failures: 0,
                half_open_probe_count: 0,
                forced: false,
                trip_count: 3,
            }],
            emergency: EmergencyState {
                level: EmergencyLevel::Panic,
                limit_factor: 0.5,
                last_pressure: 96.0,
                ..Default::default()
            },
            recommendations,
            counters: CycleCounters {
                cycles: 7,
                ..Default::default()
            },
        }
    }

    #[test]
    fn render_empty_snapshot_still_declares_types() {
        let output = render_prometheus(&GuardrailSnapshot {
            breakers: Vec::new(),
            emergency: EmergencyState::default(),
            recommendations: BTreeMap::new(),
            counters: CycleCounters::default(),
        });
        assert!(output.contains("# TYPE guardrail_breaker_state gauge"));
        assert!(output.contains("guardrail_emergency_level 0"));
        assert!(output.contains("guardrail_emergency_limit_factor 1.0000"));
    }

    #[test]
    fn render_breakers_and_emergency() {
        let output = render_prometheus(&test_snapshot());
        assert!(output.contains("guardrail_breaker_state{scope=\"tenant/acme\"} 2"));
        assert!(output.contains("guardrail_breaker_trips_total{scope=\"tenant/acme\"} 3"));
        assert!(output.contains(
            "guardrail_breaker_threshold{scope=\"tenant/acme\",metric=\"ingestion\"} 150000.00"
        ));
        // Unguarded metrics are omitted.
        assert!(!output.contains("metric=\"query\""));
        assert!(output.contains("guardrail_emergency_level 3"));
        assert!(output.contains("guardrail_emergency_limit_factor 0.5000"));
        assert!(output.contains(concat!(
            "guardrail_recommended_limit",
            "{tenant=\"acme\",limit=\"ingestion_rate\",reason=\"trend\"} 12000"
        )));
        assert!(output.contains("guardrail_cycles_total 7"));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let output = render_prometheus(&test_snapshot());
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.rsplitn(2, ' ');
            let value = parts.next().unwrap();
            assert!(value.parse::<f64>().is_ok(), "bad value in line: {line}");
            assert!(parts.next().unwrap().starts_with("guardrail_"), "bad name: {line}");
        }
    }

    #[test]
    fn every_sample_follows_its_family_header() {
        let output = render_prometheus(&test_snapshot());
        assert!(output.ends_with('\n'));
        let mut declared = Vec::new();
        for line in output.lines() {
            if let Some(rest) = line.strip_prefix("# TYPE ") {
                declared.push(rest.split(' ').next().unwrap().to_string());
            } else if !line.starts_with('#') {
                let name = line.split(['{', ' ']).next().unwrap();
                assert_eq!(declared.last().map(String::as_str), Some(name), "{line}");
            }
        }
        let helps = output.lines().filter(|l| l.starts_with("# HELP ")).count();
        assert_eq!(helps, declared.len());
    }
}
