//! Domain types shared by the analyzer, decision engine, breaker, and
//! emergency controller.
//!
//! Timestamps are unix epoch seconds throughout. Every type is serializable
//! so it can be persisted, audited, or rendered for observability.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::limit::LimitValue;

/// Unique identifier for a tenant of the metrics platform.
pub type TenantId = String;

/// Unit protected by one circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tenant", rename_all = "snake_case")]
pub enum Scope {
    /// The whole cluster.
    Global,
    Tenant(TenantId),
}

impl Scope {
    pub fn tenant(id: impl Into<TenantId>) -> Self {
        Self::Tenant(id.into())
    }

    /// Build the key used for the breakers table.
    pub fn table_key(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Tenant(id) => write!(f, "tenant/{id}"),
        }
    }
}

// ── Samples & analysis ─────────────────────────────────────────────

/// One observation of a tenant metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub tenant: TenantId,
    pub metric: String,
    pub timestamp: u64,
    pub value: f64,
}

/// Statistics computed over one (tenant, metric) window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub tenant: TenantId,
    pub metric: String,
    /// Most recent sample value.
    pub current_value: f64,
    /// Configured percentile of the window.
    pub percentile: f64,
    pub moving_average: f64,
    pub peak: f64,
    /// Relative change between the recent and the older sub-window.
    pub trend_slope: f64,
    pub spike_detected: bool,
    /// Capped multiplier to apply while spiking; 1.0 otherwise.
    pub spike_multiplier: f64,
    /// Short-window rate over baseline. `None` when the baseline is missing
    /// or zero and a spike cannot be determined.
    pub spike_ratio: Option<f64>,
    pub sample_count: usize,
    /// 0.0 with fewer than two samples, otherwise window coverage in [0, 1].
    pub confidence: f64,
}

impl AnalysisResult {
    /// Whether the result carries enough data to drive a recommendation.
    pub fn is_actionable(&self) -> bool {
        self.confidence > 0.0
    }
}

// ── Recommendations ────────────────────────────────────────────────

/// Why a recommended limit has its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    Trend,
    Spike,
    Manual,
    Tier,
}

impl std::fmt::Display for LimitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Trend => "trend",
            Self::Spike => "spike",
            Self::Manual => "manual",
            Self::Tier => "tier",
        })
    }
}

/// A computed limit for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedLimit {
    pub tenant: TenantId,
    pub limit_name: String,
    pub value: LimitValue,
    pub reason: LimitReason,
    /// Set for spike-driven values; the value reverts once this passes.
    pub expires_at: Option<u64>,
}

impl RecommendedLimit {
    /// Build the composite key for the recommendations table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.tenant, self.limit_name)
    }
}

// ── Circuit breaker ────────────────────────────────────────────────

/// Breaker automaton state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Per-metric values for the four protected traffic dimensions.
///
/// Used both for breaker thresholds and for live traffic observations. An
/// infinite value means "unguarded"; it is written as `null`, and a missing
/// or `null` field reads back as infinite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Thresholds {
    #[serde(default = "unbounded", with = "finite_or_null")]
    pub ingestion: f64,
    #[serde(default = "unbounded", with = "finite_or_null")]
    pub query: f64,
    #[serde(default = "unbounded", with = "finite_or_null")]
    pub series: f64,
    #[serde(default = "unbounded", with = "finite_or_null")]
    pub burst: f64,
}

fn unbounded() -> f64 {
    f64::INFINITY
}

mod finite_or_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            s.serialize_some(value)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::INFINITY))
    }
}

/// One live traffic sample for a scope.
pub type TrafficObservation = Thresholds;

/// The four breaker metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerMetric {
    Ingestion,
    Query,
    Series,
    Burst,
}

impl BreakerMetric {
    pub const ALL: [BreakerMetric; 4] = [
        BreakerMetric::Ingestion,
        BreakerMetric::Query,
        BreakerMetric::Series,
        BreakerMetric::Burst,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Query => "query",
            Self::Series => "series",
            Self::Burst => "burst",
        }
    }
}

impl Thresholds {
    pub fn get(&self, metric: BreakerMetric) -> f64 {
        match metric {
            BreakerMetric::Ingestion => self.ingestion,
            BreakerMetric::Query => self.query,
            BreakerMetric::Series => self.series,
            BreakerMetric::Burst => self.burst,
        }
    }

    pub fn set(&mut self, metric: BreakerMetric, value: f64) {
        match metric {
            BreakerMetric::Ingestion => self.ingestion = value,
            BreakerMetric::Query => self.query = value,
            BreakerMetric::Series => self.series = value,
            BreakerMetric::Burst => self.burst = value,
        }
    }

    /// Build by evaluating `f` for every metric.
    pub fn from_fn(mut f: impl FnMut(BreakerMetric) -> f64) -> Self {
        let mut out = Self::default();
        for metric in BreakerMetric::ALL {
            out.set(metric, f(metric));
        }
        out
    }
}

/// Persisted state of one scope's breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub scope: Scope,
    pub state: BreakerStatus,
    pub thresholds: Thresholds,
    pub last_transition_time: u64,
    pub consecutive_failures: u32,
    pub half_open_probe_count: u32,
    /// Held open by the emergency controller.
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub trip_count: u64,
}

// ── Emergency ──────────────────────────────────────────────────────

/// Escalation level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyLevel {
    Normal,
    Warning,
    Emergency,
    Panic,
}

impl std::fmt::Display for EmergencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Emergency => "emergency",
            Self::Panic => "panic",
        })
    }
}

/// Protective action taken at an emergency level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EmergencyAction {
    HeightenedMonitoring,
    ForceBreakersOpen,
    RateLimiting,
    /// Multiply every limit by `factor`.
    CutLimits { factor: f64 },
    /// Reduce ingestion limits by `percent`.
    ThrottleIngestion { percent: f64 },
    DisableNonCriticalQueries,
    ForceGc,
    AlertAllChannels,
}

/// Progress of a graduated restoration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryProgress {
    pub started_at: u64,
    pub last_step_at: u64,
    pub steps_completed: u32,
}

/// Persisted state of the emergency controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyState {
    pub level: EmergencyLevel,
    pub triggered_at: Option<u64>,
    pub active_actions: Vec<EmergencyAction>,
    pub recovery_progress: Option<RecoveryProgress>,
    /// Multiplier applied to every effective limit (1.0 = unrestricted).
    pub limit_factor: f64,
    pub last_pressure: f64,
}

impl Default for EmergencyState {
    fn default() -> Self {
        Self {
            level: EmergencyLevel::Normal,
            triggered_at: None,
            active_actions: Vec::new(),
            recovery_progress: None,
            limit_factor: 1.0,
            last_pressure: 0.0,
        }
    }
}

/// Aggregate resource usage of the shared backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourcePressure {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub network_percent: f64,
    pub ingestion_rate: f64,
    pub ingestion_capacity: f64,
}

impl ResourcePressure {
    /// Normalised pressure in percent: the worst of all signals.
    ///
    /// Non-finite inputs are ignored; ingestion counts only with a positive
    /// capacity.
    pub fn normalized(&self) -> f64 {
        let ingestion = if self.ingestion_capacity > 0.0 {
            self.ingestion_rate / self.ingestion_capacity * 100.0
        } else {
            0.0
        };
        [
            self.cpu_percent,
            self.memory_percent,
            self.disk_percent,
            self.network_percent,
            ingestion,
        ]
        .into_iter()
        .filter(|v| v.is_finite())
        .fold(0.0, f64::max)
    }
}

// ── Observability ──────────────────────────────────────────────────

/// Point-in-time counters of the reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CycleCounters {
    pub cycles: u64,
    pub tenants_evaluated: u64,
    pub tenants_skipped: u64,
    pub recommendations: u64,
    pub applies: u64,
    pub apply_failures: u64,
    pub invariant_violations: u64,
}

/// Everything an operator needs to see the controller's current posture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailSnapshot {
    pub breakers: Vec<CircuitBreakerState>,
    pub emergency: EmergencyState,
    /// tenant → recommendations.
    pub recommendations: BTreeMap<TenantId, Vec<RecommendedLimit>>,
    pub counters: CycleCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_display_and_ordering() {
        assert_eq!(Scope::Global.to_string(), "global");
        assert_eq!(Scope::tenant("acme").to_string(), "tenant/acme");
        assert!(Scope::Global < Scope::tenant("a"));
    }

    #[test]
    fn unguarded_thresholds_survive_json() {
        let t = Thresholds {
            ingestion: 150_000.0,
            query: f64::INFINITY,
            series: 10.0,
            burst: 20.0,
        };
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"query\":null"));
        let back: Thresholds = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);

        let partial: Thresholds = serde_json::from_str(r#"{"ingestion": 5}"#).unwrap();
        assert_eq!(partial.ingestion, 5.0);
        assert!(partial.burst.is_infinite());
    }

    #[test]
    fn pressure_takes_worst_signal() {
        let p = ResourcePressure {
            cpu_percent: 40.0,
            memory_percent: 82.0,
            disk_percent: 10.0,
            network_percent: 5.0,
            ingestion_rate: 900.0,
            ingestion_capacity: 1000.0,
        };
        assert_eq!(p.normalized(), 90.0);
    }

    #[test]
    fn pressure_ignores_zero_capacity_and_nan() {
        let p = ResourcePressure {
            cpu_percent: f64::NAN,
            memory_percent: 12.0,
            ingestion_rate: 5.0,
            ..Default::default()
        };
        assert_eq!(p.normalized(), 12.0);
    }

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(EmergencyLevel::Normal < EmergencyLevel::Warning);
        assert!(EmergencyLevel::Emergency < EmergencyLevel::Panic);
    }

    #[test]
    fn thresholds_from_fn_sets_every_metric() {
        let t = Thresholds::from_fn(|m| match m {
            BreakerMetric::Ingestion => 1.0,
            BreakerMetric::Query => 2.0,
            BreakerMetric::Series => 3.0,
            BreakerMetric::Burst => 4.0,
        });
        assert_eq!(t.get(BreakerMetric::Series), 3.0);
        assert_eq!(t.burst, 4.0);
    }
}
