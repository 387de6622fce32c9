//! guardrail.toml configuration parser.
//!
//! The file is deserialized into raw structures and then validated into a
//! [`GuardrailConfig`]. Any failure rejects the whole file. [`ConfigHandle`]
//! keeps the last-known-good config and lets running loops pick up a new one
//! without a restart.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::duration::humane;
use crate::error::{ConfigError, ConfigResult};
use crate::limit::{LimitDefinition, LimitValue, RawLimitDefinition, RawLimitValue, TierBounds};
use crate::types::{TenantId, Thresholds};

/// Whether computed limits are pushed to the patcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Compute and report everything, enforce nothing.
    #[default]
    DryRun,
    Enforce,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    #[serde(with = "humane")]
    pub interval: Duration,
    #[serde(with = "humane")]
    pub collect_timeout: Duration,
    #[serde(with = "humane")]
    pub apply_timeout: Duration,
    /// How long an in-flight cycle may run after shutdown is requested.
    #[serde(with = "humane")]
    pub shutdown_grace: Duration,
    pub max_parallel_tenants: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            collect_timeout: Duration::from_secs(30),
            apply_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
            max_parallel_tenants: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    #[serde(with = "humane")]
    pub window: Duration,
    pub percentile: f64,
    #[serde(with = "humane")]
    pub moving_average_window: Duration,
    pub include_moving_average: bool,
    pub include_peaks: bool,
    pub peak_safety_factor: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(48 * 3600),
            percentile: 95.0,
            moving_average_window: Duration::from_secs(12 * 3600),
            include_moving_average: true,
            include_peaks: true,
            peak_safety_factor: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeSettings {
    /// Short-rate / baseline ratio above which traffic counts as a spike.
    pub threshold: f64,
    #[serde(with = "humane")]
    pub cooldown: Duration,
    pub max_multiplier: f64,
    /// Window of the short-term rate.
    #[serde(with = "humane")]
    pub rate_window: Duration,
    /// The baseline is the mean over `[now - 2*offset, now - offset]`.
    #[serde(with = "humane")]
    pub baseline_offset: Duration,
}

impl Default for SpikeSettings {
    fn default() -> Self {
        Self {
            threshold: 2.0,
            cooldown: Duration::from_secs(3600),
            max_multiplier: 5.0,
            rate_window: Duration::from_secs(300),
            baseline_offset: Duration::from_secs(24 * 3600),
        }
    }
}

/// How breaker thresholds are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    Manual,
    #[default]
    Auto,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Multipliers {
    pub ingestion: f64,
    pub query: f64,
    pub series: f64,
    pub burst: f64,
}

impl Default for Multipliers {
    fn default() -> Self {
        Self {
            ingestion: 1.5,
            query: 2.0,
            series: 1.8,
            burst: 1.2,
        }
    }
}

impl Multipliers {
    pub fn as_thresholds(&self) -> Thresholds {
        Thresholds {
            ingestion: self.ingestion,
            query: self.query,
            series: self.series,
            burst: self.burst,
        }
    }
}

/// Operator-set thresholds for manual and hybrid breakers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ManualThresholds {
    /// Applies to every tenant without its own entry.
    pub default: Option<Thresholds>,
    pub global: Option<Thresholds>,
    pub tenants: BTreeMap<TenantId, Thresholds>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub mode: ThresholdMode,
    pub multipliers: Multipliers,
    pub safety_margin_percent: f64,
    pub manual: ManualThresholds,
    /// Cluster-wide limits protected by the global breaker. Without them the
    /// global scope is not guarded.
    pub global_limits: Option<Thresholds>,
    #[serde(with = "humane")]
    pub recovery_timeout: Duration,
    pub half_open_max_probes: u32,
    /// Consecutive over-threshold observations that trip a closed breaker.
    pub breach_samples: u32,
    #[serde(with = "humane")]
    pub adaptation_interval: Duration,
    pub max_change_percent: f64,
    #[serde(with = "humane")]
    pub sample_interval: Duration,
    /// Observations kept per scope for the adaptation P95.
    pub history_len: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            mode: ThresholdMode::Auto,
            multipliers: Multipliers::default(),
            safety_margin_percent: 25.0,
            manual: ManualThresholds::default(),
            global_limits: None,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_probes: 1,
            breach_samples: 2,
            adaptation_interval: Duration::from_secs(300),
            max_change_percent: 10.0,
            sample_interval: Duration::from_secs(10),
            history_len: 360,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencySettings {
    pub warning_threshold: f64,
    pub emergency_threshold: f64,
    pub panic_threshold: f64,
    /// Pressure must stay below this for recovery to start and progress.
    pub recovery_threshold: f64,
    #[serde(with = "humane")]
    pub debounce: Duration,
    #[serde(with = "humane")]
    pub recovery_sustain: Duration,
    #[serde(with = "humane")]
    pub recovery_step_interval: Duration,
    /// Growth of the limit factor per recovery step, in percent of its
    /// current value.
    pub recovery_step_percent: f64,
    #[serde(with = "humane")]
    pub sample_interval: Duration,
    pub panic_limit_factor: f64,
    pub ingestion_throttle_percent: f64,
}

impl Default for EmergencySettings {
    fn default() -> Self {
        Self {
            warning_threshold: 75.0,
            emergency_threshold: 90.0,
            panic_threshold: 95.0,
            recovery_threshold: 70.0,
            debounce: Duration::from_secs(60),
            recovery_sustain: Duration::from_secs(600),
            recovery_step_interval: Duration::from_secs(300),
            recovery_step_percent: 10.0,
            sample_interval: Duration::from_secs(15),
            panic_limit_factor: 0.5,
            ingestion_throttle_percent: 80.0,
        }
    }
}

/// A validated service tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    pub tenants: BTreeSet<TenantId>,
    /// limit name → bounds.
    pub bounds: BTreeMap<String, TierBounds>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTierBounds {
    min: Option<RawLimitValue>,
    max: Option<RawLimitValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTier {
    #[serde(default)]
    tenants: Vec<TenantId>,
    #[serde(default)]
    limits: BTreeMap<String, RawTierBounds>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default)]
    mode: Mode,
    #[serde(default)]
    reconcile: ReconcileSettings,
    #[serde(default)]
    analysis: AnalysisSettings,
    #[serde(default)]
    spike: SpikeSettings,
    #[serde(default)]
    breaker: BreakerSettings,
    #[serde(default)]
    emergency: EmergencySettings,
    #[serde(default)]
    limits: BTreeMap<String, RawLimitDefinition>,
    #[serde(default)]
    tiers: BTreeMap<String, RawTier>,
    #[serde(default)]
    overrides: BTreeMap<TenantId, BTreeMap<String, RawLimitValue>>,
}

/// The validated configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardrailConfig {
    pub mode: Mode,
    pub reconcile: ReconcileSettings,
    pub analysis: AnalysisSettings,
    pub spike: SpikeSettings,
    pub breaker: BreakerSettings,
    pub emergency: EmergencySettings,
    pub limits: BTreeMap<String, LimitDefinition>,
    pub tiers: BTreeMap<String, Tier>,
    /// tenant → limit → manual value.
    pub overrides: BTreeMap<TenantId, BTreeMap<String, LimitValue>>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            mode: Mode::DryRun,
            reconcile: ReconcileSettings::default(),
            analysis: AnalysisSettings::default(),
            spike: SpikeSettings::default(),
            breaker: BreakerSettings::default(),
            emergency: EmergencySettings::default(),
            limits: BTreeMap::new(),
            tiers: BTreeMap::new(),
            overrides: BTreeMap::new(),
        }
    }
}

impl GuardrailConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Read, parse, and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    fn from_raw(raw: RawConfig) -> ConfigResult<Self> {
        validate_reconcile(&raw.reconcile)?;
        validate_analysis(&raw.analysis)?;
        validate_spike(&raw.spike, &raw.analysis)?;
        validate_breaker(&raw.breaker)?;
        validate_emergency(&raw.emergency)?;

        let mut limits = BTreeMap::new();
        for (name, def) in raw.limits {
            let def = def.validate(&name)?;
            limits.insert(name, def);
        }

        let tiers = validate_tiers(raw.tiers, &limits)?;
        let overrides = validate_overrides(raw.overrides, &limits)?;

        Ok(Self {
            mode: raw.mode,
            reconcile: raw.reconcile,
            analysis: raw.analysis,
            spike: raw.spike,
            breaker: raw.breaker,
            emergency: raw.emergency,
            limits,
            tiers,
            overrides,
        })
    }

    /// The tier a tenant belongs to, if any.
    pub fn tier_for(&self, tenant: &str) -> Option<&Tier> {
        self.tiers.values().find(|t| t.tenants.contains(tenant))
    }

    /// Tier bounds for one tenant and limit.
    pub fn tier_bounds(&self, tenant: &str, limit: &str) -> Option<TierBounds> {
        self.tier_for(tenant)
            .and_then(|tier| tier.bounds.get(limit))
            .copied()
    }

    /// Manual override for one tenant and limit.
    pub fn manual_override(&self, tenant: &str, limit: &str) -> Option<&LimitValue> {
        self.overrides.get(tenant).and_then(|m| m.get(limit))
    }

    /// Definitions that are switched on.
    pub fn enabled_limits(&self) -> impl Iterator<Item = &LimitDefinition> {
        self.limits.values().filter(|d| d.enabled)
    }
}

fn positive(section: &'static str, name: &str, d: Duration) -> ConfigResult<()> {
    if d.is_zero() {
        return Err(ConfigError::invalid(section, format!("{name} must be greater than zero")));
    }
    Ok(())
}

fn validate_reconcile(s: &ReconcileSettings) -> ConfigResult<()> {
    positive("reconcile", "interval", s.interval)?;
    positive("reconcile", "collect_timeout", s.collect_timeout)?;
    positive("reconcile", "apply_timeout", s.apply_timeout)?;
    if s.max_parallel_tenants == 0 {
        return Err(ConfigError::invalid("reconcile", "max_parallel_tenants must be at least 1"));
    }
    Ok(())
}

fn validate_analysis(s: &AnalysisSettings) -> ConfigResult<()> {
    positive("analysis", "window", s.window)?;
    positive("analysis", "moving_average_window", s.moving_average_window)?;
    if s.moving_average_window > s.window {
        return Err(ConfigError::invalid(
            "analysis",
            "moving_average_window must not exceed window",
        ));
    }
    if !(s.percentile > 0.0 && s.percentile <= 100.0) {
        return Err(ConfigError::invalid(
            "analysis",
            format!("percentile must be in (0, 100], got {}", s.percentile),
        ));
    }
    if !(s.peak_safety_factor > 0.0 && s.peak_safety_factor <= 1.0) {
        return Err(ConfigError::invalid(
            "analysis",
            format!("peak_safety_factor must be in (0, 1], got {}", s.peak_safety_factor),
        ));
    }
    Ok(())
}

fn validate_spike(s: &SpikeSettings, analysis: &AnalysisSettings) -> ConfigResult<()> {
    positive("spike", "cooldown", s.cooldown)?;
    positive("spike", "rate_window", s.rate_window)?;
    positive("spike", "baseline_offset", s.baseline_offset)?;
    if !(s.threshold > 0.0) {
        return Err(ConfigError::invalid("spike", "threshold must be positive"));
    }
    if !(s.max_multiplier >= 1.0) {
        return Err(ConfigError::invalid("spike", "max_multiplier must be at least 1.0"));
    }
    let reach = s.baseline_offset.checked_mul(2);
    if reach.is_none_or(|reach| reach > analysis.window) {
        return Err(ConfigError::invalid(
            "spike",
            "baseline window [now - 2*offset, now - offset] must fit in the analysis window",
        ));
    }
    Ok(())
}

fn validate_breaker(s: &BreakerSettings) -> ConfigResult<()> {
    positive("breaker", "recovery_timeout", s.recovery_timeout)?;
    positive("breaker", "adaptation_interval", s.adaptation_interval)?;
    positive("breaker", "sample_interval", s.sample_interval)?;
    let m = s.multipliers.as_thresholds();
    if [m.ingestion, m.query, m.series, m.burst]
        .iter()
        .any(|v| !(*v > 0.0))
    {
        return Err(ConfigError::invalid("breaker", "multipliers must be positive"));
    }
    if !(s.safety_margin_percent >= 0.0) {
        return Err(ConfigError::invalid("breaker", "safety_margin_percent must be >= 0"));
    }
    if !(s.max_change_percent > 0.0 && s.max_change_percent <= 100.0) {
        return Err(ConfigError::invalid("breaker", "max_change_percent must be in (0, 100]"));
    }
    if s.half_open_max_probes == 0 || s.breach_samples == 0 {
        return Err(ConfigError::invalid(
            "breaker",
            "half_open_max_probes and breach_samples must be at least 1",
        ));
    }
    if s.history_len == 0 {
        return Err(ConfigError::invalid("breaker", "history_len must be at least 1"));
    }
    if s.mode == ThresholdMode::Manual && s.manual.default.is_none() && s.manual.tenants.is_empty()
    {
        return Err(ConfigError::invalid(
            "breaker",
            "manual mode requires [breaker.manual.default] or per-tenant thresholds",
        ));
    }
    Ok(())
}

fn validate_emergency(s: &EmergencySettings) -> ConfigResult<()> {
    positive("emergency", "debounce", s.debounce)?;
    positive("emergency", "recovery_step_interval", s.recovery_step_interval)?;
    positive("emergency", "sample_interval", s.sample_interval)?;
    let ordered = 0.0 < s.recovery_threshold
        && s.recovery_threshold <= s.warning_threshold
        && s.warning_threshold < s.emergency_threshold
        && s.emergency_threshold < s.panic_threshold
        && s.panic_threshold <= 100.0;
    if !ordered {
        return Err(ConfigError::invalid(
            "emergency",
            "thresholds must satisfy 0 < recovery <= warning < emergency < panic <= 100",
        ));
    }
    if !(s.recovery_step_percent > 0.0) {
        return Err(ConfigError::invalid("emergency", "recovery_step_percent must be positive"));
    }
    if !(s.panic_limit_factor > 0.0 && s.panic_limit_factor <= 1.0) {
        return Err(ConfigError::invalid("emergency", "panic_limit_factor must be in (0, 1]"));
    }
    if !(0.0..100.0).contains(&s.ingestion_throttle_percent) {
        return Err(ConfigError::invalid(
            "emergency",
            "ingestion_throttle_percent must be in [0, 100)",
        ));
    }
    Ok(())
}

fn validate_tiers(
    raw: BTreeMap<String, RawTier>,
    limits: &BTreeMap<String, LimitDefinition>,
) -> ConfigResult<BTreeMap<String, Tier>> {
    let mut seen: BTreeMap<TenantId, String> = BTreeMap::new();
    let mut tiers = BTreeMap::new();

    for (name, tier) in raw {
        let err = |reason: String| ConfigError::InvalidTier {
            tier: name.clone(),
            reason,
        };

        for tenant in &tier.tenants {
            if let Some(other) = seen.insert(tenant.clone(), name.clone()) {
                return Err(err(format!("tenant {tenant} is already in tier {other}")));
            }
        }

        let mut bounds = BTreeMap::new();
        for (limit, raw_bounds) in tier.limits {
            let def = limits
                .get(&limit)
                .ok_or_else(|| err(format!("unknown limit {limit}")))?;
            let (lo, hi) = def
                .bounds()
                .ok_or_else(|| err(format!("limit {limit} is not numeric")))?;
            let parse = |raw: Option<RawLimitValue>| -> ConfigResult<Option<f64>> {
                raw.map(|v| {
                    def.kind
                        .parse(&v)
                        .map_err(|e| err(format!("{limit}: {e}")))
                        .map(|v| v.as_f64().unwrap_or_default())
                })
                .transpose()
            };
            let tb = TierBounds {
                min: parse(raw_bounds.min)?,
                max: parse(raw_bounds.max)?,
            };
            if let (Some(min), Some(max)) = (tb.min, tb.max)
                && min > max
            {
                return Err(err(format!("{limit}: min {min} > max {max}")));
            }
            let outside = |v: Option<f64>| v.is_some_and(|v| v < lo || v > hi);
            if outside(tb.min) || outside(tb.max) {
                return Err(err(format!("{limit}: bounds must lie within [{lo}, {hi}]")));
            }
            bounds.insert(limit, tb);
        }

        tiers.insert(
            name.clone(),
            Tier {
                name,
                tenants: tier.tenants.into_iter().collect(),
                bounds,
            },
        );
    }
    Ok(tiers)
}

fn validate_overrides(
    raw: BTreeMap<TenantId, BTreeMap<String, RawLimitValue>>,
    limits: &BTreeMap<String, LimitDefinition>,
) -> ConfigResult<BTreeMap<TenantId, BTreeMap<String, LimitValue>>> {
    let mut out = BTreeMap::new();
    for (tenant, values) in raw {
        let err = |reason: String| ConfigError::InvalidOverride {
            tenant: tenant.clone(),
            reason,
        };
        let mut typed = BTreeMap::new();
        for (limit, value) in values {
            let def = limits
                .get(&limit)
                .ok_or_else(|| err(format!("unknown limit {limit}")))?;
            let value = def
                .kind
                .parse(&value)
                .map_err(|e| err(format!("{limit}: {e}")))?;
            if let Some(v) = value.as_f64()
                && !def.contains(v)
            {
                return Err(err(format!("{limit}: {v} outside definition bounds")));
            }
            typed.insert(limit, value);
        }
        out.insert(tenant, typed);
    }
    Ok(out)
}

/// Shared, hot-reloadable handle to the active configuration.
///
/// Readers take a cheap `Arc` snapshot per cycle; a reload only replaces the
/// snapshot after validation succeeds, so a bad file leaves the
/// last-known-good config in place.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<GuardrailConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: GuardrailConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// The active configuration.
    pub fn current(&self) -> Arc<GuardrailConfig> {
        self.tx.borrow().clone()
    }

    /// Subscribe to configuration changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<GuardrailConfig>> {
        self.tx.subscribe()
    }

    /// Install an already-validated configuration.
    pub fn replace(&self, config: GuardrailConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Validate `content` and install it. On error the active config is kept.
    pub fn reload_from_str(&self, content: &str) -> ConfigResult<Arc<GuardrailConfig>> {
        match GuardrailConfig::from_toml_str(content) {
            Ok(config) => {
                let config = Arc::new(config);
                self.tx.send_replace(config.clone());
                info!(limits = config.limits.len(), mode = ?config.mode, "configuration reloaded");
                Ok(config)
            }
            Err(e) => {
                warn!(error = %e, "configuration rejected, keeping last-known-good");
                Err(e)
            }
        }
    }

    /// Read `path`, validate it, and install it.
    pub fn reload_from_file(&self, path: &Path) -> ConfigResult<Arc<GuardrailConfig>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        self.reload_from_str(&content)
    }
}
