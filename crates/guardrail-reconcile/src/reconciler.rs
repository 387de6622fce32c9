//! Reconciliation loop — Collector → Analyzer → Decision Engine → Patcher.
//!
//! One cycle lists tenants, forgets the ones that disappeared, collects
//! samples, fans the per-tenant analysis and decisions out over a bounded
//! `JoinSet`, commits each tenant's results in one step, and finally hands
//! the effective limits to the patcher (enforce mode) or reports them
//! (dry-run). Failures are scoped to one tenant and never abort the cycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use guardrail_analyzer::TrendAnalyzer;
use guardrail_breaker::BreakerRegistry;
use guardrail_core::{
    AlertEvent, AlertPriority, AlertSink, AuditAction, AuditEvent, AuditSink, BreakerMetric,
    Component, ConfigHandle, GuardrailConfig, GuardrailError, LimitClass, LimitValue, Mode,
    RecommendedLimit, Scope, TenantId, Thresholds, TracingSink,
};
use guardrail_decision::{Decision, DecisionError, DecisionInput, DecisionPolicy, SpikeHold, decide};
use guardrail_emergency::EmergencyController;
use guardrail_metrics::CycleStats;
use guardrail_state::StateStore;

use crate::epoch_secs;
use crate::interfaces::{CollectedMetrics, Collector, Patcher};

/// A tenant left out of this cycle, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTenant {
    pub tenant: TenantId,
    pub reason: String,
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub at: u64,
    pub mode: Mode,
    pub evaluated: Vec<TenantId>,
    pub skipped: Vec<SkippedTenant>,
    /// Tenants dropped because the collector no longer lists them.
    pub forgotten: usize,
    pub recommendations: usize,
    /// Tenants whose limits the patcher accepted.
    pub applied: Vec<TenantId>,
    /// tenant → effective limits, whether applied or only reported.
    pub effective: BTreeMap<TenantId, BTreeMap<String, LimitValue>>,
    pub violations: usize,
    /// Set when the cycle could not run at all.
    pub aborted: Option<String>,
}

impl CycleReport {
    pub fn is_skipped(&self, tenant: &str) -> bool {
        self.skipped.iter().any(|s| s.tenant == tenant)
    }
}

/// Per-tenant results carried between cycles.
#[derive(Debug, Default)]
struct Ledger {
    /// tenant → limit → active spike hold.
    holds: HashMap<TenantId, HashMap<String, SpikeHold>>,
    recommendations: BTreeMap<TenantId, Vec<RecommendedLimit>>,
}

/// What one tenant's evaluation produced.
struct TenantOutcome {
    tenant: TenantId,
    decisions: Vec<Decision>,
    errors: Vec<DecisionError>,
}

/// Runs reconciliation cycles.
pub struct Reconciler {
    config: ConfigHandle,
    collector: Arc<dyn Collector>,
    patcher: Arc<dyn Patcher>,
    analyzer: Arc<TrendAnalyzer>,
    breakers: Arc<BreakerRegistry>,
    emergency: Arc<RwLock<EmergencyController>>,
    ledger: RwLock<Ledger>,
    stats: Arc<CycleStats>,
    audit: Arc<dyn AuditSink>,
    alerts: Arc<dyn AlertSink>,
    store: Option<StateStore>,
}

impl Reconciler {
    pub fn new(
        config: ConfigHandle,
        collector: Arc<dyn Collector>,
        patcher: Arc<dyn Patcher>,
        breakers: Arc<BreakerRegistry>,
        emergency: Arc<RwLock<EmergencyController>>,
    ) -> Self {
        Self {
            config,
            collector,
            patcher,
            analyzer: Arc::new(TrendAnalyzer::new()),
            breakers,
            emergency,
            ledger: RwLock::new(Ledger::default()),
            stats: Arc::new(CycleStats::new()),
            audit: Arc::new(TracingSink),
            alerts: Arc::new(TracingSink),
            store: None,
        }
    }

    pub fn with_sinks(mut self, audit: Arc<dyn AuditSink>, alerts: Arc<dyn AlertSink>) -> Self {
        self.audit = audit;
        self.alerts = alerts;
        self
    }

    pub fn with_stats(mut self, stats: Arc<CycleStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Persist recommendations to `store` after every commit.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn analyzer(&self) -> &Arc<TrendAnalyzer> {
        &self.analyzer
    }

    /// Latest recommendations per tenant.
    pub async fn recommendations(&self) -> BTreeMap<TenantId, Vec<RecommendedLimit>> {
        self.ledger.read().await.recommendations.clone()
    }

    /// Reload persisted recommendations. Spike holds are not persisted, so
    /// a held spike value reverts on the first cycle after a restart.
    pub async fn restore(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        match store.list_recommendations() {
            Ok(recs) => {
                let count = recs.len();
                self.ledger.write().await.recommendations = recs;
                if count > 0 {
                    info!(tenants = count, "recommendations restored");
                }
                count
            }
            Err(e) => {
                warn!(error = %e, "failed to restore recommendations");
                0
            }
        }
    }

    /// Run one full cycle at `now`.
    pub async fn run_cycle(&self, now: u64) -> CycleReport {
        let config = self.config.current();
        let settings = &config.reconcile;
        let mut report = CycleReport {
            at: now,
            mode: config.mode,
            ..Default::default()
        };
        self.stats.record_cycle();

        let tenants = match tokio::time::timeout(settings.collect_timeout, self.collector.tenant_list()).await {
            Ok(Ok(tenants)) => tenants,
            Ok(Err(e)) => {
                warn!(error = %e, "tenant listing failed, cycle skipped");
                report.aborted = Some(e.to_string());
                return report;
            }
            Err(_) => {
                let e = GuardrailError::Timeout("tenant listing".into());
                warn!(error = %e, "cycle skipped");
                report.aborted = Some(e.to_string());
                return report;
            }
        };
        report.forgotten = self.forget_unlisted(&tenants).await;

        let CollectedMetrics { samples, mut failures } =
            match tokio::time::timeout(settings.collect_timeout, self.collector.collect_metrics()).await {
                Ok(Ok(collected)) => collected,
                Ok(Err(e)) => everyone_failed(&tenants, e.to_string()),
                Err(_) => everyone_failed(
                    &tenants,
                    GuardrailError::Timeout("metric collection".into()).to_string(),
                ),
            };

        let listed: HashSet<&str> = tenants.iter().map(String::as_str).collect();
        let samples: Vec<_> = samples
            .into_iter()
            .filter(|s| listed.contains(s.tenant.as_str()) && !failures.contains_key(&s.tenant))
            .collect();
        let accepted = self.analyzer.ingest(samples).await;
        debug!(tenants = tenants.len(), accepted, "samples ingested");

        for tenant in &tenants {
            if let Some(reason) = failures.remove(tenant) {
                let error = GuardrailError::TransientCollection {
                    tenant: tenant.clone(),
                    reason,
                };
                self.skip(&mut report, tenant, error, now);
            }
        }

        let outcomes = self.evaluate(&config, &tenants, &report, now).await;

        for outcome in outcomes {
            let tenant = outcome.tenant.clone();
            let recs = self.commit(&config, outcome, now, &mut report).await;
            self.apply(&config, &tenant, &recs, now, &mut report).await;
        }

        self.stats.record_evaluated(report.evaluated.len() as u64);
        self.stats.record_recommendations(report.recommendations as u64);
        info!(
            mode = ?report.mode,
            evaluated = report.evaluated.len(),
            skipped = report.skipped.len(),
            applied = report.applied.len(),
            recommendations = report.recommendations,
            "reconciliation cycle complete"
        );
        report
    }

    /// Run the loop until shutdown. A cycle in flight when shutdown arrives
    /// gets the configured grace period, then is abandoned.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.current().reconcile.interval.as_secs(),
            "reconciler started"
        );

        loop {
            let cycle = self.run_cycle(epoch_secs());
            tokio::pin!(cycle);
            tokio::select! {
                _ = &mut cycle => {}
                _ = shutdown.changed() => {
                    let grace = self.config.current().reconcile.shutdown_grace;
                    if tokio::time::timeout(grace, &mut cycle).await.is_err() {
                        warn!(grace_secs = grace.as_secs(), "in-flight cycle abandoned at shutdown");
                    }
                    break;
                }
            }

            let interval = self.config.current().reconcile.interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("reconciler shutting down");
    }

    /// Analyze and decide for every collected tenant, at most
    /// `max_parallel_tenants` at a time.
    async fn evaluate(
        &self,
        config: &Arc<GuardrailConfig>,
        tenants: &[TenantId],
        report: &CycleReport,
        now: u64,
    ) -> Vec<TenantOutcome> {
        let semaphore = Arc::new(Semaphore::new(config.reconcile.max_parallel_tenants.max(1)));
        let policy = DecisionPolicy::from_config(config);
        let holds = self.ledger.read().await.holds.clone();

        let mut set = JoinSet::new();
        for tenant in tenants.iter().filter(|t| !report.is_skipped(t)) {
            let semaphore = semaphore.clone();
            let analyzer = self.analyzer.clone();
            let config = config.clone();
            let policy = policy.clone();
            let tenant = tenant.clone();
            let held = holds.get(&tenant).cloned().unwrap_or_default();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                evaluate_tenant(&analyzer, &config, &policy, tenant, held, now).await
            });
        }

        let mut outcomes = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "tenant evaluation task failed"),
            }
        }
        outcomes.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        outcomes
    }

    /// Record one tenant's decisions: recommendations, spike holds, breaker
    /// limits, audit, and persistence. Nothing is awaited once the ledger
    /// is locked, so a cancelled cycle commits a tenant fully or not at all.
    async fn commit(
        &self,
        config: &GuardrailConfig,
        outcome: TenantOutcome,
        now: u64,
        report: &mut CycleReport,
    ) -> Vec<RecommendedLimit> {
        let TenantOutcome {
            tenant,
            decisions,
            errors,
        } = outcome;
        let scope = Scope::tenant(tenant.clone());

        for e in &errors {
            match e {
                DecisionError::InsufficientData { .. } | DecisionError::NonNumeric { .. } => {
                    debug!(%tenant, error = %e, "limit not evaluated");
                }
                _ => warn!(%tenant, error = %e, "limit evaluation failed"),
            }
        }

        let mut ledger = self.ledger.write().await;
        let previous = ledger.recommendations.remove(&tenant).unwrap_or_default();
        let mut holds = HashMap::new();
        let mut recs = Vec::with_capacity(decisions.len());

        for decision in decisions {
            let Decision {
                recommendation: rec,
                clamped,
                hold,
                violation,
            } = decision;

            if let Some(v) = violation {
                report.violations += 1;
                self.stats.record_violation();
                error!(%tenant, limit = %rec.limit_name, error = %GuardrailError::InvariantViolation(v), "recommendation repaired");
            }
            if let Some(h) = hold {
                holds.insert(rec.limit_name.clone(), h);
            }

            let before = previous.iter().find(|p| p.limit_name == rec.limit_name);
            let changed = before.is_none_or(|b| b.value != rec.value);
            self.audit.record(
                AuditEvent::new(
                    now,
                    scope.clone(),
                    AuditAction::RecommendationAccepted,
                    format!("{}: {}", rec.limit_name, rec.reason),
                )
                .with_change(before.map(|b| b.value.to_string()), Some(rec.value.to_string())),
            );

            let spike_started = rec.expires_at.is_some()
                && before.is_none_or(|b| b.expires_at.is_none());
            if spike_started {
                self.alert(
                    now,
                    &scope,
                    AlertPriority::P2,
                    format!("traffic spike on {}, limit raised to {}", rec.limit_name, rec.value),
                );
            }
            if clamped.is_max() && changed {
                self.alert(
                    now,
                    &scope,
                    AlertPriority::P2,
                    format!("limit budget exhausted: {} pinned at {}", rec.limit_name, rec.value),
                );
            }
            recs.push(rec);
        }

        if holds.is_empty() {
            ledger.holds.remove(&tenant);
        } else {
            ledger.holds.insert(tenant.clone(), holds);
        }
        ledger.recommendations.insert(tenant.clone(), recs.clone());
        self.breakers.set_limits(scope, class_limits(config, &recs));
        if let Some(store) = &self.store
            && let Err(e) = store.replace_recommendations(&tenant, &recs)
        {
            warn!(%tenant, error = %e, "failed to persist recommendations");
        }
        drop(ledger);

        report.recommendations += recs.len();
        report.evaluated.push(tenant);
        recs
    }

    /// Push the last committed recommendations again under the current
    /// breaker and emergency factors. `Scope::Global` covers every tenant.
    /// Does nothing in dry-run mode.
    pub async fn reapply(&self, scope: &Scope, now: u64) -> CycleReport {
        let config = self.config.current();
        let mut report = CycleReport {
            at: now,
            mode: config.mode,
            ..Default::default()
        };
        if config.mode != Mode::Enforce {
            return report;
        }

        let targets: Vec<(TenantId, Vec<RecommendedLimit>)> = {
            let ledger = self.ledger.read().await;
            match scope {
                Scope::Global => ledger
                    .recommendations
                    .iter()
                    .map(|(tenant, recs)| (tenant.clone(), recs.clone()))
                    .collect(),
                Scope::Tenant(tenant) => ledger
                    .recommendations
                    .get(tenant)
                    .map(|recs| vec![(tenant.clone(), recs.clone())])
                    .unwrap_or_default(),
            }
        };
        for (tenant, recs) in &targets {
            self.apply(&config, tenant, recs, now, &mut report).await;
        }
        if !targets.is_empty() {
            info!(
                %scope,
                tenants = targets.len(),
                applied = report.applied.len(),
                "limits re-applied after protection change"
            );
        }
        report
    }

    /// Hand one tenant's effective limits to the patcher, or report them in
    /// dry-run mode.
    async fn apply(
        &self,
        config: &GuardrailConfig,
        tenant: &str,
        recs: &[RecommendedLimit],
        now: u64,
        report: &mut CycleReport,
    ) {
        if recs.is_empty() {
            return;
        }
        let breaker = self.breakers.effective_factor(tenant, config.mode).await;
        let (limit_factor, ingestion_factor) = {
            let emergency = self.emergency.read().await;
            (emergency.limit_factor(), emergency.ingestion_factor())
        };
        let factor = breaker * limit_factor;
        let limits = effective_limits(config, recs, factor, ingestion_factor);
        report.effective.insert(tenant.to_string(), limits.clone());
        let scope = Scope::tenant(tenant);

        match config.mode {
            Mode::DryRun => {
                debug!(%tenant, limits = limits.len(), factor, "dry-run, limits not applied");
                self.audit.record(AuditEvent::new(
                    now,
                    scope,
                    AuditAction::DryRunSkippedApply,
                    format!("would apply {} limits at factor {factor:.2}", limits.len()),
                ));
            }
            Mode::Enforce => {
                let count = limits.len();
                let result = match tokio::time::timeout(
                    config.reconcile.apply_timeout,
                    self.patcher.apply_limits(tenant, limits),
                )
                .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(GuardrailError::ApplyConflict {
                        tenant: tenant.to_string(),
                        reason: e.to_string(),
                    }),
                    Err(_) => Err(GuardrailError::Timeout(format!("applying limits for {tenant}"))),
                };
                match result {
                    Ok(()) => {
                        self.stats.record_apply(true);
                        info!(%tenant, limits = count, factor, "limits applied");
                        self.audit.record(AuditEvent::new(
                            now,
                            scope,
                            AuditAction::LimitsApplied,
                            format!("{count} limits at factor {factor:.2}"),
                        ));
                        report.applied.push(tenant.to_string());
                    }
                    Err(e) => {
                        self.stats.record_apply(false);
                        self.skip(report, tenant, e, now);
                    }
                }
            }
        }
    }

    /// Drop every trace of tenants the collector no longer lists.
    async fn forget_unlisted(&self, listed: &[TenantId]) -> usize {
        let keep: HashSet<&str> = listed.iter().map(String::as_str).collect();
        let mut known: HashSet<TenantId> = self.analyzer.tenants().await.into_iter().collect();
        known.extend(self.ledger.read().await.recommendations.keys().cloned());
        let gone: Vec<TenantId> = known
            .into_iter()
            .filter(|t| !keep.contains(t.as_str()))
            .collect();
        if gone.is_empty() {
            return 0;
        }

        self.analyzer.retain_tenants(listed).await;
        {
            let mut ledger = self.ledger.write().await;
            for tenant in &gone {
                ledger.holds.remove(tenant);
                ledger.recommendations.remove(tenant);
            }
        }
        for tenant in &gone {
            self.breakers.remove(&Scope::tenant(tenant.clone())).await;
            if let Some(store) = &self.store
                && let Err(e) = store.delete_recommendations(tenant)
            {
                warn!(%tenant, error = %e, "failed to delete recommendations");
            }
            info!(%tenant, "tenant no longer listed, state forgotten");
        }
        gone.len()
    }

    fn skip(&self, report: &mut CycleReport, tenant: &str, error: GuardrailError, now: u64) {
        warn!(%tenant, error = %error, "tenant skipped this cycle");
        self.stats.record_skipped(1);
        self.audit.record(AuditEvent::new(
            now,
            Scope::tenant(tenant),
            AuditAction::TenantSkipped,
            error.to_string(),
        ));
        report.skipped.push(SkippedTenant {
            tenant: tenant.to_string(),
            reason: error.to_string(),
        });
    }

    fn alert(&self, now: u64, scope: &Scope, priority: AlertPriority, message: String) {
        self.alerts.notify(AlertEvent {
            timestamp: now,
            priority,
            component: Component::DecisionEngine,
            scope: scope.clone(),
            message,
        });
    }
}

async fn evaluate_tenant(
    analyzer: &TrendAnalyzer,
    config: &GuardrailConfig,
    policy: &DecisionPolicy,
    tenant: TenantId,
    holds: HashMap<String, SpikeHold>,
    now: u64,
) -> TenantOutcome {
    let analyses = analyzer
        .analyze(&tenant, now, &config.analysis, &config.spike)
        .await;
    let mut decisions = Vec::new();
    let mut errors = Vec::new();
    for def in config.enabled_limits() {
        let input = DecisionInput {
            tenant: &tenant,
            definition: def,
            analysis: analyses.get(&def.metric_source),
            tier: config.tier_bounds(&tenant, &def.name),
            manual: config.manual_override(&tenant, &def.name),
            hold: holds.get(&def.name).copied(),
            now,
        };
        match decide(&input, policy) {
            Ok(d) => decisions.push(d),
            Err(e) => errors.push(e),
        }
    }
    TenantOutcome {
        tenant,
        decisions,
        errors,
    }
}

fn everyone_failed(tenants: &[TenantId], reason: String) -> CollectedMetrics {
    warn!(error = %reason, "metric collection failed for every tenant");
    CollectedMetrics {
        samples: Vec::new(),
        failures: tenants.iter().map(|t| (t.clone(), reason.clone())).collect(),
    }
}

/// Breaker limit input of a tenant: per class, the largest recommended
/// value among its limits. Classes without limits stay at zero (unguarded).
pub fn class_limits(config: &GuardrailConfig, recs: &[RecommendedLimit]) -> Thresholds {
    let mut limits = Thresholds::default();
    for rec in recs {
        let (Some(def), Some(value)) = (config.limits.get(&rec.limit_name), rec.value.as_f64()) else {
            continue;
        };
        let metric = match def.class {
            LimitClass::Ingestion => BreakerMetric::Ingestion,
            LimitClass::Query => BreakerMetric::Query,
            LimitClass::Series => BreakerMetric::Series,
            LimitClass::Burst => BreakerMetric::Burst,
            LimitClass::Other => continue,
        };
        limits.set(metric, limits.get(metric).max(value));
    }
    limits
}

/// Scale recommendations by the protection factors. Ingestion-class limits
/// additionally take `ingestion_factor`. Non-numeric limits pass through.
pub fn effective_limits(
    config: &GuardrailConfig,
    recs: &[RecommendedLimit],
    factor: f64,
    ingestion_factor: f64,
) -> BTreeMap<String, LimitValue> {
    recs.iter()
        .filter_map(|rec| {
            let def = config.limits.get(&rec.limit_name)?;
            let f = if def.class == LimitClass::Ingestion {
                factor * ingestion_factor
            } else {
                factor
            };
            let value = match rec.value.as_f64() {
                Some(v) if f < 1.0 => def.kind.from_f64(v * f).unwrap_or_else(|| rec.value.clone()),
                _ => rec.value.clone(),
            };
            Some((rec.limit_name.clone(), value))
        })
        .collect()
}
