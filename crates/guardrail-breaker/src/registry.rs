//! Sharded registry of per-scope circuit breakers.
//!
//! Scopes are spread over 16 shards, each an `RwLock<HashMap>`; every
//! breaker sits behind its own mutex so there is exactly one writer per
//! scope and a trip in one scope never touches another.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use guardrail_core::{
    AlertEvent, AlertPriority, AlertSink, AuditAction, AuditEvent, AuditSink, BreakerSettings,
    BreakerStatus, CircuitBreakerState, Component, Mode, Scope, Thresholds, TrafficObservation,
};
use guardrail_state::StateStore;

use crate::breaker::{BreakerParams, CircuitBreaker, Transition};
use crate::threshold::{ThresholdStrategy, build_strategy};

const SHARDS: usize = 16;

type Slot = Arc<Mutex<CircuitBreaker>>;

/// All breakers of the controller.
pub struct BreakerRegistry {
    shards: Vec<RwLock<HashMap<Scope, Slot>>>,
    strategy: RwLock<Arc<dyn ThresholdStrategy>>,
    params: RwLock<BreakerParams>,
    /// Configured limits per scope, as the strategy's `limit` input. Never
    /// held across an await.
    limits: std::sync::RwLock<HashMap<Scope, Thresholds>>,
    /// Emergency hold: breakers created while set start forced open.
    forced: AtomicBool,
    audit: Arc<dyn AuditSink>,
    alerts: Arc<dyn AlertSink>,
    store: Option<StateStore>,
}

impl BreakerRegistry {
    pub fn new(
        settings: &BreakerSettings,
        audit: Arc<dyn AuditSink>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let mut limits = HashMap::new();
        if let Some(global) = settings.global_limits {
            limits.insert(Scope::Global, global);
        }
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            strategy: RwLock::new(build_strategy(settings)),
            params: RwLock::new(BreakerParams::from_settings(settings)),
            limits: std::sync::RwLock::new(limits),
            forced: AtomicBool::new(false),
            audit,
            alerts,
            store: None,
        }
    }

    /// Persist every state change to `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    fn shard(&self, scope: &Scope) -> &RwLock<HashMap<Scope, Slot>> {
        let mut hasher = DefaultHasher::new();
        scope.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Apply a reloaded `[breaker]` section. Thresholds follow on the next
    /// adaptation step.
    pub async fn reconfigure(&self, settings: &BreakerSettings) {
        let strategy = build_strategy(settings);
        let params = BreakerParams::from_settings(settings);
        info!(strategy = strategy.name(), "breaker settings applied");
        *self.strategy.write().await = strategy;
        *self.params.write().await = params.clone();
        {
            let mut limits = self.limits.write().unwrap_or_else(PoisonError::into_inner);
            match settings.global_limits {
                Some(global) => limits.insert(Scope::Global, global),
                None => limits.remove(&Scope::Global),
            };
        }
        for slot in self.slots().await {
            slot.lock().await.set_params(params.clone());
        }
    }

    /// Record the configured limits of a scope.
    pub fn set_limits(&self, scope: Scope, limits: Thresholds) {
        self.limits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope, limits);
    }

    /// Limits last recorded for `scope`.
    pub fn limits(&self, scope: &Scope) -> Option<Thresholds> {
        self.limits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .copied()
    }

    fn limits_for(&self, scope: &Scope) -> Thresholds {
        self.limits(scope).unwrap_or_default()
    }

    async fn slots(&self) -> Vec<Slot> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().await.values().cloned());
        }
        out
    }

    /// Breaker for `scope`, created closed (or forced open) on first use.
    async fn slot(&self, scope: &Scope, now: u64) -> (Slot, Vec<Transition>) {
        if let Some(slot) = self.shard(scope).read().await.get(scope) {
            return (slot.clone(), Vec::new());
        }

        let strategy = self.strategy.read().await.clone();
        let params = self.params.read().await.clone();
        let limits = self.limits_for(scope);
        let thresholds = strategy.compute_threshold(scope, &limits, None);

        let mut shard = self.shard(scope).write().await;
        if let Some(slot) = shard.get(scope) {
            return (slot.clone(), Vec::new());
        }
        let mut breaker = CircuitBreaker::new(scope.clone(), thresholds, params, now);
        let mut transitions = Vec::new();
        if self.forced.load(Ordering::SeqCst) {
            transitions.extend(breaker.force_open(now));
        }
        debug!(%scope, strategy = strategy.name(), "breaker created");
        self.persist(breaker.state());
        let slot = Arc::new(Mutex::new(breaker));
        shard.insert(scope.clone(), slot.clone());
        (slot, transitions)
    }

    /// Feed one round of traffic observations.
    pub async fn sample(
        &self,
        observations: impl IntoIterator<Item = (Scope, TrafficObservation)>,
        now: u64,
    ) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for (scope, obs) in observations {
            let (slot, created) = self.slot(&scope, now).await;
            transitions.extend(created);
            let mut breaker = slot.lock().await;
            let before = breaker.state().clone();
            transitions.extend(breaker.tick(now));
            transitions.extend(breaker.observe(&obs, now));
            if breaker.state() != &before {
                self.persist(breaker.state());
            }
        }
        self.report(&transitions);
        transitions
    }

    /// Move every timed-out OPEN breaker to HALF_OPEN, including scopes with
    /// no traffic this round.
    pub async fn tick_all(&self, now: u64) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for slot in self.slots().await {
            let mut breaker = slot.lock().await;
            if let Some(t) = breaker.tick(now) {
                self.persist(breaker.state());
                transitions.push(t);
            }
        }
        self.report(&transitions);
        transitions
    }

    /// Run one adaptation step on every breaker. Returns how many changed.
    pub async fn adapt_all(&self, now: u64) -> usize {
        let strategy = self.strategy.read().await.clone();
        let mut changed = 0;
        for slot in self.slots().await {
            let mut breaker = slot.lock().await;
            let limits = self.limits_for(breaker.scope());
            if let Some(before) = breaker.adapt(strategy.as_ref(), &limits) {
                changed += 1;
                let after = breaker.state().thresholds;
                self.persist(breaker.state());
                self.audit.record(
                    AuditEvent::new(
                        now,
                        breaker.scope().clone(),
                        AuditAction::BreakerThresholdAdapted,
                        format!("{} strategy", strategy.name()),
                    )
                    .with_change(Some(fmt_thresholds(&before)), Some(fmt_thresholds(&after))),
                );
            }
        }
        if changed > 0 {
            debug!(changed, "breaker thresholds adapted");
        }
        changed
    }

    /// Force every breaker open and hold new ones open until released.
    pub async fn force_open_all(&self, now: u64) -> Vec<Transition> {
        self.forced.store(true, Ordering::SeqCst);
        let mut transitions = Vec::new();
        for slot in self.slots().await {
            let mut breaker = slot.lock().await;
            let t = breaker.force_open(now);
            self.persist(breaker.state());
            transitions.extend(t);
        }
        warn!(opened = transitions.len(), "all circuit breakers forced open");
        self.report(&transitions);
        transitions
    }

    /// Drop the emergency hold. Breakers recover through their own timeout.
    pub async fn release_all(&self) -> usize {
        self.forced.store(false, Ordering::SeqCst);
        let mut released = 0;
        for slot in self.slots().await {
            let mut breaker = slot.lock().await;
            if breaker.release() {
                released += 1;
                self.persist(breaker.state());
            }
        }
        info!(released, "circuit breaker hold released");
        released
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Factor applied to a tenant's effective limits: the smaller of its own
    /// breaker's and the global breaker's. Always 1.0 in dry-run mode.
    pub async fn effective_factor(&self, tenant: &str, mode: Mode) -> f64 {
        if mode == Mode::DryRun {
            return 1.0;
        }
        let mut factor = 1.0_f64;
        for scope in [Scope::Global, Scope::tenant(tenant)] {
            let slot = self.shard(&scope).read().await.get(&scope).cloned();
            if let Some(slot) = slot {
                factor = factor.min(slot.lock().await.effective_factor());
            }
        }
        factor
    }

    /// Consistent copy of one scope's state.
    pub async fn get(&self, scope: &Scope) -> Option<CircuitBreakerState> {
        let slot = self.shard(scope).read().await.get(scope).cloned()?;
        let state = slot.lock().await.state().clone();
        Some(state)
    }

    /// Copies of every breaker state, ordered by scope.
    pub async fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let mut out = Vec::new();
        for slot in self.slots().await {
            out.push(slot.lock().await.state().clone());
        }
        out.sort_by(|a, b| a.scope.cmp(&b.scope));
        out
    }

    /// Reinstate persisted breakers. Existing scopes are replaced.
    pub async fn restore(&self, states: Vec<CircuitBreakerState>) -> usize {
        let params = self.params.read().await.clone();
        let count = states.len();
        for state in states {
            if state.forced {
                self.forced.store(true, Ordering::SeqCst);
            }
            let scope = state.scope.clone();
            let breaker = CircuitBreaker::from_state(state, params.clone());
            self.shard(&scope)
                .write()
                .await
                .insert(scope, Arc::new(Mutex::new(breaker)));
        }
        if count > 0 {
            info!(count, "breaker state restored");
        }
        count
    }

    /// Forget a tenant's breaker.
    pub async fn remove(&self, scope: &Scope) -> bool {
        self.limits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope);
        let removed = self.shard(scope).write().await.remove(scope).is_some();
        if removed && let Some(store) = &self.store {
            if let Err(e) = store.delete_breaker(scope) {
                warn!(%scope, error = %e, "failed to delete breaker state");
            }
        }
        removed
    }

    pub async fn len(&self) -> usize {
        let mut n = 0;
        for shard in &self.shards {
            n += shard.read().await.len();
        }
        n
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn persist(&self, state: &CircuitBreakerState) {
        if let Some(store) = &self.store
            && let Err(e) = store.put_breaker(state)
        {
            warn!(scope = %state.scope, error = %e, "failed to persist breaker state");
        }
    }

    fn report(&self, transitions: &[Transition]) {
        for t in transitions {
            self.audit.record(
                AuditEvent::new(
                    t.at,
                    t.scope.clone(),
                    AuditAction::BreakerTransition,
                    t.cause.to_string(),
                )
                .with_change(Some(t.from.to_string()), Some(t.to.to_string())),
            );
            let priority = match t.to {
                BreakerStatus::Open => AlertPriority::P1,
                BreakerStatus::HalfOpen => AlertPriority::P2,
                BreakerStatus::Closed => AlertPriority::P3,
            };
            self.alerts.notify(AlertEvent {
                timestamp: t.at,
                priority,
                component: Component::CircuitBreaker,
                scope: t.scope.clone(),
                message: format!("circuit breaker {} → {}: {}", t.from, t.to, t.cause),
            });
        }
    }
}

fn fmt_thresholds(t: &Thresholds) -> String {
    format!(
        "ingestion={:.0} query={:.0} series={:.0} burst={:.0}",
        t.ingestion, t.query, t.series, t.burst
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_core::MemorySink;

    fn registry(sink: &Arc<MemorySink>) -> BreakerRegistry {
        BreakerRegistry::new(&BreakerSettings::default(), sink.clone(), sink.clone())
    }

    fn limits(v: f64) -> Thresholds {
        Thresholds::from_fn(|_| v)
    }

    fn traffic(ingestion: f64) -> TrafficObservation {
        Thresholds {
            ingestion,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn trip_in_one_scope_leaves_others_closed() {
        let sink = Arc::new(MemorySink::new());
        let reg = registry(&sink);
        reg.set_limits(Scope::tenant("a"), limits(100_000.0));
        reg.set_limits(Scope::tenant("b"), limits(100_000.0));

        for t in [0, 10] {
            reg.sample(
                [
                    (Scope::tenant("a"), traffic(160_000.0)),
                    (Scope::tenant("b"), traffic(50_000.0)),
                ],
                t,
            )
            .await;
        }

        assert_eq!(reg.get(&Scope::tenant("a")).await.unwrap().state, BreakerStatus::Open);
        assert_eq!(reg.get(&Scope::tenant("b")).await.unwrap().state, BreakerStatus::Closed);
        assert_eq!(reg.effective_factor("a", Mode::Enforce).await, 0.1);
        assert_eq!(reg.effective_factor("b", Mode::Enforce).await, 1.0);
        assert_eq!(reg.effective_factor("a", Mode::DryRun).await, 1.0);

        assert_eq!(sink.audit_with(AuditAction::BreakerTransition).len(), 1);
        assert_eq!(sink.alerts()[0].priority, AlertPriority::P1);
        assert_eq!(reg.len().await, 2);
    }

    #[tokio::test]
    async fn global_breaker_caps_every_tenant() {
        let sink = Arc::new(MemorySink::new());
        let mut settings = BreakerSettings::default();
        settings.global_limits = Some(limits(1_000.0));
        let reg = BreakerRegistry::new(&settings, sink.clone(), sink.clone());

        for t in [0, 10] {
            reg.sample([(Scope::Global, traffic(5_000.0))], t).await;
        }
        assert_eq!(reg.effective_factor("anyone", Mode::Enforce).await, 0.1);
    }

    #[tokio::test]
    async fn timeout_and_probe_through_registry() {
        let sink = Arc::new(MemorySink::new());
        let reg = registry(&sink);
        let scope = Scope::tenant("acme");
        reg.set_limits(scope.clone(), limits(100_000.0));
        reg.sample([(scope.clone(), traffic(160_000.0))], 0).await;
        reg.sample([(scope.clone(), traffic(160_000.0))], 10).await;

        assert!(reg.tick_all(30).await.is_empty());
        let t = reg.sample([(scope.clone(), traffic(80_000.0))], 70).await;
        let path: Vec<_> = t.iter().map(|t| t.to).collect();
        assert_eq!(path, vec![BreakerStatus::HalfOpen, BreakerStatus::Closed]);
    }

    #[tokio::test]
    async fn forced_hold_applies_to_new_breakers() {
        let sink = Arc::new(MemorySink::new());
        let reg = registry(&sink);
        reg.sample([(Scope::tenant("a"), traffic(1.0))], 0).await;

        let opened = reg.force_open_all(5).await;
        assert_eq!(opened.len(), 1);
        assert!(reg.is_forced());

        reg.sample([(Scope::tenant("late"), traffic(1.0))], 6).await;
        let late = reg.get(&Scope::tenant("late")).await.unwrap();
        assert_eq!(late.state, BreakerStatus::Open);
        assert!(late.forced);

        assert!(reg.tick_all(10_000).await.is_empty());
        assert_eq!(reg.release_all().await, 2);
        assert_eq!(reg.tick_all(10_000).await.len(), 2);
    }

    #[tokio::test]
    async fn adapt_all_records_audit() {
        let sink = Arc::new(MemorySink::new());
        let reg = registry(&sink);
        let scope = Scope::tenant("a");
        reg.set_limits(scope.clone(), limits(100_000.0));
        for t in 0..20 {
            reg.sample([(scope.clone(), traffic(140_000.0))], t).await;
        }
        assert_eq!(reg.adapt_all(100).await, 1);
        assert_eq!(
            reg.get(&scope).await.unwrap().thresholds.ingestion,
            165_000.0
        );
        assert_eq!(sink.audit_with(AuditAction::BreakerThresholdAdapted).len(), 1);
    }

    #[tokio::test]
    async fn state_persists_and_restores() {
        let sink = Arc::new(MemorySink::new());
        let store = StateStore::open_in_memory().unwrap();
        let reg = registry(&sink).with_store(store.clone());
        let scope = Scope::tenant("a");
        reg.set_limits(scope.clone(), limits(10.0));
        reg.sample([(scope.clone(), traffic(100.0))], 0).await;
        reg.sample([(scope.clone(), traffic(100.0))], 1).await;

        let stored = store.list_breakers().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, BreakerStatus::Open);

        let fresh = registry(&sink);
        assert_eq!(fresh.restore(stored).await, 1);
        assert_eq!(fresh.snapshot().await[0].state, BreakerStatus::Open);
        assert_eq!(fresh.effective_factor("a", Mode::Enforce).await, 0.1);
    }

    #[tokio::test]
    async fn recorded_limits_are_visible_immediately() {
        let sink = Arc::new(MemorySink::new());
        let reg = registry(&sink);
        let scope = Scope::tenant("a");
        assert_eq!(reg.limits(&scope), None);

        reg.set_limits(scope.clone(), limits(100_000.0));
        assert_eq!(reg.limits(&scope), Some(limits(100_000.0)));

        reg.sample([(scope.clone(), traffic(1.0))], 0).await;
        assert!(reg.remove(&scope).await);
        assert_eq!(reg.limits(&scope), None);
    }
}
