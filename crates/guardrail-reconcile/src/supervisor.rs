//! Supervisor — owns the shared state and runs the independent tickers.
//!
//! - reconcile: every `reconcile.interval` (default 5m)
//! - breaker sampling: every `breaker.sample_interval` (default 10s)
//! - breaker adaptation: every `breaker.adaptation_interval` (default 5m)
//! - emergency: every `emergency.sample_interval` (default 15s)
//!
//! A config watcher pushes reloaded breaker and emergency settings into the
//! running components; the reconciler reads the current config each cycle.
//! Breaker transitions and emergency changes re-push the last committed
//! limits right away instead of waiting for the next cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

use guardrail_breaker::{BreakerRegistry, Transition};
use guardrail_core::{
    AlertSink, AuditSink, ConfigHandle, EmergencyLevel, GuardrailError, GuardrailSnapshot, Scope,
};
use guardrail_emergency::{EmergencyController, EmergencyEvent};
use guardrail_metrics::CycleStats;
use guardrail_state::StateStore;

use crate::epoch_secs;
use crate::interfaces::{Collector, Patcher, PressureSource, TrafficSource};
use crate::reconciler::Reconciler;

/// Everything the supervisor is built from.
pub struct GuardrailParts {
    pub config: ConfigHandle,
    pub collector: Arc<dyn Collector>,
    pub patcher: Arc<dyn Patcher>,
    pub pressure: Arc<dyn PressureSource>,
    pub traffic: Arc<dyn TrafficSource>,
    pub audit: Arc<dyn AuditSink>,
    pub alerts: Arc<dyn AlertSink>,
    /// Persist breaker, emergency, and recommendation state here.
    pub store: Option<StateStore>,
}

/// The running controller.
pub struct Guardrail {
    config: ConfigHandle,
    reconciler: Arc<Reconciler>,
    breakers: Arc<BreakerRegistry>,
    emergency: Arc<RwLock<EmergencyController>>,
    pressure: Arc<dyn PressureSource>,
    traffic: Arc<dyn TrafficSource>,
    stats: Arc<CycleStats>,
    audit: Arc<dyn AuditSink>,
    alerts: Arc<dyn AlertSink>,
    store: Option<StateStore>,
}

impl Guardrail {
    pub fn new(parts: GuardrailParts) -> Self {
        let config = parts.config.current();

        let mut breakers =
            BreakerRegistry::new(&config.breaker, parts.audit.clone(), parts.alerts.clone());
        if let Some(store) = &parts.store {
            breakers = breakers.with_store(store.clone());
        }
        let breakers = Arc::new(breakers);
        let emergency = Arc::new(RwLock::new(EmergencyController::new(config.emergency.clone())));
        let stats = Arc::new(CycleStats::new());

        let mut reconciler = Reconciler::new(
            parts.config.clone(),
            parts.collector,
            parts.patcher,
            breakers.clone(),
            emergency.clone(),
        )
        .with_sinks(parts.audit.clone(), parts.alerts.clone())
        .with_stats(stats.clone());
        if let Some(store) = &parts.store {
            reconciler = reconciler.with_store(store.clone());
        }

        Self {
            config: parts.config,
            reconciler: Arc::new(reconciler),
            breakers,
            emergency,
            pressure: parts.pressure,
            traffic: parts.traffic,
            stats,
            audit: parts.audit,
            alerts: parts.alerts,
            store: parts.store,
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn stats(&self) -> &Arc<CycleStats> {
        &self.stats
    }

    /// Reinstate persisted state. Call once before [`Guardrail::run`].
    pub async fn restore(&self) -> anyhow::Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let breakers = store.list_breakers()?;
        self.breakers.restore(breakers).await;
        if let Some(state) = store.get_emergency()? {
            info!(level = %state.level, factor = state.limit_factor, "emergency state restored");
            let settings = self.config.current().emergency.clone();
            *self.emergency.write().await = EmergencyController::from_state(state, settings);
        }
        self.reconciler.restore().await;
        Ok(())
    }

    /// One breaker sampling round: feed live traffic and time out open
    /// breakers of scopes that saw none.
    pub async fn breaker_tick(&self, now: u64) -> Vec<Transition> {
        let timeout = self.config.current().reconcile.collect_timeout;
        let observations = match tokio::time::timeout(timeout, self.traffic.observe()).await {
            Ok(Ok(obs)) => obs,
            Ok(Err(e)) => {
                warn!(error = %e, "traffic observation failed");
                Default::default()
            }
            Err(_) => {
                warn!(error = %GuardrailError::Timeout("traffic observation".into()), "breaker round skipped");
                Default::default()
            }
        };
        let mut transitions = self.breakers.sample(observations, now).await;
        transitions.extend(self.breakers.tick_all(now).await);

        let mut scopes: Vec<Scope> = transitions.iter().map(|t| t.scope.clone()).collect();
        if scopes.contains(&Scope::Global) {
            scopes = vec![Scope::Global];
        }
        scopes.sort();
        scopes.dedup();
        for scope in &scopes {
            self.reconciler.reapply(scope, now).await;
        }
        transitions
    }

    /// One threshold adaptation step.
    pub async fn adapt(&self, now: u64) -> usize {
        self.breakers.adapt_all(now).await
    }

    /// One emergency sampling round.
    pub async fn emergency_tick(&self, now: u64) -> Vec<EmergencyEvent> {
        let timeout = self.config.current().reconcile.collect_timeout;
        let pressure = match tokio::time::timeout(timeout, self.pressure.sample()).await {
            Ok(Ok(p)) => Some(p.normalized()),
            Ok(Err(e)) => {
                warn!(error = %GuardrailError::PressureUnavailable(e.to_string()), "pressure sample failed");
                None
            }
            Err(_) => {
                warn!(error = %GuardrailError::Timeout("pressure sample".into()), "pressure sample failed");
                None
            }
        };
        self.update_emergency(now, |emergency| emergency.observe(pressure, now))
            .await
    }

    /// Operator override: jump straight to `level`.
    pub async fn force_emergency(&self, level: EmergencyLevel, now: u64) -> Vec<EmergencyEvent> {
        self.update_emergency(now, |emergency| emergency.force_level(level, now))
            .await
    }

    /// Step the emergency controller and carry out what it decided. The
    /// controller stays locked until the breakers and the store agree with
    /// it; limits are re-pushed afterwards if the protection changed.
    async fn update_emergency<F>(&self, now: u64, step: F) -> Vec<EmergencyEvent>
    where
        F: FnOnce(&mut EmergencyController) -> Vec<EmergencyEvent>,
    {
        let mut emergency = self.emergency.write().await;
        let before = (emergency.limit_factor(), emergency.ingestion_factor());
        let events = step(&mut *emergency);
        self.handle_emergency(&emergency, &events, now).await;
        let after = (emergency.limit_factor(), emergency.ingestion_factor());
        drop(emergency);

        let held = events.iter().any(|e| {
            matches!(
                e,
                EmergencyEvent::BreakersForced { .. } | EmergencyEvent::BreakersReleased { .. }
            )
        });
        if held || before != after {
            self.reconciler.reapply(&Scope::Global, now).await;
        }
        events
    }

    /// Consistent view of the controller's posture.
    pub async fn snapshot(&self) -> GuardrailSnapshot {
        GuardrailSnapshot {
            breakers: self.breakers.snapshot().await,
            emergency: self.emergency.read().await.state().clone(),
            recommendations: self.reconciler.recommendations().await,
            counters: self.stats.counters(),
        }
    }

    /// Audit, alert, and act on emergency events, then persist the state.
    async fn handle_emergency(
        &self,
        emergency: &EmergencyController,
        events: &[EmergencyEvent],
        now: u64,
    ) {
        if events.is_empty() {
            return;
        }
        for event in events {
            if let Some(audit) = event.audit() {
                self.audit.record(audit);
            }
            if let Some(alert) = event.alert() {
                self.alerts.notify(alert);
            }
            match event {
                EmergencyEvent::BreakersForced { .. } => {
                    self.breakers.force_open_all(now).await;
                }
                EmergencyEvent::BreakersReleased { .. } => {
                    self.breakers.release_all().await;
                }
                _ => {}
            }
        }
        if let Some(store) = &self.store
            && let Err(e) = store.put_emergency(emergency.state())
        {
            warn!(error = %e, "failed to persist emergency state");
        }
    }

    /// Run every loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(mode = ?self.config.current().mode, "guardrail started");

        let reconcile = tokio::spawn(self.reconciler.clone().run(shutdown.clone()));

        let this = self.clone();
        let sampler = tokio::spawn(ticker("breaker sampler", shutdown.clone(), move || {
            let this = this.clone();
            async move {
                this.breaker_tick(epoch_secs()).await;
                this.config.current().breaker.sample_interval
            }
        }));

        let this = self.clone();
        let adapter = tokio::spawn(ticker("breaker adaptation", shutdown.clone(), move || {
            let this = this.clone();
            async move {
                this.adapt(epoch_secs()).await;
                this.config.current().breaker.adaptation_interval
            }
        }));

        let this = self.clone();
        let emergency = tokio::spawn(ticker("emergency controller", shutdown.clone(), move || {
            let this = this.clone();
            async move {
                this.emergency_tick(epoch_secs()).await;
                this.config.current().emergency.sample_interval
            }
        }));

        let watcher = tokio::spawn(self.clone().watch_config(shutdown));

        for (name, handle) in [
            ("reconciler", reconcile),
            ("breaker sampler", sampler),
            ("breaker adaptation", adapter),
            ("emergency controller", emergency),
            ("config watcher", watcher),
        ] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "task failed");
            }
        }
        info!("guardrail stopped");
    }

    /// Push reloaded settings into the running components.
    async fn watch_config(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut updates = self.config.subscribe();
        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let config = updates.borrow_and_update().clone();
                    self.breakers.reconfigure(&config.breaker).await;
                    self.emergency.write().await.set_settings(config.emergency.clone());
                    debug!("reloaded settings applied");
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Run `step` repeatedly; each call returns the delay before the next one.
async fn ticker<F, Fut>(name: &'static str, mut shutdown: watch::Receiver<bool>, mut step: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Duration>,
{
    info!(task = name, "started");
    loop {
        let delay = step().await;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                info!(task = name, "shutting down");
                break;
            }
        }
    }
}
