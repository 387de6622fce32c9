//! Emergency controller — debounced escalation and graduated recovery.

use tracing::{debug, error, info, warn};

use guardrail_core::{
    AlertEvent, AlertPriority, AuditAction, AuditEvent, Component, EmergencyAction,
    EmergencyLevel, EmergencySettings, EmergencyState, RecoveryProgress, Scope,
};

use crate::level::{actions_for, deescalate, escalate, level_for};

/// Factors at or above this count as fully restored.
const RESTORED: f64 = 1.0 - 1e-9;

/// Something the controller did, for the caller to audit and act on.
#[derive(Debug, Clone, PartialEq)]
pub enum EmergencyEvent {
    LevelChanged {
        from: EmergencyLevel,
        to: EmergencyLevel,
        pressure: f64,
        at: u64,
        forced: bool,
    },
    /// Every circuit breaker must be held open.
    BreakersForced { at: u64 },
    /// The breaker hold is lifted.
    BreakersReleased { at: u64 },
    RecoveryStarted { at: u64 },
    RecoveryStep {
        at: u64,
        factor: f64,
        level: EmergencyLevel,
        steps: u32,
    },
    RecoveryAborted { at: u64, pressure: f64 },
    RecoveryCompleted { at: u64 },
    /// The pressure signal could not be read; `assumed` was used instead.
    SignalUnavailable { at: u64, assumed: f64 },
}

impl EmergencyEvent {
    /// Audit record for this event, if it is auditable.
    pub fn audit(&self) -> Option<AuditEvent> {
        let event = match *self {
            Self::LevelChanged {
                from,
                to,
                pressure,
                at,
                forced,
            } => AuditEvent::new(
                at,
                Scope::Global,
                AuditAction::EmergencyTransition,
                if forced {
                    "forced by operator".to_string()
                } else {
                    format!("pressure {pressure:.1}%")
                },
            )
            .with_change(Some(from.to_string()), Some(to.to_string())),
            Self::RecoveryStarted { at } => AuditEvent::new(
                at,
                Scope::Global,
                AuditAction::EmergencyRecoveryStep,
                "recovery started",
            ),
            Self::RecoveryStep {
                at, factor, steps, ..
            } => AuditEvent::new(
                at,
                Scope::Global,
                AuditAction::EmergencyRecoveryStep,
                format!("recovery step {steps}"),
            )
            .with_change(None, Some(format!("{factor:.4}"))),
            Self::RecoveryAborted { at, pressure } => AuditEvent::new(
                at,
                Scope::Global,
                AuditAction::EmergencyRecoveryAborted,
                format!("pressure {pressure:.1}% breached during recovery"),
            ),
            _ => return None,
        };
        Some(event)
    }

    /// Alert for this event, if it warrants one.
    pub fn alert(&self) -> Option<AlertEvent> {
        let (at, priority, message) = match *self {
            Self::LevelChanged {
                from, to, pressure, at, ..
            } => {
                let priority = if to < from {
                    AlertPriority::P3
                } else {
                    match to {
                        EmergencyLevel::Panic => AlertPriority::P0,
                        EmergencyLevel::Emergency => AlertPriority::P1,
                        _ => AlertPriority::P2,
                    }
                };
                (
                    at,
                    priority,
                    format!("emergency level {from} → {to} at {pressure:.1}% pressure"),
                )
            }
            Self::RecoveryAborted { at, pressure } => (
                at,
                AlertPriority::P1,
                format!("recovery aborted: pressure back at {pressure:.1}%"),
            ),
            Self::RecoveryCompleted { at } => (
                at,
                AlertPriority::P3,
                "recovery complete, limits fully restored".to_string(),
            ),
            Self::SignalUnavailable { at, assumed } => (
                at,
                AlertPriority::P2,
                format!("pressure signal unavailable, assuming {assumed:.1}%"),
            ),
            _ => return None,
        };
        Some(AlertEvent {
            timestamp: at,
            priority,
            component: Component::EmergencyController,
            scope: Scope::Global,
            message,
        })
    }
}

/// Drives [`EmergencyState`] from pressure readings.
#[derive(Debug, Clone)]
pub struct EmergencyController {
    state: EmergencyState,
    settings: EmergencySettings,
    /// Start of the current sustained breach above the active level.
    breach_since: Option<u64>,
    /// Start of the current run of samples below the recovery threshold.
    calm_since: Option<u64>,
    breakers_forced: bool,
}

impl EmergencyController {
    pub fn new(settings: EmergencySettings) -> Self {
        Self {
            state: EmergencyState::default(),
            settings,
            breach_since: None,
            calm_since: None,
            breakers_forced: false,
        }
    }

    /// Resume from persisted state. Debounce and sustain timers restart.
    pub fn from_state(state: EmergencyState, settings: EmergencySettings) -> Self {
        let breakers_forced = state
            .active_actions
            .contains(&EmergencyAction::ForceBreakersOpen);
        Self {
            state,
            settings,
            breach_since: None,
            calm_since: None,
            breakers_forced,
        }
    }

    pub fn state(&self) -> &EmergencyState {
        &self.state
    }

    pub fn level(&self) -> EmergencyLevel {
        self.state.level
    }

    /// Multiplier applied to every effective limit.
    pub fn limit_factor(&self) -> f64 {
        self.state.limit_factor
    }

    /// Extra multiplier for ingestion-class limits while throttling.
    pub fn ingestion_factor(&self) -> f64 {
        self.state
            .active_actions
            .iter()
            .find_map(|a| match a {
                EmergencyAction::ThrottleIngestion { percent } => Some(1.0 - percent / 100.0),
                _ => None,
            })
            .unwrap_or(1.0)
    }

    pub fn breakers_forced(&self) -> bool {
        self.breakers_forced
    }

    pub fn set_settings(&mut self, settings: EmergencySettings) {
        self.settings = settings;
        self.refresh_actions();
    }

    /// Feed one pressure reading. `None` means the signal was unreadable and
    /// is treated as elevated pressure.
    pub fn observe(&mut self, pressure: Option<f64>, now: u64) -> Vec<EmergencyEvent> {
        let mut events = Vec::new();
        let pressure = match pressure {
            Some(p) if p.is_finite() => p,
            _ => {
                let assumed = self.state.last_pressure.max(self.settings.warning_threshold);
                warn!(assumed, "pressure signal unavailable");
                events.push(EmergencyEvent::SignalUnavailable { at: now, assumed });
                assumed
            }
        };
        self.state.last_pressure = pressure;

        if pressure >= self.settings.warning_threshold {
            self.calm_since = None;
            if self.state.recovery_progress.take().is_some() {
                error!(pressure, level = %self.state.level, "recovery aborted by renewed breach");
                events.push(EmergencyEvent::RecoveryAborted { at: now, pressure });
            }
        }

        let target = level_for(pressure, &self.settings);
        if target > self.state.level {
            let since = *self.breach_since.get_or_insert(now);
            if now.saturating_sub(since) >= self.settings.debounce.as_secs() {
                let next = escalate(self.state.level);
                self.set_level(next, pressure, now, false, &mut events);
                // The next level needs its own full debounce interval.
                self.breach_since = (target > next).then_some(now);
            } else {
                debug!(pressure, %target, level = %self.state.level, "breach pending debounce");
            }
            return events;
        }
        self.breach_since = None;

        if pressure < self.settings.recovery_threshold {
            self.recover(now, &mut events);
        } else if pressure < self.settings.warning_threshold {
            // Between recovery and warning: hold position.
            self.calm_since = None;
        }
        events
    }

    /// Jump straight to `level`, bypassing debounce.
    pub fn force_level(&mut self, level: EmergencyLevel, now: u64) -> Vec<EmergencyEvent> {
        let mut events = Vec::new();
        self.breach_since = None;
        self.calm_since = None;
        self.state.recovery_progress = None;
        if level == EmergencyLevel::Normal {
            self.state.limit_factor = 1.0;
        }
        let pressure = self.state.last_pressure;
        self.set_level(level, pressure, now, true, &mut events);
        events
    }

    fn recover(&mut self, now: u64, events: &mut Vec<EmergencyEvent>) {
        if self.state.level == EmergencyLevel::Normal && self.state.limit_factor >= RESTORED {
            self.calm_since = None;
            return;
        }
        let since = *self.calm_since.get_or_insert(now);

        let due = match &self.state.recovery_progress {
            None => {
                if now.saturating_sub(since) < self.settings.recovery_sustain.as_secs() {
                    return;
                }
                info!(level = %self.state.level, factor = self.state.limit_factor, "recovery started");
                self.state.recovery_progress = Some(RecoveryProgress {
                    started_at: now,
                    last_step_at: now,
                    steps_completed: 0,
                });
                events.push(EmergencyEvent::RecoveryStarted { at: now });
                true
            }
            Some(progress) => {
                now.saturating_sub(progress.last_step_at)
                    >= self.settings.recovery_step_interval.as_secs()
            }
        };
        if due {
            self.recovery_step(now, events);
        }
    }

    fn recovery_step(&mut self, now: u64, events: &mut Vec<EmergencyEvent>) {
        let grown = self.state.limit_factor * (1.0 + self.settings.recovery_step_percent / 100.0);
        let factor = if grown >= RESTORED { 1.0 } else { grown };
        self.state.limit_factor = factor;

        let steps = match self.state.recovery_progress.as_mut() {
            Some(p) => {
                p.steps_completed += 1;
                p.last_step_at = now;
                p.steps_completed
            }
            None => 0,
        };

        let pressure = self.state.last_pressure;
        if factor >= 1.0 {
            events.push(EmergencyEvent::RecoveryStep {
                at: now,
                factor,
                level: EmergencyLevel::Normal,
                steps,
            });
            self.state.recovery_progress = None;
            self.calm_since = None;
            self.set_level(EmergencyLevel::Normal, pressure, now, false, events);
            info!(steps, "recovery complete");
            events.push(EmergencyEvent::RecoveryCompleted { at: now });
            return;
        }

        let next = deescalate(self.state.level).max(EmergencyLevel::Warning);
        if next != self.state.level {
            self.set_level(next, pressure, now, false, events);
        } else {
            self.refresh_actions();
        }
        debug!(factor, steps, level = %self.state.level, "recovery step");
        events.push(EmergencyEvent::RecoveryStep {
            at: now,
            factor,
            level: self.state.level,
            steps,
        });
    }

    fn set_level(
        &mut self,
        to: EmergencyLevel,
        pressure: f64,
        now: u64,
        forced: bool,
        events: &mut Vec<EmergencyEvent>,
    ) {
        let from = self.state.level;
        if to == EmergencyLevel::Panic {
            self.state.limit_factor = self.state.limit_factor.min(self.settings.panic_limit_factor);
        }
        if to >= EmergencyLevel::Emergency && !self.breakers_forced {
            self.breakers_forced = true;
            events.push(EmergencyEvent::BreakersForced { at: now });
        }
        if to == EmergencyLevel::Normal {
            self.state.limit_factor = 1.0;
            self.state.triggered_at = None;
            if self.breakers_forced {
                self.breakers_forced = false;
                events.push(EmergencyEvent::BreakersReleased { at: now });
            }
        } else if from == EmergencyLevel::Normal {
            self.state.triggered_at = Some(now);
        }
        self.state.level = to;
        self.refresh_actions();

        if from != to {
            if to > from {
                warn!(%from, %to, pressure, forced, "emergency level escalated");
            } else {
                info!(%from, %to, pressure, forced, "emergency level lowered");
            }
            events.push(EmergencyEvent::LevelChanged {
                from,
                to,
                pressure,
                at: now,
                forced,
            });
        }
    }

    /// Rebuild `active_actions` from the level, the current limit factor,
    /// and the breaker hold.
    fn refresh_actions(&mut self) {
        let factor = self.state.limit_factor;
        let mut actions: Vec<EmergencyAction> = actions_for(self.state.level, &self.settings)
            .into_iter()
            .filter(|a| !matches!(a, EmergencyAction::ForceBreakersOpen))
            .map(|a| match a {
                EmergencyAction::CutLimits { .. } => EmergencyAction::CutLimits { factor },
                other => other,
            })
            .collect();
        if self.breakers_forced {
            actions.push(EmergencyAction::ForceBreakersOpen);
        }
        if factor < 1.0
            && !actions
                .iter()
                .any(|a| matches!(a, EmergencyAction::CutLimits { .. }))
        {
            actions.push(EmergencyAction::CutLimits { factor });
        }
        self.state.active_actions = actions;
    }
}
